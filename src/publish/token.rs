//! Token provider
//!
//! Hands publishers a fresh access token for a connected account,
//! refreshing through the OAuth endpoint when the stored token is close to
//! expiry. Refreshed tokens are written back through the store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, info};

use crate::clock::SharedClock;
use crate::error::{Result, WorkerError};
use crate::models::ConnectedAccount;
use crate::store::Store;

/// Expiry slack: refresh when less than this much validity remains.
const REFRESH_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn access_token(&self, account: &ConnectedAccount) -> Result<AccessToken>;
}

pub struct OAuthTokenProvider {
    client: reqwest::Client,
    token_endpoint: String,
    store: Arc<dyn Store>,
    clock: SharedClock,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

impl OAuthTokenProvider {
    pub fn new(
        token_endpoint: impl Into<String>,
        store: Arc<dyn Store>,
        clock: SharedClock,
        http_timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(http_timeout).build()?;
        Ok(Self {
            client,
            token_endpoint: token_endpoint.into(),
            store,
            clock,
        })
    }

    async fn refresh(&self, account: &ConnectedAccount) -> Result<AccessToken> {
        let refresh_token = account.refresh_token_ref.as_deref().ok_or_else(|| {
            WorkerError::ProviderAuth {
                platform: account.platform.to_string(),
                status: 401,
                message: "no refresh token on file".into(),
            }
        })?;

        debug!(
            account_id = %account.id,
            platform = %account.platform,
            "Refreshing access token"
        );

        let response = self
            .client
            .post(&self.token_endpoint)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(WorkerError::from_provider_status(
                account.platform.as_str(),
                status.as_u16(),
                body,
            ));
        }

        let parsed: RefreshResponse = response.json().await?;
        let expires_at = parsed
            .expires_in
            .map(|secs| self.clock.now() + chrono::Duration::seconds(secs));

        self.store
            .update_account_tokens(
                account.id,
                &parsed.access_token,
                parsed.refresh_token.as_deref(),
                expires_at,
            )
            .await?;

        info!(account_id = %account.id, "Access token refreshed");
        Ok(AccessToken {
            token: parsed.access_token,
            expires_at,
        })
    }
}

#[async_trait]
impl TokenProvider for OAuthTokenProvider {
    async fn access_token(&self, account: &ConnectedAccount) -> Result<AccessToken> {
        let margin =
            chrono::Duration::from_std(REFRESH_MARGIN).unwrap_or_else(|_| chrono::Duration::zero());
        let still_valid = account
            .expires_at
            .map_or(false, |at| at > self.clock.now() + margin);

        if still_valid {
            return Ok(AccessToken {
                token: account.access_token_ref.clone(),
                expires_at: account.expires_at,
            });
        }
        self.refresh(account).await
    }
}
