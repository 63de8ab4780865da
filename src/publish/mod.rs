//! Publishing ports
//!
//! Platform publishers and the token provider. Errors from provider APIs
//! come back classified: 401/403 is a reconnect-the-account failure, 429
//! retries after the window, 5xx and network faults retry with backoff.

pub mod tiktok;
pub mod token;
pub mod youtube;

use std::path::Path;

use async_trait::async_trait;

use crate::cancel::CancelToken;
use crate::error::Result;
use crate::models::Platform;

pub use tiktok::TikTokPublisher;
pub use token::{AccessToken, OAuthTokenProvider, TokenProvider};
pub use youtube::YouTubePublisher;

/// Platform-agnostic post metadata; each publisher picks the fields it
/// understands.
#[derive(Debug, Clone, Default)]
pub struct PostSpec {
    pub title: Option<String>,
    pub caption: Option<String>,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub visibility: Option<String>,
    pub privacy_level: Option<String>,
}

#[async_trait]
pub trait Publisher: Send + Sync {
    fn platform(&self) -> Platform;

    /// Uploads the rendered file and returns the platform's post/video id.
    async fn upload(
        &self,
        token: &AccessToken,
        file: &Path,
        spec: &PostSpec,
        cancel: &CancelToken,
    ) -> Result<String>;
}

/// Reads an optional Retry-After header into milliseconds.
pub(crate) fn retry_after_ms(response: &reqwest::Response) -> Option<i64> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .parse::<i64>()
        .ok()
        .map(|secs| secs * 1000)
}
