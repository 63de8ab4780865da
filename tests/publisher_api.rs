//! Publisher HTTP contract tests
//!
//! Uses wiremock to stand in for the TikTok/YouTube APIs and the OAuth
//! token endpoint, pinning the request flows and the error classification
//! (401 reconnect, 429 retry-after, 5xx transient).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use cliply_worker::cancel::CancelToken;
use cliply_worker::clock::{Clock, ManualClock};
use cliply_worker::error::WorkerError;
use cliply_worker::models::{ConnectedAccount, Platform};
use cliply_worker::publish::{
    AccessToken, OAuthTokenProvider, PostSpec, Publisher, TikTokPublisher, TokenProvider,
    YouTubePublisher,
};
use cliply_worker::store::{MemoryStore, Store};

fn token() -> AccessToken {
    AccessToken {
        token: "unit-token".into(),
        expires_at: None,
    }
}

async fn clip_file() -> (tempfile::TempDir, std::path::PathBuf) {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("clip.mp4");
    tokio::fs::write(&path, b"clip-bytes").await.expect("write clip");
    (dir, path)
}

#[tokio::test]
async fn test_tiktok_three_step_flow() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v2/post/publish/video/init/"))
        .and(header("authorization", "Bearer unit-token"))
        .and(body_string_contains("FILE_UPLOAD"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": {
                "publish_id": "pub-42",
                "upload_url": format!("{}/upload-slot", server.uri()),
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("PUT"))
        .and(path("/upload-slot"))
        .and(header("content-type", "video/mp4"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/v2/post/publish/status/fetch/"))
        .and(body_string_contains("pub-42"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": { "status": "PROCESSING_UPLOAD" }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let publisher = TikTokPublisher::new(server.uri(), Duration::from_secs(5)).unwrap();
    let (_dir, clip) = clip_file().await;

    let post_id = publisher
        .upload(
            &token(),
            &clip,
            &PostSpec {
                caption: Some("hello".into()),
                ..PostSpec::default()
            },
            &CancelToken::never(),
        )
        .await
        .unwrap();
    assert_eq!(post_id, "pub-42");
}

#[tokio::test]
async fn test_tiktok_auth_failure_is_reconnect() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v2/post/publish/video/init/"))
        .respond_with(ResponseTemplate::new(401).set_body_string("token revoked"))
        .mount(&server)
        .await;

    let publisher = TikTokPublisher::new(server.uri(), Duration::from_secs(5)).unwrap();
    let (_dir, clip) = clip_file().await;

    let err = publisher
        .upload(&token(), &clip, &PostSpec::default(), &CancelToken::never())
        .await
        .unwrap_err();
    assert!(matches!(err, WorkerError::ProviderAuth { status: 401, .. }));
    assert!(!err.retryable());
}

#[tokio::test]
async fn test_tiktok_rate_limit_carries_retry_after() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v2/post/publish/video/init/"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("retry-after", "7")
                .set_body_string("slow down"),
        )
        .mount(&server)
        .await;

    let publisher = TikTokPublisher::new(server.uri(), Duration::from_secs(5)).unwrap();
    let (_dir, clip) = clip_file().await;

    let err = publisher
        .upload(&token(), &clip, &PostSpec::default(), &CancelToken::never())
        .await
        .unwrap_err();
    assert!(err.retryable());
    assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
}

#[tokio::test]
async fn test_youtube_resumable_flow() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/upload/youtube/v3/videos"))
        .and(body_string_contains("My title"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("location", format!("{}/resumable-abc", server.uri()).as_str()),
        )
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("PUT"))
        .and(path("/resumable-abc"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "vid-9"})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let publisher = YouTubePublisher::new(server.uri(), Duration::from_secs(5)).unwrap();
    let (_dir, clip) = clip_file().await;

    let video_id = publisher
        .upload(
            &token(),
            &clip,
            &PostSpec {
                title: Some("My title".into()),
                visibility: Some("unlisted".into()),
                tags: vec!["clips".into()],
                ..PostSpec::default()
            },
            &CancelToken::never(),
        )
        .await
        .unwrap();
    assert_eq!(video_id, "vid-9");
}

#[tokio::test]
async fn test_youtube_server_error_is_transient() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/upload/youtube/v3/videos"))
        .respond_with(ResponseTemplate::new(503).set_body_string("backend unavailable"))
        .mount(&server)
        .await;

    let publisher = YouTubePublisher::new(server.uri(), Duration::from_secs(5)).unwrap();
    let (_dir, clip) = clip_file().await;

    let err = publisher
        .upload(&token(), &clip, &PostSpec::default(), &CancelToken::never())
        .await
        .unwrap_err();
    assert!(matches!(err, WorkerError::ProviderTransient { .. }));
    assert!(err.retryable());
}

#[tokio::test]
async fn test_token_refresh_round_trip() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "fresh-token",
            "refresh_token": "fresh-refresh",
            "expires_in": 3600
        })))
        .expect(1)
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let account = ConnectedAccount {
        id: Uuid::new_v4(),
        workspace_id: Uuid::new_v4(),
        platform: Platform::Youtube,
        external_id: "chan".into(),
        access_token_ref: "stale-token".into(),
        refresh_token_ref: Some("old-refresh".into()),
        // Already expired: forces a refresh.
        expires_at: Some(clock.now() - chrono::Duration::minutes(5)),
        scopes: None,
        status: None,
    };
    store.seed_account(account.clone());

    let provider = OAuthTokenProvider::new(
        format!("{}/token", server.uri()),
        store.clone(),
        clock.clone(),
        Duration::from_secs(5),
    )
    .unwrap();

    let refreshed = provider.access_token(&account).await.unwrap();
    assert_eq!(refreshed.token, "fresh-token");
    assert!(refreshed.expires_at.unwrap() > clock.now());

    // The refreshed credentials were written back through the store.
    let stored = store
        .get_connected_account(account.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.access_token_ref, "fresh-token");
    assert_eq!(stored.refresh_token_ref.as_deref(), Some("fresh-refresh"));
}
