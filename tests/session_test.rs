//! Manager client against a mock manager, and a full session cycle
//! against a recording manager

mod common;

use chrono::NaiveDate;
use common::{
    document_response, feed_definition, not_modified_response, rss_document, RecordingManager,
    ScriptedFetcher, BASE_TIME,
};
use feedpull::config::{Config, ManagerConfig};
use feedpull::coordinator::{HttpManagerClient, PullerManager, SessionHandle, SessionRunner, UpstreamError};
use feedpull::crawler::pool::AcceptOutcome;
use feedpull::models::{FeedPack, FeedStateUpdatePack, SessionId};
use feedpull::stats::FeedsStatistics;
use feedpull::utils::retry::RetryConfig;
use feedpull::utils::TokioClock;
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::watch;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(server: &MockServer) -> HttpManagerClient {
    let config = ManagerConfig {
        url: server.uri(),
        request_timeout_secs: 5,
        ..ManagerConfig::default()
    };
    HttpManagerClient::new(&config, "puller-test")
        .unwrap()
        .with_retry(RetryConfig::with_delays(2, 10, 20))
}

fn session() -> SessionId {
    SessionId("abc".into())
}

#[tokio::test]
async fn test_login_returns_session() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/login"))
        .and(body_partial_json(json!({"puller": "puller-test"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"session": "abc"})))
        .mount(&mock_server)
        .await;

    assert_eq!(client(&mock_server).login().await.unwrap(), session());
}

#[tokio::test]
async fn test_login_retries_when_not_ready() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/login"))
        .respond_with(ResponseTemplate::new(503).set_body_string("starting"))
        .up_to_n_times(2)
        .mount(&mock_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"session": "abc"})))
        .mount(&mock_server)
        .await;

    assert_eq!(client(&mock_server).login().await.unwrap(), session());
}

#[tokio::test]
async fn test_login_gives_up_when_never_ready() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/login"))
        .respond_with(ResponseTemplate::new(503).set_body_string("starting"))
        .expect(3)
        .mount(&mock_server)
        .await;

    let result = client(&mock_server).login().await;
    assert!(matches!(result, Err(UpstreamError::NotReady(body)) if body == "starting"));
}

#[tokio::test]
async fn test_login_without_session_rejected() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"session": ""})))
        .mount(&mock_server)
        .await;

    let result = client(&mock_server).login().await;
    assert!(matches!(result, Err(UpstreamError::Rejected(_))));
}

#[tokio::test]
async fn test_unauthorized_means_logout() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/ping"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&mock_server)
        .await;

    let result = client(&mock_server).ping(&session()).await;
    assert!(matches!(result, Err(UpstreamError::Logout)));
}

#[tokio::test]
async fn test_logout_flag_in_body() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/ping"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"logout": true})))
        .mount(&mock_server)
        .await;

    let result = client(&mock_server).ping(&session()).await;
    assert!(matches!(result, Err(UpstreamError::Logout)));
}

#[tokio::test]
async fn test_logout_of_expired_session_succeeds() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/logout"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&mock_server)
        .await;

    assert!(client(&mock_server).logout(&session()).await.is_ok());
}

#[tokio::test]
async fn test_feed_state_acknowledgement() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/feed-state"))
        .and(body_partial_json(json!({"session": "abc"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"accepted": false})))
        .up_to_n_times(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/feed-state"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&mock_server)
        .await;

    let client = client(&mock_server);
    let pack = FeedStateUpdatePack::default();
    assert!(!client.feed_state(&session(), &pack).await.unwrap());
    assert!(client.feed_state(&session(), &pack).await.unwrap());
}

#[tokio::test]
async fn test_feed_stat_rejected() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/feed-stat"))
        .respond_with(ResponseTemplate::new(400).set_body_string("bad date"))
        .mount(&mock_server)
        .await;

    let stats = FeedsStatistics {
        date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
        feeds_stat: Vec::new(),
    };
    let result = client(&mock_server).feed_stat(&session(), &stats).await;
    assert!(matches!(result, Err(UpstreamError::Rejected(msg)) if msg.contains("bad date")));
}

async fn wait_for_session(handle: &SessionHandle, expected: &str) {
    tokio::time::timeout(Duration::from_secs(600), async {
        loop {
            if let Some(pool) = handle.pool().await {
                if pool.session().await == Some(SessionId(expected.into())) {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_session_cycle() {
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.feed_request.threads = 2;
    config.saving_feed_state.max_delay = 1;
    config.saving_feed_stat.cache_file = dir.path().join("feed_stat.json");

    let manager = Arc::new(RecordingManager::default());
    let fetcher = Arc::new(ScriptedFetcher::new(document_response(rss_document(&[
        ("a", BASE_TIME - 60),
        ("b", BASE_TIME - 660),
    ]))));
    let handle = SessionHandle::new();
    let runner = SessionRunner::new(
        config,
        manager.clone(),
        fetcher.clone(),
        Arc::new(TokioClock::new(BASE_TIME)),
        handle.clone(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(runner.run(shutdown_rx));

    wait_for_session(&handle, "session-1").await;
    let pool = handle.pool().await.unwrap();
    let outcome = pool
        .accept_feeds(FeedPack {
            session: SessionId("session-1".into()),
            feeds: vec![feed_definition(1)],
        })
        .await;
    assert!(matches!(outcome, AcceptOutcome::Accepted { added: 1, .. }));

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(fetcher.calls(), 1);
    assert_eq!(manager.state_updates(), 1);
    assert!(!pool.tables().read().await.stats.is_empty());

    // Logout persists unsent statistics and opens a new session
    assert!(handle.request_logout().await);
    wait_for_session(&handle, "session-2").await;
    assert_eq!(manager.logouts.load(Ordering::SeqCst), 1);
    assert_eq!(manager.logins.load(Ordering::SeqCst), 2);
    assert!(pool.is_stopped());

    let next_pool = handle.pool().await.unwrap();
    assert!(!next_pool.tables().read().await.stats.is_empty());
    assert!(next_pool.tables().read().await.feeds.is_empty());

    shutdown_tx.send(true).unwrap();
    task.await.unwrap().unwrap();
    assert_eq!(manager.logouts.load(Ordering::SeqCst), 2);
    assert!(handle.pool().await.is_none());
    assert!(dir.path().join("feed_stat.json").exists());
}

#[tokio::test(start_paused = true)]
async fn test_logout_without_session_is_dropped() {
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.saving_feed_stat.cache_file = dir.path().join("feed_stat.json");

    let manager = Arc::new(RecordingManager::default());
    let fetcher = Arc::new(ScriptedFetcher::new(not_modified_response()));
    let handle = SessionHandle::new();
    assert!(!handle.request_logout().await);

    let runner = SessionRunner::new(
        config,
        manager.clone(),
        fetcher,
        Arc::new(TokioClock::new(BASE_TIME)),
        handle.clone(),
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(runner.run(shutdown_rx));

    wait_for_session(&handle, "session-1").await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(manager.logins.load(Ordering::SeqCst), 1);
    assert_eq!(manager.logouts.load(Ordering::SeqCst), 0);

    shutdown_tx.send(true).unwrap();
    task.await.unwrap().unwrap();
}
