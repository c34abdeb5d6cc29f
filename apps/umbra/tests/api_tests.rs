//! Integration tests for the Umbra control API.
//!
//! Uses axum-test against the in-process router.

// Allow unwrap and panic in tests - these are standard for test code
#![allow(clippy::unwrap_used, clippy::panic)]

use axum::http::{HeaderValue, StatusCode, header};
use axum_test::TestServer;
use serde_json::{Value, json};
use std::sync::Arc;
use tempfile::TempDir;
use umbra::api::{AppState, router};
use umbra::engine::EngineManager;
use umbra::logging::LogRing;
use umbra::store::{AppPaths, SettingsStore};

// =============================================================================
// HELPER FUNCTIONS
// =============================================================================

/// Create a temporary directory for tests.
fn create_temp_dir() -> TempDir {
    tempfile::tempdir().expect("Failed to create temp dir")
}

fn state_in(dir: &TempDir) -> AppState {
    let paths = AppPaths::new(dir.path());
    let store = SettingsStore::new(paths.settings_file());
    let engine = Arc::new(EngineManager::new(paths));
    AppState::new(store, engine, LogRing::default())
}

fn server(state: AppState) -> TestServer {
    TestServer::new(router(state)).unwrap()
}

fn bearer(key: &'static str) -> HeaderValue {
    HeaderValue::from_str(&format!("Bearer {key}")).unwrap()
}

// =============================================================================
// HEALTH / AUTH TESTS
// =============================================================================

#[tokio::test]
async fn test_health() {
    let temp = create_temp_dir();
    let server = server(state_in(&temp));

    let response = server.get("/health").await;
    response.assert_status_ok();
    assert_eq!(response.json::<Value>()["status"], "ok");
}

#[tokio::test]
async fn test_api_key_required() {
    let temp = create_temp_dir();
    let server = server(state_in(&temp).with_api_key(Some("secret".to_string())));

    // Health stays open
    server.get("/health").await.assert_status_ok();

    let response = server.get("/status").await;
    response.assert_status(StatusCode::UNAUTHORIZED);

    let response = server
        .get("/status")
        .add_header(header::AUTHORIZATION, bearer("wrong"))
        .await;
    response.assert_status(StatusCode::UNAUTHORIZED);

    let response = server
        .get("/status")
        .add_header(header::AUTHORIZATION, bearer("secret"))
        .await;
    response.assert_status_ok();
}

#[tokio::test]
async fn test_blank_api_key_disables_auth() {
    let temp = create_temp_dir();
    let server = server(state_in(&temp).with_api_key(Some("  ".to_string())));

    server.get("/status").await.assert_status_ok();
}

#[tokio::test]
async fn test_rate_limit() {
    let temp = create_temp_dir();
    let server = server(state_in(&temp).with_rate_limit(1));

    server.get("/health").await.assert_status_ok();
    let response = server.get("/health").await;
    response.assert_status(StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn test_cors_allows_only_local_origins() {
    let temp = create_temp_dir();
    let server = server(state_in(&temp));

    let local = server
        .get("/health")
        .add_header(header::ORIGIN, HeaderValue::from_static("http://localhost:5173"))
        .await;
    assert_eq!(
        local.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
        "http://localhost:5173"
    );

    let remote = server
        .get("/health")
        .add_header(header::ORIGIN, HeaderValue::from_static("https://evil.example"))
        .await;
    assert!(
        remote
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .is_none()
    );
}

// =============================================================================
// STATUS / SETTINGS TESTS
// =============================================================================

#[tokio::test]
async fn test_status_on_fresh_home() {
    let temp = create_temp_dir();
    let server = server(state_in(&temp));

    let body = server.get("/status").await.json::<Value>();
    assert_eq!(body["active_profile"], "Gaming");
    assert_eq!(body["engine"]["running"], false);
    assert_eq!(body["first_run_pending"], true);
    assert!(body["active_config"].is_null());
}

#[tokio::test]
async fn test_configs_lists_imports() {
    let temp = create_temp_dir();
    let state = state_in(&temp);
    state
        .store
        .update(|s| s.import_smart_input("vless://id@a.example.com:443\nsocks5://h:1080", "manual"))
        .unwrap();
    let server = server(state);

    let body = server.get("/configs").await.json::<Value>();
    assert_eq!(body["configs"].as_array().unwrap().len(), 2);
    assert_eq!(body["configs"][1]["index"], 1);
    assert_eq!(body["protocol_counts"]["socks"], 1);
}

#[tokio::test]
async fn test_dns_lists_servers() {
    let temp = create_temp_dir();
    let server = server(state_in(&temp));

    let body = server.get("/dns").await.json::<Value>();
    assert!(!body["servers"].as_array().unwrap().is_empty());
    assert!(body["last_ranking"].as_array().unwrap().is_empty());
}

// =============================================================================
// PROBE CONSENT TESTS
// =============================================================================

#[tokio::test]
async fn test_probe_ping_needs_confirmation() {
    let temp = create_temp_dir();
    let server = server(state_in(&temp));

    let response = server.post("/probe/ping").json(&json!({})).await;
    response.assert_status(StatusCode::FORBIDDEN);

    let response = server
        .post("/probe/ping")
        .json(&json!({ "confirm": false }))
        .await;
    response.assert_status(StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_dns_optimize_needs_confirmation() {
    let temp = create_temp_dir();
    let server = server(state_in(&temp));

    let response = server.post("/dns/optimize").json(&json!({})).await;
    response.assert_status(StatusCode::FORBIDDEN);
}

/// State whose DNS list holds only the loopback address.
fn loopback_dns_state(dir: &TempDir) -> AppState {
    let state = state_in(dir);
    state
        .store
        .update(|s| {
            s.dns.servers.clear();
            s.dns.add_dns("Loopback", "127.0.0.1", "GLOBAL")
        })
        .unwrap()
        .unwrap();
    state
}

fn active_suggested_dns(state: &AppState) -> Option<String> {
    let s = state.store.load().unwrap();
    s.profiles.active_entry().unwrap().suggested_dns.clone()
}

#[tokio::test]
async fn test_dns_optimize_without_accept_leaves_profile_alone() {
    let temp = create_temp_dir();
    let state = loopback_dns_state(&temp);
    let server = server(state.clone());

    let body = server
        .post("/dns/optimize")
        .json(&json!({ "confirm": true }))
        .await
        .json::<Value>();
    assert_eq!(body["suggested"], "127.0.0.1");
    assert_eq!(body["accepted"], false);
    assert_eq!(body["ranking"].as_array().unwrap().len(), 1);

    assert_eq!(active_suggested_dns(&state), None);
    let cached = state.store.load().unwrap().dns.rank_cache.last_ranking;
    assert_eq!(cached.len(), 1);
}

#[tokio::test]
async fn test_dns_optimize_with_accept_stores_suggestion() {
    let temp = create_temp_dir();
    let state = loopback_dns_state(&temp);
    let server = server(state.clone());

    let body = server
        .post("/dns/optimize")
        .json(&json!({ "confirm": true, "accept": true }))
        .await
        .json::<Value>();
    assert_eq!(body["accepted"], true);
    assert_eq!(active_suggested_dns(&state).as_deref(), Some("127.0.0.1"));
}

// =============================================================================
// ENGINE / CORE TESTS
// =============================================================================

#[tokio::test]
async fn test_engine_start_and_stop() {
    let temp = create_temp_dir();
    let server = server(state_in(&temp));

    let body = server.post("/engine/start").await.json::<Value>();
    assert_eq!(body["started"], true);
    let body = server.post("/engine/start").await.json::<Value>();
    assert_eq!(body["started"], false);

    let body = server.get("/status").await.json::<Value>();
    assert_eq!(body["engine"]["running"], true);

    let body = server.post("/engine/stop").await.json::<Value>();
    assert_eq!(body["stopped"], true);
    let body = server.post("/engine/stop").await.json::<Value>();
    assert_eq!(body["stopped"], false);
}

#[tokio::test]
async fn test_core_start_without_active_config() {
    let temp = create_temp_dir();
    let server = server(state_in(&temp));

    let response = server.post("/core/start").json(&json!({})).await;
    response.assert_status(StatusCode::NOT_FOUND);

    let response = server.post("/core/start").json(&json!({ "index": 3 })).await;
    response.assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_core_start_without_binary_conflicts() {
    let temp = create_temp_dir();
    let state = state_in(&temp);
    state
        .store
        .update(|s| s.import_smart_input(r#"{"outbounds": [{"type": "direct"}]}"#, "manual"))
        .unwrap();
    let server = server(state);

    let response = server.post("/core/start").json(&json!({ "index": 0 })).await;
    response.assert_status(StatusCode::CONFLICT);
    let body = response.json::<Value>();
    assert!(body["error"].as_str().unwrap().contains("sing-box"));

    let body = server.post("/core/stop").await.json::<Value>();
    assert_eq!(body["stopped"], false);
}

#[tokio::test]
async fn test_ping_window_starts_empty() {
    let temp = create_temp_dir();
    let server = server(state_in(&temp));

    let body = server.get("/ping/window").await.json::<Value>();
    assert!(body["samples"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_exit_stops_engine() {
    let temp = create_temp_dir();
    let state = state_in(&temp);
    let engine = Arc::clone(&state.engine);
    let server = server(state);

    server.post("/engine/start").await.assert_status_ok();
    let body = server.post("/exit").await.json::<Value>();
    assert_eq!(body["exiting"], true);
    assert!(!engine.is_running().await);
}
