//! Integration tests for Umbra's outbound HTTP: subscriptions, the core
//! updater, the speed test and the control client.
//!
//! Uses wiremock to stand in for subscription hosts, GitHub and a running
//! `umbra serve`.

// Allow unwrap and panic in tests - these are standard for test code
#![allow(clippy::unwrap_used, clippy::panic)]

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use flate2::Compression;
use flate2::write::GzEncoder;
use serde_json::json;
use std::io::Write;
use tempfile::TempDir;
use umbra::cli::{ControlClient, cmd_core_start, cmd_core_stop, cmd_sub_update};
use umbra::probe::{Consent, SpeedtestPlan, measure_download, measure_upload, speedtest};
use umbra::store::{AppPaths, SettingsStore};
use umbra::subscription::{self, SUBSCRIPTION_USER_AGENT};
use umbra::updater::Updater;
use umbra_core::release::{CoreRelease, Platform};
use umbra_core::settings::CoreUpdates;
use umbra_core::{ConfigKind, Settings};
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};
use zip::write::SimpleFileOptions;

// =============================================================================
// HELPER FUNCTIONS
// =============================================================================

/// Create a temporary directory for tests.
fn create_temp_dir() -> TempDir {
    tempfile::tempdir().expect("Failed to create temp dir")
}

/// A zip archive holding `files` (path, contents).
fn zip_bytes(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    for (name, contents) in files {
        writer
            .start_file(*name, SimpleFileOptions::default())
            .unwrap();
        writer.write_all(contents).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

/// A gzip-compressed tarball holding `files` (path, contents).
fn tar_gz_bytes(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for (name, contents) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o755);
        builder.append_data(&mut header, name, *contents).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

fn gz_bytes(contents: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(contents).unwrap();
    encoder.finish().unwrap()
}

fn updates_for(repo: &str) -> CoreUpdates {
    let mut updates = CoreUpdates::default();
    updates
        .repos
        .insert("singbox".to_string(), repo.to_string());
    updates
}

fn linux_updater(server: &MockServer, paths: &AppPaths) -> Updater {
    Updater::new(reqwest::Client::new(), paths.clone())
        .with_api_base(&server.uri())
        .with_platform(Platform::from_names("linux", "amd64"))
}

// =============================================================================
// SUBSCRIPTION TESTS
// =============================================================================

#[tokio::test]
async fn test_fetch_sends_user_agent() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/sub"))
        .and(header("user-agent", SUBSCRIPTION_USER_AGENT))
        .respond_with(ResponseTemplate::new(200).set_body_string("vless://id@a.example.com:443"))
        .expect(1)
        .mount(&server)
        .await;

    let body = subscription::fetch(&reqwest::Client::new(), &format!("{}/sub", server.uri()))
        .await
        .unwrap();
    assert_eq!(body, "vless://id@a.example.com:443");
}

#[tokio::test]
async fn test_fetch_rejects_empty_url() {
    let result = subscription::fetch(&reqwest::Client::new(), "  ").await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_update_all_reports_each_url() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/good"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(STANDARD.encode("vmess://one\ntrojan://pw@b.example.ir:443\n")),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/bad"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let mut settings = Settings::default();
    settings.add_subscription(&format!("{}/bad", server.uri()));
    settings.add_subscription(&format!("{}/good", server.uri()));

    let reports = subscription::update_all(&reqwest::Client::new(), &mut settings).await;
    assert_eq!(reports.len(), 2);
    assert!(reports[0].outcome.is_err());
    assert_eq!(reports[1].outcome, Ok(2));
    assert_eq!(settings.configs.len(), 2);
    assert_eq!(settings.configs[0].kind, ConfigKind::Vmess);
    assert_eq!(settings.configs[0].source, "subscription");

    // Second pass imports nothing new
    let reports = subscription::update_all(&reqwest::Client::new(), &mut settings).await;
    assert_eq!(reports[1].outcome, Ok(0));
}

#[tokio::test]
async fn test_sub_update_command_saves_configs() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/list"))
        .respond_with(ResponseTemplate::new(200).set_body_string("socks5://h:1080\nhy2://pw@h:443"))
        .mount(&server)
        .await;

    let temp = create_temp_dir();
    let store = SettingsStore::new(temp.path().join("settings.json"));
    store
        .update(|s| s.add_subscription(&format!("{}/list", server.uri())))
        .unwrap();

    let result = cmd_sub_update(&store, &reqwest::Client::new()).await;
    assert!(result.is_ok());
    assert_eq!(store.load().unwrap().configs.len(), 2);
}

// =============================================================================
// CORE UPDATER TESTS
// =============================================================================

#[tokio::test]
async fn test_update_installs_binary_from_zip() {
    let server = MockServer::start().await;
    let archive = zip_bytes(&[
        ("sing-box-1.10.0-linux-amd64/LICENSE", &b"license"[..]),
        ("sing-box-1.10.0-linux-amd64/sing-box", &b"#!/bin/sh\necho sing-box\n"[..]),
    ]);
    Mock::given(method("GET"))
        .and(path("/repos/SagerNet/sing-box/releases/latest"))
        .and(header("accept", "application/vnd.github+json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "tag_name": "v1.10.0",
            "assets": [
                {
                    "name": "sing-box-1.10.0-windows-amd64.zip",
                    "browser_download_url": format!("{}/dl/windows.zip", server.uri())
                },
                {
                    "name": "sing-box-1.10.0-linux-amd64.zip",
                    "browser_download_url": format!("{}/dl/linux.zip", server.uri())
                }
            ]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/dl/linux.zip"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(archive))
        .expect(2)
        .mount(&server)
        .await;

    let temp = create_temp_dir();
    let paths = AppPaths::new(temp.path());
    let updater = linux_updater(&server, &paths);

    let outcome = updater
        .update(CoreRelease::SingBox, &updates_for("SagerNet/sing-box"))
        .await
        .unwrap();
    assert_eq!(outcome.tag, "v1.10.0");
    assert_eq!(outcome.asset, "sing-box-1.10.0-linux-amd64.zip");
    assert_eq!(outcome.binary, paths.core_dir("sing-box").join("sing-box"));
    assert!(outcome.backup.is_none());
    assert_eq!(
        std::fs::read_to_string(&outcome.binary).unwrap(),
        "#!/bin/sh\necho sing-box\n"
    );
    assert!(!paths.cores_dir().join("_tmp").exists());

    // A second update backs up the first binary
    let again = updater
        .update(CoreRelease::SingBox, &updates_for("SagerNet/sing-box"))
        .await
        .unwrap();
    let backup = again.backup.unwrap();
    assert!(backup.starts_with(paths.cores_dir().join("_backups").join("sing-box")));
    assert!(backup.is_file());
}

#[tokio::test]
async fn test_update_installs_binary_from_tar_gz() {
    let server = MockServer::start().await;
    let archive = tar_gz_bytes(&[
        ("sing-box-1.10.0-linux-amd64/LICENSE", &b"license"[..]),
        ("sing-box-1.10.0-linux-amd64/sing-box", &b"#!/bin/sh\necho tgz\n"[..]),
    ]);
    Mock::given(method("GET"))
        .and(path("/repos/SagerNet/sing-box/releases/latest"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "tag_name": "v1.10.0",
            "assets": [{
                "name": "sing-box-1.10.0-linux-amd64.tar.gz",
                "browser_download_url": format!("{}/dl/linux.tar.gz", server.uri())
            }]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/dl/linux.tar.gz"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(archive))
        .expect(1)
        .mount(&server)
        .await;

    let temp = create_temp_dir();
    let paths = AppPaths::new(temp.path());
    let outcome = linux_updater(&server, &paths)
        .update(CoreRelease::SingBox, &updates_for("SagerNet/sing-box"))
        .await
        .unwrap();
    assert_eq!(outcome.asset, "sing-box-1.10.0-linux-amd64.tar.gz");
    assert_eq!(outcome.binary, paths.core_dir("sing-box").join("sing-box"));
    assert_eq!(
        std::fs::read_to_string(&outcome.binary).unwrap(),
        "#!/bin/sh\necho tgz\n"
    );
    assert!(!paths.cores_dir().join("_tmp").exists());
}

#[tokio::test]
async fn test_update_installs_mihomo_from_gz() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/repos/MetaCubeX/mihomo/releases/latest"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "tag_name": "v1.18.0",
            "assets": [
                {
                    "name": "mihomo-linux-amd64-v1.18.0.deb",
                    "browser_download_url": format!("{}/dl/mihomo.deb", server.uri())
                },
                {
                    "name": "mihomo-linux-amd64-v1.18.0.gz",
                    "browser_download_url": format!("{}/dl/mihomo.gz", server.uri())
                }
            ]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/dl/mihomo.gz"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(gz_bytes(b"mihomo-binary")))
        .expect(1)
        .mount(&server)
        .await;

    let temp = create_temp_dir();
    let paths = AppPaths::new(temp.path());
    let outcome = linux_updater(&server, &paths)
        .update(CoreRelease::Mihomo, &CoreUpdates::default())
        .await
        .unwrap();
    assert_eq!(outcome.asset, "mihomo-linux-amd64-v1.18.0.gz");
    assert_eq!(outcome.binary, paths.core_dir("mihomo").join("mihomo"));
    assert_eq!(std::fs::read(&outcome.binary).unwrap(), b"mihomo-binary");
}

#[tokio::test]
async fn test_update_rejects_corrupt_tar_gz() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/repos/SagerNet/sing-box/releases/latest"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "tag_name": "v1.10.0",
            "assets": [{
                "name": "sing-box-1.10.0-linux-amd64.tar.gz",
                "browser_download_url": format!("{}/dl/linux.tar.gz", server.uri())
            }]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/dl/linux.tar.gz"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"not gzip at all".to_vec()))
        .mount(&server)
        .await;

    let temp = create_temp_dir();
    let paths = AppPaths::new(temp.path());
    let result = linux_updater(&server, &paths)
        .update(CoreRelease::SingBox, &updates_for("SagerNet/sing-box"))
        .await;
    assert!(result.is_err());
    assert!(!paths.core_dir("sing-box").join("sing-box").exists());
    assert!(!paths.cores_dir().join("_tmp").exists());
}

#[tokio::test]
async fn test_update_without_matching_asset() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/repos/me/fork/releases/latest"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "tag_name": "v0.1",
            "assets": []
        })))
        .mount(&server)
        .await;

    let temp = create_temp_dir();
    let paths = AppPaths::new(temp.path());
    let result = linux_updater(&server, &paths)
        .update(CoreRelease::SingBox, &updates_for("me/fork"))
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_update_surfaces_http_errors() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/repos/SagerNet/sing-box/releases/latest"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let temp = create_temp_dir();
    let paths = AppPaths::new(temp.path());
    let result = linux_updater(&server, &paths)
        .update(CoreRelease::SingBox, &updates_for("SagerNet/sing-box"))
        .await;
    assert!(result.is_err());
}

// =============================================================================
// SPEED TEST TESTS
// =============================================================================

fn plan_for(server: &MockServer, download_bytes: u64, upload_bytes: u64) -> SpeedtestPlan {
    SpeedtestPlan {
        download_url: format!("{}/down", server.uri()),
        download_bytes,
        upload_url: format!("{}/up", server.uri()),
        upload_bytes,
    }
}

fn consent() -> Consent {
    Consent::from_flag(true).unwrap()
}

#[tokio::test]
async fn test_download_sends_range_and_stops_at_limit() {
    let server = MockServer::start().await;
    // The server ignores the range and sends ten times more
    Mock::given(method("GET"))
        .and(path("/down"))
        .and(header("range", "bytes=0-99"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![7u8; 1_000]))
        .expect(1)
        .mount(&server)
        .await;

    let (downloaded, rate) =
        measure_download(&reqwest::Client::new(), &format!("{}/down", server.uri()), 100)
            .await
            .unwrap();
    assert_eq!(downloaded, 100);
    assert!(rate.0 > 0);
}

#[tokio::test]
async fn test_download_shorter_than_requested() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/down"))
        .respond_with(ResponseTemplate::new(206).set_body_bytes(vec![1u8; 40]))
        .mount(&server)
        .await;

    let (downloaded, _) =
        measure_download(&reqwest::Client::new(), &format!("{}/down", server.uri()), 100)
            .await
            .unwrap();
    assert_eq!(downloaded, 40);
}

#[tokio::test]
async fn test_upload_posts_payload_of_requested_size() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/up"))
        .and(header("content-type", "application/octet-stream"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    measure_upload(&reqwest::Client::new(), &format!("{}/up", server.uri()), 2_048)
        .await
        .unwrap();

    let requests = server.received_requests().await.unwrap();
    let upload = requests
        .iter()
        .find(|r| r.url.path() == "/up")
        .unwrap();
    assert_eq!(upload.body.len(), 2_048);
    // Random, not a zero-filled buffer
    assert!(upload.body.iter().any(|b| *b != 0));
}

#[tokio::test]
async fn test_speedtest_reports_failed_upload_as_none() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/down"))
        .and(header("range", "bytes=0-511"))
        .respond_with(ResponseTemplate::new(206).set_body_bytes(vec![0u8; 512]))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/up"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let result = speedtest(&reqwest::Client::new(), &plan_for(&server, 512, 64), consent())
        .await
        .unwrap();
    assert_eq!(result.downloaded, 512);
    assert!(result.upload.is_none());
}

#[tokio::test]
async fn test_speedtest_with_working_upload() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/down"))
        .respond_with(ResponseTemplate::new(206).set_body_bytes(vec![0u8; 256]))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/up"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let result = speedtest(&reqwest::Client::new(), &plan_for(&server, 256, 64), consent())
        .await
        .unwrap();
    assert!(result.upload.is_some());
}

#[tokio::test]
async fn test_speedtest_fails_when_download_fails() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/down"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/up"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let result = speedtest(&reqwest::Client::new(), &plan_for(&server, 256, 64), consent()).await;
    assert!(result.is_err());
}

// =============================================================================
// CONTROL CLIENT TESTS
// =============================================================================

#[tokio::test]
async fn test_core_start_posts_index_with_key() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/core/start"))
        .and(header("authorization", "Bearer k3y"))
        .and(body_json(json!({ "index": 2 })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "pid": 4242,
            "config": "a.example.com"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let control = ControlClient::new(reqwest::Client::new(), &server.uri(), Some("k3y".to_string()));
    assert!(cmd_core_start(&control, Some(2)).await.is_ok());
}

#[tokio::test]
async fn test_core_start_surfaces_api_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/core/start"))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({
            "error": "engine error: sing-box binary not found"
        })))
        .mount(&server)
        .await;

    let control = ControlClient::new(reqwest::Client::new(), &server.uri(), None);
    let result = cmd_core_start(&control, None).await;
    assert!(result.is_err());
    assert!(result.unwrap_err().to_string().contains("binary not found"));
}

#[tokio::test]
async fn test_core_stop() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/core/stop"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "stopped": false })))
        .expect(1)
        .mount(&server)
        .await;

    let control = ControlClient::new(reqwest::Client::new(), &format!("{}/", server.uri()), None);
    assert!(cmd_core_stop(&control).await.is_ok());
}
