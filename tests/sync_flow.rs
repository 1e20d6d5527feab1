mod support;

use signage_runtime::api::{AuthMode, DisplayApi};
use signage_runtime::identity;
use signage_runtime::registration::{register_display, RegistrationInput};
use signage_runtime::runtime::{DisplayRuntime, RuntimeStatus};
use signage_runtime::signer::DisplayCredentials;
use signage_runtime::store::LocalStore;
use signage_runtime::sync::{ConnectionState, SyncConfig, SyncPhase, SyncSnapshot, Synchronizer};
use signage_runtime::timing::Viewport;
use signage_runtime::types::DisplayRegistrationRecord;
use std::time::Duration;
use support::{manifest_json, StubServer, DEVICE_API_KEY, DEVICE_ID, PAIRING_CODE};
use tokio::sync::watch;
use tokio::time::{sleep, timeout, Instant};

const WAIT: Duration = Duration::from_secs(5);

fn api(server: &StubServer) -> DisplayApi {
    DisplayApi::new(&server.base_url(), Duration::from_secs(2)).expect("client")
}

fn config(poll_ms: u64, heartbeat_ms: u64) -> SyncConfig {
    SyncConfig {
        poll_interval: Duration::from_millis(poll_ms),
        heartbeat_interval: Duration::from_millis(heartbeat_ms),
        stream_retry_min: Duration::from_millis(50),
        stream_retry_max: Duration::from_millis(200),
    }
}

async fn signed_display(server: &StubServer) -> AuthMode {
    let api = api(server);
    let store = LocalStore::in_memory().await.expect("store");
    let record = register_display(
        &api,
        &store,
        RegistrationInput {
            pairing_code: PAIRING_CODE.into(),
            display_slug: "atrium".into(),
            display_name: "Atrium".into(),
            resolution_width: 1080,
            resolution_height: 1920,
            display_output: "DP-1".into(),
            machine_id: "sync-test-machine".into(),
        },
    )
    .await
    .expect("registration");
    let key = identity::load_key_pair(&store, &record.key_alias).await.expect("key");
    AuthMode::Signed(DisplayCredentials::new(&record, key).expect("creds"))
}

async fn wait_snapshot(
    rx: &mut watch::Receiver<SyncSnapshot>,
    what: &str,
    pred: impl FnMut(&SyncSnapshot) -> bool,
) -> SyncSnapshot {
    timeout(WAIT, rx.wait_for(pred))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
        .expect("synchronizer alive")
        .clone()
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        sleep(Duration::from_millis(20)).await;
    }
}

fn version(snapshot: &SyncSnapshot) -> Option<&str> {
    snapshot.manifest.as_ref().map(|m| m.playlist_version.as_str())
}

#[tokio::test]
async fn signed_display_connects_and_follows_pushed_changes() {
    let server = StubServer::start().await;
    let auth = signed_display(&server).await;
    let sync = Synchronizer::spawn(api(&server), auth, config(60_000, 60_000));
    let mut rx = sync.subscribe();

    let snapshot = wait_snapshot(&mut rx, "first manifest", |s| {
        s.manifest.is_some() && s.connection == ConnectionState::Connected
    })
    .await;
    assert_eq!(version(&snapshot), Some("v1"));
    assert_eq!(snapshot.phase, SyncPhase::Syncing);
    assert!(server.with_state(|s| s.authenticated.contains("atrium")));

    server.set_manifest(manifest_json("v2", &[("x", 1, 8.0)]));
    server.notify();

    let snapshot = wait_snapshot(&mut rx, "pushed manifest", |s| version(s) == Some("v2")).await;
    assert_eq!(snapshot.manifest.as_ref().map(|m| m.items.len()), Some(1));
    assert!(snapshot.last_event_at.is_some());
    assert!(snapshot.error_message.is_none());

    sync.shutdown().await;
}

#[tokio::test]
async fn dropped_stream_reconnects_while_poll_keeps_manifest_fresh() {
    let server = StubServer::start().await;
    let auth = signed_display(&server).await;
    let sync = Synchronizer::spawn(api(&server), auth, config(300, 60_000));
    let mut rx = sync.subscribe();

    wait_snapshot(&mut rx, "connected", |s| {
        s.manifest.is_some() && s.connection == ConnectionState::Connected
    })
    .await;
    let fetches_before = server.with_state(|s| s.manifest_fetches);

    server.close_streams();
    server.set_manifest(manifest_json("v3", &[("a", 1, 5.0)]));

    eventually("stream reconnect", || server.with_state(|s| s.stream_connects >= 2)).await;
    let snapshot = wait_snapshot(&mut rx, "polled manifest", |s| version(s) == Some("v3")).await;
    assert!(server.with_state(|s| s.manifest_fetches) > fetches_before);
    assert!(snapshot.fatal.is_none());

    wait_snapshot(&mut rx, "connected again", |s| {
        s.connection == ConnectionState::Connected
    })
    .await;

    sync.shutdown().await;
}

#[tokio::test]
async fn heartbeats_are_sent_and_their_failures_stay_quiet() {
    let server = StubServer::start().await;
    let auth = signed_display(&server).await;
    let sync = Synchronizer::spawn(api(&server), auth, config(60_000, 100));
    let mut rx = sync.subscribe();

    wait_snapshot(&mut rx, "connected", |s| {
        s.manifest.is_some() && s.connection == ConnectionState::Connected
    })
    .await;
    eventually("heartbeats", || server.with_state(|s| s.heartbeats >= 2)).await;

    server.with_state(|s| s.fail_heartbeats = true);
    let failing_from = server.with_state(|s| s.heartbeats);
    eventually("failing heartbeats", || {
        server.with_state(|s| s.heartbeats >= failing_from + 2)
    })
    .await;

    let snapshot = sync.snapshot();
    assert_eq!(snapshot.connection, ConnectionState::Connected);
    assert!(snapshot.error_message.is_none());
    assert_eq!(version(&snapshot), Some("v1"));

    sync.shutdown().await;
}

#[tokio::test]
async fn api_key_device_syncs_without_heartbeats() {
    let server = StubServer::start().await;
    let auth = AuthMode::ApiKey {
        device_id: DEVICE_ID.into(),
        api_key: DEVICE_API_KEY.into(),
    };
    let sync = Synchronizer::spawn(api(&server), auth, config(60_000, 100));
    let mut rx = sync.subscribe();

    wait_snapshot(&mut rx, "connected", |s| {
        s.manifest.is_some() && s.connection == ConnectionState::Connected
    })
    .await;

    server.set_manifest(manifest_json("v9", &[("a", 1, 5.0)]));
    server.notify();
    wait_snapshot(&mut rx, "pushed manifest", |s| version(s) == Some("v9")).await;

    sleep(Duration::from_millis(300)).await;
    assert_eq!(server.with_state(|s| s.heartbeats), 0);

    sync.shutdown().await;
}

#[tokio::test]
async fn rejected_api_key_is_reported_and_retried_not_fatal() {
    let server = StubServer::start().await;
    let auth = AuthMode::ApiKey {
        device_id: DEVICE_ID.into(),
        api_key: "wrong".into(),
    };
    let sync = Synchronizer::spawn(api(&server), auth, config(60_000, 60_000));
    let mut rx = sync.subscribe();

    let snapshot = wait_snapshot(&mut rx, "fetch error", |s| s.error_message.is_some()).await;
    assert!(snapshot.manifest.is_none());
    assert!(snapshot.fatal.is_none());
    assert_ne!(snapshot.connection, ConnectionState::Connected);

    sync.shutdown().await;
}

#[tokio::test]
async fn unknown_display_fails_connect_and_halts_playback() {
    let home = StubServer::start().await;
    let auth = signed_display(&home).await;

    let stranger = StubServer::start().await;
    let sync = Synchronizer::spawn(api(&stranger), auth, config(60_000, 60_000));
    let runtime = DisplayRuntime::spawn(sync.subscribe(), Viewport::new(1920, 1080));
    let mut rx = sync.subscribe();

    let snapshot = wait_snapshot(&mut rx, "fatal connect", |s| s.fatal.is_some()).await;
    assert_eq!(snapshot.phase, SyncPhase::Closed);
    assert_eq!(snapshot.connection, ConnectionState::Closed);
    assert_eq!(stranger.with_state(|s| s.manifest_fetches), 0);

    let mut status = runtime.status();
    let status = timeout(WAIT, status.wait_for(|s| matches!(s, RuntimeStatus::Fatal(_))))
        .await
        .expect("runtime reports fatal")
        .expect("runtime alive")
        .clone();
    match status {
        RuntimeStatus::Fatal(message) => assert!(message.contains("DISPLAY_UNKNOWN")),
        other => panic!("unexpected {other:?}"),
    }

    runtime.shutdown().await;
    sync.shutdown().await;
}

#[tokio::test]
async fn display_booted_before_server_connects_once_it_appears() {
    let addr = {
        let vacant = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        vacant.local_addr().expect("addr")
    };

    let store = LocalStore::in_memory().await.expect("store");
    let key = identity::get_or_create_key_pair(&store, "fp:HDMI-0").await.expect("key");
    let public_key_pem = key.public_key_pem().to_string();
    let record = DisplayRegistrationRecord {
        display_id: "display-foyer".into(),
        display_slug: "foyer".into(),
        key_id: "key-foyer".into(),
        key_alias: "fp:HDMI-0".into(),
        display_fingerprint: "fp".into(),
        display_output: "HDMI-0".into(),
        registered_at: chrono::Utc::now(),
    };
    let auth = AuthMode::Signed(DisplayCredentials::new(&record, key).expect("creds"));
    let api = DisplayApi::new(&format!("http://{addr}"), Duration::from_secs(2)).expect("client");
    let sync = Synchronizer::spawn(api, auth, config(60_000, 60_000));
    let mut rx = sync.subscribe();

    let snapshot = wait_snapshot(&mut rx, "connect error", |s| s.error_message.is_some()).await;
    assert!(snapshot.fatal.is_none());
    assert_eq!(snapshot.connection, ConnectionState::Reconnecting);

    let server = StubServer::start_at(addr).await;
    server.seed_display("foyer", "key-foyer", &public_key_pem);

    let snapshot = wait_snapshot(&mut rx, "late connect", |s| {
        s.manifest.is_some() && s.connection == ConnectionState::Connected
    })
    .await;
    assert_eq!(version(&snapshot), Some("v1"));
    assert!(snapshot.fatal.is_none());
    assert!(server.with_state(|s| s.authenticated.contains("foyer")));

    sync.shutdown().await;
}
