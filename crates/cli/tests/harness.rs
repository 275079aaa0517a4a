//! Server lifecycle against the fixture subject

use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use specrun::server::{find_free_port, LaunchConfig, ServerHandle, StopOutcome};
use specrun::spec::ServerConfig;
use specrun::{HarnessError, RunnerConfig};

fn fixture() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_specrun-fixture"))
}

fn launch(env: &[(&str, &str)]) -> LaunchConfig {
    let server = ServerConfig {
        env: env
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        ..Default::default()
    };
    LaunchConfig::new(fixture(), &server, &RunnerConfig::default())
}

#[tokio::test]
async fn test_waits_for_readiness_then_stops_gracefully() {
    let started = Instant::now();
    let mut server = ServerHandle::spawn(
        launch(&[("FIXTURE_READY_AFTER_MS", "300")]),
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    // /health answers 503 until the delay has passed
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(300), "{elapsed:?}");

    let resp = server
        .client()
        .get(server.url("/hello"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    assert_eq!(server.stop().await.unwrap(), StopOutcome::Graceful);
    assert_eq!(server.stop().await.unwrap(), StopOutcome::NotRunning);
    assert!(server.stdout().contains("fixture listening"), "{}", server.stdout());
    assert!(server.stdout().contains("fixture shutting down"), "{}", server.stdout());
}

#[tokio::test]
async fn test_fixed_port_is_used() {
    let port = find_free_port().unwrap();
    let config = LaunchConfig {
        port: Some(port),
        ..launch(&[])
    };

    let mut server = ServerHandle::spawn(config, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(server.port, port);
    assert_eq!(server.base_url(), format!("http://127.0.0.1:{port}"));
    assert!(server.pid().is_some());

    server.stop().await.unwrap();
    assert!(server.pid().is_none());
}

#[tokio::test]
async fn test_never_ready_reports_captured_output() {
    let config = LaunchConfig {
        startup_timeout: Duration::from_secs(1),
        ..launch(&[("FIXTURE_NEVER_READY", "1")])
    };

    let started = Instant::now();
    let err = ServerHandle::spawn(config, &CancellationToken::new())
        .await
        .err()
        .expect("server should never become ready");
    assert!(started.elapsed() < Duration::from_secs(8));

    match err {
        HarnessError::ReadinessTimeout {
            attempts, stdout, ..
        } => {
            assert!(attempts > 1);
            assert!(stdout.contains("fixture listening"), "{stdout}");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_crash_before_ready_is_reported_early() {
    let started = Instant::now();
    let err = ServerHandle::spawn(launch(&[("FIXTURE_CRASH", "boom")]), &CancellationToken::new())
        .await
        .err()
        .expect("server should crash");
    assert!(started.elapsed() < Duration::from_secs(5));

    match err {
        HarnessError::ProcessExited { stderr, .. } => {
            assert!(stderr.contains("fatal: boom"), "{stderr}");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[cfg(unix)]
#[tokio::test]
async fn test_ignored_termination_escalates_to_kill() {
    let config = LaunchConfig {
        shutdown_timeout: Duration::from_millis(300),
        ..launch(&[("FIXTURE_IGNORE_SIGTERM", "1")])
    };
    let mut server = ServerHandle::spawn(config, &CancellationToken::new())
        .await
        .unwrap();

    let started = Instant::now();
    assert_eq!(server.stop().await.unwrap(), StopOutcome::Killed);
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_cancellation_interrupts_startup() {
    let cancel = CancellationToken::new();
    let config = LaunchConfig {
        startup_timeout: Duration::from_secs(30),
        ..launch(&[("FIXTURE_NEVER_READY", "1")])
    };

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let err = ServerHandle::spawn(config, &cancel)
        .await
        .err()
        .expect("startup should be cancelled");
    assert!(matches!(err, HarnessError::Cancelled), "{err}");
    assert!(started.elapsed() < Duration::from_secs(10));
}
