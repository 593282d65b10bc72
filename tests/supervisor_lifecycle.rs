#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use sidecar::client::BackendClient;
use sidecar::{
    ErrorKind, ExitSignal, HealthStatus, InterpreterResolver, LogSink, Settings, Supervisor,
    SupervisorError, SupervisorState,
};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const HEALTH_PATH: &str = "/api/health_check";

fn write_script(dir: &TempDir, body: &str) -> PathBuf {
    let script = dir.path().join("main.sh");
    std::fs::write(&script, body).unwrap();
    script
}

fn supervisor(script: &Path, server: &MockServer, startup: Duration) -> Supervisor {
    let mut settings = Settings::for_script(script);
    settings.server_url = server.uri();
    settings.probe_timeout = Duration::from_millis(500);
    settings.startup_timeout = startup;
    settings.poll_interval = Duration::from_millis(100);
    settings.stop_timeout = Duration::from_secs(2);

    let resolver = InterpreterResolver::with_candidates(["/bad/path", "sh"], Duration::from_secs(5))
        .version_args(["-c", "exit 0"]);
    Supervisor::with_resolver(settings, LogSink::default(), resolver)
}

async fn mount_health(server: &MockServer, status: &str) {
    server.reset().await;
    Mock::given(method("GET"))
        .and(path(HEALTH_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": status })))
        .mount(server)
        .await;
}

// Version checks that pass only after `secs` seconds.
fn slow_resolver(secs: u32) -> InterpreterResolver {
    let check = format!("sleep {}; exit 0", secs);
    InterpreterResolver::with_candidates(["sh"], Duration::from_secs(10))
        .version_args(["-c".to_string(), check])
}

async fn wait_for_exit(sup: &Supervisor) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while sup.has_process() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn repeated_start_keeps_one_process() {
    let server = MockServer::start().await;
    mount_health(&server, "healthy").await;
    let dir = tempfile::tempdir().unwrap();
    let sup = supervisor(&write_script(&dir, "exec sleep 30\n"), &server, Duration::from_secs(5));

    sup.start().await.unwrap();
    let pid = sup.pid();
    assert!(pid.is_some());
    assert_eq!(sup.state(), SupervisorState::Healthy);

    sup.start().await.unwrap();
    sup.ensure_running().await.unwrap();
    sup.start().await.unwrap();

    assert_eq!(sup.launches(), 1);
    assert_eq!(sup.pid(), pid);
    assert_eq!(sup.exit_signal(), ExitSignal::Running);

    sup.stop().await;
}

#[tokio::test]
async fn concurrent_ensure_running_launches_once() {
    let server = MockServer::start().await;
    mount_health(&server, "healthy").await;
    let dir = tempfile::tempdir().unwrap();
    let sup = Arc::new(supervisor(
        &write_script(&dir, "exec sleep 30\n"),
        &server,
        Duration::from_secs(5),
    ));

    let a = tokio::spawn({
        let sup = Arc::clone(&sup);
        async move { sup.ensure_running().await }
    });
    let b = tokio::spawn({
        let sup = Arc::clone(&sup);
        async move { sup.ensure_running().await }
    });
    a.await.unwrap().unwrap();
    b.await.unwrap().unwrap();

    assert_eq!(sup.launches(), 1);
    sup.stop().await;
}

#[tokio::test]
async fn stop_twice_after_start() {
    let server = MockServer::start().await;
    mount_health(&server, "healthy").await;
    let dir = tempfile::tempdir().unwrap();
    let sup = supervisor(&write_script(&dir, "exec sleep 30\n"), &server, Duration::from_secs(5));

    sup.start().await.unwrap();
    sup.stop().await;
    assert!(!sup.has_process());
    assert!(matches!(sup.exit_signal(), ExitSignal::Exited(_)));

    sup.stop().await;
    assert_eq!(sup.state(), SupervisorState::Stopped);
}

#[tokio::test]
async fn stuck_process_is_restarted_exactly_once() {
    let server = MockServer::start().await;
    mount_health(&server, "healthy").await;
    let dir = tempfile::tempdir().unwrap();
    let sup = supervisor(
        &write_script(&dir, "exec sleep 30\n"),
        &server,
        Duration::from_millis(600),
    );

    sup.start().await.unwrap();
    let first = sup.pid();

    // Process stays up but the endpoint no longer answers healthy.
    mount_health(&server, "starting").await;
    let err = sup.ensure_running().await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ReadinessTimeout);
    assert_eq!(sup.restarts(), 1);
    assert_eq!(sup.launches(), 2);
    assert!(sup.has_process());
    assert_ne!(sup.pid(), first);
    assert_eq!(sup.state(), SupervisorState::Unhealthy);

    sup.stop().await;
}

#[tokio::test]
async fn recovers_after_unexpected_exit() {
    let server = MockServer::start().await;
    mount_health(&server, "healthy").await;
    let dir = tempfile::tempdir().unwrap();
    let sup = supervisor(&write_script(&dir, "exec sleep 30\n"), &server, Duration::from_secs(5));

    sup.start().await.unwrap();
    let pid = sup.pid().unwrap();
    let status = std::process::Command::new("kill")
        .args(["-9", &pid.to_string()])
        .status()
        .unwrap();
    assert!(status.success());

    wait_for_exit(&sup).await;
    assert!(!sup.has_process());
    assert_eq!(sup.exit_signal(), ExitSignal::Exited(None));
    assert_eq!(sup.state(), SupervisorState::Unhealthy);

    sup.ensure_running().await.unwrap();
    assert_eq!(sup.launches(), 2);
    assert_eq!(sup.restarts(), 0);
    assert_eq!(sup.state(), SupervisorState::Healthy);

    sup.stop().await;
}

#[tokio::test]
async fn stop_cancels_pending_start() {
    let server = MockServer::start().await;
    mount_health(&server, "starting").await;
    let dir = tempfile::tempdir().unwrap();
    let sup = Arc::new(supervisor(
        &write_script(&dir, "exec sleep 30\n"),
        &server,
        Duration::from_secs(10),
    ));

    let pending = tokio::spawn({
        let sup = Arc::clone(&sup);
        async move { sup.start().await }
    });

    let deadline = Instant::now() + Duration::from_secs(5);
    while !sup.has_process() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(sup.has_process());

    let stopped_at = Instant::now();
    sup.stop().await;
    let result = pending.await.unwrap();

    assert!(matches!(result, Err(SupervisorError::Cancelled)));
    assert!(stopped_at.elapsed() < Duration::from_secs(3));
    assert!(!sup.has_process());
    assert_eq!(sup.state(), SupervisorState::Stopped);
}

#[tokio::test]
async fn missing_script_never_spawns() {
    let server = MockServer::start().await;
    mount_health(&server, "healthy").await;
    let dir = tempfile::tempdir().unwrap();
    let mut settings = Settings::for_script(dir.path().join("main.py"));
    settings.server_url = server.uri();
    let sup = Supervisor::with_resolver(settings, LogSink::default(), slow_resolver(3));

    let started = Instant::now();
    let err = sup.start().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PathMissing);
    // Reported before any interpreter version check runs.
    assert!(started.elapsed() < Duration::from_secs(1), "took {:?}", started.elapsed());
    assert!(!sup.has_process());
    assert_eq!(sup.launches(), 0);
    assert_eq!(sup.exit_signal(), ExitSignal::NeverStarted);

    let lines = sup.sink().lines();
    assert!(lines.iter().any(|l| l.text.contains("Server script not found")));
    assert!(lines.iter().all(|l| !l.text.starts_with("Using interpreter")));
}

#[tokio::test]
async fn stop_while_resolving_spawns_nothing() {
    let server = MockServer::start().await;
    mount_health(&server, "healthy").await;
    let dir = tempfile::tempdir().unwrap();
    let mut settings = Settings::for_script(write_script(&dir, "exec sleep 30\n"));
    settings.server_url = server.uri();
    let sup = Arc::new(Supervisor::with_resolver(
        settings,
        LogSink::default(),
        slow_resolver(1),
    ));

    let pending = tokio::spawn({
        let sup = Arc::clone(&sup);
        async move { sup.start().await }
    });
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(sup.state(), SupervisorState::Starting);
    sup.stop().await;

    let result = pending.await.unwrap();
    assert!(matches!(result, Err(SupervisorError::Cancelled)));
    assert_eq!(sup.launches(), 0);
    assert!(!sup.has_process());
    assert_eq!(sup.state(), SupervisorState::Stopped);
    assert!(sup.sink().lines().iter().all(|l| !l.text.starts_with("Spawned")));
}

#[tokio::test]
async fn check_health_answers_during_pending_start() {
    let server = MockServer::start().await;
    mount_health(&server, "starting").await;
    let dir = tempfile::tempdir().unwrap();
    let sup = Arc::new(supervisor(
        &write_script(&dir, "exec sleep 30\n"),
        &server,
        Duration::from_secs(10),
    ));

    let pending = tokio::spawn({
        let sup = Arc::clone(&sup);
        async move { sup.start().await }
    });
    let deadline = Instant::now() + Duration::from_secs(5);
    while !sup.has_process() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(sup.state(), SupervisorState::Starting);

    let asked = Instant::now();
    assert_eq!(sup.check_health().await, HealthStatus::Unhealthy);
    assert!(asked.elapsed() < Duration::from_secs(2));
    assert_eq!(sup.state(), SupervisorState::Starting);

    sup.stop().await;
    assert!(matches!(pending.await.unwrap(), Err(SupervisorError::Cancelled)));
}

#[tokio::test]
async fn child_output_reaches_sink() {
    let server = MockServer::start().await;
    mount_health(&server, "healthy").await;
    let dir = tempfile::tempdir().unwrap();
    let sup = supervisor(
        &write_script(&dir, "echo 'Uvicorn running'\necho 'warming up' >&2\nexec sleep 30\n"),
        &server,
        Duration::from_secs(5),
    );

    sup.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let lines = sup.sink().lines();
    assert!(lines
        .iter()
        .any(|l| l.stream == sidecar::Stream::Stdout && l.text == "Uvicorn running"));
    assert!(lines
        .iter()
        .any(|l| l.stream == sidecar::Stream::Stderr && l.text == "warming up"));

    sup.stop().await;
}

#[tokio::test]
async fn client_starts_backend_before_request() {
    let server = MockServer::start().await;
    mount_health(&server, "healthy").await;
    Mock::given(method("GET"))
        .and(path("/api/dashboard"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "versions": 3 })))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let sup = Arc::new(supervisor(
        &write_script(&dir, "exec sleep 30\n"),
        &server,
        Duration::from_secs(5),
    ));
    let client = BackendClient::new(Arc::clone(&sup), Duration::from_secs(5)).unwrap();

    assert!(!sup.has_process());
    let value = client.get_json("/api/dashboard").await.unwrap();
    assert_eq!(value["versions"], 3);
    assert!(sup.has_process());

    sup.stop().await;
}
