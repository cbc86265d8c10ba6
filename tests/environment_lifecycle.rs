//! Environment lifecycle tests.
//!
//! Drives the orchestrator end to end against the in-memory engine:
//! bring-up ordering, readiness retries, setup aborts, reruns over leftovers,
//! and teardown that survives failing tests and hanging containers.

use std::collections::BTreeMap;
use std::fs;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use pretty_assertions::assert_eq;

use testbed::engine::{ContainerEngine, LogStream};
use testbed::environment::{
    AppSpec, EnvironmentError, EnvironmentPlan, EnvironmentState, Orchestrator, ServiceSpec, Stage,
};
use testbed::testing::{EngineCall, FakeEngine, Operation, RecordingSink, ScriptedProbe};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn plan(source_dir: &Path) -> EnvironmentPlan {
    let mut plan = EnvironmentPlan::new(
        "env",
        ServiceSpec {
            name: "db".to_string(),
            image: "postgres:16".to_string(),
            port: 5432,
            env: BTreeMap::from([("POSTGRES_PASSWORD".to_string(), "pw".to_string())]),
        },
        AppSpec {
            name: "app".to_string(),
            tag: "app".to_string(),
            source_dir: source_dir.to_path_buf(),
            port: 8080,
            env: BTreeMap::from([("DB_HOST".to_string(), "db".to_string())]),
            health_path: "/health".to_string(),
        },
    );
    plan.poll_interval = Duration::from_millis(500);
    plan.stop_timeout = Duration::from_secs(5);
    plan
}

fn app_source() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("Dockerfile"), "FROM scratch\nCOPY app.bin /\n").unwrap();
    fs::write(dir.path().join("app.bin"), [0x7fu8, b'E', b'L', b'F']).unwrap();
    dir
}

fn position(calls: &[EngineCall], pred: impl Fn(&EngineCall) -> bool) -> usize {
    calls
        .iter()
        .position(pred)
        .unwrap_or_else(|| panic!("call not found in {:?}", calls))
}

// ---------------------------------------------------------------------------
// End to end
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_full_lifecycle() {
    let source = app_source();
    let engine = Arc::new(FakeEngine::new());
    let sink = Arc::new(RecordingSink::default());
    let db_probe = Arc::new(ScriptedProbe::succeed_after(4));
    let app_probe = Arc::new(ScriptedProbe::succeed_after(0));

    let mut orchestrator = Orchestrator::builder(engine.clone(), plan(source.path()))
        .sink(sink.clone())
        .dependency_probe(db_probe.clone())
        .app_probe(app_probe.clone())
        .build();

    let started = tokio::time::Instant::now();
    let env = orchestrator.bring_up().await.unwrap();

    assert_eq!(orchestrator.state(), EnvironmentState::TestsRunning);
    assert_eq!(db_probe.calls(), 5);
    assert_eq!(app_probe.calls(), 1);
    assert_eq!(started.elapsed(), Duration::from_millis(2000));

    // Both containers run on the same network, reachable by name.
    let db = engine.container(&env.dependency.id).unwrap();
    let app = engine.container(&env.app.id).unwrap();
    assert!(db.running && app.running);
    assert_eq!(db.request.network_id, env.network.id);
    assert_eq!(app.request.network_id, env.network.id);
    assert_eq!(db.request.hostname, "db");
    assert_eq!(app.request.port, 8080);
    assert_eq!(app.request.env_entries(), vec!["DB_HOST=db"]);
    assert_eq!(
        engine.build_context("app").unwrap(),
        vec!["Dockerfile".to_string(), "app.bin".to_string()]
    );

    // The app image is built only once the dependency is healthy.
    let calls = engine.calls();
    let pulled = position(&calls, |c| matches!(c, EngineCall::PullImage(_)));
    let db_started = position(&calls, |c| matches!(c, EngineCall::StartContainer(id) if *id == env.dependency.id));
    let built = position(&calls, |c| matches!(c, EngineCall::BuildImage(_)));
    let app_started = position(&calls, |c| matches!(c, EngineCall::StartContainer(id) if *id == env.app.id));
    assert!(pulled < db_started && db_started < built && built < app_started);

    engine.add_log(&env.app.id, LogStream::Stderr, b"GET /health 200\n");
    let report = orchestrator.tear_down(env.clone()).await;

    assert!(report.is_clean(), "{:?}", report.failures);
    assert_eq!(orchestrator.state(), EnvironmentState::TornDown);

    // App stopped (and drained) before the dependency.
    let calls = engine.calls();
    let app_stopped = position(&calls, |c| matches!(c, EngineCall::StopContainer(id) if *id == env.app.id));
    let app_logs = position(&calls, |c| matches!(c, EngineCall::FetchLogs(id) if *id == env.app.id));
    let db_stopped = position(&calls, |c| matches!(c, EngineCall::StopContainer(id) if *id == env.dependency.id));
    assert!(app_stopped < app_logs && app_logs < db_stopped);
    assert_eq!(
        engine.count_calls(|c| matches!(c, EngineCall::FetchLogs(id) if *id == env.dependency.id)),
        0
    );
    assert!(sink.logs_for("app").contains("GET /health 200"));

    let remaining = engine.list_containers().await.unwrap();
    assert!(remaining.is_empty(), "{:?}", remaining);
    let networks = engine.list_networks().await.unwrap();
    assert_eq!(networks.len(), 1);
    assert_eq!(networks[0].name, "env");
}

#[tokio::test(start_paused = true)]
async fn test_run_tears_down_after_failing_tests() {
    let source = app_source();
    let engine = Arc::new(FakeEngine::new());

    let mut orchestrator = Orchestrator::builder(engine.clone(), plan(source.path()))
        .sink(Arc::new(RecordingSink::default()))
        .dependency_probe(ScriptedProbe::succeed_after(0))
        .app_probe(ScriptedProbe::succeed_after(0))
        .build();

    let (outcome, report) = orchestrator
        .run(|env| async move {
            assert_eq!(env.app.name, "app");
            Err::<(), _>("2 tests failed")
        })
        .await
        .unwrap();

    assert_eq!(outcome, Err("2 tests failed"));
    assert!(report.is_clean());
    assert_eq!(orchestrator.state(), EnvironmentState::TornDown);
    assert!(engine.containers().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_run_tears_down_after_panicking_tests() {
    let source = app_source();
    let engine = Arc::new(FakeEngine::new());

    let mut orchestrator = Orchestrator::builder(engine.clone(), plan(source.path()))
        .sink(Arc::new(RecordingSink::default()))
        .dependency_probe(ScriptedProbe::succeed_after(0))
        .app_probe(ScriptedProbe::succeed_after(0))
        .build();

    let result = AssertUnwindSafe(orchestrator.run(|env| async move {
        assert!(env.app.name.is_empty(), "unexpected app {}", env.app.name);
    }))
    .catch_unwind()
    .await;

    let panic = result.err().expect("panic should propagate");
    assert_eq!(
        panic.downcast_ref::<String>().map(String::as_str),
        Some("unexpected app app")
    );
    assert_eq!(orchestrator.state(), EnvironmentState::TornDown);
    assert!(engine.containers().is_empty());
    assert_eq!(
        engine.count_calls(|c| matches!(c, EngineCall::StopContainer(_))),
        2
    );
}

// ---------------------------------------------------------------------------
// Setup aborts
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_build_failure_aborts_before_app_starts() {
    let source = tempfile::tempdir().unwrap();
    fs::write(source.path().join("app.bin"), b"bin").unwrap();
    let engine = Arc::new(FakeEngine::new());

    let mut orchestrator = Orchestrator::builder(engine.clone(), plan(source.path()))
        .sink(Arc::new(RecordingSink::default()))
        .dependency_probe(ScriptedProbe::succeed_after(0))
        .app_probe(ScriptedProbe::succeed_after(0))
        .build();

    let err = orchestrator.bring_up().await.unwrap_err();

    assert!(matches!(err, EnvironmentError::MissingBuildFile { .. }));
    assert_eq!(err.stage(), Stage::Build);
    assert_eq!(orchestrator.state(), EnvironmentState::DependencyHealthy);
    assert!(engine.container_named("app").is_none());
    assert_eq!(
        engine.count_calls(|c| matches!(c, EngineCall::BuildImage(_))),
        0
    );
    // Aborted setup leaves the dependency for the next run's pre-clean.
    assert!(engine.container_named("db").unwrap().running);
}

#[tokio::test(start_paused = true)]
async fn test_rerun_replaces_leftovers() {
    let source = app_source();
    let engine = Arc::new(FakeEngine::new());
    engine.fail_on(Operation::BuildImage);

    let mut first = Orchestrator::builder(engine.clone(), plan(source.path()))
        .sink(Arc::new(RecordingSink::default()))
        .dependency_probe(ScriptedProbe::succeed_after(0))
        .app_probe(ScriptedProbe::succeed_after(0))
        .build();
    let err = first.bring_up().await.unwrap_err();
    assert_eq!(err.resource(), "app");
    let leftover = engine.container_named("db").unwrap().id;

    engine.recover(Operation::BuildImage);
    let mut second = Orchestrator::builder(engine.clone(), plan(source.path()))
        .sink(Arc::new(RecordingSink::default()))
        .dependency_probe(ScriptedProbe::succeed_after(0))
        .app_probe(ScriptedProbe::succeed_after(0))
        .build();
    let env = second.bring_up().await.unwrap();

    assert_ne!(env.dependency.id, leftover);
    assert!(engine.container(&leftover).is_none());
    assert_eq!(engine.containers().len(), 2);
    assert_eq!(
        engine.count_calls(|c| matches!(c, EngineCall::CreateNetwork(_))),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn test_app_never_ready() {
    let source = app_source();
    let engine = Arc::new(FakeEngine::new());
    let app_probe = Arc::new(ScriptedProbe::always_failing());
    let mut test_plan = plan(source.path());
    test_plan.max_attempts = 12;

    let mut orchestrator = Orchestrator::builder(engine.clone(), test_plan)
        .sink(Arc::new(RecordingSink::default()))
        .dependency_probe(ScriptedProbe::succeed_after(0))
        .app_probe(app_probe.clone())
        .build();

    let err = orchestrator.bring_up().await.unwrap_err();

    match err {
        EnvironmentError::Readiness { name, source } => {
            assert_eq!(name, "app");
            assert_eq!(source.attempts, 12);
            assert!(source.last_error.to_string().contains("attempt 12"));
        }
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(app_probe.calls(), 12);
    assert_eq!(orchestrator.state(), EnvironmentState::AppRunning);
}

// ---------------------------------------------------------------------------
// Teardown
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_hanging_stop_is_reported_not_awaited_forever() {
    let source = app_source();
    let engine = Arc::new(FakeEngine::new());

    let mut orchestrator = Orchestrator::builder(engine.clone(), plan(source.path()))
        .sink(Arc::new(RecordingSink::default()))
        .dependency_probe(ScriptedProbe::succeed_after(0))
        .app_probe(ScriptedProbe::succeed_after(0))
        .build();

    let env = orchestrator.bring_up().await.unwrap();
    engine.hang_wait();

    let started = tokio::time::Instant::now();
    let report = orchestrator.tear_down(env).await;

    assert_eq!(started.elapsed(), Duration::from_secs(10));
    assert_eq!(report.failures.len(), 2);
    assert!(
        report
            .failures
            .iter()
            .all(|e| matches!(e, EnvironmentError::StopTimeout { .. }))
    );
    assert_eq!(report.failures[0].resource(), "app");
    assert_eq!(report.failures[1].resource(), "db");
    assert_eq!(
        engine.count_calls(|c| matches!(c, EngineCall::RemoveContainer(_))),
        0
    );
}
