//! Environment lifecycle facade.
//!
//! Brings up the dependency container, waits for it, builds and starts the
//! application, waits for that, hands control to the caller, then tears both
//! down in reverse order.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;

use crate::engine::ContainerEngine;
use crate::environment::config::EnvironmentPlan;
use crate::environment::container::{Container, ContainerManager, StartOptions};
use crate::environment::error::{EnvironmentError, Result};
use crate::environment::image::ImageManager;
use crate::environment::network::{Network, NetworkManager};
use crate::environment::readiness::{HttpProbe, ReadinessPoller, ReadinessProbe, TcpProbe};
use crate::environment::sink::{OutputSink, StdioSink};

/// Lifecycle states, in the only order they are visited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EnvironmentState {
    Init,
    NetworkReady,
    DependencyImageReady,
    DependencyRunning,
    DependencyHealthy,
    AppImageReady,
    AppRunning,
    AppHealthy,
    TestsRunning,
    TornDown,
}

impl std::fmt::Display for EnvironmentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Init => "init",
            Self::NetworkReady => "network ready",
            Self::DependencyImageReady => "dependency image ready",
            Self::DependencyRunning => "dependency running",
            Self::DependencyHealthy => "dependency healthy",
            Self::AppImageReady => "app image ready",
            Self::AppRunning => "app running",
            Self::AppHealthy => "app healthy",
            Self::TestsRunning => "tests running",
            Self::TornDown => "torn down",
        };
        f.write_str(s)
    }
}

/// A running environment handed to the test runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    pub network: Network,
    pub dependency: Container,
    pub app: Container,
}

/// Failures collected during teardown.
#[derive(Debug, Default)]
pub struct TeardownReport {
    pub failures: Vec<EnvironmentError>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn record(&mut self, result: Result<()>) {
        if let Err(e) = result {
            tracing::warn!("Teardown: {}", e);
            self.failures.push(e);
        }
    }
}

/// Sequences network, image, container and readiness operations.
pub struct Orchestrator {
    plan: EnvironmentPlan,
    networks: NetworkManager,
    images: ImageManager,
    containers: ContainerManager,
    poller: ReadinessPoller,
    dependency_probe: Box<dyn ReadinessProbe>,
    app_probe: Box<dyn ReadinessProbe>,
    state: EnvironmentState,
}

impl Orchestrator {
    /// Orchestrator with stdio output and probes derived from the plan.
    pub fn new(engine: Arc<dyn ContainerEngine>, plan: EnvironmentPlan) -> Self {
        OrchestratorBuilder::new(engine, plan).build()
    }

    pub fn builder(engine: Arc<dyn ContainerEngine>, plan: EnvironmentPlan) -> OrchestratorBuilder {
        OrchestratorBuilder::new(engine, plan)
    }

    pub fn state(&self) -> EnvironmentState {
        self.state
    }

    pub fn plan(&self) -> &EnvironmentPlan {
        &self.plan
    }

    /// The container manager, for callers that manage containers by name.
    pub fn containers(&self) -> &ContainerManager {
        &self.containers
    }

    fn advance(&mut self, next: EnvironmentState) {
        debug_assert!(next >= self.state, "{} -> {}", self.state, next);
        tracing::info!("Environment: {}", next);
        self.state = next;
    }

    /// Bring the environment up to [`EnvironmentState::TestsRunning`].
    ///
    /// The first failure aborts the sequence; containers already started are
    /// left for the next run's pre-clean.
    pub async fn bring_up(&mut self) -> Result<Environment> {
        self.state = EnvironmentState::Init;

        let network = self.networks.create(&self.plan.network).await?;
        self.advance(EnvironmentState::NetworkReady);

        let dependency_image = self.images.pull(&self.plan.dependency.image).await?;
        self.advance(EnvironmentState::DependencyImageReady);

        let dependency = self
            .containers
            .start(&StartOptions {
                name: self.plan.dependency.name.clone(),
                image: dependency_image,
                port: self.plan.dependency.port,
                network: network.clone(),
                environment: self.plan.dependency.env.clone(),
            })
            .await?;
        self.advance(EnvironmentState::DependencyRunning);

        self.poller
            .wait_until_ready(self.dependency_probe.as_ref())
            .await
            .map_err(|source| EnvironmentError::Readiness {
                name: dependency.name.clone(),
                source,
            })?;
        self.advance(EnvironmentState::DependencyHealthy);

        let app_image = self
            .images
            .build(&self.plan.app.tag, &self.plan.app.source_dir)
            .await?;
        self.advance(EnvironmentState::AppImageReady);

        let app = self
            .containers
            .start(&StartOptions {
                name: self.plan.app.name.clone(),
                image: app_image,
                port: self.plan.app.port,
                network: network.clone(),
                environment: self.plan.app.env.clone(),
            })
            .await?;
        self.advance(EnvironmentState::AppRunning);

        self.poller
            .wait_until_ready(self.app_probe.as_ref())
            .await
            .map_err(|source| EnvironmentError::Readiness {
                name: app.name.clone(),
                source,
            })?;
        self.advance(EnvironmentState::AppHealthy);

        self.advance(EnvironmentState::TestsRunning);
        Ok(Environment {
            network,
            dependency,
            app,
        })
    }

    /// Stop the application (draining its logs), then the dependency.
    ///
    /// Failures are collected rather than returned. Stopped containers are
    /// removed unless the plan keeps them; the network is left in place.
    pub async fn tear_down(&mut self, environment: Environment) -> TeardownReport {
        let mut report = TeardownReport::default();

        let app_stopped = self.containers.stop(&environment.app, true).await;
        let app_stopped_ok = app_stopped.is_ok();
        report.record(app_stopped);

        let dependency_stopped = self.containers.stop(&environment.dependency, false).await;
        let dependency_stopped_ok = dependency_stopped.is_ok();
        report.record(dependency_stopped);

        if !self.plan.keep_on_teardown {
            if app_stopped_ok {
                report.record(self.containers.remove(&environment.app).await);
            }
            if dependency_stopped_ok {
                report.record(self.containers.remove(&environment.dependency).await);
            }
        } else {
            tracing::info!("Keeping stopped containers (keep_on_teardown=true)");
        }

        self.advance(EnvironmentState::TornDown);
        report
    }

    /// Bring up, run `tests`, and tear down whatever the tests returned.
    ///
    /// A panic in `tests` is resumed only after teardown.
    pub async fn run<F, Fut, T>(&mut self, tests: F) -> Result<(T, TeardownReport)>
    where
        F: FnOnce(Environment) -> Fut,
        Fut: Future<Output = T>,
    {
        let environment = self.bring_up().await?;
        let for_tests = environment.clone();
        let outcome = AssertUnwindSafe(async move { tests(for_tests).await })
            .catch_unwind()
            .await;
        let report = self.tear_down(environment).await;
        match outcome {
            Ok(outcome) => Ok((outcome, report)),
            Err(panic) => {
                tracing::warn!("Tests panicked; environment torn down before resuming");
                std::panic::resume_unwind(panic)
            }
        }
    }
}

/// Builder for an [`Orchestrator`].
pub struct OrchestratorBuilder {
    engine: Arc<dyn ContainerEngine>,
    plan: EnvironmentPlan,
    sink: Arc<dyn OutputSink>,
    dependency_probe: Option<Box<dyn ReadinessProbe>>,
    app_probe: Option<Box<dyn ReadinessProbe>>,
}

impl OrchestratorBuilder {
    pub fn new(engine: Arc<dyn ContainerEngine>, plan: EnvironmentPlan) -> Self {
        Self {
            engine,
            plan,
            sink: Arc::new(StdioSink),
            dependency_probe: None,
            app_probe: None,
        }
    }

    /// Where pull/build progress and drained logs go.
    pub fn sink(mut self, sink: Arc<dyn OutputSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Replace the default TCP probe of the dependency port.
    pub fn dependency_probe(mut self, probe: impl ReadinessProbe + 'static) -> Self {
        self.dependency_probe = Some(Box::new(probe));
        self
    }

    /// Replace the default HTTP probe of the application health URL.
    pub fn app_probe(mut self, probe: impl ReadinessProbe + 'static) -> Self {
        self.app_probe = Some(Box::new(probe));
        self
    }

    pub fn build(self) -> Orchestrator {
        let plan = self.plan;

        let dependency_probe = self
            .dependency_probe
            .unwrap_or_else(|| Box::new(TcpProbe::localhost(plan.dependency.port)));
        let app_probe = self
            .app_probe
            .unwrap_or_else(|| Box::new(HttpProbe::new(plan.app.health_url())));

        Orchestrator {
            networks: NetworkManager::new(self.engine.clone()),
            images: ImageManager::new(self.engine.clone(), self.sink.clone()),
            containers: ContainerManager::new(self.engine, self.sink)
                .with_stop_timeout(plan.stop_timeout),
            poller: ReadinessPoller::new(plan.max_attempts, plan.poll_interval),
            dependency_probe,
            app_probe,
            state: EnvironmentState::Init,
            plan,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::path::Path;
    use std::time::Duration;

    use super::*;
    use crate::environment::config::{AppSpec, ServiceSpec};
    use crate::testing::{FakeEngine, Operation, RecordingSink, ScriptedProbe};

    fn plan(source_dir: &Path) -> EnvironmentPlan {
        let mut plan = EnvironmentPlan::new(
            "env",
            ServiceSpec {
                name: "db".to_string(),
                image: "postgres:16".to_string(),
                port: 5432,
                env: BTreeMap::new(),
            },
            AppSpec {
                name: "app".to_string(),
                tag: "app".to_string(),
                source_dir: source_dir.to_path_buf(),
                port: 8080,
                env: BTreeMap::new(),
                health_path: "/health".to_string(),
            },
        );
        plan.poll_interval = Duration::from_millis(10);
        plan
    }

    fn source_tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Dockerfile"), "FROM scratch\n").unwrap();
        dir
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_pull_stops_before_dependency() {
        let dir = source_tree();
        let engine = Arc::new(FakeEngine::new());
        engine.fail_on(Operation::PullImage);

        let mut orchestrator = Orchestrator::builder(engine.clone(), plan(dir.path()))
            .sink(Arc::new(RecordingSink::default()))
            .dependency_probe(ScriptedProbe::succeed_after(0))
            .app_probe(ScriptedProbe::succeed_after(0))
            .build();

        let err = orchestrator.bring_up().await.unwrap_err();

        assert_eq!(err.stage().as_str(), "pull");
        assert_eq!(orchestrator.state(), EnvironmentState::NetworkReady);
        assert!(engine.containers().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unready_dependency_aborts_before_build() {
        let dir = source_tree();
        let engine = Arc::new(FakeEngine::new());
        let mut test_plan = plan(dir.path());
        test_plan.max_attempts = 3;

        let mut orchestrator = Orchestrator::builder(engine.clone(), test_plan)
            .sink(Arc::new(RecordingSink::default()))
            .dependency_probe(ScriptedProbe::always_failing())
            .app_probe(ScriptedProbe::succeed_after(0))
            .build();

        let err = orchestrator.bring_up().await.unwrap_err();

        assert!(matches!(err, EnvironmentError::Readiness { ref name, .. } if name == "db"));
        assert_eq!(orchestrator.state(), EnvironmentState::DependencyRunning);
        assert!(!engine.has_image("app"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_on_teardown_leaves_stopped_containers() {
        let dir = source_tree();
        let engine = Arc::new(FakeEngine::new());
        let mut test_plan = plan(dir.path());
        test_plan.keep_on_teardown = true;

        let mut orchestrator = Orchestrator::builder(engine.clone(), test_plan)
            .sink(Arc::new(RecordingSink::default()))
            .dependency_probe(ScriptedProbe::succeed_after(0))
            .app_probe(ScriptedProbe::succeed_after(0))
            .build();

        let environment = orchestrator.bring_up().await.unwrap();
        let report = orchestrator.tear_down(environment).await;

        assert!(report.is_clean());
        let containers = engine.containers();
        assert_eq!(containers.len(), 2);
        assert!(containers.iter().all(|c| !c.running));
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_collects_failures_and_continues() {
        let dir = source_tree();
        let engine = Arc::new(FakeEngine::new());

        let mut orchestrator = Orchestrator::builder(engine.clone(), plan(dir.path()))
            .sink(Arc::new(RecordingSink::default()))
            .dependency_probe(ScriptedProbe::succeed_after(0))
            .app_probe(ScriptedProbe::succeed_after(0))
            .build();

        let environment = orchestrator.bring_up().await.unwrap();
        engine.fail_on(Operation::StopContainer);
        let report = orchestrator.tear_down(environment).await;

        assert_eq!(report.failures.len(), 2);
        assert_eq!(orchestrator.state(), EnvironmentState::TornDown);
    }
}
