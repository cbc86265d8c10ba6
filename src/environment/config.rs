//! Plan types describing the environment to bring up.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::environment::container::DEFAULT_STOP_TIMEOUT;
use crate::environment::readiness::{DEFAULT_INTERVAL, DEFAULT_MAX_ATTEMPTS};

/// A dependency service run from a pulled image.
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    /// Container name, also its hostname on the network.
    pub name: String,
    /// Image reference to pull.
    pub image: String,
    /// Port exposed and published on the host.
    pub port: u16,
    pub env: BTreeMap<String, String>,
}

/// The application under test, built from a source tree.
#[derive(Debug, Clone)]
pub struct AppSpec {
    /// Container name.
    pub name: String,
    /// Tag for the built image.
    pub tag: String,
    /// Build context root; must contain a `Dockerfile`.
    pub source_dir: PathBuf,
    /// Port exposed and published on the host.
    pub port: u16,
    pub env: BTreeMap<String, String>,
    /// Path requested by the default HTTP readiness probe.
    pub health_path: String,
}

impl AppSpec {
    /// URL of the health endpoint on the host.
    pub fn health_url(&self) -> String {
        format!(
            "http://127.0.0.1:{}/{}",
            self.port,
            self.health_path.trim_start_matches('/')
        )
    }
}

/// Everything needed for one environment lifecycle.
#[derive(Debug, Clone)]
pub struct EnvironmentPlan {
    /// Network both containers join.
    pub network: String,
    pub dependency: ServiceSpec,
    pub app: AppSpec,
    /// Readiness attempts per service.
    pub max_attempts: u32,
    /// Pause between readiness attempts.
    pub poll_interval: Duration,
    /// Bound on waiting for a stopped container.
    pub stop_timeout: Duration,
    /// Keep stopped containers after teardown instead of removing them.
    pub keep_on_teardown: bool,
}

impl EnvironmentPlan {
    pub fn new(network: impl Into<String>, dependency: ServiceSpec, app: AppSpec) -> Self {
        Self {
            network: network.into(),
            dependency,
            app,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            poll_interval: DEFAULT_INTERVAL,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            keep_on_teardown: false,
        }
    }
}
