//! Ephemeral integration environments.
//!
//! Brings up a dependency service and the application under test as
//! containers on a shared network, waits for both to become ready, hands
//! control to a test runner, and tears everything down afterwards.
//!
//! Every step is idempotent by name, so an environment left behind by an
//! aborted run is replaced rather than duplicated:
//! - Networks are reused when one with the exact name exists
//! - Containers with a taken name are stopped and removed before creation
//! - Readiness is polled a bounded number of times at a fixed interval
//! - Stop waits are bounded; logs are drained only once a container exits
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                              Orchestrator                                 │
//! │                                                                           │
//! │   bring_up()                                                              │
//! │         │                                                                 │
//! │         ▼                                                                 │
//! │   ┌──────────────┐     ┌──────────────┐     ┌──────────────────────────┐  │
//! │   │ Network      │────▶│ Pull Image   │────▶│ Start Dependency         │  │
//! │   │ (get/create) │     │              │     │ (pre-clean, create, run) │  │
//! │   └──────────────┘     └──────────────┘     └──────────────────────────┘  │
//! │                                                         │                 │
//! │                                                         ▼                 │
//! │   ┌──────────────┐     ┌──────────────┐     ┌──────────────────────────┐  │
//! │   │ Start App    │◀────│ Build Image  │◀────│ Poll Dependency (TCP)    │  │
//! │   │              │     │ (tar context)│     │                          │  │
//! │   └──────────────┘     └──────────────┘     └──────────────────────────┘  │
//! │         │                                                                 │
//! │         ▼                                                                 │
//! │   ┌──────────────┐     ┌──────────────┐     ┌──────────────────────────┐  │
//! │   │ Poll App     │────▶│ Run Tests    │────▶│ tear_down(): stop app    │  │
//! │   │ (HTTP)       │     │              │     │ (drain logs), stop dep   │  │
//! │   └──────────────┘     └──────────────┘     └──────────────────────────┘  │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use testbed::config::EnvironmentConfig;
//! use testbed::engine::DockerEngine;
//! use testbed::environment::Orchestrator;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = Arc::new(DockerEngine::connect().await?);
//! let mut orchestrator = Orchestrator::new(engine, EnvironmentConfig::default().to_plan());
//!
//! let (passed, report) = orchestrator
//!     .run(|env| async move {
//!         println!("app container: {}", env.app.id);
//!         true
//!     })
//!     .await?;
//!
//! if !report.is_clean() {
//!     eprintln!("teardown had {} failure(s)", report.failures.len());
//! }
//! assert!(passed);
//! # Ok(())
//! # }
//! ```

pub mod archive;
pub mod config;
pub mod container;
pub mod error;
pub mod image;
pub mod network;
pub mod orchestrator;
pub mod readiness;
pub mod sink;

pub use archive::{BuildContext, ContextEntry};
pub use config::{AppSpec, EnvironmentPlan, ServiceSpec};
pub use container::{Container, ContainerManager, DEFAULT_STOP_TIMEOUT, StartOptions};
pub use error::{ArchiveError, EnvironmentError, ProbeError, ReadinessError, Result, Stage};
pub use image::{Image, ImageManager};
pub use network::{Network, NetworkManager};
pub use orchestrator::{
    Environment, EnvironmentState, Orchestrator, OrchestratorBuilder, TeardownReport,
};
#[cfg(feature = "postgres")]
pub use readiness::PostgresProbe;
#[cfg(feature = "mssql")]
pub use readiness::MssqlProbe;
pub use readiness::{FnProbe, HttpProbe, ReadinessPoller, ReadinessProbe, TcpProbe};
pub use sink::{NullSink, OutputSink, StdioSink, TracingSink};
