//! Container engine capability surface.
//!
//! The environment managers never talk to a daemon directly. They consume the
//! [`ContainerEngine`] trait, which exposes exactly the calls an ephemeral test
//! environment needs: network listing/creation, container lifecycle, log
//! retrieval, and image pull/build streams.
//!
//! [`DockerEngine`] implements the trait over a local Docker daemon using
//! bollard. Tests use the in-memory engine from [`crate::testing`].

mod docker;
pub mod error;

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

pub use docker::{DockerEngine, connect_docker};
pub use error::{EngineError, Result};

/// Host address every published port is bound to.
pub const PUBLISH_HOST_IP: &str = "0.0.0.0";

/// Build-instructions file expected at the root of every build context.
pub const BUILD_FILE_NAME: &str = "Dockerfile";

/// A network known to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSummary {
    /// Engine-assigned identity.
    pub id: String,
    /// Human-readable name.
    pub name: String,
}

/// A container as reported by a listing, running or not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    /// Engine-assigned identity.
    pub id: String,
    /// Names in engine namespace form (`/<name>`).
    pub names: Vec<String>,
}

/// Everything needed to create a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateContainerRequest {
    /// Declared container name.
    pub name: String,
    /// Image reference to run.
    pub image: String,
    /// Hostname inside the container.
    pub hostname: String,
    /// TCP port exposed and published on the same host port.
    pub port: u16,
    /// Environment variables.
    pub env: BTreeMap<String, String>,
    /// Identity of the network to join.
    pub network_id: String,
}

impl CreateContainerRequest {
    /// Environment rendered as `KEY=VALUE` entries.
    pub fn env_entries(&self) -> Vec<String> {
        self.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect()
    }

    /// Port key in engine form (`<port>/tcp`).
    pub fn port_key(&self) -> String {
        format!("{}/tcp", self.port)
    }
}

/// Which output stream a log chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// A piece of container log output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogChunk {
    pub stream: LogStream,
    pub bytes: Bytes,
}

/// Stream of human-readable progress lines from a pull or build.
pub type ProgressStream<'a> = BoxStream<'a, Result<String>>;

/// Stream of demultiplexed container log chunks.
pub type LogChunkStream<'a> = BoxStream<'a, Result<LogChunk>>;

/// Operations a container engine must provide.
///
/// Implementations must be shareable across the network, image and container
/// managers, which all hold the same handle.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// List every network.
    async fn list_networks(&self) -> Result<Vec<NetworkSummary>>;

    /// Create an attachable network.
    async fn create_network(&self, name: &str) -> Result<NetworkSummary>;

    /// List every container regardless of state.
    async fn list_containers(&self) -> Result<Vec<ContainerSummary>>;

    /// Create a container and return its identity.
    async fn create_container(&self, request: &CreateContainerRequest) -> Result<String>;

    /// Start a created container.
    async fn start_container(&self, id: &str) -> Result<()>;

    /// Send the stop signal. Stopping an already stopped container succeeds.
    async fn stop_container(&self, id: &str) -> Result<()>;

    /// Resolve once the container is no longer running, or with the error
    /// the engine reported while waiting.
    async fn wait_not_running(&self, id: &str) -> Result<()>;

    /// Remove a stopped container.
    async fn remove_container(&self, id: &str) -> Result<()>;

    /// Fetch the accumulated stdout/stderr log of a container.
    fn container_logs<'a>(&'a self, id: &'a str) -> LogChunkStream<'a>;

    /// Pull an image, streaming progress until every layer is present.
    fn pull_image<'a>(&'a self, reference: &'a str) -> ProgressStream<'a>;

    /// Build an image from a tar build context, tagging it `tag`.
    fn build_image<'a>(&'a self, context: Bytes, tag: &'a str) -> ProgressStream<'a>;
}
