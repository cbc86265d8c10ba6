//! Error types for environment setup and teardown.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::engine::EngineError;

/// Result type for environment operations.
pub type Result<T> = std::result::Result<T, EnvironmentError>;

/// Lifecycle stage an error belongs to, for user-facing reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Network,
    Pull,
    Build,
    Start,
    Readiness,
    Stop,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Network => "network",
            Stage::Pull => "pull",
            Stage::Build => "build",
            Stage::Start => "start",
            Stage::Readiness => "readiness",
            Stage::Stop => "stop",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Local I/O failure while turning a source tree into a build context.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// A directory could not be listed.
    #[error("cannot read directory {}: {source}", path.display())]
    ReadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A file could not be read.
    #[error("cannot read file {}: {source}", path.display())]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A path could not be expressed as a UTF-8 archive entry name.
    #[error("path {} is not valid UTF-8", path.display())]
    InvalidPath { path: PathBuf },

    /// Writing the archive stream failed.
    #[error("cannot append {entry} to build context: {source}")]
    Write {
        entry: String,
        #[source]
        source: std::io::Error,
    },
}

/// A readiness probe failure.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// The target refused or dropped the connection.
    #[error("connection to {target} failed: {reason}")]
    Connect { target: String, reason: String },

    /// The target answered but did not look healthy.
    #[error("{target} is not healthy: {reason}")]
    Unhealthy { target: String, reason: String },

    /// The probe did not answer in time.
    #[error("probe of {target} timed out after {timeout:?}")]
    Timeout { target: String, timeout: Duration },
}

/// The poller gave up on a probe.
#[derive(Debug, Error)]
#[error("not ready after {attempts} attempts: {last_error}")]
pub struct ReadinessError {
    /// Number of probe invocations made.
    pub attempts: u32,
    /// Failure reported by the final invocation.
    #[source]
    pub last_error: ProbeError,
}

/// Errors raised while bringing an environment up or down.
#[derive(Debug, Error)]
pub enum EnvironmentError {
    /// Network lookup or creation failed.
    #[error("network '{name}': {source}")]
    Network {
        name: String,
        #[source]
        source: EngineError,
    },

    /// Image pull failed.
    #[error("pull of image '{image}' failed: {source}")]
    Pull {
        image: String,
        #[source]
        source: EngineError,
    },

    /// The build context could not be assembled.
    #[error("build context for image '{tag}': {source}")]
    BuildContext {
        tag: String,
        #[source]
        source: ArchiveError,
    },

    /// The build context has no build file at its root.
    #[error("build context for image '{tag}' has no {file} at {}", dir.display())]
    MissingBuildFile {
        tag: String,
        file: &'static str,
        dir: PathBuf,
    },

    /// Image build failed.
    #[error("build of image '{tag}' failed: {source}")]
    Build {
        tag: String,
        #[source]
        source: EngineError,
    },

    /// Listing containers to find one by name failed.
    #[error("lookup of container '{name}' failed: {source}")]
    Lookup {
        name: String,
        #[source]
        source: EngineError,
    },

    /// Removing a stale container of the same name failed.
    #[error("pre-clean of container '{name}' failed: {source}")]
    PreClean {
        name: String,
        #[source]
        source: Box<EnvironmentError>,
    },

    /// Container creation failed.
    #[error("create of container '{name}' failed: {source}")]
    Create {
        name: String,
        #[source]
        source: EngineError,
    },

    /// Container start failed.
    #[error("start of container '{name}' failed: {source}")]
    Start {
        name: String,
        #[source]
        source: EngineError,
    },

    /// A service never became ready.
    #[error("'{name}' did not become ready: {source}")]
    Readiness {
        name: String,
        #[source]
        source: ReadinessError,
    },

    /// Sending the stop signal failed.
    #[error("stop of container '{name}' failed: {source}")]
    Stop {
        name: String,
        #[source]
        source: EngineError,
    },

    /// The container did not reach not-running within the deadline.
    #[error("container '{name}' did not stop within {timeout:?}")]
    StopTimeout { name: String, timeout: Duration },

    /// Removing a container failed.
    #[error("remove of container '{name}' failed: {source}")]
    Remove {
        name: String,
        #[source]
        source: EngineError,
    },
}

impl EnvironmentError {
    /// The lifecycle stage that failed.
    pub fn stage(&self) -> Stage {
        match self {
            Self::Network { .. } => Stage::Network,
            Self::Pull { .. } => Stage::Pull,
            Self::BuildContext { .. } | Self::MissingBuildFile { .. } | Self::Build { .. } => {
                Stage::Build
            }
            Self::Lookup { .. }
            | Self::PreClean { .. }
            | Self::Create { .. }
            | Self::Start { .. } => Stage::Start,
            Self::Readiness { .. } => Stage::Readiness,
            Self::Stop { .. } | Self::StopTimeout { .. } | Self::Remove { .. } => Stage::Stop,
        }
    }

    /// Name of the network, image or container the error concerns.
    pub fn resource(&self) -> &str {
        match self {
            Self::Network { name, .. }
            | Self::Lookup { name, .. }
            | Self::PreClean { name, .. }
            | Self::Create { name, .. }
            | Self::Start { name, .. }
            | Self::Readiness { name, .. }
            | Self::Stop { name, .. }
            | Self::StopTimeout { name, .. }
            | Self::Remove { name, .. } => name,
            Self::Pull { image, .. } => image,
            Self::BuildContext { tag, .. }
            | Self::MissingBuildFile { tag, .. }
            | Self::Build { tag, .. } => tag,
        }
    }
}
