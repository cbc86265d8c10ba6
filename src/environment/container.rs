//! Idempotent start and bounded stop of named containers.
//!
//! Container names are the idempotency key: starting a container whose name
//! is already taken first stops and removes the stale instance, so at most one
//! container with a given name exists afterwards. Stopping never removes; the
//! next start's pre-clean (or the caller) does that.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;

use crate::engine::{ContainerEngine, CreateContainerRequest, EngineError};
use crate::environment::error::{EnvironmentError, Result};
use crate::environment::image::Image;
use crate::environment::network::Network;
use crate::environment::sink::OutputSink;

/// Default bound on waiting for a stopped container to reach not-running.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// Handle to a container started by [`ContainerManager::start`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    /// Engine-assigned identity.
    pub id: String,
    /// Declared name.
    pub name: String,
}

/// What to run and how to wire it.
#[derive(Debug, Clone)]
pub struct StartOptions {
    /// Unique container name, also used as hostname.
    pub name: String,
    pub image: Image,
    /// Exposed TCP port, published on the same host port.
    pub port: u16,
    pub network: Network,
    pub environment: BTreeMap<String, String>,
}

/// Starts, stops and removes single named containers.
pub struct ContainerManager {
    engine: Arc<dyn ContainerEngine>,
    sink: Arc<dyn OutputSink>,
    stop_timeout: Duration,
}

impl ContainerManager {
    pub fn new(engine: Arc<dyn ContainerEngine>, sink: Arc<dyn OutputSink>) -> Self {
        Self {
            engine,
            sink,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }

    /// Bound the wait for a container to reach not-running after a stop.
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn stop_timeout(&self) -> Duration {
        self.stop_timeout
    }

    /// Find the identity of the container named `name`, running or not.
    pub async fn lookup(&self, name: &str) -> std::result::Result<Option<String>, EngineError> {
        let namespaced = format!("/{}", name);
        let containers = self.engine.list_containers().await?;

        Ok(containers
            .into_iter()
            .find(|c| c.names.iter().any(|n| *n == namespaced))
            .map(|c| c.id))
    }

    /// Start a fresh container, replacing any existing one with the same name.
    ///
    /// Failures while replacing the stale container abort the start.
    pub async fn start(&self, options: &StartOptions) -> Result<Container> {
        let name = options.name.clone();

        self.pre_clean(&name)
            .await
            .map_err(|source| EnvironmentError::PreClean {
                name: name.clone(),
                source: Box::new(source),
            })?;

        let request = CreateContainerRequest {
            name: name.clone(),
            image: options.image.reference.clone(),
            hostname: name.clone(),
            port: options.port,
            env: options.environment.clone(),
            network_id: options.network.id.clone(),
        };

        let id = self
            .engine
            .create_container(&request)
            .await
            .map_err(|source| EnvironmentError::Create {
                name: name.clone(),
                source,
            })?;

        self.engine
            .start_container(&id)
            .await
            .map_err(|source| EnvironmentError::Start {
                name: name.clone(),
                source,
            })?;

        tracing::info!(
            "Started container '{}' ({}) from {} on port {}",
            name,
            id,
            options.image.reference,
            options.port
        );

        Ok(Container { id, name })
    }

    /// Stop `container` and wait until it is no longer running.
    ///
    /// An error reported while waiting is logged and the stop proceeds. When
    /// `drain_logs` is set the container's log is copied to the sink after
    /// the not-running signal, never before.
    pub async fn stop(&self, container: &Container, drain_logs: bool) -> Result<()> {
        self.engine
            .stop_container(&container.id)
            .await
            .map_err(|source| EnvironmentError::Stop {
                name: container.name.clone(),
                source,
            })?;

        match tokio::time::timeout(
            self.stop_timeout,
            self.engine.wait_not_running(&container.id),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!("Error waiting for container '{}' to stop: {}", container.name, e);
            }
            Err(_) => {
                return Err(EnvironmentError::StopTimeout {
                    name: container.name.clone(),
                    timeout: self.stop_timeout,
                });
            }
        }

        tracing::info!("Stopped container '{}'", container.name);

        if drain_logs {
            self.drain_logs(container).await;
        }

        Ok(())
    }

    /// Remove a stopped container. A container that is already gone is not an error.
    pub async fn remove(&self, container: &Container) -> Result<()> {
        match self.engine.remove_container(&container.id).await {
            Ok(()) => {
                tracing::debug!("Removed container '{}'", container.name);
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                tracing::debug!("Container '{}' already removed", container.name);
                Ok(())
            }
            Err(source) => Err(EnvironmentError::Remove {
                name: container.name.clone(),
                source,
            }),
        }
    }

    async fn pre_clean(&self, name: &str) -> Result<()> {
        let id = self
            .lookup(name)
            .await
            .map_err(|source| EnvironmentError::Lookup {
                name: name.to_string(),
                source,
            })?;

        let Some(id) = id else {
            tracing::debug!("No existing container named '{}'", name);
            return Ok(());
        };

        tracing::info!("Replacing existing container '{}' ({})", name, id);

        let stale = Container {
            id,
            name: name.to_string(),
        };
        self.stop(&stale, false).await?;
        self.remove(&stale).await
    }

    async fn drain_logs(&self, container: &Container) {
        let mut logs = self.engine.container_logs(&container.id);

        while let Some(chunk) = logs.next().await {
            match chunk {
                Ok(chunk) => self.sink.log(&container.name, chunk.stream, &chunk.bytes),
                Err(e) => {
                    tracing::warn!("Failed to read logs of container '{}': {}", container.name, e);
                    break;
                }
            }
        }
    }
}
