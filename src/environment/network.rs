//! Idempotent network lookup-or-create.

use std::sync::Arc;

use crate::engine::ContainerEngine;
use crate::environment::error::{EnvironmentError, Result};

/// An isolated network containers join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Network {
    /// Engine-assigned identity.
    pub id: String,
    /// Human-readable name.
    pub name: String,
}

/// Creates networks, reusing any that already exist under the same name.
pub struct NetworkManager {
    engine: Arc<dyn ContainerEngine>,
}

impl NetworkManager {
    pub fn new(engine: Arc<dyn ContainerEngine>) -> Self {
        Self { engine }
    }

    /// Return the network named `name`, creating it if no exact match exists.
    ///
    /// Created networks are attachable. Existing networks are returned as-is.
    pub async fn create(&self, name: &str) -> Result<Network> {
        let network_err = |source| EnvironmentError::Network {
            name: name.to_string(),
            source,
        };

        let existing = self.engine.list_networks().await.map_err(network_err)?;
        if let Some(found) = existing.into_iter().find(|n| n.name == name) {
            tracing::debug!("Reusing network '{}' ({})", name, found.id);
            return Ok(Network {
                id: found.id,
                name: found.name,
            });
        }

        let created = self.engine.create_network(name).await.map_err(network_err)?;
        tracing::info!("Created network '{}' ({})", name, created.id);

        Ok(Network {
            id: created.id,
            name: created.name,
        })
    }
}
