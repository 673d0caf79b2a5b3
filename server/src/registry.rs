//! Shared registry of live instances and their clients.
//!
//! Each instance owns one client map keyed by its instance id, holding
//! display name -> current opponent name. The leader reads every live map to
//! check name uniqueness and reads a restarted instance's map to clean up
//! after it. Writes are last-write-wins per key; nothing here is
//! linearizable.

use crate::error::RegistryError;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use tokio::sync::RwLock;

/// Display name -> opponent name.
pub type ClientMap = HashMap<String, Option<String>>;

/// Storage backend for the shared registry.
#[async_trait]
pub trait Registry: Send + Sync {
    async fn add_instance(&self, instance_id: &str) -> Result<(), RegistryError>;

    async fn remove_instance(&self, instance_id: &str) -> Result<(), RegistryError>;

    /// Ids of every live instance.
    async fn instances(&self) -> Result<Vec<String>, RegistryError>;

    /// Client map of one instance; empty if it has none.
    async fn clients(&self, instance_id: &str) -> Result<ClientMap, RegistryError>;

    async fn set_client(
        &self,
        instance_id: &str,
        name: &str,
        opponent: Option<&str>,
    ) -> Result<(), RegistryError>;

    async fn remove_client(&self, instance_id: &str, name: &str) -> Result<(), RegistryError>;

    /// Deletes the whole client map of an instance.
    async fn clear_clients(&self, instance_id: &str) -> Result<(), RegistryError>;
}

#[derive(Default)]
struct RegistryState {
    instances: BTreeSet<String>,
    clients: HashMap<String, ClientMap>,
}

/// Registry kept in process memory, shared by instances in one runtime.
#[derive(Default)]
pub struct InMemoryRegistry {
    state: RwLock<RegistryState>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Registry for InMemoryRegistry {
    async fn add_instance(&self, instance_id: &str) -> Result<(), RegistryError> {
        self.state
            .write()
            .await
            .instances
            .insert(instance_id.to_string());
        Ok(())
    }

    async fn remove_instance(&self, instance_id: &str) -> Result<(), RegistryError> {
        self.state.write().await.instances.remove(instance_id);
        Ok(())
    }

    async fn instances(&self) -> Result<Vec<String>, RegistryError> {
        Ok(self.state.read().await.instances.iter().cloned().collect())
    }

    async fn clients(&self, instance_id: &str) -> Result<ClientMap, RegistryError> {
        Ok(self
            .state
            .read()
            .await
            .clients
            .get(instance_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn set_client(
        &self,
        instance_id: &str,
        name: &str,
        opponent: Option<&str>,
    ) -> Result<(), RegistryError> {
        self.state
            .write()
            .await
            .clients
            .entry(instance_id.to_string())
            .or_default()
            .insert(name.to_string(), opponent.map(str::to_string));
        Ok(())
    }

    async fn remove_client(&self, instance_id: &str, name: &str) -> Result<(), RegistryError> {
        let mut state = self.state.write().await;
        if let Some(clients) = state.clients.get_mut(instance_id) {
            clients.remove(name);
            if clients.is_empty() {
                state.clients.remove(instance_id);
            }
        }
        Ok(())
    }

    async fn clear_clients(&self, instance_id: &str) -> Result<(), RegistryError> {
        self.state.write().await.clients.remove(instance_id);
        Ok(())
    }
}
