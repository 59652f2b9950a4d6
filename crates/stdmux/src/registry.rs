//! Registry of containers known to this process.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::broadcast::ExitReason;
use crate::container::{ContainerConfig, ContainerIo};
use crate::launcher::{LaunchError, LaunchSpec, ProcessLauncher};
use crate::session::{AttachError, AttachOptions, AttachSession};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("container {0} already exists")]
    AlreadyExists(String),
}

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("no such container: {0}")]
    NotFound(String),
    #[error("failed to launch container: {0}")]
    Launch(#[from] LaunchError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyStarted,
}

/// Containers by id. Each container has its own broadcaster and state;
/// the map itself is the only thing they share.
pub struct ContainerRegistry {
    containers: DashMap<String, Arc<ContainerIo>>,
    launcher: Arc<dyn ProcessLauncher>,
}

impl ContainerRegistry {
    pub fn new(launcher: Arc<dyn ProcessLauncher>) -> Self {
        Self {
            containers: DashMap::new(),
            launcher,
        }
    }

    pub fn create(
        &self,
        id: impl Into<String>,
        config: ContainerConfig,
    ) -> Result<Arc<ContainerIo>, RegistryError> {
        let id = id.into();
        match self.containers.entry(id.clone()) {
            Entry::Occupied(_) => Err(RegistryError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                let container = ContainerIo::new(id.clone(), config);
                slot.insert(Arc::clone(&container));
                tracing::info!(container_id = %id, tty = container.tty(), "Container created");
                Ok(container)
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<ContainerIo>> {
        self.containers.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Remove a container. Output ends for every attached session and
    /// sessions waiting for start fail.
    pub fn remove(&self, id: &str) -> Option<Arc<ContainerIo>> {
        let (_, container) = self.containers.remove(id)?;
        container.mark_removed();
        Some(container)
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.containers.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.containers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.containers.is_empty()
    }

    /// Launch the container's process. Starting twice is not an error.
    pub async fn start(&self, id: &str) -> Result<StartOutcome, StartError> {
        let container = self
            .get(id)
            .ok_or_else(|| StartError::NotFound(id.to_string()))?;

        if !container.claim_start() {
            tracing::debug!(container_id = %id, state = container.run_state().as_str(), "Container already started");
            return Ok(StartOutcome::AlreadyStarted);
        }

        let spec = LaunchSpec::for_container(&container);
        match self.launcher.launch(&spec).await {
            Ok(process) => {
                container.attach_process(process).await;
                Ok(StartOutcome::Started)
            }
            Err(e) => {
                tracing::error!(container_id = %id, error = %e, "Container launch failed");
                container.fail_start(ExitReason::failed(e.to_string()));
                Err(e.into())
            }
        }
    }

    /// Create an attach session. Run it over a transport to start streaming.
    pub fn attach(&self, id: &str, options: AttachOptions) -> Result<AttachSession, AttachError> {
        let container = self
            .get(id)
            .ok_or_else(|| AttachError::ContainerNotFound(id.to_string()))?;
        Ok(AttachSession::new(container, options))
    }
}
