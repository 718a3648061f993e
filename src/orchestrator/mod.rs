use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::types::{EventFilter, OrchestratorEvent, RolloutReceipt, ServiceState};

pub mod docker;
pub use docker::DockerOrchestrator;

/// Receiving ends of one event subscription. The stream is infinite
/// until the transport fails; a failure surfaces on `errors` and both
/// channels close.
pub struct Subscription {
    pub events: mpsc::Receiver<OrchestratorEvent>,
    pub errors: mpsc::Receiver<anyhow::Error>,
}

/// Orchestrator port: event streaming, service inspection and listing,
/// and imperative image rollouts.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// All services currently known to the cluster.
    async fn list_services(&self) -> Result<Vec<ServiceState>>;

    /// Inspect one service by name. `Ok(None)` when it no longer exists.
    async fn inspect_service(&self, name: &str) -> Result<Option<ServiceState>>;

    /// Open an event stream matching `filter`.
    async fn subscribe(&self, filter: EventFilter) -> Result<Subscription>;

    /// Replace the image of a running service and trigger a rollout.
    async fn update_service_image(&self, name: &str, image: &str) -> Result<RolloutReceipt>;
}
