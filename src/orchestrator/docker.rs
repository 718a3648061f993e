use std::collections::HashMap;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bollard::errors::Error as BollardError;
use bollard::service::{InspectServiceOptions, ListServicesOptions, UpdateServiceOptions};
use bollard::system::EventsOptions;
use bollard::Docker;
use futures_util::stream::StreamExt;
use log::debug;
use tokio::sync::mpsc;

use super::{Orchestrator, Subscription};
use crate::types::{EventAction, EventFilter, OrchestratorEvent, RolloutReceipt, ServiceState};

const EVENT_CHANNEL_CAPACITY: usize = 128;

/// Orchestrator port backed by the local Docker daemon in swarm mode.
pub struct DockerOrchestrator {
    docker: Docker,
}

impl DockerOrchestrator {
    /// Connect to the local daemon using default settings. This handles
    /// the unix socket on Linux.
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .context("failed to connect to the Docker daemon")?;
        Ok(Self { docker })
    }

    /// Liveness probe, used at startup to fail fast on an unreachable
    /// daemon.
    pub async fn ping(&self) -> Result<()> {
        self.docker
            .ping()
            .await
            .context("Docker daemon unreachable")?;
        Ok(())
    }

    async fn raw_inspect(&self, name: &str) -> Result<bollard::models::Service> {
        self.docker
            .inspect_service(name, None::<InspectServiceOptions>)
            .await
            .with_context(|| format!("inspecting service {name}"))
    }
}

fn decode_service(service: bollard::models::Service) -> Option<ServiceState> {
    let spec = service.spec?;
    let name = spec.name?;
    let version = service.version.and_then(|v| v.index).unwrap_or_default();
    let image = spec
        .task_template
        .as_ref()
        .and_then(|task| task.container_spec.as_ref())
        .and_then(|container| container.image.clone())
        .unwrap_or_default();
    Some(ServiceState {
        name,
        labels: spec.labels.unwrap_or_default(),
        version,
        image,
    })
}

fn decode_event(message: bollard::models::EventMessage) -> Option<OrchestratorEvent> {
    let action = EventAction::parse(message.action.as_deref()?)?;
    let actor = message.actor?;
    Some(OrchestratorEvent {
        action,
        actor_id: actor.id.unwrap_or_default(),
        attributes: actor.attributes.unwrap_or_default(),
        time: message.time.unwrap_or_default(),
    })
}

#[async_trait]
impl Orchestrator for DockerOrchestrator {
    async fn list_services(&self) -> Result<Vec<ServiceState>> {
        let services = self
            .docker
            .list_services(Some(ListServicesOptions::<String>::default()))
            .await
            .context("listing services")?;
        Ok(services.into_iter().filter_map(decode_service).collect())
    }

    async fn inspect_service(&self, name: &str) -> Result<Option<ServiceState>> {
        match self
            .docker
            .inspect_service(name, None::<InspectServiceOptions>)
            .await
        {
            Ok(service) => Ok(decode_service(service)),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(None),
            Err(e) => Err(e).with_context(|| format!("inspecting service {name}")),
        }
    }

    async fn subscribe(&self, filter: EventFilter) -> Result<Subscription> {
        let mut filters = HashMap::new();
        filters.insert("type".to_string(), vec![filter.scope.to_string()]);
        filters.insert(
            "event".to_string(),
            filter.actions.iter().map(|a| a.to_string()).collect(),
        );

        let mut stream = self.docker.events(Some(EventsOptions::<String> {
            filters,
            ..Default::default()
        }));
        let (event_tx, events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (error_tx, errors) = mpsc::channel(1);

        tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                match message {
                    Ok(message) => {
                        let Some(event) = decode_event(message) else {
                            continue;
                        };
                        if event_tx.send(event).await.is_err() {
                            // Subscriber went away; stop pumping.
                            return;
                        }
                    }
                    Err(e) => {
                        let _ = error_tx.send(anyhow::Error::new(e)).await;
                        return;
                    }
                }
            }
            debug!("docker event stream ended");
        });

        Ok(Subscription { events, errors })
    }

    async fn update_service_image(&self, name: &str, image: &str) -> Result<RolloutReceipt> {
        let service = self.raw_inspect(name).await?;
        let old_version = service
            .version
            .as_ref()
            .and_then(|v| v.index)
            .unwrap_or_default();
        let id = service
            .id
            .clone()
            .ok_or_else(|| anyhow!("service {name} has no id"))?;
        let mut spec = service
            .spec
            .ok_or_else(|| anyhow!("service {name} has no spec"))?;

        let container = spec
            .task_template
            .as_mut()
            .and_then(|task| task.container_spec.as_mut())
            .ok_or_else(|| anyhow!("service {name} has no container spec"))?;
        container.image = Some(image.to_string());

        self.docker
            .update_service(
                &id,
                spec,
                UpdateServiceOptions {
                    version: old_version,
                    ..Default::default()
                },
                None,
            )
            .await
            .with_context(|| format!("updating service {name}"))?;

        // Re-inspect for the post-rollout version index.
        let updated = self.raw_inspect(name).await?;
        let new_version = updated
            .version
            .and_then(|v| v.index)
            .unwrap_or(old_version);

        Ok(RolloutReceipt {
            success: true,
            old_version,
            new_version,
        })
    }
}
