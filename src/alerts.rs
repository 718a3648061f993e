//! Container anomaly alerts, deduplicated over a cooldown window.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, error};
use tokio_util::sync::CancellationToken;

use crate::notify::{Notification, Notifier};
use crate::state::RecentEvents;
use crate::supervisor::EventHandler;
use crate::types::OrchestratorEvent;

const ALERT_TITLE: &str = "DOCKER SWARM EVENT";
const COOLDOWN: Duration = Duration::from_secs(60);
const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);
const MAX_EVENT_AGE: Duration = Duration::from_secs(10 * 60);
const SHORT_ID_LEN: usize = 12;

pub struct AlertPipeline {
    notifier: Arc<dyn Notifier>,
    recent: Arc<RecentEvents>,
}

impl AlertPipeline {
    pub fn new(notifier: Arc<dyn Notifier>, recent: Arc<RecentEvents>) -> Self {
        Self { notifier, recent }
    }

    /// Handle one container `die`/`restart`/`crash` event. Send
    /// failures are logged and never retried.
    pub async fn handle_container_event(&self, event: &OrchestratorEvent) {
        let short_id = short_container_id(&event.actor_id);
        let key = format!("{short_id}:{}", event.action.as_str());
        if !self.recent.observe(&key, Instant::now(), COOLDOWN).await {
            debug!("suppressing duplicate container event {key}");
            return;
        }

        let name = event.actor_name().unwrap_or_default();
        let exit_code = event
            .attributes
            .get("exitCode")
            .map(String::as_str)
            .unwrap_or_default();
        let notification = Notification {
            title: ALERT_TITLE.to_string(),
            message: format!(
                "Container has died or restarted: {name} ({short_id}) with exit code {exit_code}"
            ),
            timestamp: event.time,
        };
        if let Err(e) = self.notifier.send(&notification).await {
            error!("failed to send notification for {key}: {e:#}");
        }
    }

    /// Periodically evict stale dedup entries.
    pub async fn run_sweeper(&self, cancel: CancellationToken) {
        let start = tokio::time::Instant::now() + SWEEP_INTERVAL;
        let mut ticker = tokio::time::interval_at(start, SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("recent-event sweeper stopping");
                    return;
                }
                _ = ticker.tick() => self.recent.sweep(Instant::now(), MAX_EVENT_AGE).await,
            }
        }
    }
}

// Container ids are hex ascii, so a byte slice is a char slice.
fn short_container_id(id: &str) -> &str {
    &id[..id.len().min(SHORT_ID_LEN)]
}

#[async_trait]
impl EventHandler for AlertPipeline {
    async fn handle(&self, event: OrchestratorEvent) -> Result<()> {
        self.handle_container_event(&event).await;
        Ok(())
    }
}
