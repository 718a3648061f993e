//! Delayed-removal reconciler: prunes ingress hostnames whose backing
//! service is gone.
//!
//! Removal events only enqueue a pending record; a periodic pass
//! processes records older than the removal delay. The delay absorbs
//! rolling redeploys where a remove is immediately followed by a create
//! under the same name. The pass itself is convergent: desired state is
//! re-derived from a fresh service list and a fresh ingress fetch, never
//! from event history.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, error, info};
use tokio_util::sync::CancellationToken;

use crate::orchestrator::Orchestrator;
use crate::state::{rules_to_map, HostnameRegistry, IngressCache, PendingRemovals};
use crate::supervisor::EventHandler;
use crate::tunnel::TunnelEdge;
use crate::types::{hostnames_from_labels, IngressRule, OrchestratorEvent, LABEL_ENABLED};

const TICK_INTERVAL: Duration = Duration::from_secs(60);

pub struct RemovalReconciler {
    orchestrator: Arc<dyn Orchestrator>,
    edge: Arc<dyn TunnelEdge>,
    cache: Arc<IngressCache>,
    registry: Arc<HostnameRegistry>,
    pending: Arc<PendingRemovals>,
    removal_delay: Duration,
    delete_dns: bool,
}

impl RemovalReconciler {
    pub fn new(
        orchestrator: Arc<dyn Orchestrator>,
        edge: Arc<dyn TunnelEdge>,
        cache: Arc<IngressCache>,
        registry: Arc<HostnameRegistry>,
        pending: Arc<PendingRemovals>,
        removal_delay: Duration,
        delete_dns: bool,
    ) -> Self {
        Self {
            orchestrator,
            edge,
            cache,
            registry,
            pending,
            removal_delay,
            delete_dns,
        }
    }

    /// Tick loop; runs until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let start = tokio::time::Instant::now() + TICK_INTERVAL;
        let mut ticker = tokio::time::interval_at(start, TICK_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("removal reconciler stopping");
                    return;
                }
                _ = ticker.tick() => self.tick(Instant::now()).await,
            }
        }
    }

    /// One tick: drain matured pending removals and, if any, run a full
    /// reconciliation pass. Records are consumed regardless of the
    /// per-hostname outcome.
    pub async fn tick(&self, now: Instant) {
        let matured = self.pending.drain_matured(now, self.removal_delay).await;
        if matured.is_empty() {
            return;
        }
        info!("pending removals matured: {matured:?}");
        for service in &matured {
            self.registry.forget(service).await;
        }
        if let Err(e) = self.reconcile().await {
            error!("tunnel reconciliation failed: {e:#}");
        }
    }

    /// One convergent pass: prune ingress hostnames no running
    /// tunnel-enabled service claims.
    pub async fn reconcile(&self) -> Result<()> {
        let services = self
            .orchestrator
            .list_services()
            .await
            .context("listing services")?;
        let mut desired: HashMap<String, String> = HashMap::new();
        for service in &services {
            if service.labels.get(LABEL_ENABLED).map(String::as_str) != Some("true") {
                continue;
            }
            for hostname in hostnames_from_labels(&service.labels) {
                desired.insert(hostname, service.name.clone());
            }
        }

        // The remote table is authoritative here, not the cache.
        let current = self
            .edge
            .get_ingress()
            .await
            .context("fetching ingress table")?;
        let orphans: Vec<String> = current
            .iter()
            .filter(|rule| !rule.is_terminator())
            .filter_map(|rule| rule.hostname.clone())
            .filter(|hostname| !hostname.is_empty() && !desired.contains_key(hostname))
            .collect();

        if orphans.is_empty() {
            debug!("no orphaned ingress rules");
            self.cache.replace(rules_to_map(&current)).await;
            return Ok(());
        }

        let mut working = current;
        for orphan in &orphans {
            working.retain(|rule| rule.hostname.as_deref() != Some(orphan.as_str()));
            if let Err(e) = self.edge.put_ingress(rebuild(&working)).await {
                error!("failed to prune {orphan} from ingress: {e:#}");
                continue;
            }
            info!("pruned orphaned ingress rule for {orphan}");

            if self.delete_dns {
                if let Err(e) = self.delete_dns_record(orphan).await {
                    error!("failed to delete dns record for {orphan}: {e:#}");
                }
            }
        }

        let refreshed = self
            .edge
            .get_ingress()
            .await
            .context("refreshing ingress table")?;
        self.cache.replace(rules_to_map(&refreshed)).await;
        info!("reconciliation complete, {} orphan(s) processed", orphans.len());
        Ok(())
    }

    async fn delete_dns_record(&self, hostname: &str) -> Result<()> {
        let Some(zone_id) = self.edge.resolve_zone(hostname).await? else {
            debug!("no zone covers {hostname}, nothing to delete");
            return Ok(());
        };
        // A missing record is success: the goal state is "no record".
        let Some(record_id) = self.edge.lookup_record(&zone_id, hostname).await? else {
            debug!("no dns record for {hostname}");
            return Ok(());
        };
        self.edge.delete_record(&zone_id, &record_id).await?;
        info!("deleted dns record for {hostname}");
        Ok(())
    }
}

/// Written tables carry the surviving rules with the terminator last;
/// comma-hostname legacy entries never make it back out.
fn rebuild(rules: &[IngressRule]) -> Vec<IngressRule> {
    let mut rebuilt: Vec<IngressRule> = rules
        .iter()
        .filter(|rule| !rule.is_terminator())
        .filter(|rule| !rule.hostname.as_deref().unwrap_or_default().contains(','))
        .cloned()
        .collect();
    rebuilt.push(IngressRule::terminator());
    rebuilt
}

/// On a `service remove` event, enqueue the service for delayed
/// reconciliation when the registry knows it was tunnel-enabled. The
/// event carries no labels, so the registry is the only signal.
#[async_trait]
impl EventHandler for RemovalReconciler {
    async fn handle(&self, event: OrchestratorEvent) -> Result<()> {
        let Some(name) = event.actor_name() else {
            debug!("removal event without a name, dropping");
            return Ok(());
        };
        if !self.registry.contains(name).await {
            debug!("service {name} removed but was not tunnel-enabled");
            return Ok(());
        }
        info!(
            "tunnel-enabled service {name} removed, reconciling after {}s",
            self.removal_delay.as_secs()
        );
        self.pending.enqueue(name, Instant::now()).await;
        Ok(())
    }
}
