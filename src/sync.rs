//! Sync engine: converges tunnel ingress and DNS toward a service's
//! desired state on create and update events.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};

use crate::orchestrator::Orchestrator;
use crate::state::{HostnameRegistry, IngressCache, PendingRemovals};
use crate::supervisor::EventHandler;
use crate::tunnel::{RecordTtl, TunnelEdge};
use crate::types::{IngressRule, OrchestratorEvent, TunnelSpec};

pub struct SyncEngine {
    orchestrator: Arc<dyn Orchestrator>,
    edge: Arc<dyn TunnelEdge>,
    cache: Arc<IngressCache>,
    registry: Arc<HostnameRegistry>,
    pending: Arc<PendingRemovals>,
}

impl SyncEngine {
    pub fn new(
        orchestrator: Arc<dyn Orchestrator>,
        edge: Arc<dyn TunnelEdge>,
        cache: Arc<IngressCache>,
        registry: Arc<HostnameRegistry>,
        pending: Arc<PendingRemovals>,
    ) -> Self {
        Self {
            orchestrator,
            edge,
            cache,
            registry,
            pending,
        }
    }

    /// Bring ingress and DNS in line with the named service's labels.
    pub async fn sync_service(&self, name: &str) -> Result<()> {
        let Some(service) = self.orchestrator.inspect_service(name).await? else {
            debug!("service {name} vanished before inspection, dropping event");
            return Ok(());
        };

        let spec = match TunnelSpec::from_labels(&service.labels) {
            Ok(Some(spec)) => spec,
            Ok(None) => {
                debug!("service {name} is not tunnel-enabled");
                return Ok(());
            }
            Err(e) => {
                debug!("service {name} has unusable tunnel labels: {e}");
                return Ok(());
            }
        };

        let target = spec.target_url(&service.name);
        self.cache.ensure_loaded(self.edge.as_ref()).await?;

        for hostname in &spec.hostnames {
            let existing = self.cache.get(hostname).await;
            if existing.as_deref() == Some(target.as_str()) {
                continue;
            }
            let is_new = existing.is_none();

            let rules = self.build_rules(hostname, &target).await;
            self.edge
                .put_ingress(rules)
                .await
                .with_context(|| format!("updating ingress for {hostname}"))?;
            self.cache.put(hostname, &target).await;

            if is_new {
                self.create_dns(hostname).await?;
            }
            info!("ingress for {hostname} now routes to {target}");
        }

        self.registry.record(&service.name, &spec.hostnames).await;
        // A re-created service must not be pruned by an older removal.
        self.pending.discard(&service.name).await;
        Ok(())
    }

    /// New full rule table: the updated rule first, then every cached
    /// rule for another hostname, terminator last. Legacy rules whose
    /// hostname contains a comma are dropped.
    async fn build_rules(&self, hostname: &str, target: &str) -> Vec<IngressRule> {
        let mut rules = vec![IngressRule::new(hostname, target)];
        let mut others: Vec<(String, String)> = self
            .cache
            .snapshot()
            .await
            .into_iter()
            .filter(|(host, _)| host != hostname && !host.contains(','))
            .collect();
        others.sort();
        rules.extend(
            others
                .into_iter()
                .map(|(host, url)| IngressRule::new(host, url)),
        );
        rules.push(IngressRule::terminator());
        rules
    }

    async fn create_dns(&self, hostname: &str) -> Result<()> {
        let zone = self
            .edge
            .resolve_zone(hostname)
            .await
            .with_context(|| format!("resolving zone for {hostname}"))?;
        let Some(zone_id) = zone else {
            warn!("no zone covers {hostname}, skipping dns record");
            return Ok(());
        };

        let target = self.edge.cname_target();
        self.edge
            .create_cname(&zone_id, hostname, &target, true, RecordTtl::Automatic)
            .await
            .with_context(|| format!("creating cname for {hostname}"))?;
        info!("created cname {hostname} -> {target}");
        Ok(())
    }
}

#[async_trait]
impl EventHandler for SyncEngine {
    async fn handle(&self, event: OrchestratorEvent) -> Result<()> {
        let Some(name) = event.actor_name() else {
            debug!("service event without a name, dropping");
            return Ok(());
        };
        self.sync_service(name).await
    }
}

#[cfg(test)]
pub(crate) mod fakes {
    use super::*;
    use crate::types::{EventFilter, RolloutReceipt, ServiceState};
    use std::collections::HashMap;
    use tokio::sync::Mutex;

    /// In-memory orchestrator serving a fixed set of services.
    #[derive(Default)]
    pub struct FakeOrchestrator {
        pub services: Mutex<HashMap<String, ServiceState>>,
    }

    impl FakeOrchestrator {
        pub fn with_services(services: Vec<ServiceState>) -> Self {
            Self {
                services: Mutex::new(
                    services
                        .into_iter()
                        .map(|service| (service.name.clone(), service))
                        .collect(),
                ),
            }
        }
    }

    #[async_trait]
    impl Orchestrator for FakeOrchestrator {
        async fn list_services(&self) -> Result<Vec<ServiceState>> {
            Ok(self.services.lock().await.values().cloned().collect())
        }

        async fn inspect_service(&self, name: &str) -> Result<Option<ServiceState>> {
            Ok(self.services.lock().await.get(name).cloned())
        }

        async fn subscribe(&self, _filter: EventFilter) -> Result<crate::orchestrator::Subscription> {
            unimplemented!("engine tests never subscribe")
        }

        async fn update_service_image(&self, _: &str, _: &str) -> Result<RolloutReceipt> {
            unimplemented!("engine tests never roll out")
        }
    }

    /// In-memory tunnel edge recording every mutation.
    pub struct FakeEdge {
        pub table: Mutex<Vec<IngressRule>>,
        pub puts: Mutex<Vec<Vec<IngressRule>>>,
        pub cnames: Mutex<Vec<(String, String)>>,
        pub deleted_records: Mutex<Vec<String>>,
        /// `hostname → record_id` records the zone currently holds.
        pub dns_records: Mutex<HashMap<String, String>>,
    }

    impl FakeEdge {
        pub fn empty() -> Self {
            Self::with_table(vec![IngressRule::terminator()])
        }

        pub fn with_table(table: Vec<IngressRule>) -> Self {
            Self {
                table: Mutex::new(table),
                puts: Mutex::new(Vec::new()),
                cnames: Mutex::new(Vec::new()),
                deleted_records: Mutex::new(Vec::new()),
                dns_records: Mutex::new(HashMap::new()),
            }
        }
    }

    #[async_trait]
    impl TunnelEdge for FakeEdge {
        async fn get_ingress(&self) -> Result<Vec<IngressRule>> {
            Ok(self.table.lock().await.clone())
        }

        async fn put_ingress(&self, rules: Vec<IngressRule>) -> Result<()> {
            *self.table.lock().await = rules.clone();
            self.puts.lock().await.push(rules);
            Ok(())
        }

        async fn resolve_zone(&self, fqdn: &str) -> Result<Option<String>> {
            Ok(psl::domain_str(fqdn).map(|domain| format!("zone-{domain}")))
        }

        async fn create_cname(
            &self,
            zone_id: &str,
            hostname: &str,
            _target: &str,
            _proxied: bool,
            _ttl: RecordTtl,
        ) -> Result<()> {
            self.cnames
                .lock()
                .await
                .push((zone_id.to_string(), hostname.to_string()));
            self.dns_records
                .lock()
                .await
                .insert(hostname.to_string(), format!("rec-{hostname}"));
            Ok(())
        }

        async fn lookup_record(&self, _zone_id: &str, hostname: &str) -> Result<Option<String>> {
            Ok(self.dns_records.lock().await.get(hostname).cloned())
        }

        async fn delete_record(&self, _zone_id: &str, record_id: &str) -> Result<()> {
            self.deleted_records.lock().await.push(record_id.to_string());
            Ok(())
        }

        fn cname_target(&self) -> String {
            "tun-1.cfargotunnel.com".to_string()
        }
    }

    pub fn service(name: &str, labels: &[(&str, &str)]) -> ServiceState {
        ServiceState {
            name: name.to_string(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            version: 1,
            image: format!("registry.example.com/{name}:latest"),
        }
    }
}
