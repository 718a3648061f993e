//! In-memory state owned by the engine: the ingress mirror, the
//! service→hostname registry, pending removals and the alert dedup map.
//!
//! All four tolerate stale reads; compound read-modify-write sequences
//! hold the lock for their duration, and no lock is held across a call
//! to an external port.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::{Mutex, RwLock};

use crate::tunnel::TunnelEdge;
use crate::types::IngressRule;

/// Project a rule table into a `hostname → service_url` map, dropping
/// the terminator.
pub fn rules_to_map(rules: &[IngressRule]) -> HashMap<String, String> {
    rules
        .iter()
        .filter(|rule| !rule.is_terminator())
        .filter_map(|rule| {
            rule.hostname
                .clone()
                .map(|hostname| (hostname, rule.service.clone()))
        })
        .collect()
}

/// In-memory mirror of the remote ingress table, keyed by hostname.
///
/// Reflects the last successful write; the remote table stays
/// authoritative and replaces the mirror whenever it is re-fetched.
#[derive(Default)]
pub struct IngressCache {
    inner: Mutex<Option<HashMap<String, String>>>,
}

impl IngressCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hydrate from the remote table on first use. Idempotent.
    pub async fn ensure_loaded(&self, edge: &dyn TunnelEdge) -> Result<()> {
        if self.inner.lock().await.is_some() {
            return Ok(());
        }
        let rules = edge.get_ingress().await?;
        let mut guard = self.inner.lock().await;
        if guard.is_none() {
            *guard = Some(rules_to_map(&rules));
        }
        Ok(())
    }

    pub async fn get(&self, hostname: &str) -> Option<String> {
        self.inner
            .lock()
            .await
            .as_ref()
            .and_then(|map| map.get(hostname).cloned())
    }

    pub async fn put(&self, hostname: &str, url: &str) {
        self.inner
            .lock()
            .await
            .get_or_insert_with(HashMap::new)
            .insert(hostname.to_string(), url.to_string());
    }

    pub async fn snapshot(&self) -> HashMap<String, String> {
        self.inner.lock().await.clone().unwrap_or_default()
    }

    pub async fn replace(&self, map: HashMap<String, String>) {
        *self.inner.lock().await = Some(map);
    }
}

/// Hostnames previously synced for each service name. Remove events
/// carry no labels, so this is how removed tunnel-enabled services are
/// recognized.
#[derive(Default)]
pub struct HostnameRegistry {
    inner: RwLock<HashMap<String, Vec<String>>>,
}

impl HostnameRegistry {
    pub async fn record(&self, service: &str, hostnames: &[String]) {
        if hostnames.is_empty() {
            return;
        }
        self.inner
            .write()
            .await
            .insert(service.to_string(), hostnames.to_vec());
    }

    pub async fn contains(&self, service: &str) -> bool {
        self.inner.read().await.contains_key(service)
    }

    pub async fn forget(&self, service: &str) {
        self.inner.write().await.remove(service);
    }
}

/// Tunnel-enabled services observed removed, awaiting the delayed
/// reconcile pass.
#[derive(Default)]
pub struct PendingRemovals {
    inner: Mutex<HashMap<String, Instant>>,
}

impl PendingRemovals {
    pub async fn enqueue(&self, service: &str, removed_at: Instant) {
        self.inner
            .lock()
            .await
            .insert(service.to_string(), removed_at);
    }

    /// Drop the record for a service that came back before its record
    /// matured.
    pub async fn discard(&self, service: &str) {
        self.inner.lock().await.remove(service);
    }

    /// Remove and return every service whose record is at least `delay`
    /// old at `now`.
    pub async fn drain_matured(&self, now: Instant, delay: Duration) -> Vec<String> {
        let mut guard = self.inner.lock().await;
        let matured: Vec<String> = guard
            .iter()
            .filter(|(_, removed_at)| now.saturating_duration_since(**removed_at) >= delay)
            .map(|(service, _)| service.clone())
            .collect();
        for service in &matured {
            guard.remove(service);
        }
        matured
    }
}

/// Container events recently alerted on, keyed by `<short_id>:<action>`.
#[derive(Default)]
pub struct RecentEvents {
    inner: Mutex<HashMap<String, Instant>>,
}

impl RecentEvents {
    /// Record the event unless an identical one was seen within
    /// `cooldown`. Returns `false` when the event should be suppressed.
    pub async fn observe(&self, key: &str, now: Instant, cooldown: Duration) -> bool {
        let mut guard = self.inner.lock().await;
        if let Some(last_seen) = guard.get(key) {
            if now.saturating_duration_since(*last_seen) < cooldown {
                return false;
            }
        }
        guard.insert(key.to_string(), now);
        true
    }

    /// Evict entries older than `max_age` at `now`.
    pub async fn sweep(&self, now: Instant, max_age: Duration) {
        self.inner
            .lock()
            .await
            .retain(|_, last_seen| now.saturating_duration_since(*last_seen) <= max_age);
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}
