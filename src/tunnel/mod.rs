use anyhow::Result;
use async_trait::async_trait;

use crate::types::IngressRule;

pub mod cloudflare;
pub use cloudflare::CloudflareEdge;

/// TTL requested for created records. `Automatic` lets the provider
/// choose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordTtl {
    Automatic,
    Seconds(u32),
}

/// Tunnel/DNS port: the remote ingress rule table and CNAME records.
#[async_trait]
pub trait TunnelEdge: Send + Sync {
    /// The full current rule table, in provider order.
    async fn get_ingress(&self) -> Result<Vec<IngressRule>>;

    /// Replace the entire ingress table. The caller is responsible for
    /// terminating `rules` with the catch-all rule; insertion order is
    /// preserved and the last writer wins.
    async fn put_ingress(&self, rules: Vec<IngressRule>) -> Result<()>;

    /// Zone containing `fqdn`, matched on the registrable domain
    /// (public suffix plus one label). `Ok(None)` when no zone covers
    /// it.
    async fn resolve_zone(&self, fqdn: &str) -> Result<Option<String>>;

    async fn create_cname(
        &self,
        zone_id: &str,
        hostname: &str,
        target: &str,
        proxied: bool,
        ttl: RecordTtl,
    ) -> Result<()>;

    /// `Ok(None)` when no record exists for the hostname.
    async fn lookup_record(&self, zone_id: &str, hostname: &str) -> Result<Option<String>>;

    async fn delete_record(&self, zone_id: &str, record_id: &str) -> Result<()>;

    /// CNAME content for hostnames routed through this tunnel.
    fn cname_target(&self) -> String;
}
