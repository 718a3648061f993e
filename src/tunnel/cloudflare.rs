//! Cloudflare implementation of the tunnel/DNS port.
//!
//! Ingress rules live in the cloudflared tunnel configuration document;
//! CNAMEs are ordinary zone DNS records. Both are managed through the
//! v4 REST API.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::header::HeaderValue;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{RecordTtl, TunnelEdge};
use crate::types::IngressRule;

const API_BASE: &str = "https://api.cloudflare.com/client/v4";
const TUNNEL_APEX: &str = "cfargotunnel.com";
/// Sentinel TTL the provider reads as "automatic".
const TTL_AUTOMATIC: u32 = 1;

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    result: Option<T>,
    success: bool,
    #[serde(default)]
    errors: Vec<ApiErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    code: i64,
    message: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TunnelConfigDocument {
    #[serde(default)]
    config: TunnelConfig,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TunnelConfig {
    #[serde(default)]
    ingress: Vec<IngressRule>,
}

#[derive(Debug, Deserialize)]
struct Zone {
    id: String,
}

#[derive(Debug, Deserialize)]
struct DnsRecord {
    id: String,
}

#[derive(Serialize)]
struct CreateRecord<'a> {
    #[serde(rename = "type")]
    record_type: &'static str,
    name: &'a str,
    content: &'a str,
    ttl: u32,
    proxied: bool,
}

pub struct CloudflareEdge {
    client: reqwest::Client,
    account_id: String,
    tunnel_id: String,
}

impl CloudflareEdge {
    pub fn new(
        api_key: &str,
        api_email: &str,
        account_id: String,
        tunnel_id: String,
    ) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            "X-Auth-Key",
            HeaderValue::from_str(api_key).context("api key is not a valid header value")?,
        );
        headers.insert(
            "X-Auth-Email",
            HeaderValue::from_str(api_email).context("api email is not a valid header value")?,
        );
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .context("building cloudflare http client")?;
        Ok(Self {
            client,
            account_id,
            tunnel_id,
        })
    }

    fn config_url(&self) -> String {
        format!(
            "{API_BASE}/accounts/{}/cfd_tunnel/{}/configurations",
            self.account_id, self.tunnel_id
        )
    }

    async fn check<T: DeserializeOwned>(
        response: reqwest::Response,
        what: &str,
    ) -> Result<ApiResponse<T>> {
        let status = response.status();
        if !status.is_success() {
            bail!("{what}: cloudflare api returned {status}");
        }
        let body: ApiResponse<T> = response
            .json()
            .await
            .with_context(|| format!("{what}: decoding response"))?;
        if !body.success {
            let detail = body
                .errors
                .iter()
                .map(|e| format!("{} ({})", e.message, e.code))
                .collect::<Vec<_>>()
                .join("; ");
            bail!("{what}: cloudflare api error: {detail}");
        }
        Ok(body)
    }
}

#[async_trait]
impl TunnelEdge for CloudflareEdge {
    async fn get_ingress(&self) -> Result<Vec<IngressRule>> {
        let response = self
            .client
            .get(self.config_url())
            .send()
            .await
            .context("fetching tunnel configuration")?;
        let body: ApiResponse<TunnelConfigDocument> = Self::check(response, "get ingress").await?;
        Ok(body.result.unwrap_or_default().config.ingress)
    }

    async fn put_ingress(&self, rules: Vec<IngressRule>) -> Result<()> {
        let document = TunnelConfigDocument {
            config: TunnelConfig { ingress: rules },
        };
        let response = self
            .client
            .put(self.config_url())
            .json(&document)
            .send()
            .await
            .context("writing tunnel configuration")?;
        Self::check::<serde_json::Value>(response, "put ingress").await?;
        Ok(())
    }

    async fn resolve_zone(&self, fqdn: &str) -> Result<Option<String>> {
        // A name with no registrable domain cannot belong to any zone.
        let Some(domain) = psl::domain_str(fqdn) else {
            return Ok(None);
        };
        let response = self
            .client
            .get(format!("{API_BASE}/zones"))
            .query(&[("account.id", self.account_id.as_str()), ("name", domain)])
            .send()
            .await
            .with_context(|| format!("listing zones for {domain:?}"))?;
        let body: ApiResponse<Vec<Zone>> = Self::check(response, "resolve zone").await?;
        Ok(body
            .result
            .unwrap_or_default()
            .into_iter()
            .next()
            .map(|zone| zone.id))
    }

    async fn create_cname(
        &self,
        zone_id: &str,
        hostname: &str,
        target: &str,
        proxied: bool,
        ttl: RecordTtl,
    ) -> Result<()> {
        let record = CreateRecord {
            record_type: "CNAME",
            name: hostname,
            content: target,
            ttl: match ttl {
                RecordTtl::Automatic => TTL_AUTOMATIC,
                RecordTtl::Seconds(seconds) => seconds,
            },
            proxied,
        };
        let response = self
            .client
            .post(format!("{API_BASE}/zones/{zone_id}/dns_records"))
            .json(&record)
            .send()
            .await
            .with_context(|| format!("creating cname for {hostname}"))?;
        Self::check::<serde_json::Value>(response, "create cname").await?;
        Ok(())
    }

    async fn lookup_record(&self, zone_id: &str, hostname: &str) -> Result<Option<String>> {
        let response = self
            .client
            .get(format!("{API_BASE}/zones/{zone_id}/dns_records"))
            .query(&[("type", "CNAME"), ("name", hostname)])
            .send()
            .await
            .with_context(|| format!("looking up record for {hostname}"))?;
        let body: ApiResponse<Vec<DnsRecord>> = Self::check(response, "lookup record").await?;
        Ok(body
            .result
            .unwrap_or_default()
            .into_iter()
            .next()
            .map(|record| record.id))
    }

    async fn delete_record(&self, zone_id: &str, record_id: &str) -> Result<()> {
        let response = self
            .client
            .delete(format!("{API_BASE}/zones/{zone_id}/dns_records/{record_id}"))
            .send()
            .await
            .with_context(|| format!("deleting record {record_id}"))?;
        Self::check::<serde_json::Value>(response, "delete record").await?;
        Ok(())
    }

    fn cname_target(&self) -> String {
        format!("{}.{TUNNEL_APEX}", self.tunnel_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_document_round_trips_ingress_rules() {
        let document = TunnelConfigDocument {
            config: TunnelConfig {
                ingress: vec![
                    IngressRule::new("api.example.com", "http://api:8080"),
                    IngressRule::terminator(),
                ],
            },
        };
        let json = serde_json::to_value(&document).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "config": {
                    "ingress": [
                        { "hostname": "api.example.com", "service": "http://api:8080" },
                        { "service": "http_status:404" },
                    ]
                }
            })
        );
    }

    #[test]
    fn cname_target_is_tunnel_scoped() {
        let edge = CloudflareEdge::new("key", "ops@example.com", "acct".into(), "tun-1".into())
            .unwrap();
        assert_eq!(edge.cname_target(), "tun-1.cfargotunnel.com");
    }

    #[test]
    fn registrable_domain_spans_multi_label_suffixes() {
        assert_eq!(psl::domain_str("api.svc.example.co.uk"), Some("example.co.uk"));
        assert_eq!(psl::domain_str("api.example.com"), Some("example.com"));
    }

    #[tokio::test]
    async fn names_without_a_registrable_domain_resolve_to_no_zone() {
        let edge = CloudflareEdge::new("key", "ops@example.com", "acct".into(), "tun-1".into())
            .unwrap();
        assert_eq!(edge.resolve_zone("localhost").await.unwrap(), None);
    }
}
