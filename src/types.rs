//! Core domain types shared across the daemon.
//!
//! The tunnel enablement contract lives in service labels:
//! `tunnel.enabled` gates participation, `tunnel.port` names the
//! container port, and `tunnel.hostname` (plus any other label ending in
//! `.hostname`) carries comma-separated FQDN lists.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Catch-all service value of the terminator rule, required last in
/// every ingress table written to the provider.
pub const TERMINATOR_SERVICE: &str = "http_status:404";

pub const LABEL_ENABLED: &str = "tunnel.enabled";
pub const LABEL_PORT: &str = "tunnel.port";
pub const LABEL_HOSTNAME: &str = "tunnel.hostname";

const HOSTNAME_LABEL_SUFFIX: &str = ".hostname";

/// A swarm service as observed through the orchestrator port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceState {
    pub name: String,
    pub labels: HashMap<String, String>,
    /// Monotonically increasing spec version index.
    pub version: u64,
    pub image: String,
}

/// Event actions this daemon reacts to. Anything else is dropped at the
/// port boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventAction {
    Create,
    Update,
    Remove,
    Die,
    Restart,
    Crash,
}

impl EventAction {
    pub fn parse(action: &str) -> Option<Self> {
        match action {
            "create" => Some(Self::Create),
            "update" => Some(Self::Update),
            "remove" => Some(Self::Remove),
            "die" => Some(Self::Die),
            "restart" => Some(Self::Restart),
            "crash" => Some(Self::Crash),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Remove => "remove",
            Self::Die => "die",
            Self::Restart => "restart",
            Self::Crash => "crash",
        }
    }
}

/// One message from an orchestrator event stream.
#[derive(Debug, Clone)]
pub struct OrchestratorEvent {
    pub action: EventAction,
    pub actor_id: String,
    pub attributes: HashMap<String, String>,
    /// Wall-clock seconds since the epoch, as reported by the daemon.
    pub time: i64,
}

impl OrchestratorEvent {
    pub fn actor_name(&self) -> Option<&str> {
        self.attributes.get("name").map(String::as_str)
    }
}

/// Value filter over `{type, action}` passed to
/// [`crate::orchestrator::Orchestrator::subscribe`].
#[derive(Debug, Clone)]
pub struct EventFilter {
    pub scope: &'static str,
    pub actions: &'static [&'static str],
}

impl EventFilter {
    pub fn service_changes() -> Self {
        Self {
            scope: "service",
            actions: &["create", "update"],
        }
    }

    pub fn service_removals() -> Self {
        Self {
            scope: "service",
            actions: &["remove"],
        }
    }

    pub fn container_anomalies() -> Self {
        Self {
            scope: "container",
            actions: &["die", "restart", "crash"],
        }
    }
}

/// One `(hostname, service)` entry in the tunnel's routing table. The
/// terminator rule carries no hostname.
///
/// This type doubles as the wire shape of the provider's configuration
/// document, so field names match the remote API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub service: String,
}

impl IngressRule {
    pub fn new(hostname: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            hostname: Some(hostname.into()),
            service: service.into(),
        }
    }

    pub fn terminator() -> Self {
        Self {
            hostname: None,
            service: TERMINATOR_SERVICE.to_string(),
        }
    }

    pub fn is_terminator(&self) -> bool {
        self.service == TERMINATOR_SERVICE
    }
}

/// Faults in the tunnel label projection of an enabled service.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LabelError {
    #[error("label `tunnel.port` is required when the tunnel is enabled")]
    MissingPort,
    #[error("label `tunnel.port` must be an integer port, got {0:?}")]
    InvalidPort(String),
}

/// Tunnel enablement projected from a service's label map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelSpec {
    pub port: u16,
    pub hostnames: Vec<String>,
}

impl TunnelSpec {
    /// Project the tunnel labels from a service's label map.
    ///
    /// Returns `Ok(None)` when the service is not tunnel-enabled.
    pub fn from_labels(labels: &HashMap<String, String>) -> Result<Option<Self>, LabelError> {
        if labels.get(LABEL_ENABLED).map(String::as_str) != Some("true") {
            return Ok(None);
        }

        let port = match labels.get(LABEL_PORT).map(|p| p.trim()) {
            Some(port) if !port.is_empty() => port,
            _ => return Err(LabelError::MissingPort),
        };
        let port: u16 = port
            .parse()
            .map_err(|_| LabelError::InvalidPort(port.to_string()))?;

        Ok(Some(Self {
            port,
            hostnames: hostnames_from_labels(labels),
        }))
    }

    /// Origin URL the tunnel routes matching hostnames to.
    pub fn target_url(&self, service_name: &str) -> String {
        format!("http://{service_name}:{}", self.port)
    }
}

/// Collect hostnames from the primary `tunnel.hostname` label and any
/// other label ending in `.hostname`: comma-split, trimmed, empties
/// dropped, deduplicated preserving first-seen order.
pub fn hostnames_from_labels(labels: &HashMap<String, String>) -> Vec<String> {
    fn push_list(list: &str, out: &mut Vec<String>) {
        for host in list.split(',') {
            let host = host.trim();
            if !host.is_empty() && !out.iter().any(|existing| existing == host) {
                out.push(host.to_string());
            }
        }
    }

    let mut hostnames = Vec::new();
    if let Some(primary) = labels.get(LABEL_HOSTNAME) {
        push_list(primary, &mut hostnames);
    }

    // Secondary labels in sorted key order, so the projection is stable.
    let mut secondary: Vec<&String> = labels
        .keys()
        .filter(|k| k.as_str() != LABEL_HOSTNAME && k.ends_with(HOSTNAME_LABEL_SUFFIX))
        .collect();
    secondary.sort();
    for key in secondary {
        push_list(&labels[key], &mut hostnames);
    }

    hostnames
}

/// Outcome of an imperative image rollout.
#[derive(Debug, Clone, Serialize)]
pub struct RolloutReceipt {
    pub success: bool,
    pub old_version: u64,
    pub new_version: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn hostname_lists_are_trimmed_deduped_and_ordered() {
        let labels = labels(&[
            (LABEL_ENABLED, "true"),
            (LABEL_HOSTNAME, "a.example, b.example,,a.example"),
        ]);
        assert_eq!(
            hostnames_from_labels(&labels),
            vec!["a.example".to_string(), "b.example".to_string()]
        );
    }

    #[test]
    fn secondary_hostname_labels_contribute_after_primary() {
        let labels = labels(&[
            (LABEL_HOSTNAME, "a.example.com,b.example.com"),
            ("edge.hostname", "c.example.com"),
            ("zz.hostname", "a.example.com"),
        ]);
        assert_eq!(
            hostnames_from_labels(&labels),
            vec!["a.example.com", "b.example.com", "c.example.com"]
        );
    }

    #[test]
    fn disabled_service_projects_to_none() {
        let spec = TunnelSpec::from_labels(&labels(&[(LABEL_PORT, "8080")])).unwrap();
        assert_eq!(spec, None);

        let spec =
            TunnelSpec::from_labels(&labels(&[(LABEL_ENABLED, "True"), (LABEL_PORT, "8080")]))
                .unwrap();
        assert_eq!(spec, None, "the gate is case-sensitive");
    }

    #[test]
    fn enabled_service_without_port_is_rejected() {
        let err = TunnelSpec::from_labels(&labels(&[
            (LABEL_ENABLED, "true"),
            (LABEL_HOSTNAME, "api.example.com"),
        ]))
        .unwrap_err();
        assert_eq!(err, LabelError::MissingPort);

        let err = TunnelSpec::from_labels(&labels(&[(LABEL_ENABLED, "true"), (LABEL_PORT, "  ")]))
            .unwrap_err();
        assert_eq!(err, LabelError::MissingPort);
    }

    #[test]
    fn non_numeric_port_is_rejected() {
        let err =
            TunnelSpec::from_labels(&labels(&[(LABEL_ENABLED, "true"), (LABEL_PORT, "http")]))
                .unwrap_err();
        assert_eq!(err, LabelError::InvalidPort("http".to_string()));
    }

    #[test]
    fn target_url_joins_name_and_port() {
        let spec = TunnelSpec::from_labels(&labels(&[
            (LABEL_ENABLED, "true"),
            (LABEL_PORT, "8080"),
            (LABEL_HOSTNAME, "api.example.com"),
        ]))
        .unwrap()
        .unwrap();
        assert_eq!(spec.target_url("api"), "http://api:8080");
    }

    #[test]
    fn unknown_event_actions_are_ignored() {
        assert_eq!(EventAction::parse("die"), Some(EventAction::Die));
        assert_eq!(EventAction::parse("exec_start"), None);
    }

    #[test]
    fn terminator_rule_has_no_hostname() {
        let terminator = IngressRule::terminator();
        assert!(terminator.is_terminator());
        assert_eq!(terminator.hostname, None);
        assert!(!IngressRule::new("a.example", "http://a:80").is_terminator());
    }

    #[test]
    fn ingress_rule_wire_shape_skips_missing_hostname() {
        let json = serde_json::to_value(IngressRule::terminator()).unwrap();
        assert_eq!(json, serde_json::json!({ "service": TERMINATOR_SERVICE }));

        let rule: IngressRule =
            serde_json::from_value(serde_json::json!({ "service": "http://api:8080" })).unwrap();
        assert_eq!(rule.hostname, None);
    }
}
