use std::time::Duration;

use anyhow::Context;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub tunnel_id: String,
    pub account_id: String,
    pub api_key: String,
    pub api_email: String,
    pub auth_token: String,
    pub pushover_api_key: String,
    pub pushover_recipient: String,
    pub service_removal_delay_minutes: u64,
    pub delete_dns_on_removal: bool,
    pub http_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tunnel_id: String::new(),
            account_id: String::new(),
            api_key: String::new(),
            api_email: String::new(),
            auth_token: String::new(),
            pushover_api_key: String::new(),
            pushover_recipient: String::new(),
            service_removal_delay_minutes: 30,
            delete_dns_on_removal: false,
            http_port: 8080,
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let mut config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("swarmgate.toml"))
            .merge(Env::prefixed("SWARMGATE_"))
            .extract()
            .map_err(|e| anyhow::anyhow!("failed to load configuration: {e}"))?;

        for value in [
            &mut config.tunnel_id,
            &mut config.account_id,
            &mut config.api_key,
            &mut config.api_email,
            &mut config.auth_token,
            &mut config.pushover_api_key,
            &mut config.pushover_recipient,
        ] {
            *value = resolve_secret(value)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn removal_delay(&self) -> Duration {
        Duration::from_secs(self.service_removal_delay_minutes * 60)
    }

    fn validate(&self) -> anyhow::Result<()> {
        let missing: Vec<&str> = [
            ("tunnel_id", &self.tunnel_id),
            ("account_id", &self.account_id),
            ("api_key", &self.api_key),
            ("api_email", &self.api_email),
            ("auth_token", &self.auth_token),
            ("pushover_api_key", &self.pushover_api_key),
            ("pushover_recipient", &self.pushover_recipient),
        ]
        .into_iter()
        .filter(|(_, value)| value.is_empty())
        .map(|(name, _)| name)
        .collect();

        if !missing.is_empty() {
            anyhow::bail!("missing required configuration: {}", missing.join(", "));
        }
        Ok(())
    }
}

/// A value starting with `/` names a file holding the real secret; the
/// trimmed file contents are substituted.
fn resolve_secret(value: &str) -> anyhow::Result<String> {
    if !value.starts_with('/') {
        return Ok(value.to_string());
    }
    let contents = std::fs::read_to_string(value)
        .with_context(|| format!("reading secret file {value}"))?;
    Ok(contents.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_contract() {
        let config = Config::default();
        assert_eq!(config.service_removal_delay_minutes, 30);
        assert!(!config.delete_dns_on_removal);
        assert_eq!(config.http_port, 8080);
        assert_eq!(config.removal_delay(), Duration::from_secs(30 * 60));
    }

    #[test]
    fn plain_values_pass_through_secret_resolution() {
        assert_eq!(resolve_secret("abc123").unwrap(), "abc123");
        assert_eq!(resolve_secret("").unwrap(), "");
    }

    #[test]
    fn slash_prefixed_values_are_read_from_disk() {
        let path = std::env::temp_dir().join("swarmgate-secret-test");
        std::fs::write(&path, "  s3cr3t\n").unwrap();
        let resolved = resolve_secret(path.to_str().unwrap()).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(resolved, "s3cr3t");
    }

    #[test]
    fn missing_secret_file_is_an_error() {
        assert!(resolve_secret("/nonexistent/swarmgate/secret").is_err());
    }

    #[test]
    fn validation_names_every_missing_key() {
        let config = Config::default();
        let message = config.validate().unwrap_err().to_string();
        assert!(message.contains("tunnel_id"));
        assert!(message.contains("pushover_recipient"));

        let full = Config {
            tunnel_id: "t".into(),
            account_id: "a".into(),
            api_key: "k".into(),
            api_email: "e@example.com".into(),
            auth_token: "auth".into(),
            pushover_api_key: "p".into(),
            pushover_recipient: "r".into(),
            ..Config::default()
        };
        assert!(full.validate().is_ok());
    }
}
