use anyhow::Result;
use async_trait::async_trait;

pub mod pushover;
pub use pushover::PushoverNotifier;

/// One alert to deliver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub title: String,
    pub message: String,
    /// Event time, seconds since the epoch.
    pub timestamp: i64,
}

/// Notification port for container lifecycle alerts.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<()>;
}
