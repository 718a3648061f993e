//! Pushover implementation of the notification port.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;

use super::{Notification, Notifier};

const MESSAGES_URL: &str = "https://api.pushover.net/1/messages.json";
const SOUND: &str = "cosmic";

pub struct PushoverNotifier {
    client: reqwest::Client,
    token: String,
    recipient: String,
}

impl PushoverNotifier {
    pub fn new(token: String, recipient: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            token,
            recipient,
        }
    }
}

#[async_trait]
impl Notifier for PushoverNotifier {
    async fn send(&self, notification: &Notification) -> Result<()> {
        let timestamp = notification.timestamp.to_string();
        let form = [
            ("token", self.token.as_str()),
            ("user", self.recipient.as_str()),
            ("title", notification.title.as_str()),
            ("message", notification.message.as_str()),
            ("timestamp", timestamp.as_str()),
            ("sound", SOUND),
        ];
        let response = self
            .client
            .post(MESSAGES_URL)
            .form(&form)
            .send()
            .await
            .context("sending pushover message")?;
        if !response.status().is_success() {
            bail!("pushover returned {}", response.status());
        }
        Ok(())
    }
}
