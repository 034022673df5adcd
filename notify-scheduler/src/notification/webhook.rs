//! Generic webhook channel.

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use super::channel::{Channel, ChannelError};
use crate::Result;
use crate::config::ConfigurationSource;
use crate::domain::JobInstance;

/// Install the rustls crypto provider once per process.
pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            // Another crate installed one first.
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Webhook channel configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    /// `channel_type` attribute value routed to this webhook.
    #[serde(default = "default_channel_type")]
    pub channel_type: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    pub bearer_token: Option<String>,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_channel_type() -> String {
    "webhook".to_string()
}

fn default_timeout() -> u64 {
    30
}

impl WebhookConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            channel_type: default_channel_type(),
            headers: Vec::new(),
            bearer_token: None,
            timeout_secs: default_timeout(),
        }
    }

    /// Read `channel.webhook.*`. `None` when no URL is configured.
    pub fn from_source(source: &dyn ConfigurationSource) -> Result<Option<Self>> {
        let Some(url) = source.get_non_blank("channel.webhook.url") else {
            return Ok(None);
        };
        Ok(Some(Self {
            url,
            channel_type: source.get_or_default("channel.webhook.channel_type", default_channel_type())?,
            headers: Vec::new(),
            bearer_token: source.get_non_blank("channel.webhook.bearer_token"),
            timeout_secs: source.get_or_default("channel.webhook.timeout_secs", default_timeout())?,
        }))
    }
}

/// POSTs each instance as JSON to a fixed URL.
pub struct WebhookChannel {
    config: WebhookConfig,
    client: Client,
}

impl WebhookChannel {
    pub fn new(config: WebhookConfig) -> Result<Self> {
        install_rustls_provider();
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { config, client })
    }

    fn build_payload(&self, instance: &JobInstance) -> serde_json::Value {
        json!({
            "instance_id": instance.id,
            "job_ref": instance.job_ref,
            "due_at": instance.due_at.to_rfc3339(),
            "attempt": instance.failure_count + 1,
            "attributes": instance.attributes,
            "payload": instance.payload,
        })
    }
}

/// Throttling and server errors are transient; other rejections are not.
fn classify_status(status: StatusCode, body: &str) -> Option<ChannelError> {
    if status.is_success() {
        return None;
    }
    let message = format!("webhook responded {} - {}", status, body);
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        Some(ChannelError::Transient(message))
    } else {
        Some(ChannelError::Permanent(message))
    }
}

#[async_trait]
impl Channel for WebhookChannel {
    fn channel_type(&self) -> &str {
        &self.config.channel_type
    }

    async fn send(&self, instance: &JobInstance) -> std::result::Result<(), ChannelError> {
        let mut request = self
            .client
            .post(&self.config.url)
            .json(&self.build_payload(instance));
        for (name, value) in &self.config.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(token) = &self.config.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_builder() {
                ChannelError::Permanent(format!("invalid webhook request: {}", e))
            } else {
                ChannelError::Transient(format!("webhook request failed: {}", e))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if let Some(err) = classify_status(status, &body) {
                return Err(err);
            }
        }

        debug!(instance_id = instance.id, %status, "Webhook notification sent");
        Ok(())
    }
}
