//! Notification processor.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use super::channel::{Channel, ChannelError};
use crate::domain::{DEFAULT_PARTITION_ATTRIBUTE, JobInstance};
use crate::scheduler::{JobInstanceProcessor, ProcessOutcome};

/// Routes each instance to the channel named by one of its attributes,
/// `channel_type` unless configured otherwise.
#[derive(Clone)]
pub struct NotificationProcessor {
    channels: HashMap<String, Arc<dyn Channel>>,
    route_attribute: String,
}

impl Default for NotificationProcessor {
    fn default() -> Self {
        Self {
            channels: HashMap::new(),
            route_attribute: DEFAULT_PARTITION_ATTRIBUTE.to_string(),
        }
    }
}

impl NotificationProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route on `attribute` instead of `channel_type`, e.g. to match a
    /// partition key built with a custom partition attribute.
    pub fn with_route_attribute(mut self, attribute: impl Into<String>) -> Self {
        self.route_attribute = attribute.into();
        self
    }

    pub fn route_attribute(&self) -> &str {
        &self.route_attribute
    }

    /// Register `channel` under its own `channel_type`. A later channel with
    /// the same type replaces the earlier one.
    pub fn with_channel(mut self, channel: Arc<dyn Channel>) -> Self {
        self.channels
            .insert(channel.channel_type().to_string(), channel);
        self
    }

    pub fn channel_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.channels.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

#[async_trait]
impl JobInstanceProcessor for NotificationProcessor {
    async fn process(&self, instance: &JobInstance) -> ProcessOutcome {
        let Some(channel_type) = instance.attribute(&self.route_attribute) else {
            return ProcessOutcome::failed(format!(
                "instance has no {} attribute",
                self.route_attribute
            ));
        };
        let Some(channel) = self.channels.get(channel_type) else {
            return ProcessOutcome::failed(format!("no channel registered for '{}'", channel_type));
        };

        match channel.send(instance).await {
            Ok(()) => {
                debug!(instance_id = instance.id, channel = channel_type, "Notification sent");
                ProcessOutcome::done_with(json!({ "channel": channel_type }))
            }
            Err(ChannelError::Transient(reason)) => ProcessOutcome::retry(reason),
            Err(ChannelError::Permanent(reason)) => ProcessOutcome::failed(reason),
        }
    }
}

impl std::fmt::Debug for NotificationProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationProcessor")
            .field("channels", &self.channel_types())
            .field("route_attribute", &self.route_attribute)
            .finish()
    }
}
