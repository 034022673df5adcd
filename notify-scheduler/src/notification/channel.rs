//! Delivery channels.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tracing::info;

use crate::domain::JobInstance;

/// Why a delivery did not go through.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// Worth retrying later (timeouts, 5xx, throttling).
    #[error("transient delivery failure: {0}")]
    Transient(String),

    /// Retrying will not help (rejected request, bad recipient).
    #[error("permanent delivery failure: {0}")]
    Permanent(String),
}

/// Delivers one notification instance.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Value of the `channel_type` attribute this channel serves.
    fn channel_type(&self) -> &str;

    async fn send(&self, instance: &JobInstance) -> Result<(), ChannelError>;
}

/// Writes notifications to the log. Never fails.
#[derive(Debug)]
pub struct LogChannel {
    channel_type: String,
    sent: AtomicU64,
}

impl LogChannel {
    pub fn new(channel_type: impl Into<String>) -> Self {
        Self {
            channel_type: channel_type.into(),
            sent: AtomicU64::new(0),
        }
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

impl Default for LogChannel {
    fn default() -> Self {
        Self::new("log")
    }
}

#[async_trait]
impl Channel for LogChannel {
    fn channel_type(&self) -> &str {
        &self.channel_type
    }

    async fn send(&self, instance: &JobInstance) -> Result<(), ChannelError> {
        self.sent.fetch_add(1, Ordering::Relaxed);
        info!(
            channel = %self.channel_type,
            instance_id = instance.id,
            job_ref = %instance.job_ref,
            payload = ?instance.payload,
            "Notification delivered"
        );
        Ok(())
    }
}
