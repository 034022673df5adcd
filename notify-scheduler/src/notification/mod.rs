//! Notification delivery on top of the scheduler.
//!
//! A [`NotificationProcessor`] is a
//! [`JobInstanceProcessor`](crate::scheduler::JobInstanceProcessor) that
//! hands each instance to the [`Channel`] named by its `channel_type`
//! attribute. Partitions are usually fanned out by that same attribute, so
//! a slow channel only backs up its own partition.

mod channel;
mod processor;
mod webhook;

pub use channel::{Channel, ChannelError, LogChannel};
pub use processor::NotificationProcessor;
pub use webhook::{WebhookChannel, WebhookConfig, install_rustls_provider};
