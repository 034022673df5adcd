//! Job instance processors and the registry that resolves them.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::domain::JobInstance;
use crate::{Error, Result};

/// Result of processing one instance.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    /// Processed; the optional payload is stored as the instance result.
    Done(Option<Value>),
    /// Permanent failure, never retried.
    Failed(String),
    /// Retryable failure. `not_before` overrides the backoff policy.
    Retry {
        reason: String,
        not_before: Option<DateTime<Utc>>,
    },
}

impl ProcessOutcome {
    pub fn done() -> Self {
        Self::Done(None)
    }

    pub fn done_with(result: Value) -> Self {
        Self::Done(Some(result))
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed(reason.into())
    }

    pub fn retry(reason: impl Into<String>) -> Self {
        Self::Retry {
            reason: reason.into(),
            not_before: None,
        }
    }

    pub fn retry_at(reason: impl Into<String>, not_before: DateTime<Utc>) -> Self {
        Self::Retry {
            reason: reason.into(),
            not_before: Some(not_before),
        }
    }
}

/// Business logic for one instance type.
///
/// Called at most once at a time per partition, for instances the calling
/// actor has claimed. Implementations should bound their own I/O; the
/// scheduler additionally applies `processor_timeout` and treats expiry as
/// a retryable failure.
#[async_trait]
pub trait JobInstanceProcessor: Send + Sync {
    async fn process(&self, instance: &JobInstance) -> ProcessOutcome;
}

/// Immutable table from instance type tag to processor.
#[derive(Clone, Default)]
pub struct ProcessorRegistry {
    processors: HashMap<String, Arc<dyn JobInstanceProcessor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(
        mut self,
        instance_type: impl Into<String>,
        processor: Arc<dyn JobInstanceProcessor>,
    ) -> Self {
        self.processors.insert(instance_type.into(), processor);
        self
    }

    /// Missing processors are configuration errors.
    pub fn resolve(&self, instance_type: &str) -> Result<Arc<dyn JobInstanceProcessor>> {
        self.processors.get(instance_type).cloned().ok_or_else(|| {
            Error::config(format!(
                "no processor registered for instance type '{}'",
                instance_type
            ))
        })
    }

    pub fn instance_types(&self) -> impl Iterator<Item = &str> {
        self.processors.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }
}

impl std::fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<&str> = self.instance_types().collect();
        types.sort_unstable();
        f.debug_struct("ProcessorRegistry")
            .field("instance_types", &types)
            .finish()
    }
}
