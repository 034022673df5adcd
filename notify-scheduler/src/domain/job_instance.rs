//! Job instance entity and its lifecycle.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::domain::value_objects::DEFAULT_INSTANCE_TYPE;

/// Lifecycle state of a job instance.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobInstanceState {
    /// Ready, waiting for its due time.
    New,
    /// Claimed by exactly one actor.
    Running,
    /// Processed successfully.
    Done,
    /// Processing failed permanently or retries were exhausted.
    Failed,
    /// Discarded without processing.
    Dropped,
    /// Re-armed with a later due time after a retryable failure.
    Deferred,
}

impl JobInstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Running => "RUNNING",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
            Self::Dropped => "DROPPED",
            Self::Deferred => "DEFERRED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Dropped)
    }

    /// States from which an instance may be claimed.
    pub fn is_claimable(&self) -> bool {
        matches!(self, Self::New | Self::Deferred)
    }

    /// Whether the lifecycle permits moving from `self` to `next`.
    ///
    /// The only way back into the ready set is `RUNNING -> DEFERRED`.
    pub fn can_transition_to(&self, next: JobInstanceState) -> bool {
        use JobInstanceState::*;
        matches!(
            (self, next),
            (New, Running)
                | (New, Dropped)
                | (Deferred, Running)
                | (Deferred, Dropped)
                | (Running, Done)
                | (Running, Failed)
                | (Running, Deferred)
                | (Running, Dropped)
        )
    }
}

/// One schedulable unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInstance {
    pub id: i64,
    /// Instance type tag; selects the store table and the processor.
    pub instance_type: String,
    /// Owning job or trigger reference.
    pub job_ref: String,
    pub due_at: DateTime<Utc>,
    pub state: JobInstanceState,
    /// Discriminator attributes (e.g. `channel_type`) matched by partition predicates.
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default)]
    pub failure_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl JobInstance {
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }
}

/// A job instance as handed over by a producer, before the store assigns an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJobInstance {
    pub instance_type: String,
    pub job_ref: String,
    pub due_at: DateTime<Utc>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub payload: Option<Value>,
}

impl NewJobInstance {
    pub fn new(job_ref: impl Into<String>, due_at: DateTime<Utc>) -> Self {
        Self {
            instance_type: DEFAULT_INSTANCE_TYPE.to_string(),
            job_ref: job_ref.into(),
            due_at,
            attributes: BTreeMap::new(),
            payload: None,
        }
    }

    pub fn with_instance_type(mut self, instance_type: impl Into<String>) -> Self {
        self.instance_type = instance_type.into();
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Materialize the stored form once the store has assigned an id.
    pub fn into_instance(self, id: i64, created_at: DateTime<Utc>) -> JobInstance {
        JobInstance {
            id,
            instance_type: self.instance_type,
            job_ref: self.job_ref,
            due_at: self.due_at,
            state: JobInstanceState::New,
            attributes: self.attributes,
            payload: self.payload,
            result: None,
            failure_count: 0,
            last_error: None,
            claimed_at: None,
            created_at,
        }
    }
}

/// State change committed for a claimed (`RUNNING`) instance.
///
/// `None` fields leave the stored value untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub state: JobInstanceState,
    pub due_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub failure_count: Option<u32>,
    pub last_error: Option<String>,
}

impl Transition {
    pub fn done(result: Option<Value>) -> Self {
        Self {
            state: JobInstanceState::Done,
            due_at: None,
            result,
            failure_count: None,
            last_error: None,
        }
    }

    pub fn failed(failure_count: u32, error: impl Into<String>) -> Self {
        Self {
            state: JobInstanceState::Failed,
            due_at: None,
            result: None,
            failure_count: Some(failure_count),
            last_error: Some(error.into()),
        }
    }

    pub fn deferred(due_at: DateTime<Utc>, failure_count: u32, error: impl Into<String>) -> Self {
        Self {
            state: JobInstanceState::Deferred,
            due_at: Some(due_at),
            result: None,
            failure_count: Some(failure_count),
            last_error: Some(error.into()),
        }
    }

    pub fn dropped() -> Self {
        Self {
            state: JobInstanceState::Dropped,
            due_at: None,
            result: None,
            failure_count: None,
            last_error: None,
        }
    }

    /// Apply this transition to an in-memory copy of the instance.
    pub fn apply(&self, instance: &mut JobInstance) {
        instance.state = self.state;
        if let Some(due_at) = self.due_at {
            instance.due_at = due_at;
        }
        if self.result.is_some() {
            instance.result = self.result.clone();
        }
        if let Some(count) = self.failure_count {
            instance.failure_count = count;
        }
        if self.last_error.is_some() {
            instance.last_error = self.last_error.clone();
        }
        instance.claimed_at = None;
    }
}

/// `at + delay`, saturating instead of overflowing.
pub fn add_delay(at: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(delay)
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
