//! Job instance row model.

use std::collections::BTreeMap;
use std::str::FromStr;

use sqlx::FromRow;

use crate::database::time::{ms_to_datetime, opt_ms_to_datetime};
use crate::domain::{JobInstance, JobInstanceState};
use crate::{Error, Result};

/// One row of a job instance table, with the key's id, schedule and state
/// columns aliased to `id`, `due_at` and `state`.
#[derive(Debug, Clone, FromRow)]
pub struct JobInstanceDbModel {
    pub id: i64,
    pub job_ref: String,
    /// Epoch milliseconds.
    pub due_at: i64,
    pub state: String,
    /// JSON object of string attributes.
    pub attributes: String,
    pub payload: Option<String>,
    pub result: Option<String>,
    pub failure_count: i64,
    pub last_error: Option<String>,
    pub claimed_at: Option<i64>,
    pub created_at: i64,
}

impl JobInstanceDbModel {
    pub fn into_domain(self, instance_type: &str) -> Result<JobInstance> {
        let state = JobInstanceState::from_str(&self.state).map_err(|_| {
            Error::Database(format!(
                "{} {} has unknown state '{}'",
                instance_type, self.id, self.state
            ))
        })?;
        let attributes: BTreeMap<String, String> = if self.attributes.trim().is_empty() {
            BTreeMap::new()
        } else {
            serde_json::from_str(&self.attributes)?
        };

        Ok(JobInstance {
            id: self.id,
            instance_type: instance_type.to_string(),
            job_ref: self.job_ref,
            due_at: ms_to_datetime(self.due_at),
            state,
            attributes,
            payload: self.payload.as_deref().map(serde_json::from_str).transpose()?,
            result: self.result.as_deref().map(serde_json::from_str).transpose()?,
            failure_count: self.failure_count.clamp(0, u32::MAX as i64) as u32,
            last_error: self.last_error,
            claimed_at: opt_ms_to_datetime(self.claimed_at),
            created_at: ms_to_datetime(self.created_at),
        })
    }
}
