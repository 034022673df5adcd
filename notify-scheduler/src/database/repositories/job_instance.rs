//! SQLite job instance store.
//!
//! Table and column names come from the [`PartitionKey`]: the instance type
//! names the table, and the id, schedule and state attributes name columns.
//! All of them are validated identifiers when the key is built. Predicate
//! clauses match against the JSON `attributes` column and their values are
//! always bound.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::{debug, trace};

use crate::database::models::JobInstanceDbModel;
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::{datetime_to_ms, due_to_ms, ms_to_datetime, now_ms};
use crate::domain::{
    DEFAULT_ID_ATTRIBUTE, JobInstance, JobInstanceState, NewJobInstance, PartitionKey, Transition,
};
use crate::scheduler::listener::ListenerRegistry;
use crate::scheduler::store::{JobInstanceStore, check_claim_expected, check_commit_target};
use crate::{Error, Result};

/// `WHERE` fragment selecting a key's ready instances, with its bind values
/// in order. `due_at <= ?` is bound separately by the caller.
struct ReadyFilter {
    sql: String,
    states: Vec<&'static str>,
    predicate: Vec<String>,
}

impl ReadyFilter {
    fn new(key: &PartitionKey, due_before: bool) -> Self {
        let states: Vec<&'static str> = key.ready_states().iter().map(|s| s.as_str()).collect();
        let placeholders = vec!["?"; states.len()].join(", ");
        let mut sql = format!("{} IN ({})", key.state_attribute(), placeholders);
        if due_before {
            sql.push_str(&format!(" AND {} <= ?", key.schedule_attribute()));
        }
        let (predicate_sql, predicate) = predicate_sql(key);
        sql.push_str(&predicate_sql);
        Self {
            sql,
            states,
            predicate,
        }
    }
}

/// ` AND json_extract(attributes, '$.a') = ?` per predicate clause.
fn predicate_sql(key: &PartitionKey) -> (String, Vec<String>) {
    let mut sql = String::new();
    let mut binds = Vec::new();
    for clause in key.predicate().clauses() {
        sql.push_str(&format!(
            " AND json_extract(attributes, '$.{}') = ?",
            clause.attribute
        ));
        binds.push(clause.value.clone());
    }
    (sql, binds)
}

fn select_columns(key: &PartitionKey) -> String {
    format!(
        "{} AS id, job_ref, {} AS due_at, {} AS state, attributes, payload, result, \
         failure_count, last_error, claimed_at, created_at",
        key.id_attribute(),
        key.schedule_attribute(),
        key.state_attribute()
    )
}

/// SQLx implementation of [`JobInstanceStore`].
pub struct SqlxJobInstanceStore {
    pool: SqlitePool,
    listeners: Option<ListenerRegistry>,
}

impl SqlxJobInstanceStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            listeners: None,
        }
    }

    /// Notify `listeners` after every insert.
    pub fn with_listeners(mut self, listeners: ListenerRegistry) -> Self {
        self.listeners = Some(listeners);
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn current_state(&self, key: &PartitionKey, id: i64) -> Result<Option<JobInstanceState>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = ?",
            key.state_attribute(),
            key.instance_type(),
            key.id_attribute()
        );
        let state: Option<String> = retry_on_sqlite_busy("job_instance.current_state", || async {
            Ok(sqlx::query_scalar::<_, String>(&sql)
                .bind(id)
                .fetch_optional(&self.pool)
                .await?)
        })
        .await?;
        state
            .map(|s| {
                s.parse::<JobInstanceState>()
                    .map_err(|_| Error::Database(format!("unknown job instance state '{}'", s)))
            })
            .transpose()
    }
}

#[async_trait]
impl JobInstanceStore for SqlxJobInstanceStore {
    async fn count_ready(&self, key: &PartitionKey, now: DateTime<Utc>) -> Result<u64> {
        let filter = ReadyFilter::new(key, true);
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE {}",
            key.instance_type(),
            filter.sql
        );
        let now = datetime_to_ms(now);

        let count = retry_on_sqlite_busy("job_instance.count_ready", || async {
            let mut query = sqlx::query_scalar::<_, i64>(&sql);
            for state in &filter.states {
                query = query.bind(*state);
            }
            query = query.bind(now);
            for value in &filter.predicate {
                query = query.bind(value);
            }
            Ok(query.fetch_one(&self.pool).await?)
        })
        .await?;
        Ok(count.max(0) as u64)
    }

    async fn fetch_ready_batch(
        &self,
        key: &PartitionKey,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobInstance>> {
        if !key.join_fetches().is_empty() {
            trace!(
                partition = %key.name(),
                join_fetches = ?key.join_fetches(),
                "Ignoring join fetch hints; instances carry no relations"
            );
        }
        let filter = ReadyFilter::new(key, true);
        let sql = format!(
            "SELECT {} FROM {} WHERE {} ORDER BY {} ASC, {} ASC LIMIT ?",
            select_columns(key),
            key.instance_type(),
            filter.sql,
            key.schedule_attribute(),
            key.id_attribute()
        );
        let now = datetime_to_ms(now);
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let rows = retry_on_sqlite_busy("job_instance.fetch_ready_batch", || async {
            let mut query = sqlx::query_as::<_, JobInstanceDbModel>(&sql);
            for state in &filter.states {
                query = query.bind(*state);
            }
            query = query.bind(now);
            for value in &filter.predicate {
                query = query.bind(value);
            }
            Ok(query.bind(limit).fetch_all(&self.pool).await?)
        })
        .await?;

        rows.into_iter()
            .map(|row| row.into_domain(key.instance_type()))
            .collect()
    }

    async fn try_claim(
        &self,
        key: &PartitionKey,
        id: i64,
        expected: JobInstanceState,
    ) -> Result<bool> {
        check_claim_expected(id, expected)?;
        let (predicate, values) = predicate_sql(key);
        let sql = format!(
            "UPDATE {} SET {} = ?, claimed_at = ?, updated_at = ? WHERE {} = ? AND {} = ?{}",
            key.instance_type(),
            key.state_attribute(),
            key.id_attribute(),
            key.state_attribute(),
            predicate
        );
        let now = now_ms();

        let affected = retry_on_sqlite_busy("job_instance.try_claim", || async {
            let mut query = sqlx::query(&sql)
                .bind(JobInstanceState::Running.as_str())
                .bind(now)
                .bind(now)
                .bind(id)
                .bind(expected.as_str());
            for value in &values {
                query = query.bind(value);
            }
            Ok(query.execute(&self.pool).await?.rows_affected())
        })
        .await?;

        let won = affected == 1;
        trace!(partition = %key.name(), instance_id = id, won, "Claim attempted");
        Ok(won)
    }

    async fn commit(&self, key: &PartitionKey, id: i64, transition: Transition) -> Result<()> {
        check_commit_target(&transition)?;
        let sql = format!(
            "UPDATE {table} SET {state} = ?, {due} = COALESCE(?, {due}), \
             result = COALESCE(?, result), failure_count = COALESCE(?, failure_count), \
             last_error = COALESCE(?, last_error), claimed_at = NULL, updated_at = ? \
             WHERE {id} = ? AND {state} = ?",
            table = key.instance_type(),
            state = key.state_attribute(),
            due = key.schedule_attribute(),
            id = key.id_attribute()
        );
        let due_at = transition.due_at.map(due_to_ms);
        let result = transition.result.as_ref().map(serde_json::to_string).transpose()?;
        let failure_count = transition.failure_count.map(i64::from);
        let now = now_ms();

        let affected = retry_on_sqlite_busy("job_instance.commit", || async {
            Ok(sqlx::query(&sql)
                .bind(transition.state.as_str())
                .bind(due_at)
                .bind(&result)
                .bind(failure_count)
                .bind(&transition.last_error)
                .bind(now)
                .bind(id)
                .bind(JobInstanceState::Running.as_str())
                .execute(&self.pool)
                .await?
                .rows_affected())
        })
        .await?;

        if affected == 1 {
            return Ok(());
        }
        match self.current_state(key, id).await? {
            Some(current) => Err(Error::invalid_transition(current, transition.state)),
            None => Err(Error::not_found(key.instance_type(), id.to_string())),
        }
    }

    async fn next_due_time(&self, key: &PartitionKey) -> Result<Option<DateTime<Utc>>> {
        let filter = ReadyFilter::new(key, false);
        let sql = format!(
            "SELECT MIN({}) FROM {} WHERE {}",
            key.schedule_attribute(),
            key.instance_type(),
            filter.sql
        );

        let due = retry_on_sqlite_busy("job_instance.next_due_time", || async {
            let mut query = sqlx::query_scalar::<_, Option<i64>>(&sql);
            for state in &filter.states {
                query = query.bind(*state);
            }
            for value in &filter.predicate {
                query = query.bind(value);
            }
            Ok(query.fetch_one(&self.pool).await?)
        })
        .await?;
        Ok(due.map(ms_to_datetime))
    }

    async fn insert(&self, instance: NewJobInstance) -> Result<i64> {
        if !crate::domain::is_identifier(&instance.instance_type) {
            return Err(Error::validation(format!(
                "invalid instance type '{}'",
                instance.instance_type
            )));
        }
        let sql = format!(
            "INSERT INTO {} (job_ref, due_at, state, attributes, payload, failure_count, \
             created_at, updated_at) VALUES (?, ?, ?, ?, ?, 0, ?, ?)",
            instance.instance_type
        );
        let attributes = serde_json::to_string(&instance.attributes)?;
        let payload = instance.payload.as_ref().map(serde_json::to_string).transpose()?;
        let due_at = due_to_ms(instance.due_at);
        let now = now_ms();

        let id = retry_on_sqlite_busy("job_instance.insert", || async {
            Ok(sqlx::query(&sql)
                .bind(&instance.job_ref)
                .bind(due_at)
                .bind(JobInstanceState::New.as_str())
                .bind(&attributes)
                .bind(&payload)
                .bind(now)
                .bind(now)
                .execute(&self.pool)
                .await?
                .last_insert_rowid())
        })
        .await?;

        debug!(instance_id = id, job_ref = %instance.job_ref, "Job instance inserted");
        if let Some(listeners) = &self.listeners {
            listeners.notify_instance(&instance.into_instance(id, ms_to_datetime(now)));
        }
        Ok(id)
    }

    async fn get(&self, instance_type: &str, id: i64) -> Result<Option<JobInstance>> {
        if !crate::domain::is_identifier(instance_type) {
            return Err(Error::validation(format!(
                "invalid instance type '{}'",
                instance_type
            )));
        }
        let sql = format!(
            "SELECT * FROM {} WHERE {} = ?",
            instance_type, DEFAULT_ID_ATTRIBUTE
        );

        let row = retry_on_sqlite_busy("job_instance.get", || async {
            Ok(sqlx::query_as::<_, JobInstanceDbModel>(&sql)
                .bind(id)
                .fetch_optional(&self.pool)
                .await?)
        })
        .await?;
        row.map(|row| row.into_domain(instance_type)).transpose()
    }

    async fn reset_stale_running(
        &self,
        key: &PartitionKey,
        claimed_before: DateTime<Utc>,
    ) -> Result<u64> {
        let (predicate, values) = predicate_sql(key);
        let sql = format!(
            "UPDATE {} SET {} = ?, claimed_at = NULL, updated_at = ? \
             WHERE {} = ? AND (claimed_at IS NULL OR claimed_at < ?){}",
            key.instance_type(),
            key.state_attribute(),
            key.state_attribute(),
            predicate
        );
        let cutoff = datetime_to_ms(claimed_before);
        let now = now_ms();

        retry_on_sqlite_busy("job_instance.reset_stale_running", || async {
            let mut query = sqlx::query(&sql)
                .bind(JobInstanceState::Deferred.as_str())
                .bind(now)
                .bind(JobInstanceState::Running.as_str())
                .bind(cutoff);
            for value in &values {
                query = query.bind(value);
            }
            Ok(query.execute(&self.pool).await?.rows_affected())
        })
        .await
    }
}

impl std::fmt::Debug for SqlxJobInstanceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlxJobInstanceStore")
            .field("listeners", &self.listeners)
            .finish()
    }
}
