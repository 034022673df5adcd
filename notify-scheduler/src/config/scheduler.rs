//! Scheduler tuning parameters and partition declarations.

use std::str::FromStr;
use std::time::Duration;

use super::source::ConfigurationSource;
use crate::domain::{
    DEFAULT_ID_ATTRIBUTE, DEFAULT_INSTANCE_TYPE, DEFAULT_PARTITION_ATTRIBUTE,
    DEFAULT_SCHEDULE_ATTRIBUTE, DEFAULT_STATE_ATTRIBUTE, JobInstanceState, PartitionKey,
    PartitionPredicate, RetryPolicy,
};
use crate::{Error, Result};

/// A configured partition, optionally fanned out by discriminator value.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionConfig {
    pub key: PartitionKey,
    /// `Some` marks the key as a fan-out base: one derived partition per
    /// value is started, and further values may be registered later.
    pub fan_out: Option<Vec<String>>,
}

impl PartitionConfig {
    pub fn new(key: PartitionKey) -> Self {
        Self { key, fan_out: None }
    }

    pub fn fan_out<I, S>(key: PartitionKey, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            key,
            fan_out: Some(values.into_iter().map(Into::into).collect()),
        }
    }

    /// Read `partition.<name>.*`.
    pub fn from_source(source: &dyn ConfigurationSource, name: &str) -> Result<Self> {
        let prop = |suffix: &str| format!("partition.{}.{}", name, suffix);

        let ready_state: String = source.get_or_default(&prop("ready_state"), "NEW".to_string())?;
        let ready_state = JobInstanceState::from_str(&ready_state.to_ascii_uppercase())
            .map_err(|_| {
                Error::config(format!("unknown ready state '{}' for partition '{}'", ready_state, name))
            })?;
        let predicate = PartitionPredicate::parse(
            &source
                .get_non_blank(&prop("predicate"))
                .unwrap_or_default(),
        )?;

        let mut builder = PartitionKey::builder(name)
            .instance_type(source.get_or_default(&prop("instance_type"), DEFAULT_INSTANCE_TYPE.to_string())?)
            .id_attribute(source.get_or_default(&prop("id_attribute"), DEFAULT_ID_ATTRIBUTE.to_string())?)
            .schedule_attribute(
                source.get_or_default(&prop("schedule_attribute"), DEFAULT_SCHEDULE_ATTRIBUTE.to_string())?,
            )
            .state_attribute(source.get_or_default(&prop("state_attribute"), DEFAULT_STATE_ATTRIBUTE.to_string())?)
            .partition_attribute(
                source.get_or_default(&prop("partition_attribute"), DEFAULT_PARTITION_ATTRIBUTE.to_string())?,
            )
            .ready_state(ready_state)
            .predicate(predicate);
        for path in source.get_list(&prop("join_fetches")) {
            builder = builder.join_fetch(path);
        }

        let fan_out = source
            .get_property(&prop("fan_out"))
            .map(|raw| super::source::split_list(&raw));

        Ok(Self {
            key: builder.build()?,
            fan_out,
        })
    }

    /// Keys this declaration starts with.
    pub fn expand(&self) -> Result<Vec<PartitionKey>> {
        match &self.fan_out {
            Some(values) => values.iter().map(|v| self.key.derive(v.as_str())).collect(),
            None => Ok(vec![self.key.clone()]),
        }
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    pub partitions: Vec<PartitionConfig>,
    /// Instances fetched per batch.
    pub batch_size: usize,
    /// Drain cycles that may run at once.
    pub pool_size: usize,
    /// Drain cycles that may wait for a worker before submissions back off.
    pub queue_capacity: usize,
    /// Processor invocations that may run at once across all partitions.
    pub max_in_flight: usize,
    /// Upper bound on how long an idle partition sleeps; `None` waits for
    /// the next due time or a listener signal only.
    pub poll_interval: Option<Duration>,
    pub shutdown_timeout: Duration,
    pub processor_timeout: Duration,
    pub submit_backoff_base: Duration,
    pub submit_backoff_max: Duration,
    pub suspend_backoff_base: Duration,
    pub suspend_backoff_max: Duration,
    pub store_backoff_base: Duration,
    pub store_backoff_max: Duration,
    /// When set, `RUNNING` instances claimed longer ago than this are returned
    /// to `DEFERRED` on startup.
    pub stale_claim_timeout: Option<Duration>,
    pub retry: RetryPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            partitions: Vec::new(),
            batch_size: 10,
            pool_size: 4,
            queue_capacity: 64,
            max_in_flight: 4,
            poll_interval: Some(Duration::from_secs(30)),
            shutdown_timeout: Duration::from_secs(10),
            processor_timeout: Duration::from_secs(60),
            submit_backoff_base: Duration::from_millis(50),
            submit_backoff_max: Duration::from_secs(5),
            suspend_backoff_base: Duration::from_millis(25),
            suspend_backoff_max: Duration::from_secs(1),
            store_backoff_base: Duration::from_millis(500),
            store_backoff_max: Duration::from_secs(30),
            stale_claim_timeout: None,
            retry: RetryPolicy::default(),
        }
    }
}

fn millis(source: &dyn ConfigurationSource, key: &str, default: Duration) -> Result<Duration> {
    let ms: u64 = source.get_or_default(key, default.as_millis() as u64)?;
    Ok(Duration::from_millis(ms))
}

/// Zero disables the feature.
fn optional_millis(
    source: &dyn ConfigurationSource,
    key: &str,
    default: Option<Duration>,
) -> Result<Option<Duration>> {
    let default_ms = default.map(|d| d.as_millis() as u64).unwrap_or(0);
    let ms: u64 = source.get_or_default(key, default_ms)?;
    Ok((ms > 0).then(|| Duration::from_millis(ms)))
}

impl SchedulerConfig {
    pub fn with_partition(mut self, partition: PartitionConfig) -> Self {
        self.partitions.push(partition);
        self
    }

    /// Build from a configuration source. `scheduler.partitions` is required.
    pub fn from_source(source: &dyn ConfigurationSource) -> Result<Self> {
        let defaults = Self::default();

        let names: String = source.get_or_fail("scheduler.partitions")?;
        let partitions = super::source::split_list(&names)
            .iter()
            .map(|name| PartitionConfig::from_source(source, name))
            .collect::<Result<Vec<_>>>()?;
        if partitions.is_empty() {
            return Err(Error::config("scheduler.partitions does not name any partition"));
        }

        let pool_size = source.get_or_default("scheduler.pool_size", defaults.pool_size)?;
        let retry = RetryPolicy {
            max_retries: source.get_or_default("retry.max_retries", defaults.retry.max_retries)?,
            initial_delay_ms: source
                .get_or_default("retry.initial_delay_ms", defaults.retry.initial_delay_ms)?,
            max_delay_ms: source.get_or_default("retry.max_delay_ms", defaults.retry.max_delay_ms)?,
            backoff_multiplier: source
                .get_or_default("retry.backoff_multiplier", defaults.retry.backoff_multiplier)?,
            use_jitter: source.get_or_default("retry.jitter", defaults.retry.use_jitter)?,
        };

        let config = Self {
            partitions,
            batch_size: source.get_or_default("scheduler.batch_size", defaults.batch_size)?,
            pool_size,
            queue_capacity: source
                .get_or_default("scheduler.queue_capacity", defaults.queue_capacity)?,
            max_in_flight: source.get_or_default("scheduler.max_in_flight", pool_size)?,
            poll_interval: optional_millis(source, "scheduler.poll_interval_ms", defaults.poll_interval)?,
            shutdown_timeout: millis(source, "scheduler.shutdown_timeout_ms", defaults.shutdown_timeout)?,
            processor_timeout: millis(
                source,
                "scheduler.processor_timeout_ms",
                defaults.processor_timeout,
            )?,
            submit_backoff_base: millis(
                source,
                "scheduler.submit_backoff_base_ms",
                defaults.submit_backoff_base,
            )?,
            submit_backoff_max: millis(
                source,
                "scheduler.submit_backoff_max_ms",
                defaults.submit_backoff_max,
            )?,
            suspend_backoff_base: millis(
                source,
                "scheduler.suspend_backoff_ms",
                defaults.suspend_backoff_base,
            )?,
            suspend_backoff_max: defaults.suspend_backoff_max,
            store_backoff_base: millis(
                source,
                "scheduler.store_backoff_base_ms",
                defaults.store_backoff_base,
            )?,
            store_backoff_max: millis(
                source,
                "scheduler.store_backoff_max_ms",
                defaults.store_backoff_max,
            )?,
            stale_claim_timeout: optional_millis(
                source,
                "scheduler.stale_claim_timeout_ms",
                defaults.stale_claim_timeout,
            )?,
            retry,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("scheduler.batch_size", self.batch_size),
            ("scheduler.pool_size", self.pool_size),
            ("scheduler.max_in_flight", self.max_in_flight),
        ] {
            if value == 0 {
                return Err(Error::config(format!("{} must be greater than zero", name)));
            }
        }
        if self.processor_timeout.is_zero() {
            return Err(Error::config("scheduler.processor_timeout_ms must be greater than zero"));
        }
        if !(self.retry.backoff_multiplier >= 1.0) {
            return Err(Error::config("retry.backoff_multiplier must be at least 1.0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MapConfigurationSource;

    #[test]
    fn test_from_source_requires_partitions() {
        let source = MapConfigurationSource::new().with("scheduler.batch_size", "5");
        let err = SchedulerConfig::from_source(&source).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_from_source_reads_partitions_and_tuning() {
        let source = MapConfigurationSource::new()
            .with("scheduler.partitions", "notifications, reminders")
            .with("scheduler.batch_size", "25")
            .with("scheduler.pool_size", "8")
            .with("scheduler.poll_interval_ms", "0")
            .with("retry.max_retries", "5")
            .with("partition.notifications.fan_out", "email,sms")
            .with("partition.reminders.instance_type", "reminder")
            .with("partition.reminders.ready_state", "deferred")
            .with("partition.reminders.predicate", "tenant=acme");

        let config = SchedulerConfig::from_source(&source).unwrap();

        assert_eq!(config.batch_size, 25);
        assert_eq!(config.pool_size, 8);
        assert_eq!(config.max_in_flight, 8);
        assert_eq!(config.poll_interval, None);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.partitions.len(), 2);

        let notifications = &config.partitions[0];
        let keys = notifications.expand().unwrap();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].name(), "notifications/email");
        assert_eq!(keys[1].discriminator(), Some("sms"));

        let reminders = &config.partitions[1];
        assert_eq!(reminders.fan_out, None);
        assert_eq!(reminders.key.instance_type(), "reminder");
        assert_eq!(reminders.key.ready_state(), JobInstanceState::Deferred);
        assert_eq!(reminders.key.predicate().clauses().len(), 1);
    }

    #[test]
    fn test_invalid_tuning_rejected() {
        let source = MapConfigurationSource::new()
            .with("scheduler.partitions", "p")
            .with("scheduler.batch_size", "0");
        assert!(SchedulerConfig::from_source(&source).is_err());

        let source = MapConfigurationSource::new()
            .with("scheduler.partitions", "p")
            .with("partition.p.ready_state", "RUNNING");
        assert!(SchedulerConfig::from_source(&source).is_err());
    }

    #[test]
    fn test_empty_fan_out_is_a_late_registration_base() {
        let source = MapConfigurationSource::new()
            .with("scheduler.partitions", "notifications")
            .with("partition.notifications.fan_out", "");
        let config = SchedulerConfig::from_source(&source).unwrap();
        assert_eq!(config.partitions[0].fan_out, Some(vec![]));
        assert!(config.partitions[0].expand().unwrap().is_empty());
    }
}
