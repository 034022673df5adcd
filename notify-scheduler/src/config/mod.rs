//! Configuration module.
//!
//! Configuration is read once at construction time: a [`ConfigurationSource`]
//! supplies raw properties and [`SchedulerConfig`] turns them into partition
//! keys and tuning parameters.

pub mod scheduler;
pub mod source;

pub use scheduler::{PartitionConfig, SchedulerConfig};
pub use source::{
    ConfigurationSource, DEFAULT_ENV_PREFIX, EnvConfigurationSource, MapConfigurationSource,
};
