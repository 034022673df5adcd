//! Key/value configuration sources.

use std::collections::HashMap;
use std::fmt::Display;
use std::str::FromStr;

use crate::{Error, Result};

/// Key/value lookup consulted only while the scheduler is being built.
pub trait ConfigurationSource: Send + Sync {
    fn get_property(&self, key: &str) -> Option<String>;
}

impl dyn ConfigurationSource + '_ {
    /// Raw value, with blank values treated as absent.
    pub fn get_non_blank(&self, key: &str) -> Option<String> {
        self.get_property(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    /// Parsed value or `default` when the key is absent.
    pub fn get_or_default<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.get_non_blank(key) {
            Some(raw) => parse_value(key, &raw),
            None => Ok(default),
        }
    }

    /// Parsed value; a missing key is a configuration error.
    pub fn get_or_fail<T>(&self, key: &str) -> Result<T>
    where
        T: FromStr,
        T::Err: Display,
    {
        let raw = self
            .get_non_blank(key)
            .ok_or_else(|| Error::config(format!("missing required property '{}'", key)))?;
        parse_value(key, &raw)
    }

    /// Comma separated list, empty when the key is absent.
    pub fn get_list(&self, key: &str) -> Vec<String> {
        self.get_property(key)
            .map(|raw| split_list(&raw))
            .unwrap_or_default()
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    raw.parse::<T>()
        .map_err(|e| Error::config(format!("invalid value '{}' for '{}': {}", raw, key, e)))
}

pub(crate) fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// In-process property map.
#[derive(Debug, Clone, Default)]
pub struct MapConfigurationSource {
    properties: HashMap<String, String>,
}

impl MapConfigurationSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.properties.insert(key.into(), value.into());
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for MapConfigurationSource {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            properties: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl ConfigurationSource for MapConfigurationSource {
    fn get_property(&self, key: &str) -> Option<String> {
        self.properties.get(key).cloned()
    }
}

/// Environment variable prefix used by [`EnvConfigurationSource::default`].
pub const DEFAULT_ENV_PREFIX: &str = "NOTIFY_";

/// Reads properties from the process environment.
///
/// `scheduler.batch_size` is looked up as `NOTIFY_SCHEDULER_BATCH_SIZE`.
#[derive(Debug, Clone)]
pub struct EnvConfigurationSource {
    prefix: String,
}

impl EnvConfigurationSource {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn variable_name(&self, key: &str) -> String {
        let mapped: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}{}", self.prefix, mapped)
    }
}

impl Default for EnvConfigurationSource {
    fn default() -> Self {
        Self::new(DEFAULT_ENV_PREFIX)
    }
}

impl ConfigurationSource for EnvConfigurationSource {
    fn get_property(&self, key: &str) -> Option<String> {
        std::env::var(self.variable_name(key)).ok()
    }
}
