//! Partition key value object.
//!
//! A `PartitionKey` describes one independently scheduled class of job
//! instances: where they live, which attributes hold identity, due time and
//! state, which state means "ready", and an optional predicate that carves
//! the instance type into disjoint subsets (for example one per channel).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

use crate::domain::job_instance::{JobInstance, JobInstanceState};
use crate::{Error, Result};

/// Instance type (and table) used when a key does not name one.
pub const DEFAULT_INSTANCE_TYPE: &str = "job_instance";
pub const DEFAULT_ID_ATTRIBUTE: &str = "id";
pub const DEFAULT_SCHEDULE_ATTRIBUTE: &str = "due_at";
pub const DEFAULT_STATE_ATTRIBUTE: &str = "state";
pub const DEFAULT_PARTITION_ATTRIBUTE: &str = "channel_type";

/// Returns true for `[A-Za-z_][A-Za-z0-9_]*`.
///
/// Attribute names end up in store queries, so nothing else is accepted.
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn require_identifier(what: &str, name: &str) -> Result<()> {
    if is_identifier(name) {
        Ok(())
    } else {
        Err(Error::config(format!("{} '{}' is not a valid identifier", what, name)))
    }
}

/// One `attribute = value` clause.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PredicateClause {
    pub attribute: String,
    pub value: String,
}

/// Conjunction of equality clauses over instance attributes.
///
/// An empty predicate matches every instance of the key's type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionPredicate {
    clauses: Vec<PredicateClause>,
}

impl PartitionPredicate {
    pub fn all() -> Self {
        Self::default()
    }

    /// Compose with `AND attribute = value`.
    pub fn and(mut self, attribute: impl Into<String>, value: impl Into<String>) -> Self {
        let clause = PredicateClause {
            attribute: attribute.into(),
            value: value.into(),
        };
        if !self.clauses.contains(&clause) {
            self.clauses.push(clause);
        }
        self
    }

    /// Parse `attr=value;attr=value`. Blank input yields the match-all predicate.
    pub fn parse(input: &str) -> Result<Self> {
        let mut predicate = Self::all();
        for part in input.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let (attribute, value) = part.split_once('=').ok_or_else(|| {
                Error::config(format!("predicate clause '{}' is not of the form attr=value", part))
            })?;
            let attribute = attribute.trim();
            require_identifier("predicate attribute", attribute)?;
            predicate = predicate.and(attribute, value.trim());
        }
        Ok(predicate)
    }

    pub fn clauses(&self) -> &[PredicateClause] {
        &self.clauses
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// False when one attribute is constrained to two different constants.
    pub fn is_satisfiable(&self) -> bool {
        !self.clauses.iter().enumerate().any(|(i, a)| {
            self.clauses[i + 1..]
                .iter()
                .any(|b| a.attribute == b.attribute && a.value != b.value)
        })
    }

    pub fn matches(&self, attributes: &std::collections::BTreeMap<String, String>) -> bool {
        self.clauses
            .iter()
            .all(|c| attributes.get(&c.attribute) == Some(&c.value))
    }

    /// Two predicates are disjoint if either is unsatisfiable or they pin a
    /// shared attribute to different constants.
    pub fn is_disjoint_from(&self, other: &PartitionPredicate) -> bool {
        if !self.is_satisfiable() || !other.is_satisfiable() {
            return true;
        }
        self.clauses.iter().any(|a| {
            other
                .clauses
                .iter()
                .any(|b| a.attribute == b.attribute && a.value != b.value)
        })
    }
}

impl fmt::Display for PartitionPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.clauses.is_empty() {
            return write!(f, "<all>");
        }
        let parts: Vec<String> = self
            .clauses
            .iter()
            .map(|c| format!("{} = '{}'", c.attribute, c.value))
            .collect();
        write!(f, "{}", parts.join(" AND "))
    }
}

/// Declarative descriptor of one independently scheduled partition.
///
/// Immutable once built; share it behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionKey {
    name: String,
    instance_type: String,
    id_attribute: String,
    schedule_attribute: String,
    state_attribute: String,
    partition_attribute: String,
    ready_state: JobInstanceState,
    predicate: PartitionPredicate,
    join_fetches: Vec<String>,
}

impl PartitionKey {
    pub fn builder(name: impl Into<String>) -> PartitionKeyBuilder {
        PartitionKeyBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instance_type(&self) -> &str {
        &self.instance_type
    }

    pub fn id_attribute(&self) -> &str {
        &self.id_attribute
    }

    pub fn schedule_attribute(&self) -> &str {
        &self.schedule_attribute
    }

    pub fn state_attribute(&self) -> &str {
        &self.state_attribute
    }

    pub fn partition_attribute(&self) -> &str {
        &self.partition_attribute
    }

    pub fn ready_state(&self) -> JobInstanceState {
        self.ready_state
    }

    pub fn predicate(&self) -> &PartitionPredicate {
        &self.predicate
    }

    /// Related paths a store adapter may eagerly load with each instance.
    /// Adapters without relations ignore them; the SQLite store is one.
    pub fn join_fetches(&self) -> &[String] {
        &self.join_fetches
    }

    /// States that count as ready: the configured ready state plus `DEFERRED`.
    pub fn ready_states(&self) -> Vec<JobInstanceState> {
        if self.ready_state == JobInstanceState::Deferred {
            vec![JobInstanceState::Deferred]
        } else {
            vec![self.ready_state, JobInstanceState::Deferred]
        }
    }

    pub fn is_ready_state(&self, state: JobInstanceState) -> bool {
        state == self.ready_state || state == JobInstanceState::Deferred
    }

    /// The value this key pins its partition attribute to, if any.
    pub fn discriminator(&self) -> Option<&str> {
        self.predicate
            .clauses()
            .iter()
            .rev()
            .find(|c| c.attribute == self.partition_attribute)
            .map(|c| c.value.as_str())
    }

    /// Whether the instance belongs to this partition, regardless of state.
    pub fn matches(&self, instance: &JobInstance) -> bool {
        instance.instance_type == self.instance_type && self.predicate.matches(&instance.attributes)
    }

    /// Whether the instance would be returned by a ready fetch at `now`.
    pub fn is_ready(&self, instance: &JobInstance, now: DateTime<Utc>) -> bool {
        self.matches(instance) && self.is_ready_state(instance.state) && instance.due_at <= now
    }

    /// Scope this key to one discriminator value.
    ///
    /// The derived key is named `<base>/<value>` and carries the base
    /// predicate `AND <partition_attribute> = value`. The base is untouched.
    pub fn derive(&self, value: impl Into<String>) -> Result<PartitionKey> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(Error::config(format!(
                "cannot derive partition '{}' from an empty discriminator",
                self.name
            )));
        }
        let mut derived = self.clone();
        derived.name = format!("{}/{}", self.name, value);
        derived.predicate = self
            .predicate
            .clone()
            .and(self.partition_attribute.clone(), value);
        Ok(derived)
    }

    /// Disjoint keys can never select the same row.
    pub fn is_disjoint_from(&self, other: &PartitionKey) -> bool {
        self.instance_type != other.instance_type || self.predicate.is_disjoint_from(&other.predicate)
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}: {})", self.name, self.instance_type, self.predicate)
    }
}

/// Reject duplicate names and any pair of keys that may overlap.
pub fn validate_disjoint<'a>(keys: impl IntoIterator<Item = &'a PartitionKey>) -> Result<()> {
    let keys: Vec<&PartitionKey> = keys.into_iter().collect();
    let mut names = HashSet::new();
    for key in &keys {
        if !names.insert(key.name()) {
            return Err(Error::config(format!(
                "partition '{}' is registered more than once",
                key.name()
            )));
        }
    }
    for (i, a) in keys.iter().enumerate() {
        for b in &keys[i + 1..] {
            if !a.is_disjoint_from(b) {
                return Err(Error::config(format!(
                    "partitions '{}' and '{}' are not provably disjoint",
                    a, b
                )));
            }
        }
    }
    Ok(())
}

/// Builder for [`PartitionKey`].
#[derive(Debug, Clone)]
pub struct PartitionKeyBuilder {
    key: PartitionKey,
}

impl PartitionKeyBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            key: PartitionKey {
                name: name.into(),
                instance_type: DEFAULT_INSTANCE_TYPE.to_string(),
                id_attribute: DEFAULT_ID_ATTRIBUTE.to_string(),
                schedule_attribute: DEFAULT_SCHEDULE_ATTRIBUTE.to_string(),
                state_attribute: DEFAULT_STATE_ATTRIBUTE.to_string(),
                partition_attribute: DEFAULT_PARTITION_ATTRIBUTE.to_string(),
                ready_state: JobInstanceState::New,
                predicate: PartitionPredicate::all(),
                join_fetches: Vec::new(),
            },
        }
    }

    pub fn instance_type(mut self, instance_type: impl Into<String>) -> Self {
        self.key.instance_type = instance_type.into();
        self
    }

    pub fn id_attribute(mut self, attribute: impl Into<String>) -> Self {
        self.key.id_attribute = attribute.into();
        self
    }

    pub fn schedule_attribute(mut self, attribute: impl Into<String>) -> Self {
        self.key.schedule_attribute = attribute.into();
        self
    }

    pub fn state_attribute(mut self, attribute: impl Into<String>) -> Self {
        self.key.state_attribute = attribute.into();
        self
    }

    pub fn partition_attribute(mut self, attribute: impl Into<String>) -> Self {
        self.key.partition_attribute = attribute.into();
        self
    }

    pub fn ready_state(mut self, state: JobInstanceState) -> Self {
        self.key.ready_state = state;
        self
    }

    pub fn predicate(mut self, predicate: PartitionPredicate) -> Self {
        self.key.predicate = predicate;
        self
    }

    /// Shorthand for adding one `attribute = value` clause.
    pub fn filter(mut self, attribute: impl Into<String>, value: impl Into<String>) -> Self {
        self.key.predicate = self.key.predicate.and(attribute, value);
        self
    }

    /// Adds an eager-load hint for store adapters that support relations.
    /// It never changes which instances are ready or claimable, and
    /// [`SqlxJobInstanceStore`](crate::database::SqlxJobInstanceStore) ignores it.
    pub fn join_fetch(mut self, path: impl Into<String>) -> Self {
        self.key.join_fetches.push(path.into());
        self
    }

    pub fn build(self) -> Result<PartitionKey> {
        let key = self.key;
        if key.name.trim().is_empty() {
            return Err(Error::config("partition name must not be empty"));
        }
        require_identifier("instance type", &key.instance_type)?;
        require_identifier("id attribute", &key.id_attribute)?;
        require_identifier("schedule attribute", &key.schedule_attribute)?;
        require_identifier("state attribute", &key.state_attribute)?;
        require_identifier("partition attribute", &key.partition_attribute)?;
        for clause in key.predicate.clauses() {
            require_identifier("predicate attribute", &clause.attribute)?;
        }
        if !key.ready_state.is_claimable() {
            return Err(Error::config(format!(
                "ready state of partition '{}' must be NEW or DEFERRED, got {}",
                key.name, key.ready_state
            )));
        }
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::job_instance::NewJobInstance;

    fn notifications() -> PartitionKey {
        PartitionKey::builder("notifications").build().unwrap()
    }

    #[test]
    fn test_builder_defaults() {
        let key = notifications();
        assert_eq!(key.instance_type(), "job_instance");
        assert_eq!(key.id_attribute(), "id");
        assert_eq!(key.schedule_attribute(), "due_at");
        assert_eq!(key.state_attribute(), "state");
        assert_eq!(key.ready_state(), JobInstanceState::New);
        assert!(key.predicate().is_empty());
        assert_eq!(
            key.ready_states(),
            vec![JobInstanceState::New, JobInstanceState::Deferred]
        );
    }

    #[test]
    fn test_builder_rejects_bad_identifiers() {
        let err = PartitionKey::builder("p")
            .state_attribute("state; DROP TABLE x")
            .build()
            .unwrap_err();
        assert!(err.is_configuration());

        assert!(
            PartitionKey::builder("p")
                .ready_state(JobInstanceState::Running)
                .build()
                .is_err()
        );
    }

    #[test]
    fn test_derive_composes_predicate() {
        let base = notifications();
        let email = base.derive("email").unwrap();

        assert_eq!(email.name(), "notifications/email");
        assert_eq!(email.discriminator(), Some("email"));
        assert_eq!(email.predicate().clauses().len(), 1);
        // Base is untouched.
        assert!(base.predicate().is_empty());
        assert!(base.derive("  ").is_err());
    }

    #[test]
    fn test_derived_keys_are_disjoint() {
        let base = notifications();
        let email = base.derive("email").unwrap();
        let sms = base.derive("sms").unwrap();

        assert!(email.is_disjoint_from(&sms));
        assert!(!email.is_disjoint_from(&base));
        assert!(validate_disjoint([&email, &sms]).is_ok());
        assert!(validate_disjoint([&email, &base]).is_err());
    }

    #[test]
    fn test_different_instance_types_are_disjoint() {
        let a = PartitionKey::builder("a").instance_type("reminder").build().unwrap();
        let b = notifications();
        assert!(a.is_disjoint_from(&b));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let a = notifications().derive("email").unwrap();
        let b = a.clone();
        let err = validate_disjoint([&a, &b]).unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_predicate_parse_and_match() {
        let predicate = PartitionPredicate::parse("channel_type=email; tenant = acme").unwrap();
        assert_eq!(predicate.clauses().len(), 2);
        assert_eq!(
            predicate.to_string(),
            "channel_type = 'email' AND tenant = 'acme'"
        );

        let instance = NewJobInstance::new("j", Utc::now())
            .with_attribute("channel_type", "email")
            .with_attribute("tenant", "acme")
            .into_instance(1, Utc::now());
        assert!(predicate.matches(&instance.attributes));

        assert!(PartitionPredicate::parse("no-equals-sign").is_err());
        assert!(PartitionPredicate::parse("").unwrap().is_empty());
    }

    #[test]
    fn test_unsatisfiable_predicate_is_disjoint() {
        let contradictory = PartitionPredicate::all().and("a", "1").and("a", "2");
        assert!(!contradictory.is_satisfiable());
        assert!(contradictory.is_disjoint_from(&PartitionPredicate::all()));
    }

    #[test]
    fn test_is_ready_respects_due_time_and_state() {
        let key = notifications().derive("email").unwrap();
        let now = Utc::now();
        let mut instance = NewJobInstance::new("j", now)
            .with_attribute("channel_type", "email")
            .into_instance(1, now);

        assert!(key.is_ready(&instance, now));
        assert!(!key.is_ready(&instance, now - chrono::TimeDelta::milliseconds(1)));

        instance.state = JobInstanceState::Deferred;
        assert!(key.is_ready(&instance, now));

        instance.state = JobInstanceState::Running;
        assert!(!key.is_ready(&instance, now));

        instance.state = JobInstanceState::New;
        instance.attributes.insert("channel_type".into(), "sms".into());
        assert!(!key.is_ready(&instance, now));
    }
}
