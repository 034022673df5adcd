//! Domain value objects.
//!
//! Value objects are immutable objects that represent concepts in the domain
//! and are defined by their attributes rather than identity.

mod partition_key;
mod retry_policy;

pub use partition_key::{
    DEFAULT_ID_ATTRIBUTE, DEFAULT_INSTANCE_TYPE, DEFAULT_PARTITION_ATTRIBUTE,
    DEFAULT_SCHEDULE_ATTRIBUTE, DEFAULT_STATE_ATTRIBUTE, PartitionKey, PartitionKeyBuilder,
    PartitionPredicate, PredicateClause, is_identifier, validate_disjoint,
};
pub use retry_policy::{BackoffPolicy, RetryPolicy, capped_exponential};
