//! Database models.
//!
//! These map directly to the schema and convert into domain types.

pub mod job_instance;

pub use job_instance::*;
