//! Repository layer for database access.

pub mod job_instance;

pub use job_instance::*;
