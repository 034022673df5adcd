//! Domain layer for notify-scheduler.
//!
//! This module contains the job instance entity and the value objects that
//! describe how instances are partitioned and retried.

pub mod job_instance;
pub mod value_objects;

pub use job_instance::{JobInstance, JobInstanceState, NewJobInstance, Transition, add_delay};
pub use value_objects::*;
