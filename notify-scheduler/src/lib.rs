//! notify-scheduler library crate.
//!
//! Actor-based partitioned scheduling of deferred job instances, with a
//! SQLite store and notification channels on top.

pub mod config;
pub mod database;
pub mod domain;
pub mod error;
pub mod logging;
pub mod notification;
pub mod scheduler;

pub use error::{Error, Result};
