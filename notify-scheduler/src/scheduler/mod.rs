//! Partitioned job scheduling.
//!
//! An [`ActorManager`] runs one [`ConsumingActor`](actor::ConsumingActor) per
//! [`PartitionKey`](crate::domain::PartitionKey). A single scheduling loop
//! keeps every partition's next wake time in a queue and submits due actors
//! to a bounded [`WorkerPool`]. Producers wake a partition early through its
//! [`ConsumerListener`].

pub mod actor;
pub mod events;
pub mod listener;
pub mod manager;
pub mod memory_store;
pub mod processor;
mod scheduling_loop;
pub mod store;
mod wake_queue;
pub mod worker_pool;

pub use actor::{ActorRunState, MetricsSnapshot};
pub use events::{EventBroadcaster, SchedulerEvent};
pub use listener::{ConsumerListener, ListenerRegistry};
pub use manager::{ActorManager, ShutdownReport};
pub use memory_store::InMemoryJobInstanceStore;
pub use processor::{JobInstanceProcessor, ProcessOutcome, ProcessorRegistry};
pub use store::JobInstanceStore;
pub use worker_pool::{WorkerPool, WorkerPoolConfig};
