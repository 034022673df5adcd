//! Per-partition consuming actors.

mod consuming_actor;
mod metrics;

pub use consuming_actor::{
    ActorRunState, ConsumingActor, ConsumingActorConfig, CycleError, CycleReport, CycleResult,
};
pub use metrics::{ActorMetrics, MetricsSnapshot};
pub(crate) use consuming_actor::panic_message;
