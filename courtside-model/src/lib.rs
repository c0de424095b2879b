//! Core data model definitions shared across courtside crates.
#![allow(missing_docs)]

pub use ::chrono;

pub mod breaker;
pub mod catalog;
pub mod checkpoint;
pub mod error;
pub mod gap;
pub mod ids;
pub mod inventory;
pub mod priority;
pub mod task;
pub mod telemetry;

// Intentionally curated re-exports for downstream consumers.
pub use breaker::CircuitState;
pub use catalog::{DataTypeSpec, PartitionScheme, SubUnitPlan};
pub use checkpoint::Checkpoint;
pub use error::{ModelError, Result as ModelResult};
pub use gap::{Gap, GapReason};
pub use ids::{DataTypeId, PartitionKey, SourceId, SubUnitId, TaskId, TaskKey};
pub use inventory::{ListingEntry, ObservedPartition};
pub use priority::Priority;
pub use task::{FailureKind, Task, TaskStatus};
pub use telemetry::{
    DeadLetterEntry, HealthSummary, SourceHealth, StatusCounts, TaskEvent,
};
