use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::breaker::CircuitState;
use crate::ids::{DataTypeId, PartitionKey, SourceId, TaskId};
use crate::task::{FailureKind, Task, TaskStatus};

/// Emitted on every task status change.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TaskEvent {
    pub task_id: TaskId,
    pub source: SourceId,
    pub data_type: DataTypeId,
    pub partition_key: PartitionKey,
    pub status: TaskStatus,
    pub attempt_count: u16,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

impl TaskEvent {
    pub fn from_task(task: &Task, timestamp: DateTime<Utc>) -> Self {
        Self {
            task_id: task.id,
            source: task.source.clone(),
            data_type: task.key.data_type.clone(),
            partition_key: task.key.partition.clone(),
            status: task.status,
            attempt_count: task.attempt_count,
            timestamp,
            reason: task.last_failure_reason.clone(),
        }
    }
}

/// Task counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StatusCounts {
    pub pending: u64,
    pub in_progress: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub dead_letter: u64,
}

impl StatusCounts {
    pub fn record(&mut self, status: TaskStatus) {
        *self.slot(status) += 1;
    }

    pub fn get(&self, status: TaskStatus) -> u64 {
        match status {
            TaskStatus::Pending => self.pending,
            TaskStatus::InProgress => self.in_progress,
            TaskStatus::Succeeded => self.succeeded,
            TaskStatus::Failed => self.failed,
            TaskStatus::DeadLetter => self.dead_letter,
        }
    }

    pub fn active(&self) -> u64 {
        self.pending + self.in_progress
    }

    pub fn merge(&mut self, other: &StatusCounts) {
        self.pending += other.pending;
        self.in_progress += other.in_progress;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.dead_letter += other.dead_letter;
    }

    fn slot(&mut self, status: TaskStatus) -> &mut u64 {
        match status {
            TaskStatus::Pending => &mut self.pending,
            TaskStatus::InProgress => &mut self.in_progress,
            TaskStatus::Succeeded => &mut self.succeeded,
            TaskStatus::Failed => &mut self.failed,
            TaskStatus::DeadLetter => &mut self.dead_letter,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SourceHealth {
    pub breaker: CircuitState,
    pub failure_score: f64,
    pub available_tokens: f64,
    pub counts: StatusCounts,
}

/// Operator-facing health view.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct HealthSummary {
    pub counts: StatusCounts,
    pub sources: BTreeMap<SourceId, SourceHealth>,
    pub generated_at: Option<DateTime<Utc>>,
}

/// A task that exhausted its retries, kept for secondary review.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeadLetterEntry {
    pub task_id: TaskId,
    pub source: SourceId,
    pub data_type: DataTypeId,
    pub partition_key: PartitionKey,
    pub attempt_count: u16,
    pub last_failure_reason: Option<String>,
    pub last_failure_kind: Option<FailureKind>,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn from_task(task: &Task) -> Self {
        Self {
            task_id: task.id,
            source: task.source.clone(),
            data_type: task.key.data_type.clone(),
            partition_key: task.key.partition.clone(),
            attempt_count: task.attempt_count,
            last_failure_reason: task.last_failure_reason.clone(),
            last_failure_kind: task.last_failure_kind,
            dead_lettered_at: task.updated_at,
        }
    }
}
