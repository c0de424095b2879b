use std::fmt;

use chrono::{DateTime, Utc};

use crate::gap::{Gap, GapReason};
use crate::ids::{DataTypeId, PartitionKey, SourceId, TaskId, TaskKey};
use crate::priority::Priority;

/// Scheduler-visible task states. Pending/InProgress map directly to queue
/// presence; the rest are terminal.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "SCREAMING_SNAKE_CASE"))]
pub enum TaskStatus {
    Pending,
    InProgress,
    Succeeded,
    Failed,
    DeadLetter,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::DeadLetter
        )
    }

    pub fn is_active(self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::InProgress)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::InProgress => "IN_PROGRESS",
            TaskStatus::Succeeded => "SUCCEEDED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::DeadLetter => "DEAD_LETTER",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure classes that drive retry and breaker accounting.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum FailureKind {
    /// Timeouts, connection resets, 5xx.
    Transient,
    /// 429/503; retried on the longer backoff track.
    RateLimited,
    /// Other 4xx or unparseable payloads. Never retried.
    Permanent,
}

impl FailureKind {
    pub fn is_retryable(self) -> bool {
        !matches!(self, FailureKind::Permanent)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Transient => "transient",
            FailureKind::RateLimited => "rate_limited",
            FailureKind::Permanent => "permanent",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A gap promoted to schedulable work. Lives across attempts until it
/// reaches a terminal status.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Task {
    pub id: TaskId,
    pub key: TaskKey,
    pub source: SourceId,
    pub priority: Priority,
    pub reason: GapReason,
    pub attempt_count: u16,
    pub next_eligible_time: DateTime<Utc>,
    pub status: TaskStatus,
    pub last_failure_reason: Option<String>,
    pub last_failure_kind: Option<FailureKind>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn from_gap(gap: &Gap, now: DateTime<Utc>) -> Self {
        Self {
            id: TaskId::new(),
            key: gap.key(),
            source: gap.source.clone(),
            priority: gap.priority,
            reason: gap.reason,
            attempt_count: 0,
            next_eligible_time: now,
            status: TaskStatus::Pending,
            last_failure_reason: None,
            last_failure_kind: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn data_type(&self) -> &DataTypeId {
        &self.key.data_type
    }

    pub fn partition(&self) -> &PartitionKey {
        &self.key.partition
    }

    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Pending && self.next_eligible_time <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tasks_start_pending_and_eligible() {
        let now = Utc::now();
        let gap = Gap {
            data_type_id: "pbp".into(),
            source: "nba_stats".into(),
            partition_key: "2024".into(),
            priority: Priority::High,
            reason: GapReason::Missing,
        };
        let task = Task::from_gap(&gap, now);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempt_count, 0);
        assert!(task.is_eligible(now));
        assert_eq!(task.key.to_string(), "pbp:2024");
    }

    #[test]
    fn permanent_failures_are_not_retryable() {
        assert!(FailureKind::Transient.is_retryable());
        assert!(FailureKind::RateLimited.is_retryable());
        assert!(!FailureKind::Permanent.is_retryable());
    }
}
