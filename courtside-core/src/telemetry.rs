//! Task and breaker observability: broadcast streams, run counters and the
//! operator alert channel.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use courtside_model::{
    CircuitState, DeadLetterEntry, SourceId, StatusCounts, Task, TaskEvent,
    TaskStatus,
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, info};

/// Log target for operator-visible alerts.
pub const ALERT_TARGET: &str = "courtside::alert";

/// Circuit breaker state change for one source.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerEvent {
    pub source: SourceId,
    pub from: CircuitState,
    pub to: CircuitState,
    pub at: DateTime<Utc>,
}

/// In-process fan-out of task and breaker events plus transition counters
/// for the current run. Cheap to clone.
#[derive(Clone)]
pub struct Telemetry {
    inner: Arc<TelemetryInner>,
}

struct TelemetryInner {
    task_sender: broadcast::Sender<TaskEvent>,
    breaker_sender: broadcast::Sender<BreakerEvent>,
    capacity: usize,
    transitions: Mutex<StatusCounts>,
}

impl fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Telemetry")
            .field("capacity", &self.inner.capacity)
            .field("task_subscribers", &self.inner.task_sender.receiver_count())
            .field(
                "breaker_subscribers",
                &self.inner.breaker_sender.receiver_count(),
            )
            .finish()
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl Telemetry {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (task_sender, _) = broadcast::channel(capacity);
        let (breaker_sender, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(TelemetryInner {
                task_sender,
                breaker_sender,
                capacity,
                transitions: Mutex::new(StatusCounts::default()),
            }),
        }
    }

    pub fn subscribe_tasks(&self) -> broadcast::Receiver<TaskEvent> {
        self.inner.task_sender.subscribe()
    }

    pub fn subscribe_breakers(&self) -> broadcast::Receiver<BreakerEvent> {
        self.inner.breaker_sender.subscribe()
    }

    /// Publishes the task's current status. Dead letters also raise an
    /// alert.
    pub fn task_changed(&self, task: &Task, now: DateTime<Utc>) {
        self.inner
            .transitions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(task.status);

        match task.status {
            TaskStatus::DeadLetter => error!(
                target: ALERT_TARGET,
                task_id = %task.id,
                source = %task.source,
                key = %task.key,
                attempts = task.attempt_count,
                reason = task.last_failure_reason.as_deref().unwrap_or("unknown"),
                "task moved to dead letter"
            ),
            TaskStatus::Failed => info!(
                target: "courtside::scheduler",
                task_id = %task.id,
                key = %task.key,
                reason = task.last_failure_reason.as_deref().unwrap_or("unknown"),
                "task failed permanently"
            ),
            status => debug!(
                target: "courtside::scheduler",
                task_id = %task.id,
                key = %task.key,
                %status,
                attempts = task.attempt_count,
                "task status changed"
            ),
        }

        let _ = self.inner.task_sender.send(TaskEvent::from_task(task, now));
    }

    pub fn breaker_changed(
        &self,
        source: &SourceId,
        from: CircuitState,
        to: CircuitState,
        at: DateTime<Utc>,
    ) {
        if to == CircuitState::Open {
            error!(
                target: ALERT_TARGET,
                %source,
                %from,
                "circuit breaker opened"
            );
        } else {
            info!(
                target: "courtside::executor",
                %source,
                %from,
                %to,
                "circuit breaker transition"
            );
        }
        let _ = self.inner.breaker_sender.send(BreakerEvent {
            source: source.clone(),
            from,
            to,
            at,
        });
    }

    /// Escalates an error that stops the run.
    pub fn fatal(&self, message: &str) {
        error!(target: ALERT_TARGET, error = message, "fatal collector error");
    }

    /// Transitions into each status observed so far.
    pub fn transitions(&self) -> StatusCounts {
        *self
            .inner
            .transitions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Tasks that exhausted their retries, newest last.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterReport {
    pub entries: Vec<DeadLetterEntry>,
}

impl DeadLetterReport {
    pub fn new(mut entries: Vec<DeadLetterEntry>) -> Self {
        entries.sort_by(|a, b| {
            a.dead_lettered_at
                .cmp(&b.dead_lettered_at)
                .then_with(|| a.task_id.cmp(&b.task_id))
        });
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl fmt::Display for DeadLetterReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.entries.is_empty() {
            return writeln!(f, "no dead-lettered tasks");
        }
        writeln!(f, "{} dead-lettered task(s):", self.entries.len())?;
        for entry in &self.entries {
            writeln!(
                f,
                "  {}:{} [{}] attempts={} reason={}",
                entry.data_type,
                entry.partition_key,
                entry.source,
                entry.attempt_count,
                entry.last_failure_reason.as_deref().unwrap_or("unknown"),
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courtside_model::{Gap, GapReason, Priority};

    fn task(status: TaskStatus) -> Task {
        let gap = Gap {
            data_type_id: "pbp".into(),
            source: "nba_stats".into(),
            partition_key: "2024".into(),
            priority: Priority::High,
            reason: GapReason::Missing,
        };
        let mut task = Task::from_gap(&gap, Utc::now());
        task.status = status;
        task
    }

    #[tokio::test]
    async fn subscribers_receive_task_events() {
        let telemetry = Telemetry::new(16);
        let mut rx = telemetry.subscribe_tasks();

        let task = task(TaskStatus::InProgress);
        telemetry.task_changed(&task, Utc::now());

        let event = rx.recv().await.unwrap();
        assert_eq!(event.task_id, task.id);
        assert_eq!(event.status, TaskStatus::InProgress);
        assert_eq!(telemetry.transitions().in_progress, 1);
    }

    #[tokio::test]
    async fn breaker_events_are_broadcast() {
        let telemetry = Telemetry::new(16);
        let mut rx = telemetry.subscribe_breakers();
        telemetry.breaker_changed(
            &"bref".into(),
            CircuitState::Closed,
            CircuitState::Open,
            Utc::now(),
        );
        let event = rx.recv().await.unwrap();
        assert_eq!(event.to, CircuitState::Open);
    }

    #[test]
    fn dead_letter_report_lists_reasons() {
        let mut task = task(TaskStatus::DeadLetter);
        task.attempt_count = 5;
        task.last_failure_reason = Some("http 502".into());
        let report = DeadLetterReport::new(vec![DeadLetterEntry::from_task(&task)]);

        let rendered = report.to_string();
        assert!(rendered.contains("pbp:2024"));
        assert!(rendered.contains("http 502"));
        assert_eq!(report.len(), 1);
    }
}
