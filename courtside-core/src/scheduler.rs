//! Turns gaps into tasks and hands them to workers in priority order while
//! enforcing per-source worker caps, rate budgets and circuit breakers.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use courtside_model::{
    DataTypeId, DeadLetterEntry, FailureKind, Gap, PartitionKey, Priority,
    SourceId, StatusCounts, Task, TaskId, TaskKey, TaskStatus,
};
use dashmap::DashMap;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info};

use crate::error::{CollectError, Result};
use crate::registry::SourceRegistry;
use crate::retry::RetryPolicy;
use crate::telemetry::Telemetry;

/// How an execution attempt ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskOutcome {
    Succeeded,
    Failed { kind: FailureKind, reason: String },
    /// The attempt never reached the source (breaker open, no token in
    /// time, cancelled). Requeued without spending an attempt.
    Deferred { reason: String, retry_after: Duration },
}

impl TaskOutcome {
    pub fn failed(kind: FailureKind, reason: impl Into<String>) -> Self {
        TaskOutcome::Failed {
            kind,
            reason: reason.into(),
        }
    }

    pub fn deferred(reason: impl Into<String>, retry_after: Duration) -> Self {
        TaskOutcome::Deferred {
            reason: reason.into(),
            retry_after,
        }
    }
}

/// What the scheduler did with a completed attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Disposition {
    Succeeded,
    Retry { at: DateTime<Utc> },
    Deferred { at: DateTime<Utc> },
    Failed,
    DeadLetter,
}

#[derive(Clone, Debug)]
pub struct Completion {
    pub task: Task,
    pub disposition: Disposition,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EnqueueSummary {
    pub inserted: usize,
    /// Gaps folded into an already pending or running task.
    pub merged: usize,
    /// Gaps for keys that already failed or dead-lettered in this process.
    pub suppressed: usize,
}

/// When a worker should next ask for work.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Wakeup {
    Ready,
    After(Duration),
    /// Blocked on the worker cap or waiting for running tasks; a
    /// completion or enqueue will notify.
    OnNotify,
    /// Nothing pending or running for this source.
    Drained,
}

/// Ready-set ordering: tier, newest partition, data type, then id.
#[derive(Clone, Debug, PartialEq, Eq)]
struct QueueEntry {
    priority: Priority,
    partition: PartitionKey,
    data_type: DataTypeId,
    id: TaskId,
}

impl QueueEntry {
    fn of(task: &Task) -> Self {
        Self {
            priority: task.priority,
            partition: task.key.partition.clone(),
            data_type: task.key.data_type.clone(),
            id: task.id,
        }
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.partition.cmp(&self.partition))
            .then_with(|| self.data_type.cmp(&other.data_type))
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct SourceQueue {
    tasks: HashMap<TaskId, Task>,
    /// PENDING or IN_PROGRESS task per key.
    active: HashMap<TaskKey, TaskId>,
    ready: BTreeSet<QueueEntry>,
    in_progress: usize,
    succeeded: u64,
    /// Keys that failed permanently or dead-lettered; not re-enqueued until
    /// released.
    suppressed: HashMap<TaskKey, TaskStatus>,
}

impl fmt::Debug for SourceQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceQueue")
            .field("tasks", &self.tasks.len())
            .field("ready", &self.ready.len())
            .field("in_progress", &self.in_progress)
            .field("suppressed", &self.suppressed.len())
            .finish()
    }
}

impl SourceQueue {
    fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts {
            succeeded: self.succeeded,
            ..StatusCounts::default()
        };
        for task in self.tasks.values() {
            counts.record(task.status);
        }
        counts
    }

    fn first_eligible(&self, now: DateTime<Utc>) -> Option<TaskId> {
        self.ready
            .iter()
            .find(|entry| {
                self.tasks
                    .get(&entry.id)
                    .is_some_and(|task| task.is_eligible(now))
            })
            .map(|entry| entry.id)
    }

    fn earliest_eligible(&self) -> Option<DateTime<Utc>> {
        self.ready
            .iter()
            .filter_map(|entry| self.tasks.get(&entry.id))
            .map(|task| task.next_eligible_time)
            .min()
    }
}

struct SourceSlot {
    queue: Mutex<SourceQueue>,
    notify: Arc<Notify>,
}

/// Per-source priority queues. Each source has its own lock; no lock spans
/// sources.
#[derive(Clone)]
pub struct Scheduler {
    registry: SourceRegistry,
    retry: RetryPolicy,
    telemetry: Telemetry,
    sources: Arc<DashMap<SourceId, Arc<SourceSlot>>>,
    owners: Arc<DashMap<TaskId, SourceId>>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("sources", &self.sources.len())
            .field("tracked_tasks", &self.owners.len())
            .field("retry", &self.retry)
            .finish()
    }
}

impl Scheduler {
    pub fn new(
        registry: SourceRegistry,
        retry: RetryPolicy,
        telemetry: Telemetry,
    ) -> Self {
        Self {
            registry,
            retry,
            telemetry,
            sources: Arc::new(DashMap::new()),
            owners: Arc::new(DashMap::new()),
        }
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    fn slot(&self, source: &SourceId) -> Arc<SourceSlot> {
        if let Some(slot) = self.sources.get(source) {
            return Arc::clone(slot.value());
        }
        let slot = self.sources.entry(source.clone()).or_insert_with(|| {
            Arc::new(SourceSlot {
                queue: Mutex::new(SourceQueue::default()),
                notify: Arc::new(Notify::new()),
            })
        });
        Arc::clone(slot.value())
    }

    /// Wakes workers waiting on `source` when its queue changes.
    pub fn notifier(&self, source: &SourceId) -> Arc<Notify> {
        Arc::clone(&self.slot(source).notify)
    }

    pub fn sources(&self) -> Vec<SourceId> {
        let mut sources: Vec<SourceId> =
            self.sources.iter().map(|entry| entry.key().clone()).collect();
        sources.sort();
        sources
    }

    /// Inserts tasks for new gaps. A gap whose key already has a pending or
    /// running task is merged into it, keeping the more urgent tier.
    pub async fn enqueue(&self, gaps: &[Gap], now: DateTime<Utc>) -> EnqueueSummary {
        let mut summary = EnqueueSummary::default();
        let mut by_source: HashMap<&SourceId, Vec<&Gap>> = HashMap::new();
        for gap in gaps {
            by_source.entry(&gap.source).or_default().push(gap);
        }

        for (source, gaps) in by_source {
            let slot = self.slot(source);
            let mut queue = slot.queue.lock().await;
            for gap in gaps {
                let key = gap.key();
                if queue.suppressed.contains_key(&key) {
                    summary.suppressed += 1;
                    continue;
                }
                if let Some(existing) = queue.active.get(&key).copied() {
                    summary.merged += 1;
                    let Some(task) = queue.tasks.get(&existing) else {
                        continue;
                    };
                    let elevated = task.priority.elevate(gap.priority);
                    if elevated == task.priority {
                        continue;
                    }
                    let old_entry = QueueEntry::of(task);
                    let was_pending = task.status == TaskStatus::Pending;
                    if let Some(task) = queue.tasks.get_mut(&existing) {
                        task.priority = elevated;
                        task.updated_at = now;
                    }
                    if was_pending {
                        queue.ready.remove(&old_entry);
                        if let Some(task) = queue.tasks.get(&existing) {
                            let entry = QueueEntry::of(task);
                            queue.ready.insert(entry);
                        }
                    }
                    continue;
                }

                let task = Task::from_gap(gap, now);
                queue.ready.insert(QueueEntry::of(&task));
                queue.active.insert(key, task.id);
                self.owners.insert(task.id, source.clone());
                self.telemetry.task_changed(&task, now);
                queue.tasks.insert(task.id, task);
                summary.inserted += 1;
            }
            drop(queue);
            slot.notify.notify_waiters();
        }

        debug!(
            target: "courtside::scheduler",
            inserted = summary.inserted,
            merged = summary.merged,
            suppressed = summary.suppressed,
            "gaps enqueued"
        );
        summary
    }

    /// Claims the most urgent eligible task for `source`, or `None` when
    /// the breaker, the rate budget or the worker cap says wait.
    pub async fn next(&self, source: &SourceId, now: DateTime<Utc>) -> Option<Task> {
        let handle = self.registry.handle(source);
        let slot = self.slot(source);
        let mut queue = slot.queue.lock().await;

        if queue.in_progress >= handle.max_workers {
            return None;
        }
        if !handle.breaker.admits_dispatch(now) {
            return None;
        }
        if !handle.bucket.has_token() {
            return None;
        }

        let id = queue.first_eligible(now)?;
        let task = queue.tasks.get_mut(&id)?;
        let entry = QueueEntry::of(task);
        task.status = TaskStatus::InProgress;
        task.updated_at = now;
        let claimed = task.clone();
        queue.ready.remove(&entry);
        queue.in_progress += 1;
        drop(queue);

        self.telemetry.task_changed(&claimed, now);
        Some(claimed)
    }

    /// Tells a worker whose `next` came back empty when to ask again.
    pub async fn next_wakeup(&self, source: &SourceId, now: DateTime<Utc>) -> Wakeup {
        let handle = self.registry.handle(source);
        let slot = self.slot(source);
        let queue = slot.queue.lock().await;

        if queue.ready.is_empty() {
            return if queue.in_progress == 0 {
                Wakeup::Drained
            } else {
                Wakeup::OnNotify
            };
        }
        if queue.in_progress >= handle.max_workers {
            return Wakeup::OnNotify;
        }

        let mut wait = handle.breaker.retry_after(now);
        wait = wait.max(handle.bucket.time_until_available());
        if let Some(earliest) = queue.earliest_eligible() {
            let until = (earliest - now).to_std().unwrap_or(Duration::ZERO);
            wait = wait.max(until);
        }
        if wait.is_zero() && !handle.breaker.admits_dispatch(now) {
            // A half-open probe is running; its completion notifies.
            return Wakeup::OnNotify;
        }
        if wait.is_zero() {
            Wakeup::Ready
        } else {
            Wakeup::After(wait)
        }
    }

    /// Records the outcome of an in-progress task.
    pub async fn complete(
        &self,
        task_id: TaskId,
        outcome: TaskOutcome,
        now: DateTime<Utc>,
    ) -> Result<Completion> {
        let source = self
            .owners
            .get(&task_id)
            .map(|entry| entry.value().clone())
            .ok_or(CollectError::UnknownTask(task_id))?;
        let slot = self.slot(&source);
        let mut queue = slot.queue.lock().await;

        let status = queue
            .tasks
            .get(&task_id)
            .map(|task| task.status)
            .ok_or(CollectError::UnknownTask(task_id))?;
        if status != TaskStatus::InProgress {
            return Err(CollectError::NotInProgress(task_id));
        }
        queue.in_progress = queue.in_progress.saturating_sub(1);

        let (task, disposition) = match outcome {
            TaskOutcome::Succeeded => {
                let mut task = queue
                    .tasks
                    .remove(&task_id)
                    .ok_or(CollectError::UnknownTask(task_id))?;
                queue.active.remove(&task.key);
                queue.succeeded += 1;
                self.owners.remove(&task_id);
                task.status = TaskStatus::Succeeded;
                task.updated_at = now;
                (task, Disposition::Succeeded)
            }
            TaskOutcome::Deferred {
                reason,
                retry_after,
            } => {
                let task = queue
                    .tasks
                    .get_mut(&task_id)
                    .ok_or(CollectError::UnknownTask(task_id))?;
                let at = now + chrono::Duration::from_std(retry_after)
                    .unwrap_or(chrono::Duration::zero());
                task.status = TaskStatus::Pending;
                task.next_eligible_time = at.max(task.next_eligible_time);
                task.updated_at = now;
                debug!(
                    target: "courtside::scheduler",
                    task_id = %task_id,
                    %reason,
                    "task deferred without spending an attempt"
                );
                let task = task.clone();
                queue.ready.insert(QueueEntry::of(&task));
                (task, Disposition::Deferred { at })
            }
            TaskOutcome::Failed { kind, reason } => {
                let task = queue
                    .tasks
                    .get_mut(&task_id)
                    .ok_or(CollectError::UnknownTask(task_id))?;
                task.attempt_count = task.attempt_count.saturating_add(1);
                task.last_failure_reason = Some(reason);
                task.last_failure_kind = Some(kind);
                task.updated_at = now;

                let disposition = if kind == FailureKind::Permanent {
                    task.status = TaskStatus::Failed;
                    Disposition::Failed
                } else if self.retry.should_retry(kind, task.attempt_count) {
                    let delay = self.retry.delay(kind, task.attempt_count);
                    let at = now
                        + chrono::Duration::from_std(delay)
                            .unwrap_or(chrono::Duration::zero());
                    task.status = TaskStatus::Pending;
                    task.next_eligible_time = at;
                    Disposition::Retry { at }
                } else {
                    task.status = TaskStatus::DeadLetter;
                    Disposition::DeadLetter
                };

                let task = task.clone();
                match disposition {
                    Disposition::Retry { at } => {
                        info!(
                            target: "courtside::scheduler",
                            task_id = %task.id,
                            key = %task.key,
                            attempt = task.attempt_count,
                            %kind,
                            retry_at = %at,
                            "task failed, retry scheduled"
                        );
                        queue.ready.insert(QueueEntry::of(&task));
                    }
                    _ => {
                        queue.active.remove(&task.key);
                        queue.suppressed.insert(task.key.clone(), task.status);
                    }
                }
                (task, disposition)
            }
        };
        drop(queue);

        self.telemetry.task_changed(&task, now);
        slot.notify.notify_waiters();
        Ok(Completion { task, disposition })
    }

    /// Drops pending tasks, for one source or all. Running tasks finish.
    pub async fn cancel_pending(&self, source: Option<&SourceId>) -> usize {
        let targets = match source {
            Some(source) => vec![source.clone()],
            None => self.sources(),
        };
        let mut cancelled = 0;
        for source in targets {
            let slot = self.slot(&source);
            let mut queue = slot.queue.lock().await;
            let ready = std::mem::take(&mut queue.ready);
            for entry in ready {
                if let Some(task) = queue.tasks.remove(&entry.id) {
                    queue.active.remove(&task.key);
                    self.owners.remove(&task.id);
                    cancelled += 1;
                }
            }
            drop(queue);
            slot.notify.notify_waiters();
        }
        cancelled
    }

    /// Allows a failed or dead-lettered key to be enqueued again.
    pub async fn release_dead_letter(&self, source: &SourceId, key: &TaskKey) -> bool {
        let slot = self.slot(source);
        let mut queue = slot.queue.lock().await;
        let released = queue.suppressed.remove(key).is_some();
        if released {
            let stale: Vec<TaskId> = queue
                .tasks
                .values()
                .filter(|task| &task.key == key && task.status.is_terminal())
                .map(|task| task.id)
                .collect();
            for id in stale {
                queue.tasks.remove(&id);
                self.owners.remove(&id);
            }
        }
        released
    }

    /// Every retained task: active, failed and dead-lettered.
    pub async fn snapshot(&self) -> Vec<Task> {
        let mut tasks = Vec::new();
        for source in self.sources() {
            let slot = self.slot(&source);
            let queue = slot.queue.lock().await;
            tasks.extend(queue.tasks.values().cloned());
        }
        tasks.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.key.cmp(&b.key))
                .then_with(|| a.id.cmp(&b.id))
        });
        tasks
    }

    pub async fn counts_for(&self, source: &SourceId) -> StatusCounts {
        let slot = self.slot(source);
        let queue = slot.queue.lock().await;
        queue.counts()
    }

    pub async fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for source in self.sources() {
            counts.merge(&self.counts_for(&source).await);
        }
        counts
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetterEntry> {
        self.snapshot()
            .await
            .iter()
            .filter(|task| task.status == TaskStatus::DeadLetter)
            .map(DeadLetterEntry::from_task)
            .collect()
    }

    /// True once no source has pending or running work.
    pub async fn is_drained(&self) -> bool {
        self.counts().await.active() == 0
    }
}
