//! Runs one task against its source: checkpoint resume, rate limiting,
//! breaker admission, fetch, persist.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use courtside_model::{
    Checkpoint, DataTypeSpec, FailureKind, SubUnitId, Task,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::circuit_breaker::Admission;
use crate::config::{SinkConfig, TimeoutConfig};
use crate::registry::{SourceHandle, SourceRegistry};
use crate::scheduler::TaskOutcome;
use crate::scraper::{RawArtifact, ScrapeError, Scraper, ScraperSet};
use crate::storage::{ArtifactMetadata, CheckpointStore, SinkError, StorageSink};
use crate::telemetry::Telemetry;

/// Result of one execution attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Execution {
    pub outcome: TaskOutcome,
    /// Sub-units fetched and persisted during this attempt.
    pub fetched: usize,
    /// Sub-units skipped because the checkpoint already had them.
    pub skipped: usize,
    /// Set when storage failed in a way that must stop the run.
    pub fatal: Option<SinkError>,
}

impl Execution {
    pub fn is_fatal(&self) -> bool {
        self.fatal.is_some()
    }
}

#[derive(Debug, Default)]
struct Progress {
    fetched: usize,
    skipped: usize,
    /// A request was admitted by the breaker and has not reported back.
    in_flight: bool,
}

/// Why an attempt stopped before finishing every sub-unit.
enum Halt {
    Outcome(TaskOutcome),
    Fatal(SinkError),
    /// The task deadline passed between sub-units.
    Deadline,
}

impl From<TaskOutcome> for Halt {
    fn from(outcome: TaskOutcome) -> Self {
        Halt::Outcome(outcome)
    }
}

/// Executes tasks handed out by the scheduler. Holds no per-task state, so
/// one instance is shared by every worker.
#[derive(Clone)]
pub struct Executor {
    registry: SourceRegistry,
    scrapers: ScraperSet,
    sink: Arc<dyn StorageSink>,
    checkpoints: Arc<dyn CheckpointStore>,
    telemetry: Telemetry,
    timeouts: TimeoutConfig,
    sink_config: SinkConfig,
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("scrapers", &self.scrapers)
            .field("timeouts", &self.timeouts)
            .field("sink_config", &self.sink_config)
            .finish()
    }
}

impl Executor {
    pub fn new(
        registry: SourceRegistry,
        scrapers: ScraperSet,
        sink: Arc<dyn StorageSink>,
        checkpoints: Arc<dyn CheckpointStore>,
        telemetry: Telemetry,
    ) -> Self {
        let timeouts = registry.config().timeouts.clone();
        let sink_config = registry.config().sink.clone();
        Self {
            registry,
            scrapers,
            sink,
            checkpoints,
            telemetry,
            timeouts,
            sink_config,
        }
    }

    pub fn with_timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn scrapers(&self) -> &ScraperSet {
        &self.scrapers
    }

    /// Runs `task` to completion, failure or deferral. Cancellation and the
    /// task deadline are honoured between sub-units, so a write or
    /// checkpoint save in progress always finishes. A fetch is cut short
    /// at the deadline. The outer timeout, one request timeout past the
    /// deadline, only catches a stalled write.
    pub async fn execute(
        &self,
        task: &Task,
        spec: &DataTypeSpec,
        cancel: &CancellationToken,
    ) -> Execution {
        let handle = self.registry.handle(&task.source);
        let mut progress = Progress::default();
        let deadline = deadline_after(self.timeouts.task());

        let result = tokio::time::timeout(
            self.timeouts.task() + self.timeouts.request(),
            self.run(task, spec, &handle, cancel, deadline, &mut progress),
        )
        .await;

        let (outcome, fatal) = match result {
            Ok(Ok(())) => (TaskOutcome::Succeeded, None),
            Ok(Err(Halt::Outcome(outcome))) => (outcome, None),
            Ok(Err(Halt::Fatal(err))) => {
                self.telemetry.fatal(&err.to_string());
                (
                    TaskOutcome::deferred("storage unavailable", Duration::ZERO),
                    Some(err),
                )
            }
            Ok(Err(Halt::Deadline)) | Err(_) => {
                if progress.in_flight {
                    handle
                        .breaker
                        .record_failure(FailureKind::Transient, Utc::now());
                }
                warn!(
                    target: "courtside::executor",
                    task_id = %task.id,
                    key = %task.key,
                    fetched = progress.fetched,
                    "task exceeded its time limit"
                );
                (TaskOutcome::failed(FailureKind::Transient, "timeout"), None)
            }
        };

        Execution {
            outcome,
            fetched: progress.fetched,
            skipped: progress.skipped,
            fatal,
        }
    }

    async fn run(
        &self,
        task: &Task,
        spec: &DataTypeSpec,
        handle: &SourceHandle,
        cancel: &CancellationToken,
        deadline: Instant,
        progress: &mut Progress,
    ) -> Result<(), Halt> {
        let Some(scraper) = self.scrapers.get(&task.source) else {
            return Err(TaskOutcome::failed(
                FailureKind::Permanent,
                format!("no scraper registered for source {}", task.source),
            )
            .into());
        };

        let mut checkpoint = match self.checkpoints.load(&task.key).await {
            Ok(Some(checkpoint)) => checkpoint,
            Ok(None) => Checkpoint::new(&task.key, Utc::now()),
            Err(err) if err.is_fatal() => return Err(Halt::Fatal(err)),
            Err(err) => {
                return Err(TaskOutcome::failed(
                    FailureKind::Transient,
                    format!("checkpoint load: {err}"),
                )
                .into());
            }
        };

        let plan = scraper.plan(spec, task.partition());
        let base = spec.partition_path(task.partition());
        let extension = scraper.extension(spec).to_string();
        debug!(
            target: "courtside::executor",
            task_id = %task.id,
            key = %task.key,
            units = plan.len(),
            resumed = checkpoint.completed.len(),
            "executing task"
        );

        for unit in plan {
            if checkpoint.is_done(&unit) {
                progress.skipped += 1;
                continue;
            }
            if cancel.is_cancelled() {
                return Err(TaskOutcome::deferred("cancelled", Duration::ZERO).into());
            }
            if Instant::now() >= deadline {
                return Err(Halt::Deadline);
            }

            if let Err(exceeded) = handle.bucket.acquire(self.timeouts.token_wait()).await {
                debug!(
                    target: "courtside::executor",
                    task_id = %task.id,
                    source = %task.source,
                    waited_ms = exceeded.waited.as_millis() as u64,
                    "no rate-limit token in time"
                );
                return Err(TaskOutcome::deferred(
                    "rate limit wait",
                    handle.bucket.time_until_available(),
                )
                .into());
            }

            if let Admission::Rejected { retry_after } =
                handle.breaker.try_acquire(Utc::now())
            {
                return Err(TaskOutcome::deferred("circuit open", retry_after).into());
            }

            progress.in_flight = true;
            let fetched = self
                .fetch(scraper.as_ref(), spec, task, &unit, deadline)
                .await;
            progress.in_flight = false;

            let artifact = match fetched {
                Ok(artifact) => {
                    handle.breaker.record_success(Utc::now());
                    artifact
                }
                Err(err) => {
                    let kind = err.kind();
                    handle.breaker.record_failure(kind, Utc::now());
                    debug!(
                        target: "courtside::executor",
                        task_id = %task.id,
                        key = %task.key,
                        sub_unit = %unit,
                        %kind,
                        error = %err,
                        "fetch failed"
                    );
                    return Err(TaskOutcome::failed(kind, err.reason()).into());
                }
            };

            let path = format!("{base}/{unit}.{extension}");
            let metadata = ArtifactMetadata {
                source: task.source.clone(),
                data_type: spec.id.clone(),
                partition: task.partition().clone(),
                sub_unit: unit.clone(),
                content_type: artifact.content_type.clone(),
                fetched_at: Utc::now(),
            };
            self.persist(&path, &artifact, &metadata).await?;
            progress.fetched += 1;

            checkpoint.advance(unit, Utc::now());
            match self.checkpoints.save(&checkpoint).await {
                Ok(()) => {}
                Err(err) if err.is_fatal() => return Err(Halt::Fatal(err)),
                Err(err) => warn!(
                    target: "courtside::executor",
                    key = %task.key,
                    error = %err,
                    "checkpoint save failed; progress kept in memory"
                ),
            }
        }

        if let Err(err) = self.checkpoints.delete(&task.key).await {
            if err.is_fatal() {
                return Err(Halt::Fatal(err));
            }
            warn!(
                target: "courtside::executor",
                key = %task.key,
                error = %err,
                "stale checkpoint left behind"
            );
        }
        info!(
            target: "courtside::executor",
            task_id = %task.id,
            key = %task.key,
            fetched = progress.fetched,
            skipped = progress.skipped,
            "task completed"
        );
        Ok(())
    }

    async fn fetch(
        &self,
        scraper: &dyn Scraper,
        spec: &DataTypeSpec,
        task: &Task,
        unit: &SubUnitId,
        deadline: Instant,
    ) -> Result<RawArtifact, ScrapeError> {
        let limit = self
            .timeouts
            .request()
            .min(deadline.saturating_duration_since(Instant::now()));
        match tokio::time::timeout(
            limit,
            scraper.fetch(spec, task.partition(), unit),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ScrapeError::Timeout),
        }
    }

    /// Writes one artifact, retrying transient sink errors.
    async fn persist(
        &self,
        path: &str,
        artifact: &RawArtifact,
        metadata: &ArtifactMetadata,
    ) -> Result<(), Halt> {
        let attempts = self.sink_config.write_attempts.max(1);
        let mut attempt: u16 = 1;
        loop {
            match self.sink.put(path, &artifact.bytes, metadata).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_fatal() => return Err(Halt::Fatal(err)),
                Err(err) if attempt >= attempts => {
                    return Err(TaskOutcome::failed(
                        FailureKind::Transient,
                        format!("storage: {err}"),
                    )
                    .into());
                }
                Err(err) => {
                    warn!(
                        target: "courtside::executor",
                        path,
                        attempt,
                        error = %err,
                        "artifact write failed, retrying"
                    );
                    let delay = self.sink_config.write_retry_delay() * u32::from(attempt);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// `now + limit`, saturating far in the future for unbounded limits.
fn deadline_after(limit: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(limit)
        .unwrap_or_else(|| now + Duration::from_secs(30 * 365 * 86_400))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    use courtside_model::{
        CircuitState, Gap, GapReason, PartitionScheme, Priority, SubUnitPlan,
        TaskKey,
    };

    use crate::config::CollectorConfig;
    use crate::scraper::ScriptedScraper;
    use crate::storage::{MemoryCheckpointStore, MemoryStorage};

    const SOURCE: &str = "nba_stats";

    fn spec(pages: u32) -> DataTypeSpec {
        DataTypeSpec {
            id: "play_by_play".into(),
            source: SOURCE.into(),
            required: true,
            priority: Priority::High,
            freshness_days: 0,
            path_pattern: "nba_stats/play_by_play/season={partition}".into(),
            completeness_threshold: 0.9,
            estimated_records: 0,
            partitions: PartitionScheme::Single,
            sub_units: SubUnitPlan::Pages { count: pages },
        }
    }

    fn task(partition: &str) -> Task {
        let gap = Gap {
            data_type_id: "play_by_play".into(),
            source: SOURCE.into(),
            partition_key: partition.into(),
            priority: Priority::High,
            reason: GapReason::Missing,
        };
        Task::from_gap(&gap, Utc::now())
    }

    struct Harness {
        executor: Executor,
        registry: SourceRegistry,
        scraper: Arc<ScriptedScraper>,
        storage: Arc<MemoryStorage>,
        checkpoints: Arc<MemoryCheckpointStore>,
    }

    fn harness(config: CollectorConfig, scraper: ScriptedScraper) -> Harness {
        let telemetry = Telemetry::default();
        let registry =
            SourceRegistry::build(Arc::new(config), telemetry.clone(), [SOURCE.into()]);
        let scraper = Arc::new(scraper);
        let storage = Arc::new(MemoryStorage::new());
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let executor = Executor::new(
            registry.clone(),
            ScraperSet::new().with(scraper.clone()),
            storage.clone(),
            checkpoints.clone(),
            telemetry,
        );
        Harness {
            executor,
            registry,
            scraper,
            storage,
            checkpoints,
        }
    }

    fn generous() -> CollectorConfig {
        let mut config = CollectorConfig::default();
        config.defaults.bucket_capacity = 100.0;
        config.defaults.refill_per_sec = 100.0;
        config
    }

    #[tokio::test]
    async fn fetches_every_unit_and_clears_checkpoint() {
        let h = harness(generous(), ScriptedScraper::new(SOURCE));
        let task = task("2024");

        let run = h
            .executor
            .execute(&task, &spec(3), &CancellationToken::new())
            .await;

        assert_eq!(run.outcome, TaskOutcome::Succeeded);
        assert_eq!(run.fetched, 3);
        assert_eq!(
            h.storage.paths(),
            vec![
                "nba_stats/play_by_play/season=2024/1.json",
                "nba_stats/play_by_play/season=2024/2.json",
                "nba_stats/play_by_play/season=2024/3.json",
            ]
        );
        let stored = h
            .storage
            .get("nba_stats/play_by_play/season=2024/2.json")
            .unwrap();
        let metadata = stored.metadata.unwrap();
        assert_eq!(metadata.sub_unit.as_str(), "2");
        assert_eq!(metadata.content_type.as_deref(), Some("application/json"));
        assert!(h.checkpoints.is_empty());
    }

    #[tokio::test]
    async fn resumes_after_the_last_completed_unit() {
        let h = harness(generous(), ScriptedScraper::new(SOURCE));
        let task = task("2023");
        let mut checkpoint = Checkpoint::new(&task.key, Utc::now());
        for page in 1..=7 {
            checkpoint.advance(SubUnitId::new(page.to_string()), Utc::now());
        }
        h.checkpoints.save(&checkpoint).await.unwrap();

        let run = h
            .executor
            .execute(&task, &spec(10), &CancellationToken::new())
            .await;

        assert_eq!(run.outcome, TaskOutcome::Succeeded);
        assert_eq!(run.skipped, 7);
        assert_eq!(run.fetched, 3);
        assert_eq!(h.scraper.fetched_units(), vec!["8", "9", "10"]);
        assert!(h.checkpoints.get(&task.key).is_none());
    }

    #[tokio::test]
    async fn failure_mid_partition_keeps_progress_for_the_next_attempt() {
        let scraper = ScriptedScraper::new(SOURCE);
        scraper.respond("2024", "3", Err(ScrapeError::Http { status: 502 }));
        let h = harness(generous(), scraper);
        let task = task("2024");

        let first = h
            .executor
            .execute(&task, &spec(5), &CancellationToken::new())
            .await;
        assert_eq!(
            first.outcome,
            TaskOutcome::failed(FailureKind::Transient, "http 502")
        );
        let saved = h.checkpoints.get(&task.key).unwrap();
        let done: BTreeSet<&str> = saved.completed.iter().map(|u| u.as_str()).collect();
        assert_eq!(done, BTreeSet::from(["1", "2"]));

        let second = h
            .executor
            .execute(&task, &spec(5), &CancellationToken::new())
            .await;
        assert_eq!(second.outcome, TaskOutcome::Succeeded);
        assert_eq!(second.skipped, 2);
        assert_eq!(
            h.scraper.fetched_units(),
            vec!["1", "2", "3", "3", "4", "5"]
        );
    }

    #[tokio::test]
    async fn status_codes_become_classified_failures() {
        let scraper = ScriptedScraper::new(SOURCE);
        scraper.queue([
            Err(ScrapeError::Http { status: 429 }),
            Err(ScrapeError::Http { status: 404 }),
        ]);
        let h = harness(generous(), scraper);

        let limited = h
            .executor
            .execute(&task("2024"), &spec(1), &CancellationToken::new())
            .await;
        assert_eq!(
            limited.outcome,
            TaskOutcome::failed(FailureKind::RateLimited, "http 429")
        );

        let missing = h
            .executor
            .execute(&task("2023"), &spec(1), &CancellationToken::new())
            .await;
        assert_eq!(
            missing.outcome,
            TaskOutcome::failed(FailureKind::Permanent, "http 404")
        );

        let snapshot = h.registry.breaker_snapshot(&SOURCE.into(), Utc::now());
        assert_eq!(snapshot.failure_count, 2);
        assert!((snapshot.failure_score - 1.5).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_requests_time_out_as_transient() {
        let mut config = generous();
        config.timeouts.request_ms = 1_000;
        let scraper = ScriptedScraper::new(SOURCE).with_latency(Duration::from_secs(5));
        let h = harness(config, scraper);

        let run = h
            .executor
            .execute(&task("2024"), &spec(1), &CancellationToken::new())
            .await;

        assert_eq!(
            run.outcome,
            TaskOutcome::failed(FailureKind::Transient, "timeout")
        );
        assert!(h.storage.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn whole_task_is_bounded() {
        let mut config = generous();
        config.timeouts.request_ms = 10_000;
        config.timeouts.task_ms = 2_500;
        let scraper = ScriptedScraper::new(SOURCE).with_latency(Duration::from_secs(1));
        let h = harness(config, scraper);
        let task = task("2024");

        let run = h
            .executor
            .execute(&task, &spec(10), &CancellationToken::new())
            .await;

        assert_eq!(
            run.outcome,
            TaskOutcome::failed(FailureKind::Transient, "timeout")
        );
        assert_eq!(run.fetched, 2);
        assert_eq!(h.checkpoints.get(&task.key).unwrap().completed.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_lets_a_running_write_finish() {
        let mut config = generous();
        config.timeouts.request_ms = 10_000;
        config.timeouts.task_ms = 1_000;
        let h = harness(config, ScriptedScraper::new(SOURCE));
        // Retry delays of 500 ms and 1 s push the first write past the deadline.
        h.storage.fail_next_puts([
            SinkError::Transient("busy".into()),
            SinkError::Transient("busy".into()),
        ]);
        let task = task("2024");

        let run = h
            .executor
            .execute(&task, &spec(3), &CancellationToken::new())
            .await;

        assert_eq!(
            run.outcome,
            TaskOutcome::failed(FailureKind::Transient, "timeout")
        );
        assert_eq!(run.fetched, 1);
        assert_eq!(h.storage.put_count(), 3);
        assert_eq!(
            h.storage.paths(),
            vec!["nba_stats/play_by_play/season=2024/1.json"]
        );
        assert_eq!(h.scraper.call_count(), 1);
        assert_eq!(h.checkpoints.get(&task.key).unwrap().completed.len(), 1);
        let snapshot = h.registry.breaker_snapshot(&SOURCE.into(), Utc::now());
        assert_eq!(snapshot.failure_count, 0);
    }

    #[tokio::test]
    async fn fatal_sink_error_stops_without_spending_an_attempt() {
        let h = harness(generous(), ScriptedScraper::new(SOURCE));
        h.storage
            .fail_next_puts([SinkError::Fatal("permission denied".into())]);

        let run = h
            .executor
            .execute(&task("2024"), &spec(2), &CancellationToken::new())
            .await;

        assert!(run.is_fatal());
        assert!(matches!(run.outcome, TaskOutcome::Deferred { .. }));
        assert_eq!(h.storage.put_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_sink_errors_are_retried() {
        let h = harness(generous(), ScriptedScraper::new(SOURCE));
        h.storage.fail_next_puts([
            SinkError::Transient("busy".into()),
            SinkError::Transient("busy".into()),
        ]);

        let run = h
            .executor
            .execute(&task("2024"), &spec(1), &CancellationToken::new())
            .await;

        assert_eq!(run.outcome, TaskOutcome::Succeeded);
        assert_eq!(h.storage.put_count(), 3);
        assert_eq!(h.storage.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_sink_retries_fail_transiently() {
        let h = harness(generous(), ScriptedScraper::new(SOURCE));
        h.storage.fail_next_puts(
            std::iter::repeat_n(SinkError::Transient("busy".into()), 3),
        );

        let run = h
            .executor
            .execute(&task("2024"), &spec(1), &CancellationToken::new())
            .await;

        assert!(matches!(
            run.outcome,
            TaskOutcome::Failed { kind: FailureKind::Transient, ref reason }
                if reason.starts_with("storage:")
        ));
        assert!(!run.is_fatal());
    }

    #[tokio::test]
    async fn open_breaker_defers_without_calling_the_source() {
        let h = harness(generous(), ScriptedScraper::new(SOURCE));
        let handle = h.registry.handle(&SOURCE.into());
        for _ in 0..5 {
            handle.breaker.record_failure(FailureKind::Transient, Utc::now());
        }
        assert_eq!(handle.breaker.state_at(Utc::now()), CircuitState::Open);

        let run = h
            .executor
            .execute(&task("2024"), &spec(1), &CancellationToken::new())
            .await;

        assert!(matches!(
            run.outcome,
            TaskOutcome::Deferred { ref reason, retry_after }
                if reason == "circuit open" && retry_after > Duration::ZERO
        ));
        assert_eq!(h.scraper.call_count(), 0);
    }

    #[tokio::test]
    async fn cancellation_is_checked_between_units() {
        let h = harness(generous(), ScriptedScraper::new(SOURCE));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let run = h.executor.execute(&task("2024"), &spec(3), &cancel).await;

        assert_eq!(
            run.outcome,
            TaskOutcome::deferred("cancelled", Duration::ZERO)
        );
        assert_eq!(h.scraper.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_bucket_defers_after_bounded_wait() {
        let mut config = CollectorConfig::default();
        config.defaults.bucket_capacity = 1.0;
        config.defaults.refill_per_sec = 0.01;
        config.timeouts.token_wait_ms = 1_000;
        let h = harness(config, ScriptedScraper::new(SOURCE));

        let run = h
            .executor
            .execute(&task("2024"), &spec(2), &CancellationToken::new())
            .await;

        assert!(matches!(
            run.outcome,
            TaskOutcome::Deferred { ref reason, .. } if reason == "rate limit wait"
        ));
        assert_eq!(run.fetched, 1);
        let key = TaskKey::new("play_by_play".into(), "2024".into());
        assert!(h.checkpoints.get(&key).is_some());
    }

    #[tokio::test]
    async fn unknown_source_fails_permanently() {
        let h = harness(generous(), ScriptedScraper::new("other"));

        let run = h
            .executor
            .execute(&task("2024"), &spec(1), &CancellationToken::new())
            .await;

        assert!(matches!(
            run.outcome,
            TaskOutcome::Failed { kind: FailureKind::Permanent, .. }
        ));
    }
}
