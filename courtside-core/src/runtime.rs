//! Wires catalog, scheduler and executor into a bounded collection run.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use courtside_model::{
    DeadLetterEntry, FailureKind, Gap, HealthSummary, Priority, SourceHealth,
    SourceId, StatusCounts, Task,
};
use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::Catalog;
use crate::config::CollectorConfig;
use crate::error::{CollectError, Result};
use crate::executor::Executor;
use crate::reconcile::{InventorySnapshot, ReconcileSummary, reconcile};
use crate::registry::SourceRegistry;
use crate::retry::RetryPolicy;
use crate::scheduler::{Disposition, EnqueueSummary, Scheduler, TaskOutcome, Wakeup};
use crate::scraper::ScraperSet;
use crate::storage::{CheckpointStore, StorageListing, StorageSink};
use crate::telemetry::{DeadLetterReport, Telemetry};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Storage the runtime reads inventory from and writes artifacts to.
#[derive(Clone)]
pub struct StorageBackends {
    pub listing: Arc<dyn StorageListing>,
    pub sink: Arc<dyn StorageSink>,
    pub checkpoints: Arc<dyn CheckpointStore>,
}

impl fmt::Debug for StorageBackends {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageBackends").finish_non_exhaustive()
    }
}

impl StorageBackends {
    /// One store serving both listing and writes.
    pub fn shared<S>(storage: Arc<S>, checkpoints: Arc<dyn CheckpointStore>) -> Self
    where
        S: StorageListing + StorageSink + 'static,
    {
        Self {
            listing: storage.clone(),
            sink: storage,
            checkpoints,
        }
    }
}

/// Narrows which gaps a pass acts on.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunFilter {
    /// Least urgent tier to include; more urgent tiers always pass.
    pub tier: Option<Priority>,
    pub source: Option<SourceId>,
    /// Report gaps without enqueuing them.
    pub dry_run: bool,
}

impl RunFilter {
    pub fn admits(&self, gap: &Gap) -> bool {
        self.tier.is_none_or(|tier| gap.priority <= tier)
            && self.source.as_ref().is_none_or(|source| &gap.source == source)
    }
}

#[derive(Clone, Debug)]
pub struct ReconcileReport {
    pub gaps: Vec<Gap>,
    pub summary: ReconcileSummary,
    /// Zeroed on dry runs.
    pub enqueued: EnqueueSummary,
    pub dry_run: bool,
}

/// How a bounded run ended.
#[derive(Clone, Debug, Default)]
pub struct RunReport {
    pub counts: StatusCounts,
    /// Tasks that reached DEAD_LETTER during this run.
    pub dead_letters: DeadLetterReport,
    pub fatal: Option<String>,
    /// The deadline passed before the queue drained.
    pub timed_out: bool,
}

impl RunReport {
    pub fn has_dead_letters(&self) -> bool {
        !self.dead_letters.is_empty()
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "succeeded {}, failed {}, dead-lettered {}, still pending {}",
            self.counts.succeeded,
            self.counts.failed,
            self.counts.dead_letter,
            self.counts.active(),
        )?;
        if self.timed_out {
            f.write_str(" (deadline reached)")?;
        }
        if let Some(fatal) = &self.fatal {
            write!(f, " (aborted: {fatal})")?;
        }
        Ok(())
    }
}

/// Shared by every worker of one run.
#[derive(Clone)]
struct WorkerContext {
    scheduler: Scheduler,
    executor: Executor,
    catalog: Arc<Catalog>,
    cancel: CancellationToken,
    fatal: Arc<Mutex<Option<String>>>,
    dead_letters: Arc<Mutex<Vec<DeadLetterEntry>>>,
}

impl WorkerContext {
    async fn work(self, source: SourceId, worker: usize) {
        let notify = self.scheduler.notifier(&source);
        debug!(
            target: "courtside::executor",
            %source,
            worker,
            "worker started"
        );
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            // Register before looking at the queue so a completion between
            // the check and the wait is not lost.
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(task) = self.scheduler.next(&source, Utc::now()).await {
                self.run_task(task).await;
                continue;
            }

            match self.scheduler.next_wakeup(&source, Utc::now()).await {
                Wakeup::Drained => break,
                Wakeup::Ready => tokio::task::yield_now().await,
                Wakeup::OnNotify => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = notified.as_mut() => {}
                    }
                }
                Wakeup::After(wait) => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = notified.as_mut() => {}
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }
        debug!(
            target: "courtside::executor",
            %source,
            worker,
            "worker stopped"
        );
    }

    async fn run_task(&self, task: Task) {
        let outcome = match self.catalog.get(task.data_type()) {
            Some(spec) => {
                let execution = self.executor.execute(&task, spec, &self.cancel).await;
                if let Some(err) = execution.fatal {
                    lock(&self.fatal).get_or_insert_with(|| err.to_string());
                    self.cancel.cancel();
                }
                execution.outcome
            }
            None => TaskOutcome::failed(
                FailureKind::Permanent,
                format!("data type {} is not in the catalog", task.data_type()),
            ),
        };

        match self.scheduler.complete(task.id, outcome, Utc::now()).await {
            Ok(completion) => {
                if completion.disposition == Disposition::DeadLetter {
                    lock(&self.dead_letters)
                        .push(DeadLetterEntry::from_task(&completion.task));
                }
            }
            Err(err) => warn!(
                target: "courtside::executor",
                task_id = %task.id,
                error = %err,
                "could not record task outcome"
            ),
        }
    }
}

/// The collection engine: reconciles storage against the catalog and drains
/// the resulting work through per-source worker pools.
pub struct CollectorRuntime {
    catalog: Arc<Catalog>,
    config: Arc<CollectorConfig>,
    registry: SourceRegistry,
    scheduler: Scheduler,
    executor: Executor,
    listing: Arc<dyn StorageListing>,
    telemetry: Telemetry,
    shutdown: CancellationToken,
}

impl fmt::Debug for CollectorRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectorRuntime")
            .field("data_types", &self.catalog.len())
            .field("scheduler", &self.scheduler)
            .field("executor", &self.executor)
            .field("shutdown", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl CollectorRuntime {
    pub fn new(
        catalog: Catalog,
        config: CollectorConfig,
        scrapers: ScraperSet,
        storage: StorageBackends,
    ) -> Result<Self> {
        Self::with_telemetry(catalog, config, scrapers, storage, Telemetry::default())
    }

    pub fn with_telemetry(
        catalog: Catalog,
        config: CollectorConfig,
        scrapers: ScraperSet,
        storage: StorageBackends,
        telemetry: Telemetry,
    ) -> Result<Self> {
        config.validate().map_err(CollectError::InvalidConfig)?;
        let config = Arc::new(config);

        let registry =
            SourceRegistry::build(config.clone(), telemetry.clone(), catalog.sources());
        for source in catalog.sources() {
            if !scrapers.contains(&source) {
                warn!(
                    target: "courtside::executor",
                    %source,
                    "no scraper registered; its tasks will fail"
                );
            }
        }
        let scheduler = Scheduler::new(
            registry.clone(),
            RetryPolicy::from_config(&config),
            telemetry.clone(),
        );
        let executor = Executor::new(
            registry.clone(),
            scrapers,
            storage.sink,
            storage.checkpoints,
            telemetry.clone(),
        );

        Ok(Self {
            catalog: Arc::new(catalog),
            config,
            registry,
            scheduler,
            executor,
            listing: storage.listing,
            telemetry,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    /// Lists storage, reconciles it against the catalog and enqueues the
    /// gaps the filter admits.
    pub async fn reconcile_pass(&self, filter: &RunFilter) -> Result<ReconcileReport> {
        let now = Utc::now();
        let snapshot = InventorySnapshot::collect(&self.catalog, self.listing.as_ref()).await?;
        let mut gaps = reconcile(&self.catalog, &snapshot, now);
        gaps.retain(|gap| filter.admits(gap));
        let summary = ReconcileSummary::from_gaps(&gaps);

        let enqueued = if filter.dry_run {
            EnqueueSummary::default()
        } else {
            self.scheduler.enqueue(&gaps, now).await
        };
        info!(
            target: "courtside::reconcile",
            observed = snapshot.len(),
            gaps = summary.total,
            inserted = enqueued.inserted,
            dry_run = filter.dry_run,
            "{summary}"
        );

        Ok(ReconcileReport {
            gaps,
            summary,
            enqueued,
            dry_run: filter.dry_run,
        })
    }

    /// Works the queue until nothing is pending or running, `deadline`
    /// passes, a fatal storage error occurs, or [`shutdown`] is called.
    ///
    /// [`shutdown`]: CollectorRuntime::shutdown
    pub async fn run_until_drained(&self, deadline: Option<Duration>) -> RunReport {
        let run = self.shutdown.child_token();
        let context = WorkerContext {
            scheduler: self.scheduler.clone(),
            executor: self.executor.clone(),
            catalog: self.catalog.clone(),
            cancel: run.clone(),
            fatal: Arc::new(Mutex::new(None)),
            dead_letters: Arc::new(Mutex::new(Vec::new())),
        };

        let mut handles: Vec<JoinHandle<()>> = Vec::new();
        for source in self.scheduler.sources() {
            let parallelism = self.registry.handle(&source).max_workers;
            for worker in 0..parallelism {
                let context = context.clone();
                let source = source.clone();
                handles.push(tokio::spawn(context.work(source, worker)));
            }
        }
        info!(
            target: "courtside::executor",
            workers = handles.len(),
            "collection run started"
        );

        let workers = join_all(handles);
        tokio::pin!(workers);
        let (results, timed_out) = match deadline {
            Some(limit) => {
                tokio::select! {
                    results = workers.as_mut() => (results, false),
                    _ = tokio::time::sleep(limit) => {
                        info!(
                            target: "courtside::executor",
                            "run deadline reached; stopping workers"
                        );
                        run.cancel();
                        (workers.as_mut().await, true)
                    }
                }
            }
            None => (workers.as_mut().await, false),
        };
        for result in results {
            if let Err(err) = result {
                warn!(target: "courtside::executor", error = %err, "worker ended abnormally");
            }
        }

        let fatal = lock(&context.fatal).take();
        let dead_letters = DeadLetterReport::new(std::mem::take(&mut *lock(
            &context.dead_letters,
        )));
        let report = RunReport {
            counts: self.scheduler.counts().await,
            dead_letters,
            fatal,
            timed_out,
        };
        info!(target: "courtside::executor", "collection run finished: {report}");
        report
    }

    /// One reconcile pass followed by a run over whatever it enqueued.
    /// Dry runs stop after reconciling.
    pub async fn run_once(
        &self,
        filter: &RunFilter,
        deadline: Option<Duration>,
    ) -> Result<(ReconcileReport, RunReport)> {
        let reconciled = self.reconcile_pass(filter).await?;
        if reconciled.dry_run {
            let report = RunReport {
                counts: self.scheduler.counts().await,
                ..RunReport::default()
            };
            return Ok((reconciled, report));
        }
        let report = self.run_until_drained(deadline).await;
        Ok((reconciled, report))
    }

    /// Stops workers at their next sub-unit boundary.
    pub fn shutdown(&self) {
        info!(target: "courtside::executor", "shutdown requested");
        self.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Task counts plus breaker and budget state per source.
    pub async fn health(&self, now: DateTime<Utc>) -> HealthSummary {
        let sources: BTreeSet<SourceId> = self
            .registry
            .sources()
            .into_iter()
            .chain(self.scheduler.sources())
            .collect();

        let mut summary = HealthSummary {
            generated_at: Some(now),
            ..HealthSummary::default()
        };
        for source in sources {
            let handle = self.registry.handle(&source);
            let breaker = handle.breaker.snapshot(now);
            let counts = self.scheduler.counts_for(&source).await;
            summary.counts.merge(&counts);
            summary.sources.insert(
                source,
                SourceHealth {
                    breaker: breaker.state,
                    failure_score: breaker.failure_score,
                    available_tokens: handle.bucket.available(),
                    counts,
                },
            );
        }
        summary
    }

    /// Every dead-lettered task still held by the scheduler.
    pub async fn dead_letters(&self) -> DeadLetterReport {
        DeadLetterReport::new(self.scheduler.dead_letters().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courtside_model::{
        CircuitState, DataTypeSpec, GapReason, PartitionScheme, SubUnitPlan,
    };

    use crate::scraper::{ScrapeError, ScriptedScraper};
    use crate::storage::{MemoryCheckpointStore, MemoryStorage};

    fn spec(id: &str, priority: Priority, first: i32, last: i32) -> DataTypeSpec {
        DataTypeSpec {
            id: id.into(),
            source: "nba_stats".into(),
            required: true,
            priority,
            freshness_days: 0,
            path_pattern: format!("nba_stats/{id}/season={{partition}}"),
            completeness_threshold: 0.9,
            estimated_records: 0,
            partitions: PartitionScheme::Seasons {
                first,
                last: Some(last),
            },
            sub_units: SubUnitPlan::Pages { count: 2 },
        }
    }

    fn config(workers: usize) -> CollectorConfig {
        let mut config = CollectorConfig::default();
        config.defaults.max_workers = workers;
        config.defaults.bucket_capacity = 1_000.0;
        config.defaults.refill_per_sec = 1_000.0;
        config
    }

    fn runtime(
        specs: Vec<DataTypeSpec>,
        config: CollectorConfig,
        scraper: Arc<ScriptedScraper>,
        storage: Arc<MemoryStorage>,
    ) -> CollectorRuntime {
        let catalog = Catalog::load(specs, Utc::now()).catalog;
        CollectorRuntime::new(
            catalog,
            config,
            ScraperSet::new().with(scraper),
            StorageBackends::shared(storage, Arc::new(MemoryCheckpointStore::new())),
        )
        .unwrap()
    }

    #[test]
    fn filter_keeps_tier_and_more_urgent() {
        let gap = |priority| Gap {
            data_type_id: "pbp".into(),
            source: "nba_stats".into(),
            partition_key: "2024".into(),
            priority,
            reason: GapReason::Missing,
        };
        let filter = RunFilter {
            tier: Some(Priority::High),
            ..RunFilter::default()
        };
        assert!(filter.admits(&gap(Priority::Immediate)));
        assert!(filter.admits(&gap(Priority::High)));
        assert!(!filter.admits(&gap(Priority::Medium)));

        let filter = RunFilter {
            source: Some("bref".into()),
            ..RunFilter::default()
        };
        assert!(!filter.admits(&gap(Priority::High)));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut config = CollectorConfig::default();
        config.defaults.max_workers = 0;
        let storage = Arc::new(MemoryStorage::new());
        let result = CollectorRuntime::new(
            Catalog::default(),
            config,
            ScraperSet::new(),
            StorageBackends::shared(storage, Arc::new(MemoryCheckpointStore::new())),
        );
        assert!(matches!(result, Err(CollectError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn dry_run_reports_without_enqueuing() {
        let storage = Arc::new(MemoryStorage::new());
        let scraper = Arc::new(ScriptedScraper::new("nba_stats"));
        let runtime = runtime(
            vec![spec("pbp", Priority::High, 2022, 2024)],
            config(2),
            scraper.clone(),
            storage,
        );

        let filter = RunFilter {
            dry_run: true,
            ..RunFilter::default()
        };
        let (reconciled, report) = runtime.run_once(&filter, None).await.unwrap();

        assert_eq!(reconciled.summary.total, 3);
        assert_eq!(reconciled.enqueued, EnqueueSummary::default());
        assert_eq!(report.counts.active(), 0);
        assert_eq!(scraper.call_count(), 0);
    }

    #[tokio::test]
    async fn run_fills_every_gap_and_second_pass_is_clean() {
        let storage = Arc::new(MemoryStorage::new());
        let scraper = Arc::new(ScriptedScraper::new("nba_stats"));
        let runtime = runtime(
            vec![
                spec("pbp", Priority::High, 2022, 2024),
                spec("box", Priority::Low, 2023, 2024),
            ],
            config(2),
            scraper.clone(),
            storage.clone(),
        );

        let (reconciled, report) =
            runtime.run_once(&RunFilter::default(), None).await.unwrap();

        assert_eq!(reconciled.enqueued.inserted, 5);
        assert_eq!(report.counts.succeeded, 5);
        assert_eq!(report.counts.active(), 0);
        assert!(!report.has_dead_letters());
        assert_eq!(storage.len(), 10);
        assert_eq!(scraper.call_count(), 10);

        let again = runtime.reconcile_pass(&RunFilter::default()).await.unwrap();
        assert_eq!(again.summary.total, 0);
    }

    #[tokio::test]
    async fn single_worker_dispatches_in_priority_order() {
        let storage = Arc::new(MemoryStorage::new());
        let scraper = Arc::new(ScriptedScraper::new("nba_stats"));
        let mut low = spec("box", Priority::Low, 2024, 2024);
        low.sub_units = SubUnitPlan::Single;
        let mut high = spec("pbp", Priority::High, 2023, 2024);
        high.sub_units = SubUnitPlan::Single;
        let runtime = runtime(vec![low, high], config(1), scraper.clone(), storage);

        runtime.run_once(&RunFilter::default(), None).await.unwrap();

        let order: Vec<String> = scraper
            .calls()
            .into_iter()
            .map(|call| format!("{}:{}", call.data_type, call.partition))
            .collect();
        assert_eq!(order, vec!["pbp:2024", "pbp:2023", "box:2024"]);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_as_dead_letters() {
        let storage = Arc::new(MemoryStorage::new());
        let scraper = Arc::new(ScriptedScraper::new("nba_stats"));
        scraper.queue((0..3).map(|_| Err(ScrapeError::Http { status: 500 })));
        let mut config = config(1);
        config.retry.max_attempts = 3;
        config.retry.backoff_base_ms = 100;
        config.breaker.failure_threshold = 100.0;
        let mut pbp = spec("pbp", Priority::High, 2024, 2024);
        pbp.sub_units = SubUnitPlan::Single;
        let runtime = runtime(vec![pbp], config, scraper.clone(), storage);

        let (_, report) = runtime.run_once(&RunFilter::default(), None).await.unwrap();

        assert!(report.has_dead_letters());
        assert_eq!(report.dead_letters.len(), 1);
        assert_eq!(report.counts.dead_letter, 1);
        assert_eq!(scraper.call_count(), 3);
        assert_eq!(runtime.dead_letters().await.len(), 1);

        // Dead-lettered keys stay out of later passes.
        let again = runtime.reconcile_pass(&RunFilter::default()).await.unwrap();
        assert_eq!(again.summary.total, 1);
        assert_eq!(again.enqueued.suppressed, 1);
    }

    #[tokio::test]
    async fn fatal_storage_error_aborts_the_run() {
        let storage = Arc::new(MemoryStorage::new());
        storage.fail_next_puts([crate::storage::SinkError::Fatal("read-only".into())]);
        let scraper = Arc::new(ScriptedScraper::new("nba_stats"));
        let runtime = runtime(
            vec![spec("pbp", Priority::High, 2020, 2024)],
            config(1),
            scraper,
            storage,
        );

        let (_, report) = runtime.run_once(&RunFilter::default(), None).await.unwrap();

        assert!(report.fatal.as_deref().unwrap_or_default().contains("read-only"));
        assert!(report.counts.pending >= 1);
        assert_eq!(report.counts.succeeded, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_stops_a_blocked_run() {
        let storage = Arc::new(MemoryStorage::new());
        let scraper = Arc::new(ScriptedScraper::new("nba_stats"));
        let runtime = runtime(
            vec![spec("pbp", Priority::High, 2024, 2024)],
            config(1),
            scraper.clone(),
            storage,
        );
        let handle = runtime.registry.handle(&"nba_stats".into());
        for _ in 0..5 {
            handle.breaker.record_failure(FailureKind::Transient, Utc::now());
        }

        let (_, report) = runtime
            .run_once(&RunFilter::default(), Some(Duration::from_secs(5)))
            .await
            .unwrap();

        assert!(report.timed_out);
        assert_eq!(report.counts.pending, 1);
        assert_eq!(scraper.call_count(), 0);
        let health = runtime.health(Utc::now()).await;
        let source = &health.sources[&SourceId::from("nba_stats")];
        assert_eq!(source.breaker, CircuitState::Open);
        assert_eq!(health.counts.pending, 1);
    }
}
