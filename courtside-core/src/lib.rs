//! # Courtside Core
//!
//! The collection engine behind the courtside analytics platform. It keeps
//! a declarative inventory of expected NBA data complete by diffing it
//! against storage and running rate-limited, checkpointed scrape tasks for
//! whatever is missing, incomplete or stale.
//!
//! ## Architecture
//!
//! - [`catalog`]: validated inventory of expected data types
//! - [`reconcile`]: pure gap detection over a storage listing
//! - [`scheduler`]: per-source priority queues with retry and dead-letter
//!   handling
//! - [`executor`]: runs one task sub-unit by sub-unit against a [`Scraper`]
//! - [`rate_limit`], [`circuit_breaker`], [`registry`]: per-source limits
//! - [`storage`]: listing, sink and checkpoint contracts plus adapters
//! - [`runtime`]: worker pools tying the pieces into a bounded run
//! - [`telemetry`]: task/breaker event streams and operator alerts
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use courtside_core::{
//!     Catalog, CollectorConfig, CollectorRuntime, MemoryCheckpointStore,
//!     MemoryStorage, RunFilter, ScraperSet, ScriptedScraper, StorageBackends,
//! };
//!
//! async fn collect(catalog: Catalog) -> courtside_core::Result<()> {
//!     let scrapers = ScraperSet::new().with(Arc::new(ScriptedScraper::new("nba_stats")));
//!     let storage = StorageBackends::shared(
//!         Arc::new(MemoryStorage::new()),
//!         Arc::new(MemoryCheckpointStore::new()),
//!     );
//!     let runtime =
//!         CollectorRuntime::new(catalog, CollectorConfig::default(), scrapers, storage)?;
//!     let (_, report) = runtime.run_once(&RunFilter::default(), None).await?;
//!     println!("{report}");
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(missing_docs)]

pub use courtside_model;

pub mod catalog;
pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod executor;
pub mod rate_limit;
pub mod reconcile;
pub mod registry;
pub mod retry;
pub mod runtime;
pub mod scheduler;
pub mod scraper;
pub mod storage;
pub mod telemetry;

pub use catalog::{Catalog, CatalogFile, CatalogIssue, CatalogLoad};
pub use circuit_breaker::{Admission, BreakerSnapshot, CircuitBreaker};
pub use config::{
    BreakerConfig, CollectorConfig, HttpConfig, RetryConfig, SinkConfig,
    SourceOverride, SourcePolicy, StorageConfig, TimeoutConfig,
};
pub use error::{CollectError, Result};
pub use executor::{Execution, Executor};
pub use rate_limit::{TokenBucket, TokenWaitExceeded};
pub use reconcile::{InventorySnapshot, ReconcileSummary, reconcile};
pub use registry::{SourceHandle, SourceRegistry};
pub use retry::RetryPolicy;
pub use runtime::{
    CollectorRuntime, ReconcileReport, RunFilter, RunReport, StorageBackends,
};
pub use scheduler::{
    Completion, Disposition, EnqueueSummary, Scheduler, TaskOutcome, Wakeup,
};
pub use scraper::{
    HttpScraper, RawArtifact, ScrapeError, Scraper, ScraperSet, ScriptedScraper,
};
pub use storage::{
    ArtifactMetadata, CheckpointStore, FsCheckpointStore, FsStorage,
    MemoryCheckpointStore, MemoryStorage, SinkError, StorageListing,
    StorageSink,
};
pub use telemetry::{ALERT_TARGET, BreakerEvent, DeadLetterReport, Telemetry};
