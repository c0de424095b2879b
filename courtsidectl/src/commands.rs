use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use courtside_config::ConfigLoader;
use courtside_core::{
    CollectorConfig, CollectorRuntime, FsCheckpointStore, FsStorage, HttpScraper,
    ReconcileReport, RunFilter, ScraperSet, StorageBackends,
};
use tracing::{info, warn};

pub const EXIT_FATAL: u8 = 1;
pub const EXIT_DEAD_LETTERS: u8 = 2;

fn build_runtime(
    loader: &ConfigLoader,
    config_path: Option<&Path>,
    catalog_path: Option<&Path>,
) -> anyhow::Result<Arc<CollectorRuntime>> {
    let config = loader.load_config(config_path)?.config;
    let (path, load) = loader.load_catalog(catalog_path)?;
    for issue in &load.rejected {
        warn!(catalog = %path.display(), "skipping catalog entry: {issue}");
    }

    let scrapers = http_scrapers(&config)?;
    let storage = Arc::new(FsStorage::new(config.storage.data_root.clone()));
    let checkpoints = Arc::new(FsCheckpointStore::new(config.storage.checkpoint_root()));

    let runtime = CollectorRuntime::new(
        load.catalog,
        config,
        scrapers,
        StorageBackends::shared(storage, checkpoints),
    )
    .context("failed to initialise the collector")?;
    Ok(Arc::new(runtime))
}

fn http_scrapers(config: &CollectorConfig) -> anyhow::Result<ScraperSet> {
    let mut scrapers = ScraperSet::new();
    for scraper in HttpScraper::from_config(&config.http, config.timeouts.request())
        .context("failed to build HTTP scrapers")?
    {
        scrapers.register(Arc::new(scraper));
    }
    Ok(scrapers)
}

fn print_gaps(reconciled: &ReconcileReport) {
    for gap in &reconciled.gaps {
        println!(
            "{:<9} {}:{} [{}] {}",
            gap.priority.as_str(),
            gap.data_type_id,
            gap.partition_key,
            gap.source,
            gap.reason
        );
    }
    println!("{}", reconciled.summary);
}

pub async fn run(
    config_path: Option<&Path>,
    catalog_path: Option<&Path>,
    filter: RunFilter,
    max_runtime: Option<Duration>,
) -> anyhow::Result<ExitCode> {
    let loader = ConfigLoader::from_env();
    let runtime = build_runtime(&loader, config_path, catalog_path)?;

    let watcher = {
        let runtime = runtime.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                runtime.shutdown();
            }
        })
    };

    let outcome = runtime.run_once(&filter, max_runtime).await;
    watcher.abort();
    let (reconciled, report) = outcome.context("reconcile pass failed")?;

    if reconciled.dry_run {
        print_gaps(&reconciled);
        return Ok(ExitCode::SUCCESS);
    }

    info!(
        inserted = reconciled.enqueued.inserted,
        merged = reconciled.enqueued.merged,
        suppressed = reconciled.enqueued.suppressed,
        "queued gaps"
    );
    println!("{report}");
    if report.has_dead_letters() {
        print!("{}", report.dead_letters);
    }

    if report.fatal.is_some() {
        Ok(ExitCode::from(EXIT_FATAL))
    } else if report.has_dead_letters() {
        Ok(ExitCode::from(EXIT_DEAD_LETTERS))
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

pub async fn gaps(
    config_path: Option<&Path>,
    catalog_path: Option<&Path>,
    filter: RunFilter,
    json: bool,
) -> anyhow::Result<ExitCode> {
    let loader = ConfigLoader::from_env();
    let runtime = build_runtime(&loader, config_path, catalog_path)?;
    let reconciled = runtime
        .reconcile_pass(&RunFilter {
            dry_run: true,
            ..filter
        })
        .await
        .context("reconcile pass failed")?;

    if json {
        for gap in &reconciled.gaps {
            println!("{}", serde_json::to_string(gap)?);
        }
    } else {
        print_gaps(&reconciled);
    }
    Ok(ExitCode::SUCCESS)
}

pub fn show_config(config_path: Option<&Path>) -> anyhow::Result<ExitCode> {
    let load = ConfigLoader::from_env().load_config(config_path)?;
    println!("# source: {}", load.source);
    print!(
        "{}",
        toml::to_string_pretty(&load.config).context("failed to render configuration")?
    );
    Ok(ExitCode::SUCCESS)
}
