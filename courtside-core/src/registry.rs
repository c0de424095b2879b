use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use courtside_model::{CircuitState, SourceId};
use dashmap::DashMap;

use crate::circuit_breaker::{BreakerSnapshot, CircuitBreaker};
use crate::config::CollectorConfig;
use crate::rate_limit::TokenBucket;
use crate::telemetry::Telemetry;

/// Shared per-source limits: the token bucket, the circuit breaker and the
/// worker-pool cap.
#[derive(Debug)]
pub struct SourceHandle {
    pub source: SourceId,
    pub bucket: TokenBucket,
    pub breaker: CircuitBreaker,
    pub max_workers: usize,
}

/// Explicit registry of source limits, passed by handle to the scheduler
/// and workers. Each source's state sits behind its own locks.
#[derive(Clone)]
pub struct SourceRegistry {
    config: Arc<CollectorConfig>,
    telemetry: Telemetry,
    sources: Arc<DashMap<SourceId, Arc<SourceHandle>>>,
}

impl fmt::Debug for SourceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceRegistry")
            .field("sources", &self.sources.len())
            .finish()
    }
}

impl SourceRegistry {
    pub fn new(config: Arc<CollectorConfig>, telemetry: Telemetry) -> Self {
        Self {
            config,
            telemetry,
            sources: Arc::new(DashMap::new()),
        }
    }

    /// Registry with every listed source registered up front.
    pub fn build(
        config: Arc<CollectorConfig>,
        telemetry: Telemetry,
        sources: impl IntoIterator<Item = SourceId>,
    ) -> Self {
        let registry = Self::new(config, telemetry);
        for source in sources {
            registry.handle(&source);
        }
        registry
    }

    fn create(&self, source: &SourceId) -> SourceHandle {
        let policy = self.config.policy_for(source);
        SourceHandle {
            source: source.clone(),
            bucket: TokenBucket::new(policy.bucket_capacity, policy.refill_per_sec),
            breaker: CircuitBreaker::new(
                source.clone(),
                self.config.breaker_for(source),
            )
            .with_telemetry(self.telemetry.clone()),
            max_workers: policy.max_workers.max(1),
        }
    }

    /// Limits for `source`, created from config on first use.
    pub fn handle(&self, source: &SourceId) -> Arc<SourceHandle> {
        if let Some(handle) = self.sources.get(source) {
            return Arc::clone(handle.value());
        }
        let handle = self
            .sources
            .entry(source.clone())
            .or_insert_with(|| Arc::new(self.create(source)));
        Arc::clone(handle.value())
    }

    pub fn sources(&self) -> Vec<SourceId> {
        let mut sources: Vec<SourceId> =
            self.sources.iter().map(|entry| entry.key().clone()).collect();
        sources.sort();
        sources
    }

    pub fn breaker_state(&self, source: &SourceId, now: DateTime<Utc>) -> CircuitState {
        self.handle(source).breaker.state_at(now)
    }

    pub fn breaker_snapshot(
        &self,
        source: &SourceId,
        now: DateTime<Utc>,
    ) -> BreakerSnapshot {
        self.handle(source).breaker.snapshot(now)
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceOverride;

    #[test]
    fn handles_follow_source_overrides() {
        let mut config = CollectorConfig::default();
        config.sources.insert(
            "bref".into(),
            SourceOverride {
                max_workers: Some(1),
                bucket_capacity: Some(2.0),
                ..SourceOverride::default()
            },
        );
        let registry = SourceRegistry::build(
            Arc::new(config),
            Telemetry::default(),
            ["bref".into(), "nba_stats".into()],
        );

        let bref = registry.handle(&"bref".into());
        assert_eq!(bref.max_workers, 1);
        assert_eq!(bref.bucket.capacity(), 2.0);
        assert_eq!(registry.handle(&"nba_stats".into()).max_workers, 2);
        assert_eq!(registry.sources().len(), 2);
    }

    #[test]
    fn same_source_shares_one_handle() {
        let registry = SourceRegistry::new(
            Arc::new(CollectorConfig::default()),
            Telemetry::default(),
        );
        let a = registry.handle(&"odds".into());
        let b = registry.handle(&"odds".into());
        assert!(Arc::ptr_eq(&a, &b));
    }
}
