use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use courtside_model::SourceId;
use serde::{Deserialize, Serialize};

/// Global knobs that tune collector behaviour.
///
/// All fields carry defaults so a deployment only spells out what it wants
/// to change.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CollectorConfig {
    /// Backoff for timeouts, connection failures and 5xx.
    pub retry: RetryConfig,
    /// Backoff for 429/503 responses.
    pub rate_limited_retry: RetryConfig,
    pub breaker: BreakerConfig,
    /// Policy applied to sources without an override.
    pub defaults: SourcePolicy,
    /// Per-source overrides. Missing fields fall back to `defaults`.
    pub sources: BTreeMap<SourceId, SourceOverride>,
    pub timeouts: TimeoutConfig,
    pub sink: SinkConfig,
    pub storage: StorageConfig,
    pub http: HttpConfig,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            rate_limited_retry: RetryConfig::rate_limited(),
            breaker: BreakerConfig::default(),
            defaults: SourcePolicy::default(),
            sources: BTreeMap::new(),
            timeouts: TimeoutConfig::default(),
            sink: SinkConfig::default(),
            storage: StorageConfig::default(),
            http: HttpConfig::default(),
        }
    }
}

impl CollectorConfig {
    /// Effective policy for one source.
    pub fn policy_for(&self, source: &SourceId) -> SourcePolicy {
        let mut policy = self.defaults.clone();
        if let Some(over) = self.sources.get(source) {
            if let Some(max_workers) = over.max_workers {
                policy.max_workers = max_workers;
            }
            if let Some(capacity) = over.bucket_capacity {
                policy.bucket_capacity = capacity;
            }
            if let Some(refill) = over.refill_per_sec {
                policy.refill_per_sec = refill;
            }
            if let Some(breaker) = &over.breaker {
                policy.breaker = Some(breaker.clone());
            }
        }
        policy
    }

    /// Breaker settings for one source.
    pub fn breaker_for(&self, source: &SourceId) -> BreakerConfig {
        self.policy_for(source)
            .breaker
            .unwrap_or_else(|| self.breaker.clone())
    }

    /// Rejects values that would stall or spin the runtime.
    pub fn validate(&self) -> Result<(), String> {
        for (name, retry) in [
            ("retry", &self.retry),
            ("rate_limited_retry", &self.rate_limited_retry),
        ] {
            if retry.max_attempts == 0 {
                return Err(format!("{name}.max_attempts must be at least 1"));
            }
            if retry.backoff_base_ms > retry.backoff_max_ms {
                return Err(format!(
                    "{name}.backoff_base_ms exceeds backoff_max_ms"
                ));
            }
            if !(0.0..=1.0).contains(&retry.jitter_ratio) {
                return Err(format!("{name}.jitter_ratio must be within 0..=1"));
            }
        }
        let breakers = std::iter::once(("breaker".to_string(), self.breaker.clone()))
            .chain(self.sources.keys().map(|source| {
                (format!("sources.{source}.breaker"), self.breaker_for(source))
            }));
        for (label, breaker) in breakers {
            if !(breaker.failure_threshold > 0.0) {
                return Err(format!("{label}.failure_threshold must be positive"));
            }
            if !(breaker.rate_limited_weight >= 0.0) {
                return Err(format!(
                    "{label}.rate_limited_weight must not be negative"
                ));
            }
        }
        let sources = std::iter::once((None, self.defaults.clone())).chain(
            self.sources
                .keys()
                .map(|source| (Some(source), self.policy_for(source))),
        );
        for (source, policy) in sources {
            let label = source
                .map(|s| format!("sources.{s}"))
                .unwrap_or_else(|| "defaults".into());
            if policy.max_workers == 0 {
                return Err(format!("{label}.max_workers must be at least 1"));
            }
            if policy.bucket_capacity < 1.0 {
                return Err(format!(
                    "{label}.bucket_capacity must be at least 1"
                ));
            }
            if policy.refill_per_sec <= 0.0 {
                return Err(format!("{label}.refill_per_sec must be positive"));
            }
        }
        if self.timeouts.request_ms == 0 || self.timeouts.task_ms == 0 {
            return Err("timeouts must be non-zero".into());
        }
        if self.sink.write_attempts == 0 {
            return Err("sink.write_attempts must be at least 1".into());
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts before a task is dead-lettered, the first one included.
    pub max_attempts: u16,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Delay is scaled by a uniform factor in `1 ± jitter_ratio`.
    pub jitter_ratio: f64,
}

impl RetryConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn rate_limited() -> Self {
        Self {
            max_attempts: 8,
            backoff_base_ms: 30_000,
            backoff_max_ms: 30 * 60 * 1_000,
            jitter_ratio: 0.5,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base_ms: 1_000,
            backoff_max_ms: 5 * 60 * 1_000,
            jitter_ratio: 0.5,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BreakerConfig {
    /// Weighted failure score that trips the breaker.
    pub failure_threshold: f64,
    pub reset_timeout_ms: u64,
    /// Score contributed by one rate-limited failure. Hard failures count 1.
    pub rate_limited_weight: f64,
}

impl BreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5.0,
            reset_timeout_ms: 5 * 60 * 1_000,
            rate_limited_weight: 0.5,
        }
    }
}

/// Parallelism and request budget of one source. The worker cap and the
/// token bucket are independent: one bounds concurrency, the other rate.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SourcePolicy {
    pub max_workers: usize,
    pub bucket_capacity: f64,
    pub refill_per_sec: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub breaker: Option<BreakerConfig>,
}

impl Default for SourcePolicy {
    fn default() -> Self {
        Self {
            max_workers: 2,
            bucket_capacity: 5.0,
            refill_per_sec: 1.0,
            breaker: None,
        }
    }
}

/// Optional per-source overrides of [`SourcePolicy`].
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct SourceOverride {
    pub max_workers: Option<usize>,
    pub bucket_capacity: Option<f64>,
    pub refill_per_sec: Option<f64>,
    pub breaker: Option<BreakerConfig>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimeoutConfig {
    pub request_ms: u64,
    pub task_ms: u64,
    /// Longest a worker waits for a rate-limit token before giving up.
    pub token_wait_ms: u64,
}

impl TimeoutConfig {
    pub fn request(&self) -> Duration {
        Duration::from_millis(self.request_ms)
    }

    pub fn task(&self) -> Duration {
        Duration::from_millis(self.task_ms)
    }

    pub fn token_wait(&self) -> Duration {
        Duration::from_millis(self.token_wait_ms)
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request_ms: 30_000,
            task_ms: 60 * 60 * 1_000,
            token_wait_ms: 60_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SinkConfig {
    pub write_attempts: u16,
    pub write_retry_delay_ms: u64,
}

impl SinkConfig {
    pub fn write_retry_delay(&self) -> Duration {
        Duration::from_millis(self.write_retry_delay_ms)
    }
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            write_attempts: 3,
            write_retry_delay_ms: 500,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory artifacts are written under.
    pub data_root: PathBuf,
    /// Directory for checkpoint files. Relative paths resolve against
    /// `data_root`.
    pub checkpoint_dir: PathBuf,
}

impl StorageConfig {
    pub fn checkpoint_root(&self) -> PathBuf {
        if self.checkpoint_dir.is_absolute() {
            self.checkpoint_dir.clone()
        } else {
            self.data_root.join(&self.checkpoint_dir)
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("data"),
            checkpoint_dir: PathBuf::from(".checkpoints"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HttpConfig {
    pub user_agent: String,
    /// URL template per source. Supports `{data_type}`, `{partition}` and
    /// `{sub_unit}` placeholders.
    pub url_templates: BTreeMap<SourceId, String>,
    /// File extension used for stored artifacts per source.
    pub extensions: BTreeMap<SourceId, String>,
}

impl HttpConfig {
    pub fn extension_for(&self, source: &SourceId) -> &str {
        self.extensions
            .get(source)
            .map(String::as_str)
            .unwrap_or("json")
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: concat!("courtside/", env!("CARGO_PKG_VERSION"))
                .to_string(),
            url_templates: BTreeMap::new(),
            extensions: BTreeMap::new(),
        }
    }
}
