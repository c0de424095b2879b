//! The pluggable fetch capability. The execution core only ever talks to
//! [`Scraper`]; concrete sources live behind it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use courtside_model::{DataTypeSpec, FailureKind, PartitionKey, SourceId, SubUnitId};
use thiserror::Error;

mod http;
mod scripted;

pub use http::HttpScraper;
pub use scripted::{FetchCall, ScriptedScraper};

/// Bytes fetched for one sub-unit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawArtifact {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

impl RawArtifact {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
            content_type: None,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScrapeError {
    #[error("http {status}")]
    Http { status: u16 },
    #[error("request timed out")]
    Timeout,
    #[error("connection error: {0}")]
    Connection(String),
    /// The payload does not have the expected shape.
    #[error("parse error: {0}")]
    Parse(String),
}

impl ScrapeError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ScrapeError::Http { status: 429 | 503 } => FailureKind::RateLimited,
            ScrapeError::Http { status } if (400..500).contains(status) => {
                FailureKind::Permanent
            }
            ScrapeError::Http { .. } => FailureKind::Transient,
            ScrapeError::Timeout | ScrapeError::Connection(_) => {
                FailureKind::Transient
            }
            ScrapeError::Parse(_) => FailureKind::Permanent,
        }
    }

    /// Short reason code recorded on the task.
    pub fn reason(&self) -> String {
        match self {
            ScrapeError::Http { status } => format!("http {status}"),
            ScrapeError::Timeout => "timeout".into(),
            ScrapeError::Connection(msg) => format!("connection: {msg}"),
            ScrapeError::Parse(msg) => format!("parse: {msg}"),
        }
    }
}

/// Fetches raw artifacts from one external source.
#[async_trait]
pub trait Scraper: Send + Sync {
    fn source(&self) -> &SourceId;

    /// Sub-units that make up a partition. Defaults to the catalog plan.
    fn plan(&self, spec: &DataTypeSpec, _partition: &PartitionKey) -> Vec<SubUnitId> {
        spec.sub_units.sub_units()
    }

    /// File extension for stored artifacts.
    fn extension(&self, _spec: &DataTypeSpec) -> &str {
        "json"
    }

    async fn fetch(
        &self,
        spec: &DataTypeSpec,
        partition: &PartitionKey,
        sub_unit: &SubUnitId,
    ) -> Result<RawArtifact, ScrapeError>;
}

/// Scrapers keyed by the source they serve.
#[derive(Clone, Default)]
pub struct ScraperSet {
    scrapers: HashMap<SourceId, Arc<dyn Scraper>>,
}

impl fmt::Debug for ScraperSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut sources: Vec<&SourceId> = self.scrapers.keys().collect();
        sources.sort();
        f.debug_struct("ScraperSet").field("sources", &sources).finish()
    }
}

impl ScraperSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any scraper already registered for the same source.
    pub fn register(&mut self, scraper: Arc<dyn Scraper>) -> &mut Self {
        self.scrapers.insert(scraper.source().clone(), scraper);
        self
    }

    pub fn with(mut self, scraper: Arc<dyn Scraper>) -> Self {
        self.register(scraper);
        self
    }

    pub fn get(&self, source: &SourceId) -> Option<Arc<dyn Scraper>> {
        self.scrapers.get(source).cloned()
    }

    pub fn contains(&self, source: &SourceId) -> bool {
        self.scrapers.contains_key(source)
    }

    pub fn len(&self) -> usize {
        self.scrapers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scrapers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_to_failure_kinds() {
        let kind = |status| ScrapeError::Http { status }.kind();
        assert_eq!(kind(429), FailureKind::RateLimited);
        assert_eq!(kind(503), FailureKind::RateLimited);
        assert_eq!(kind(404), FailureKind::Permanent);
        assert_eq!(kind(403), FailureKind::Permanent);
        assert_eq!(kind(500), FailureKind::Transient);
        assert_eq!(kind(502), FailureKind::Transient);
        assert_eq!(ScrapeError::Timeout.kind(), FailureKind::Transient);
        assert_eq!(
            ScrapeError::Parse("no table".into()).kind(),
            FailureKind::Permanent
        );
        assert_eq!(ScrapeError::Timeout.reason(), "timeout");
    }
}
