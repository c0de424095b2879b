//! The inventory catalog: every data type the collector is expected to keep
//! complete, validated once at load time.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use courtside_model::catalog::{PARTITION_PLACEHOLDER, PartitionScheme};
use courtside_model::{DataTypeId, DataTypeSpec, SourceId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Why a catalog entry was rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CatalogIssue {
    #[error("entry #{index}: {message}")]
    Malformed { index: usize, message: String },
    #[error("entry #{index}: data type id is empty")]
    EmptyId { index: usize },
    #[error("{id}: source is empty")]
    EmptySource { id: DataTypeId },
    #[error("{id}: duplicate data type id")]
    Duplicate { id: DataTypeId },
    #[error("{id}: path_pattern must contain exactly one {{partition}}")]
    BadPathPattern { id: DataTypeId },
    #[error("{id}: completeness_threshold must be in (0, 1]")]
    BadThreshold { id: DataTypeId },
    #[error("{id}: {reason}")]
    BadPartitions { id: DataTypeId, reason: String },
    #[error("{id}: sub-unit plan is empty or has invalid ids")]
    BadSubUnits { id: DataTypeId },
}

/// Raw catalog document: a `[[data_types]]` array in TOML or JSON.
///
/// Entries stay untyped until [`Catalog::from_file`] so one that does not
/// deserialize is rejected on its own.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogFile {
    #[serde(default)]
    pub data_types: Vec<serde_json::Value>,
}

/// Outcome of validating catalog entries. Rejected entries never abort
/// the load.
#[derive(Debug, Clone)]
pub struct CatalogLoad {
    pub catalog: Catalog,
    pub rejected: Vec<CatalogIssue>,
}

/// Validated, immutable set of data type specs, iterated in id order.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    specs: BTreeMap<DataTypeId, DataTypeSpec>,
}

impl Catalog {
    /// Validates each entry against `now` (open-ended partition ranges are
    /// resolved relative to it).
    pub fn load(entries: Vec<DataTypeSpec>, now: DateTime<Utc>) -> CatalogLoad {
        Self::load_entries(entries.into_iter().map(Ok), now)
    }

    /// Deserializes and validates each raw entry of a catalog document.
    pub fn from_file(file: CatalogFile, now: DateTime<Utc>) -> CatalogLoad {
        let entries = file.data_types.into_iter().enumerate().map(|(index, raw)| {
            serde_json::from_value::<DataTypeSpec>(raw).map_err(|err| {
                CatalogIssue::Malformed {
                    index,
                    message: err.to_string(),
                }
            })
        });
        Self::load_entries(entries, now)
    }

    fn load_entries(
        entries: impl IntoIterator<Item = Result<DataTypeSpec, CatalogIssue>>,
        now: DateTime<Utc>,
    ) -> CatalogLoad {
        let mut specs = BTreeMap::new();
        let mut rejected = Vec::new();

        for (index, entry) in entries.into_iter().enumerate() {
            let verdict = entry.and_then(|spec| {
                validate(index, &spec, now)?;
                if specs.contains_key(&spec.id) {
                    Err(CatalogIssue::Duplicate {
                        id: spec.id.clone(),
                    })
                } else {
                    Ok(spec)
                }
            });
            match verdict {
                Ok(spec) => {
                    specs.insert(spec.id.clone(), spec);
                }
                Err(issue) => {
                    warn!(target: "courtside::catalog", %issue, "rejecting catalog entry");
                    rejected.push(issue);
                }
            }
        }

        CatalogLoad {
            catalog: Catalog { specs },
            rejected,
        }
    }

    pub fn get(&self, id: &DataTypeId) -> Option<&DataTypeSpec> {
        self.specs.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DataTypeSpec> {
        self.specs.values()
    }

    pub fn for_source<'a>(
        &'a self,
        source: &'a SourceId,
    ) -> impl Iterator<Item = &'a DataTypeSpec> + 'a {
        self.specs.values().filter(move |spec| &spec.source == source)
    }

    /// Distinct sources, sorted.
    pub fn sources(&self) -> Vec<SourceId> {
        let mut sources: Vec<SourceId> =
            self.specs.values().map(|spec| spec.source.clone()).collect();
        sources.sort();
        sources.dedup();
        sources
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

fn validate(
    index: usize,
    spec: &DataTypeSpec,
    now: DateTime<Utc>,
) -> Result<(), CatalogIssue> {
    if spec.id.as_str().trim().is_empty() {
        return Err(CatalogIssue::EmptyId { index });
    }
    let id = || spec.id.clone();
    if spec.source.as_str().trim().is_empty() {
        return Err(CatalogIssue::EmptySource { id: id() });
    }
    if spec.path_pattern.matches(PARTITION_PLACEHOLDER).count() != 1
        || spec.path_pattern.starts_with('/')
        || spec.path_pattern.split('/').any(|s| s == "..")
    {
        return Err(CatalogIssue::BadPathPattern { id: id() });
    }
    let threshold = spec.completeness_threshold;
    if !(threshold > 0.0 && threshold <= 1.0) {
        return Err(CatalogIssue::BadThreshold { id: id() });
    }
    if let PartitionScheme::Seasons { first, .. } = spec.partitions
        && first < 1946
    {
        return Err(CatalogIssue::BadPartitions {
            id: id(),
            reason: format!("season {first} predates the league"),
        });
    }
    spec.partitions
        .keys(now)
        .map_err(|err| CatalogIssue::BadPartitions {
            id: id(),
            reason: err.to_string(),
        })?;
    if !spec.sub_units.is_valid() {
        return Err(CatalogIssue::BadSubUnits { id: id() });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use courtside_model::{Priority, SubUnitPlan};

    fn spec(id: &str, source: &str) -> DataTypeSpec {
        DataTypeSpec {
            id: id.into(),
            source: source.into(),
            required: true,
            priority: Priority::Medium,
            freshness_days: 0,
            path_pattern: format!("{source}/{id}/{{partition}}"),
            completeness_threshold: 0.9,
            estimated_records: 0,
            partitions: PartitionScheme::Seasons {
                first: 2020,
                last: Some(2024),
            },
            sub_units: SubUnitPlan::Single,
        }
    }

    #[test]
    fn malformed_entries_are_rejected_without_aborting() {
        let mut no_placeholder = spec("schedule", "nba_stats");
        no_placeholder.path_pattern = "nba_stats/schedule".into();
        let mut bad_threshold = spec("odds", "odds_api");
        bad_threshold.completeness_threshold = 1.5;
        let mut inverted = spec("draft", "bref");
        inverted.partitions = PartitionScheme::Seasons {
            first: 2025,
            last: Some(2020),
        };

        let load = Catalog::load(
            vec![
                spec("pbp", "nba_stats"),
                no_placeholder,
                bad_threshold,
                inverted,
                spec("pbp", "bref"),
            ],
            Utc::now(),
        );

        assert_eq!(load.catalog.len(), 1);
        assert_eq!(load.rejected.len(), 4);
        assert!(matches!(load.rejected[3], CatalogIssue::Duplicate { .. }));
        assert_eq!(
            load.catalog.get(&"pbp".into()).unwrap().source,
            SourceId::from("nba_stats")
        );
    }

    #[test]
    fn sources_are_distinct_and_sorted() {
        let load = Catalog::load(
            vec![
                spec("pbp", "nba_stats"),
                spec("box", "nba_stats"),
                spec("totals", "bref"),
            ],
            Utc::now(),
        );
        assert_eq!(
            load.catalog.sources(),
            vec![SourceId::from("bref"), SourceId::from("nba_stats")]
        );
        assert_eq!(load.catalog.for_source(&"nba_stats".into()).count(), 2);
    }

    #[test]
    fn catalog_file_parses_from_toml_shape() {
        let file: CatalogFile = serde_json::from_str(
            r#"{"data_types": [{
                "id": "pbp",
                "source": "nba_stats",
                "priority": "high",
                "path_pattern": "nba_stats/pbp/{partition}",
                "partitions": {"kind": "seasons", "first": 2022},
                "sub_units": {"kind": "pages", "count": 10}
            }]}"#,
        )
        .unwrap();
        let load = Catalog::from_file(file, Utc::now());
        assert!(load.rejected.is_empty());
        let spec = load.catalog.get(&"pbp".into()).unwrap();
        assert_eq!(spec.priority, Priority::High);
        assert!(spec.required);
        assert_eq!(spec.completeness_threshold, 0.9);
        assert_eq!(spec.sub_units.sub_units().len(), 10);
    }

    #[test]
    fn undeserializable_entry_is_skipped_alone() {
        let file: CatalogFile = serde_json::from_str(
            r#"{"data_types": [
                {"id": "odds", "source": "odds_api", "priority": "urgent",
                 "path_pattern": "odds_api/odds/{partition}"},
                {"id": "box", "source": "nba_stats"},
                {"id": "pbp", "source": "nba_stats",
                 "path_pattern": "nba_stats/pbp/{partition}"}
            ]}"#,
        )
        .unwrap();

        let load = Catalog::from_file(file, Utc::now());

        assert_eq!(load.catalog.len(), 1);
        assert!(load.catalog.get(&"pbp".into()).is_some());
        assert_eq!(load.rejected.len(), 2);
        match &load.rejected[0] {
            CatalogIssue::Malformed { index, message } => {
                assert_eq!(*index, 0);
                assert!(message.contains("urgent"), "{message}");
            }
            other => panic!("unexpected issue {other:?}"),
        }
        assert!(matches!(
            load.rejected[1],
            CatalogIssue::Malformed { index: 1, .. }
        ));
    }
}
