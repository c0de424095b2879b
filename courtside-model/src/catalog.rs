use chrono::{DateTime, Datelike, Days, NaiveDate, Utc};

use crate::error::{ModelError, Result};
use crate::ids::{DataTypeId, PartitionKey, SourceId, SubUnitId};
use crate::priority::Priority;

/// Placeholder substituted with the partition key in `path_pattern`.
pub const PARTITION_PLACEHOLDER: &str = "{partition}";

/// Month (1-based) in which a new NBA season starts.
pub const SEASON_START_MONTH: u32 = 10;

/// Upper bound on partitions a single scheme may expand to.
pub const MAX_PARTITIONS: usize = 50_000;

/// Declarative description of one expected data type.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DataTypeSpec {
    pub id: DataTypeId,
    pub source: SourceId,
    #[cfg_attr(feature = "serde", serde(default = "default_required"))]
    pub required: bool,
    #[cfg_attr(feature = "serde", serde(default))]
    pub priority: Priority,
    /// Maximum age in days before a partition is stale. Zero disables the
    /// freshness check.
    #[cfg_attr(feature = "serde", serde(default))]
    pub freshness_days: u32,
    pub path_pattern: String,
    #[cfg_attr(
        feature = "serde",
        serde(default = "default_completeness_threshold")
    )]
    pub completeness_threshold: f64,
    /// Expected records per partition. Zero disables the completeness check.
    #[cfg_attr(feature = "serde", serde(default))]
    pub estimated_records: u64,
    #[cfg_attr(feature = "serde", serde(default))]
    pub partitions: PartitionScheme,
    #[cfg_attr(feature = "serde", serde(default))]
    pub sub_units: SubUnitPlan,
}

#[cfg(feature = "serde")]
fn default_required() -> bool {
    true
}

#[cfg(feature = "serde")]
fn default_completeness_threshold() -> f64 {
    0.9
}

impl DataTypeSpec {
    /// Text before the partition placeholder; every artifact of this data
    /// type lives under it.
    pub fn listing_prefix(&self) -> &str {
        match self.path_pattern.find(PARTITION_PLACEHOLDER) {
            Some(idx) => &self.path_pattern[..idx],
            None => &self.path_pattern,
        }
    }

    /// Directory holding the artifacts of one partition.
    pub fn partition_path(&self, partition: &PartitionKey) -> String {
        self.path_pattern
            .replacen(PARTITION_PLACEHOLDER, partition.as_str(), 1)
            .trim_end_matches('/')
            .to_string()
    }

    /// Extracts the partition key from a listed object path, if the path
    /// belongs to this data type.
    pub fn partition_of(&self, path: &str) -> Option<PartitionKey> {
        let idx = self.path_pattern.find(PARTITION_PLACEHOLDER)?;
        let prefix = &self.path_pattern[..idx];
        let suffix = &self.path_pattern[idx + PARTITION_PLACEHOLDER.len()..];
        let rest = path.strip_prefix(prefix)?;

        let key = match suffix.split('/').next().filter(|s| !s.is_empty()) {
            // Literal text directly after the placeholder ends the key.
            Some(delimiter) => &rest[..rest.find(delimiter)?],
            None => rest.split('/').next()?,
        };
        if key.is_empty() {
            return None;
        }

        let after_key = &rest[key.len()..];
        if !suffix.is_empty() && !after_key.starts_with(suffix) {
            return None;
        }
        let remainder = &after_key[suffix.len().min(after_key.len())..];
        if !remainder.is_empty() && !remainder.starts_with('/') {
            return None;
        }
        Some(PartitionKey::new(key))
    }
}

/// Valid partition range of a data type.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(
    feature = "serde",
    serde(tag = "kind", rename_all = "snake_case")
)]
pub enum PartitionScheme {
    /// NBA seasons keyed by start year. Open-ended ranges run through the
    /// season in progress.
    Seasons { first: i32, last: Option<i32> },
    /// One partition per calendar day, keyed `YYYY-MM-DD`.
    Daily {
        first: NaiveDate,
        last: Option<NaiveDate>,
    },
    List { keys: Vec<String> },
    #[default]
    Single,
}

impl PartitionScheme {
    /// Expands the range into partition keys, oldest first.
    pub fn keys(&self, now: DateTime<Utc>) -> Result<Vec<PartitionKey>> {
        match self {
            PartitionScheme::Seasons { first, last } => {
                let last = last.unwrap_or_else(|| current_season(now));
                if *first > last {
                    return Err(ModelError::InvalidPartitionRange(format!(
                        "season {first} is after {last}"
                    )));
                }
                let span = (last - first) as usize + 1;
                if span > MAX_PARTITIONS {
                    return Err(ModelError::InvalidPartitionRange(format!(
                        "{span} seasons exceeds the partition limit"
                    )));
                }
                Ok((*first..=last)
                    .map(|season| PartitionKey::new(season.to_string()))
                    .collect())
            }
            PartitionScheme::Daily { first, last } => {
                let last = last.unwrap_or_else(|| now.date_naive());
                if *first > last {
                    return Err(ModelError::InvalidPartitionRange(format!(
                        "date {first} is after {last}"
                    )));
                }
                let span = (last - *first).num_days() as usize + 1;
                if span > MAX_PARTITIONS {
                    return Err(ModelError::InvalidPartitionRange(format!(
                        "{span} days exceeds the partition limit"
                    )));
                }
                let mut keys = Vec::with_capacity(span);
                let mut day = *first;
                while day <= last {
                    keys.push(PartitionKey::new(
                        day.format("%Y-%m-%d").to_string(),
                    ));
                    day = match day.checked_add_days(Days::new(1)) {
                        Some(next) => next,
                        None => break,
                    };
                }
                Ok(keys)
            }
            PartitionScheme::List { keys } => {
                if keys.is_empty() {
                    return Err(ModelError::InvalidPartitionRange(
                        "partition list is empty".into(),
                    ));
                }
                if let Some(bad) = keys.iter().find(|k| !valid_segment(k)) {
                    return Err(ModelError::InvalidPartitionRange(format!(
                        "partition key {bad:?} is not a valid path segment"
                    )));
                }
                let mut keys: Vec<PartitionKey> =
                    keys.iter().map(|k| PartitionKey::new(k.clone())).collect();
                keys.sort();
                keys.dedup();
                Ok(keys)
            }
            PartitionScheme::Single => Ok(vec![PartitionKey::new("all")]),
        }
    }
}

/// Start year of the season in progress at `now`.
pub fn current_season(now: DateTime<Utc>) -> i32 {
    if now.month() >= SEASON_START_MONTH {
        now.year()
    } else {
        now.year() - 1
    }
}

fn valid_segment(key: &str) -> bool {
    !key.is_empty() && !key.contains('/') && key != "." && key != ".."
}

/// How a partition splits into checkpointable sub-units.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(
    feature = "serde",
    serde(tag = "kind", rename_all = "snake_case")
)]
pub enum SubUnitPlan {
    #[default]
    Single,
    Pages { count: u32 },
    Named { ids: Vec<String> },
}

impl SubUnitPlan {
    pub fn sub_units(&self) -> Vec<SubUnitId> {
        match self {
            SubUnitPlan::Single => vec![SubUnitId::new("all")],
            SubUnitPlan::Pages { count } => {
                (1..=*count).map(|page| SubUnitId::new(page.to_string())).collect()
            }
            SubUnitPlan::Named { ids } => {
                ids.iter().map(|id| SubUnitId::new(id.clone())).collect()
            }
        }
    }

    pub fn is_valid(&self) -> bool {
        match self {
            SubUnitPlan::Single => true,
            SubUnitPlan::Pages { count } => *count > 0,
            SubUnitPlan::Named { ids } => {
                !ids.is_empty() && ids.iter().all(|id| valid_segment(id))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn spec(pattern: &str) -> DataTypeSpec {
        DataTypeSpec {
            id: DataTypeId::new("box_scores"),
            source: SourceId::new("nba_stats"),
            required: true,
            priority: Priority::High,
            freshness_days: 7,
            path_pattern: pattern.to_string(),
            completeness_threshold: 0.9,
            estimated_records: 1230,
            partitions: PartitionScheme::Single,
            sub_units: SubUnitPlan::Single,
        }
    }

    #[test]
    fn open_season_range_runs_through_current_season() {
        let before_tipoff = Utc.with_ymd_and_hms(2025, 9, 30, 0, 0, 0).unwrap();
        let after_tipoff = Utc.with_ymd_and_hms(2025, 10, 1, 0, 0, 0).unwrap();
        let scheme = PartitionScheme::Seasons {
            first: 2022,
            last: None,
        };

        let keys = scheme.keys(before_tipoff).unwrap();
        assert_eq!(keys.last().unwrap().as_str(), "2024");
        let keys = scheme.keys(after_tipoff).unwrap();
        assert_eq!(keys.len(), 4);
        assert_eq!(keys.last().unwrap().as_str(), "2025");
    }

    #[test]
    fn inverted_ranges_are_rejected() {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let scheme = PartitionScheme::Seasons {
            first: 2030,
            last: Some(2020),
        };
        assert!(scheme.keys(now).is_err());
        assert!(PartitionScheme::List { keys: vec![] }.keys(now).is_err());
    }

    #[test]
    fn daily_range_is_inclusive() {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let scheme = PartitionScheme::Daily {
            first: NaiveDate::from_ymd_opt(2024, 12, 30).unwrap(),
            last: None,
        };
        let keys: Vec<String> = scheme
            .keys(now)
            .unwrap()
            .into_iter()
            .map(|k| k.0)
            .collect();
        assert_eq!(keys, vec!["2024-12-30", "2024-12-31", "2025-01-01"]);
    }

    #[test]
    fn partition_is_extracted_from_listed_paths() {
        let spec = spec("nba_stats/box_scores/season={partition}");
        assert_eq!(spec.listing_prefix(), "nba_stats/box_scores/season=");
        assert_eq!(
            spec.partition_of("nba_stats/box_scores/season=2024/1.json"),
            Some(PartitionKey::from("2024"))
        );
        assert_eq!(spec.partition_of("nba_stats/other/season=2024/1.json"), None);
    }

    #[test]
    fn partition_extraction_honours_literal_suffix() {
        let spec = spec("bref/{partition}_games/raw");
        assert_eq!(
            spec.partition_of("bref/2023_games/raw/1.html"),
            Some(PartitionKey::from("2023"))
        );
        assert_eq!(spec.partition_of("bref/2023_games/other/1.html"), None);
        assert_eq!(
            spec.partition_path(&PartitionKey::from("2023")),
            "bref/2023_games/raw"
        );
    }

    #[test]
    fn pages_expand_to_numbered_sub_units() {
        let plan = SubUnitPlan::Pages { count: 3 };
        let ids: Vec<String> = plan.sub_units().into_iter().map(|s| s.0).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
        assert!(!SubUnitPlan::Pages { count: 0 }.is_valid());
    }
}
