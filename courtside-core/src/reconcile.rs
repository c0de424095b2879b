//! Diffs the catalog against what storage holds and emits ordered gaps.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use courtside_model::{
    DataTypeId, DataTypeSpec, Gap, GapReason, ListingEntry, ObservedPartition,
    PartitionKey, Priority,
};
use tracing::{debug, warn};

use crate::catalog::Catalog;
use crate::storage::{SinkError, StorageListing};

/// Observed coverage per (data type, partition), rebuilt every pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InventorySnapshot {
    observed: HashMap<(DataTypeId, PartitionKey), ObservedPartition>,
}

impl InventorySnapshot {
    /// Groups listing entries under the data type whose `path_pattern`
    /// they match.
    pub fn from_listing<'a>(
        catalog: &Catalog,
        entries: impl IntoIterator<Item = &'a ListingEntry>,
    ) -> Self {
        let specs: Vec<&DataTypeSpec> = catalog.iter().collect();
        let mut snapshot = Self::default();
        for entry in entries {
            for spec in &specs {
                if let Some(partition) = spec.partition_of(&entry.path) {
                    snapshot.observe(spec.id.clone(), partition, entry);
                }
            }
        }
        snapshot
    }

    /// Lists every data type's prefix and builds the snapshot.
    pub async fn collect(
        catalog: &Catalog,
        listing: &dyn StorageListing,
    ) -> Result<Self, SinkError> {
        let mut snapshot = Self::default();
        for spec in catalog.iter() {
            let entries = listing.list(spec.listing_prefix()).await?;
            debug!(
                target: "courtside::reconcile",
                data_type = %spec.id,
                objects = entries.len(),
                "listed storage prefix"
            );
            for entry in &entries {
                if let Some(partition) = spec.partition_of(&entry.path) {
                    snapshot.observe(spec.id.clone(), partition, entry);
                }
            }
        }
        Ok(snapshot)
    }

    pub fn observe(
        &mut self,
        data_type: DataTypeId,
        partition: PartitionKey,
        entry: &ListingEntry,
    ) {
        self.observed
            .entry((data_type, partition))
            .and_modify(|observed| observed.observe(entry))
            .or_insert_with(|| ObservedPartition::from(entry));
    }

    pub fn get(
        &self,
        data_type: &DataTypeId,
        partition: &PartitionKey,
    ) -> Option<&ObservedPartition> {
        self.observed.get(&(data_type.clone(), partition.clone()))
    }

    pub fn len(&self) -> usize {
        self.observed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observed.is_empty()
    }
}

/// Classifies one expected partition. `None` means it is satisfied.
fn classify(
    spec: &DataTypeSpec,
    observed: Option<&ObservedPartition>,
    now: DateTime<Utc>,
) -> Option<GapReason> {
    let Some(observed) = observed else {
        return Some(GapReason::Missing);
    };
    if spec.estimated_records > 0 {
        let ratio = observed.record_count as f64 / spec.estimated_records as f64;
        if ratio < spec.completeness_threshold {
            return Some(GapReason::Incomplete);
        }
    }
    if spec.freshness_days > 0 {
        let max_age = chrono::Duration::days(i64::from(spec.freshness_days));
        if now - observed.last_modified > max_age {
            return Some(GapReason::Stale);
        }
    }
    None
}

/// Produces one gap per unsatisfied partition of every required data type,
/// in dispatch order. Pure: identical inputs give an identical result.
pub fn reconcile(
    catalog: &Catalog,
    snapshot: &InventorySnapshot,
    now: DateTime<Utc>,
) -> Vec<Gap> {
    let mut gaps = Vec::new();
    for spec in catalog.iter().filter(|spec| spec.required) {
        let partitions = match spec.partitions.keys(now) {
            Ok(partitions) => partitions,
            Err(err) => {
                warn!(
                    target: "courtside::reconcile",
                    data_type = %spec.id,
                    error = %err,
                    "skipping data type with unusable partition range"
                );
                continue;
            }
        };
        for partition in partitions {
            let observed = snapshot.get(&spec.id, &partition);
            if let Some(reason) = classify(spec, observed, now) {
                gaps.push(Gap {
                    data_type_id: spec.id.clone(),
                    source: spec.source.clone(),
                    partition_key: partition,
                    priority: spec.priority,
                    reason,
                });
            }
        }
    }
    gaps.sort_by(Gap::dispatch_cmp);
    gaps
}

/// Gap counts for logs and the CLI.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub total: usize,
    pub by_reason: BTreeMap<GapReason, usize>,
    pub by_priority: BTreeMap<Priority, usize>,
}

impl ReconcileSummary {
    pub fn from_gaps(gaps: &[Gap]) -> Self {
        let mut summary = Self {
            total: gaps.len(),
            ..Self::default()
        };
        for gap in gaps {
            *summary.by_reason.entry(gap.reason).or_default() += 1;
            *summary.by_priority.entry(gap.priority).or_default() += 1;
        }
        summary
    }

    pub fn count(&self, reason: GapReason) -> usize {
        self.by_reason.get(&reason).copied().unwrap_or(0)
    }
}

impl fmt::Display for ReconcileSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} gap(s): {} missing, {} incomplete, {} stale",
            self.total,
            self.count(GapReason::Missing),
            self.count(GapReason::Incomplete),
            self.count(GapReason::Stale),
        )
    }
}
