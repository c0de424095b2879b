use std::fmt;

use crate::ids::{DataTypeId, PartitionKey, SourceId, TaskKey};
use crate::priority::Priority;

/// Why a partition needs collecting.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum GapReason {
    Missing,
    Incomplete,
    Stale,
}

impl GapReason {
    pub fn as_str(self) -> &'static str {
        match self {
            GapReason::Missing => "missing",
            GapReason::Incomplete => "incomplete",
            GapReason::Stale => "stale",
        }
    }
}

impl fmt::Display for GapReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A discrepancy between expected and observed coverage.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Gap {
    pub data_type_id: DataTypeId,
    pub source: SourceId,
    pub partition_key: PartitionKey,
    pub priority: Priority,
    pub reason: GapReason,
}

impl Gap {
    pub fn key(&self) -> TaskKey {
        TaskKey::new(self.data_type_id.clone(), self.partition_key.clone())
    }

    /// Dispatch order: tier, then newest partition, then data type.
    pub fn dispatch_cmp(&self, other: &Gap) -> std::cmp::Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.partition_key.cmp(&self.partition_key))
            .then_with(|| self.data_type_id.cmp(&other.data_type_id))
    }
}

impl fmt::Display for Gap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} ({}, {})",
            self.data_type_id, self.partition_key, self.priority, self.reason
        )
    }
}
