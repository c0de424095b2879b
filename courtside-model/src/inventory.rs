use chrono::{DateTime, Utc};

/// One object reported by a storage listing.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ListingEntry {
    pub path: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

/// What storage holds for one (data type, partition).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ObservedPartition {
    /// Non-empty objects under the partition.
    pub record_count: u64,
    /// Newest object timestamp.
    pub last_modified: DateTime<Utc>,
}

impl ObservedPartition {
    pub fn observe(&mut self, entry: &ListingEntry) {
        if entry.size > 0 {
            self.record_count += 1;
        }
        if entry.last_modified > self.last_modified {
            self.last_modified = entry.last_modified;
        }
    }
}

impl From<&ListingEntry> for ObservedPartition {
    fn from(entry: &ListingEntry) -> Self {
        Self {
            record_count: u64::from(entry.size > 0),
            last_modified: entry.last_modified,
        }
    }
}
