use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use crate::ids::{DataTypeId, PartitionKey, SubUnitId, TaskKey};

/// Progress cursor for one (data type, partition). Survives task
/// recreation so a crashed run resumes where it stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Checkpoint {
    pub data_type_id: DataTypeId,
    pub partition_key: PartitionKey,
    pub completed: BTreeSet<SubUnitId>,
    pub last_completed: Option<SubUnitId>,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(key: &TaskKey, now: DateTime<Utc>) -> Self {
        Self {
            data_type_id: key.data_type.clone(),
            partition_key: key.partition.clone(),
            completed: BTreeSet::new(),
            last_completed: None,
            updated_at: now,
        }
    }

    pub fn key(&self) -> TaskKey {
        TaskKey::new(self.data_type_id.clone(), self.partition_key.clone())
    }

    pub fn is_done(&self, unit: &SubUnitId) -> bool {
        self.completed.contains(unit)
    }

    pub fn advance(&mut self, unit: SubUnitId, now: DateTime<Utc>) {
        self.completed.insert(unit.clone());
        self.last_completed = Some(unit);
        self.updated_at = now;
    }
}
