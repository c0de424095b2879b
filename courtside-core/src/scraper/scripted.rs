use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use courtside_model::{DataTypeId, DataTypeSpec, PartitionKey, SourceId, SubUnitId};

use super::{RawArtifact, ScrapeError, Scraper};

type Response = Result<RawArtifact, ScrapeError>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A recorded `fetch` call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchCall {
    pub data_type: DataTypeId,
    pub partition: PartitionKey,
    pub sub_unit: SubUnitId,
}

/// Scraper double that replays queued responses and records every call.
///
/// Responses scripted for a specific sub-unit win over the shared queue;
/// when both are empty the call succeeds with a small JSON body.
pub struct ScriptedScraper {
    source: SourceId,
    latency: Duration,
    targeted: Mutex<HashMap<(PartitionKey, SubUnitId), VecDeque<Response>>>,
    shared: Mutex<VecDeque<Response>>,
    calls: Mutex<Vec<FetchCall>>,
}

impl fmt::Debug for ScriptedScraper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptedScraper")
            .field("source", &self.source)
            .field("latency", &self.latency)
            .field("calls", &lock(&self.calls).len())
            .finish()
    }
}

impl ScriptedScraper {
    pub fn new(source: impl Into<SourceId>) -> Self {
        Self {
            source: source.into(),
            latency: Duration::ZERO,
            targeted: Mutex::new(HashMap::new()),
            shared: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Each fetch sleeps this long before answering.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Queues a response for one sub-unit of one partition.
    pub fn respond(
        &self,
        partition: impl Into<PartitionKey>,
        sub_unit: impl Into<SubUnitId>,
        response: Response,
    ) {
        lock(&self.targeted)
            .entry((partition.into(), sub_unit.into()))
            .or_default()
            .push_back(response);
    }

    /// Queues responses consumed by the next calls, whatever they target.
    pub fn queue(&self, responses: impl IntoIterator<Item = Response>) {
        lock(&self.shared).extend(responses);
    }

    pub fn calls(&self) -> Vec<FetchCall> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }

    /// Sub-unit ids fetched so far, in call order.
    pub fn fetched_units(&self) -> Vec<String> {
        lock(&self.calls)
            .iter()
            .map(|call| call.sub_unit.to_string())
            .collect()
    }
}

#[async_trait]
impl Scraper for ScriptedScraper {
    fn source(&self) -> &SourceId {
        &self.source
    }

    async fn fetch(
        &self,
        spec: &DataTypeSpec,
        partition: &PartitionKey,
        sub_unit: &SubUnitId,
    ) -> Result<RawArtifact, ScrapeError> {
        lock(&self.calls).push(FetchCall {
            data_type: spec.id.clone(),
            partition: partition.clone(),
            sub_unit: sub_unit.clone(),
        });
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let targeted = lock(&self.targeted)
            .get_mut(&(partition.clone(), sub_unit.clone()))
            .and_then(VecDeque::pop_front);
        if let Some(response) = targeted {
            return response;
        }
        if let Some(response) = lock(&self.shared).pop_front() {
            return response;
        }
        Ok(RawArtifact::new(format!(
            "{{\"data_type\":\"{}\",\"partition\":\"{partition}\",\"sub_unit\":\"{sub_unit}\"}}",
            spec.id
        ))
        .with_content_type("application/json"))
    }
}
