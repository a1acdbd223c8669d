//! Boundary traits for the collaborators that produce fixes and turn them
//! into record payloads.
use crate::types::{Fix, LocationRecord, Provenance};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};

#[async_trait]
pub trait LocationSource: Send + Sync {
    /// Most recent fix seen by the source, if any.
    fn last_known(&self) -> Option<Fix>;

    /// Requests one fresh fix. `None` means the source had no data to offer.
    async fn fetch_one(&self) -> Option<Fix>;
}

pub trait Enricher: Send + Sync {
    /// Builds the payload sent to endpoints for this fix. The result is
    /// opaque to the pipeline.
    fn enrich(&self, fix: &Fix, provenance: Provenance) -> Value;

    fn record(&self, fix: &Fix, provenance: Provenance) -> LocationRecord {
        LocationRecord::new(
            fix.timestamp,
            fix.coordinate,
            provenance,
            self.enrich(fix, provenance),
        )
    }
}

/// Emits the coordinate, accuracy, timestamp and provenance of the fix.
pub struct BasicEnricher;

impl Enricher for BasicEnricher {
    fn enrich(&self, fix: &Fix, provenance: Provenance) -> Value {
        json!({
            "latitude": fix.coordinate.latitude,
            "longitude": fix.coordinate.longitude,
            "horizontal_accuracy": fix.horizontal_accuracy,
            "utc_timestamp": fix.timestamp.as_millis(),
            "location_context": provenance.as_str(),
        })
    }
}

/// Source fed from outside the process, e.g. fixes read from a file or
/// stdin. It remembers the latest fix it was shown but cannot produce new
/// ones on demand.
#[derive(Default)]
pub struct ReplaySource {
    last: Mutex<Option<Fix>>,
}

impl ReplaySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `fix` as the last known fix unless a newer one was seen.
    pub fn observe(&self, fix: &Fix) {
        let mut last = self.last.lock();
        match last.as_ref() {
            Some(current) if current.timestamp > fix.timestamp => {}
            _ => *last = Some(fix.clone()),
        }
    }
}

#[async_trait]
impl LocationSource for ReplaySource {
    fn last_known(&self) -> Option<Fix> {
        self.last.lock().clone()
    }

    async fn fetch_one(&self) -> Option<Fix> {
        None
    }
}
