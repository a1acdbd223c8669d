use crate::clock::Clock;
use crate::metrics_defs::RECORDS_PRUNED;
use crate::store::{LocationStore, StoreError};
use crate::types::{EndpointId, Timestamp};
use crate::watermarks::WatermarkRegistry;
use shared::counter;
use std::sync::Arc;
use std::time::Duration;

/// Deletes queued records every configured endpoint has acknowledged, and
/// anything older than the maximum retention age regardless of
/// acknowledgement.
pub struct RetentionManager {
    store: Arc<dyn LocationStore>,
    watermarks: WatermarkRegistry,
    endpoints: Vec<EndpointId>,
    max_retention: Duration,
    clock: Arc<dyn Clock>,
}

impl RetentionManager {
    pub fn new(
        store: Arc<dyn LocationStore>,
        watermarks: WatermarkRegistry,
        endpoints: Vec<EndpointId>,
        max_retention: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        RetentionManager {
            store,
            watermarks,
            endpoints,
            max_retention,
            clock,
        }
    }

    /// The oldest watermark across all endpoints, clamped so that nothing
    /// older than the retention age survives. A single endpoint without a
    /// watermark holds the raw cutoff at `DISTANT_PAST`.
    pub fn compute_cutoff(&self) -> Timestamp {
        let mut raw: Option<Timestamp> = None;
        for endpoint in &self.endpoints {
            match self.watermarks.recorded(endpoint) {
                Some(watermark) => raw = Some(raw.map_or(watermark, |m| m.min(watermark))),
                None => {
                    raw = None;
                    break;
                }
            }
        }
        let raw = raw.unwrap_or(Timestamp::DISTANT_PAST);

        let oldest_allowed = self.clock.now().saturating_sub(self.max_retention);
        raw.max(oldest_allowed)
    }

    /// Prunes the store up to the current cutoff. Called once per completed
    /// flush round.
    pub fn prune(&self) -> Result<usize, StoreError> {
        let cutoff = self.compute_cutoff();
        let removed = self.store.prune(cutoff)?;
        counter!(RECORDS_PRUNED).increment(removed as u64);
        tracing::debug!(cutoff = %cutoff, removed, remaining = self.store.len(), "pruned location store");
        Ok(removed)
    }
}
