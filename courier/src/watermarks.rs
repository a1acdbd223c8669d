use crate::state::{StateError, StateStore};
use crate::types::{EndpointId, Timestamp};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Per-endpoint timestamp of the newest record the endpoint acknowledged.
#[derive(Clone)]
pub struct WatermarkRegistry {
    state: Arc<StateStore>,
}

impl WatermarkRegistry {
    pub fn new(state: Arc<StateStore>) -> Self {
        WatermarkRegistry { state }
    }

    /// The recorded watermark, or `DISTANT_PAST` if the endpoint never
    /// acknowledged anything.
    pub fn get(&self, endpoint: &EndpointId) -> Timestamp {
        self.recorded(endpoint).unwrap_or(Timestamp::DISTANT_PAST)
    }

    pub fn recorded(&self, endpoint: &EndpointId) -> Option<Timestamp> {
        self.state.read(|s| s.watermarks.get(endpoint).copied())
    }

    /// Advances the watermark and persists it. Watermarks never move
    /// backwards; an older timestamp is ignored and `Ok(false)` returned.
    pub fn set(&self, endpoint: &EndpointId, timestamp: Timestamp) -> Result<bool, StateError> {
        self.state.update(|s| match s.watermarks.get(endpoint) {
            Some(current) if *current >= timestamp => false,
            _ => {
                s.watermarks.insert(endpoint.clone(), timestamp);
                true
            }
        })
    }

    /// Forgets the watermark so the next flush resends the whole queue.
    pub fn reset(&self, endpoint: &EndpointId) -> Result<(), StateError> {
        self.state.update(|s| {
            s.watermarks.remove(endpoint);
        })
    }

    pub fn snapshot(&self) -> BTreeMap<EndpointId, Timestamp> {
        self.state.read(|s| s.watermarks.clone())
    }
}
