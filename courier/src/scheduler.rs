use crate::clock::Clock;
use crate::store::LocationStore;
use crate::types::{EndpointId, Timestamp};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct SessionState {
    active: bool,
    pending: BTreeSet<EndpointId>,
    last_transmission: Option<Timestamp>,
}

/// In-process transmission state. Starts idle on every launch and is never
/// persisted.
#[derive(Default)]
pub struct TransmissionSession {
    inner: Mutex<SessionState>,
}

impl TransmissionSession {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Marks a round as active. Returns `None` if one is already running.
    /// The check and the update happen under the same lock.
    pub fn try_begin(
        self: &Arc<Self>,
        endpoints: impl IntoIterator<Item = EndpointId>,
    ) -> Option<RoundToken> {
        let mut inner = self.inner.lock();
        if inner.active {
            return None;
        }
        inner.active = true;
        inner.pending = endpoints.into_iter().collect();

        Some(RoundToken {
            session: self.clone(),
            completed: false,
        })
    }

    pub fn is_active(&self) -> bool {
        self.inner.lock().active
    }

    /// When the previous round finished, if any round finished since launch.
    pub fn last_transmission(&self) -> Option<Timestamp> {
        self.inner.lock().last_transmission
    }

    /// Endpoints of the active round that have not reported yet.
    pub fn pending(&self) -> Vec<EndpointId> {
        self.inner.lock().pending.iter().cloned().collect()
    }
}

/// Proof that the holder owns the active round. Dropping it without calling
/// `complete` still releases the round, so an abandoned flush cannot leave
/// the session stuck.
pub struct RoundToken {
    session: Arc<TransmissionSession>,
    completed: bool,
}

impl RoundToken {
    pub fn endpoint_reported(&self, endpoint: &EndpointId) {
        self.session.inner.lock().pending.remove(endpoint);
    }

    /// Records the completion time and marks the session idle.
    pub fn complete(mut self, now: Timestamp) {
        let mut inner = self.session.inner.lock();
        inner.last_transmission = Some(now);
        inner.active = false;
        inner.pending.clear();
        self.completed = true;
    }
}

impl Drop for RoundToken {
    fn drop(&mut self) {
        if !self.completed {
            tracing::warn!("flush round dropped before completion, releasing session");
            let mut inner = self.session.inner.lock();
            inner.active = false;
            inner.pending.clear();
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    /// Nothing is queued.
    EmptyQueue,
    /// The oldest queued record is younger than the transmission interval.
    NotStale,
    /// The previous round finished less than half an interval ago.
    Thrashing,
    /// A round is already running.
    InFlight,
    /// No collection endpoints are configured.
    NoEndpoints,
}

impl SkipReason {
    pub const fn as_str(&self) -> &'static str {
        match self {
            SkipReason::EmptyQueue => "empty_queue",
            SkipReason::NotStale => "not_stale",
            SkipReason::Thrashing => "thrashing",
            SkipReason::InFlight => "in_flight",
            SkipReason::NoEndpoints => "no_endpoints",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    Flush,
    Skip(SkipReason),
}

/// Decides whether a new-location, foreground or background-fetch event
/// should trigger a flush.
pub struct Scheduler {
    store: Arc<dyn LocationStore>,
    session: Arc<TransmissionSession>,
    clock: Arc<dyn Clock>,
    interval: Duration,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn LocationStore>,
        session: Arc<TransmissionSession>,
        clock: Arc<dyn Clock>,
        interval: Duration,
    ) -> Self {
        Scheduler {
            store,
            session,
            clock,
            interval,
        }
    }

    /// Checks run in order: staleness, thrashing, single-flight. The first
    /// failing check decides the skip reason.
    pub fn evaluate(&self) -> Decision {
        let now = self.clock.now();

        let Some(earliest) = self.store.earliest() else {
            return Decision::Skip(SkipReason::EmptyQueue);
        };
        if now.since(earliest.created_at) <= self.interval {
            return Decision::Skip(SkipReason::NotStale);
        }

        if let Some(last) = self.session.last_transmission()
            && now.since(last) < self.interval / 2
        {
            return Decision::Skip(SkipReason::Thrashing);
        }

        if self.session.is_active() {
            return Decision::Skip(SkipReason::InFlight);
        }

        Decision::Flush
    }
}
