//! Fan-out delivery of queued locations to every configured endpoint.
//!
//! A flush round queries the store once per endpoint, starting after that
//! endpoint's watermark, and posts the batches concurrently. Each endpoint
//! succeeds or fails on its own: a success advances only that endpoint's
//! watermark, a failure leaves it where it was so the same range is resent
//! by the next round. The round ends when every endpoint has reported or the
//! background slot expires, whichever happens first.
use crate::background::{BackgroundGuard, BackgroundHost};
use crate::clock::Clock;
use crate::metrics_defs::{
    BACKGROUND_SLOT_EXPIRED, BATCH_SIZE, ENDPOINT_DELIVERY_FAILED, FLUSH_DURATION, FLUSH_ROUNDS,
    FLUSH_SKIPPED, QUEUE_LENGTH,
};
use crate::retention::RetentionManager;
use crate::scheduler::{RoundToken, SkipReason, TransmissionSession};
use crate::store::LocationStore;
use crate::transport::{Transport, TransportError, batch_body};
use crate::types::{EndpointId, EndpointTarget, Timestamp};
use crate::watermarks::WatermarkRegistry;
use shared::{counter, gauge, histogram};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;

#[derive(thiserror::Error, Debug)]
pub enum DeliveryError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("round abandoned before {0} reported")]
    Abandoned(EndpointId),

    #[error("delivery task for {0} panicked")]
    Panicked(EndpointId),
}

/// Result of one endpoint's delivery within a round.
#[derive(Debug)]
pub struct EndpointReport {
    pub endpoint: EndpointId,
    /// Number of records acknowledged by the endpoint.
    pub sent: usize,
    pub result: Result<(), DeliveryError>,
}

#[derive(Debug)]
pub enum FlushOutcome {
    /// No round was started.
    Skipped(SkipReason),
    Completed {
        /// True only if every endpoint acknowledged its batch.
        success: bool,
        /// One report per endpoint, in configuration order.
        reports: Vec<EndpointReport>,
    },
}

impl FlushOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, FlushOutcome::Completed { success: true, .. })
    }
}

pub struct Dispatcher {
    targets: Arc<[EndpointTarget]>,
    store: Arc<dyn LocationStore>,
    watermarks: WatermarkRegistry,
    session: Arc<TransmissionSession>,
    retention: RetentionManager,
    transport: Arc<dyn Transport>,
    host: Arc<dyn BackgroundHost>,
    clock: Arc<dyn Clock>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        targets: Vec<EndpointTarget>,
        store: Arc<dyn LocationStore>,
        watermarks: WatermarkRegistry,
        session: Arc<TransmissionSession>,
        retention: RetentionManager,
        transport: Arc<dyn Transport>,
        host: Arc<dyn BackgroundHost>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Dispatcher {
            targets: targets.into(),
            store,
            watermarks,
            session,
            retention,
            transport,
            host,
            clock,
        }
    }

    pub fn targets(&self) -> &[EndpointTarget] {
        &self.targets
    }

    /// Claims the session for a new round. Fails if no endpoint is
    /// configured or another round is active.
    pub fn begin(&self) -> Result<RoundToken, SkipReason> {
        if self.targets.is_empty() {
            tracing::debug!("no endpoints configured, nothing to flush");
            return Err(SkipReason::NoEndpoints);
        }

        self.session
            .try_begin(self.targets.iter().map(EndpointTarget::id))
            .ok_or_else(|| {
                tracing::debug!("flush already in progress");
                counter!(FLUSH_SKIPPED, "reason" => SkipReason::InFlight.as_str()).increment(1);
                SkipReason::InFlight
            })
    }

    /// Runs one flush round. Returns `Skipped` without side effects if the
    /// round cannot begin.
    pub async fn flush(&self) -> FlushOutcome {
        match self.begin() {
            Ok(round) => self.run(round).await,
            Err(reason) => FlushOutcome::Skipped(reason),
        }
    }

    /// Runs a round claimed with `begin`.
    pub async fn run(&self, round: RoundToken) -> FlushOutcome {
        let started = Instant::now();
        let mut guard = BackgroundGuard::acquire(self.host.clone());
        let now = self.clock.now();

        let mut join_set = JoinSet::new();
        let mut task_endpoints: HashMap<tokio::task::Id, EndpointId> = HashMap::new();

        for target in self.targets.iter() {
            let delivery = Delivery {
                target: target.clone(),
                store: self.store.clone(),
                watermarks: self.watermarks.clone(),
                transport: self.transport.clone(),
            };
            let handle = join_set.spawn(delivery.run(now));
            task_endpoints.insert(handle.id(), target.id());
        }

        let mut reports = Vec::with_capacity(self.targets.len());

        loop {
            tokio::select! {
                _ = guard.expired() => {
                    tracing::warn!(
                        pending = task_endpoints.len(),
                        "background slot expired, abandoning flush round"
                    );
                    counter!(BACKGROUND_SLOT_EXPIRED).increment(1);
                    break;
                }
                joined = join_set.join_next_with_id() => {
                    match joined {
                        Some(Ok((task_id, report))) => {
                            task_endpoints.remove(&task_id);
                            round.endpoint_reported(&report.endpoint);
                            reports.push(report);
                        }
                        Some(Err(err)) => {
                            if let Some(endpoint) = task_endpoints.remove(&err.id()) {
                                tracing::error!(endpoint = %endpoint, "delivery task panicked: {err}");
                                round.endpoint_reported(&endpoint);
                                reports.push(EndpointReport {
                                    endpoint: endpoint.clone(),
                                    sent: 0,
                                    result: Err(DeliveryError::Panicked(endpoint)),
                                });
                            }
                        }
                        // No more tasks
                        None => break,
                    }
                }
            }
        }

        // Anything still running is cancelled; its watermark stays put
        join_set.abort_all();
        for (_, endpoint) in task_endpoints.drain() {
            reports.push(EndpointReport {
                endpoint: endpoint.clone(),
                sent: 0,
                result: Err(DeliveryError::Abandoned(endpoint)),
            });
        }
        reports.sort_by_key(|report| {
            self.targets
                .iter()
                .position(|target| target.id() == report.endpoint)
        });

        let success = reports.iter().all(|report| report.result.is_ok());
        let finished_at = self.clock.now();

        if let Err(err) = self.retention.prune() {
            tracing::error!(error = %err, "failed to prune location store");
        }
        round.complete(finished_at);
        drop(guard);

        let outcome = if success { "success" } else { "failure" };
        counter!(FLUSH_ROUNDS, "outcome" => outcome).increment(1);
        histogram!(FLUSH_DURATION).record(started.elapsed().as_secs_f64());
        gauge!(QUEUE_LENGTH).set(self.store.len() as f64);
        tracing::info!(
            success,
            endpoints = reports.len(),
            sent = reports.iter().map(|r| r.sent).sum::<usize>(),
            remaining = self.store.len(),
            "flush round finished"
        );

        FlushOutcome::Completed { success, reports }
    }
}

/// One endpoint's share of a round, run as its own task.
struct Delivery {
    target: EndpointTarget,
    store: Arc<dyn LocationStore>,
    watermarks: WatermarkRegistry,
    transport: Arc<dyn Transport>,
}

impl Delivery {
    async fn run(self, now: Timestamp) -> EndpointReport {
        let endpoint = self.target.id();
        let since = self.watermark_for_query(&endpoint, now);
        let batch = self.store.query(since);
        let body = batch_body(&batch);

        match self.transport.post(&self.target, &body).await {
            Ok(()) => {
                // An empty batch leaves the watermark untouched
                if let Some(last) = batch.last()
                    && let Err(err) = self.watermarks.set(&endpoint, last.created_at)
                {
                    tracing::error!(endpoint = %endpoint, error = %err, "failed to persist watermark");
                }
                histogram!(BATCH_SIZE).record(batch.len() as f64);
                tracing::info!(endpoint = %endpoint, records = batch.len(), "posted locations");

                EndpointReport {
                    endpoint,
                    sent: batch.len(),
                    result: Ok(()),
                }
            }
            Err(err) => {
                tracing::warn!(endpoint = %endpoint, records = batch.len(), error = %err, "failed to post locations");
                counter!(ENDPOINT_DELIVERY_FAILED).increment(1);

                EndpointReport {
                    endpoint,
                    sent: 0,
                    result: Err(err.into()),
                }
            }
        }
    }

    /// A watermark later than `now` means the clock moved backwards since it
    /// was recorded. It is reset and the whole queue is resent.
    fn watermark_for_query(&self, endpoint: &EndpointId, now: Timestamp) -> Timestamp {
        match self.watermarks.recorded(endpoint) {
            Some(watermark) if watermark <= now => watermark,
            Some(watermark) => {
                tracing::warn!(endpoint = %endpoint, watermark = %watermark, "watermark is in the future, resetting");
                if let Err(err) = self.watermarks.reset(endpoint) {
                    tracing::error!(endpoint = %endpoint, error = %err, "failed to reset watermark");
                }
                Timestamp::DISTANT_PAST
            }
            None => Timestamp::DISTANT_PAST,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::background::UnboundedHost;
    use crate::clock::ManualClock;
    use crate::scheduler::{Decision, Scheduler};
    use crate::state::StateStore;
    use crate::store::MemoryLocationStore;
    use crate::testutils::{ManualHost, ScriptedTransport};
    use crate::types::{Coordinate, LocationRecord, Provenance};
    use serde_json::json;
    use std::time::Duration;
    use url::Url;

    const NOW: i64 = 1_700_000_000_000;
    const A: &str = "https://a.example.com/locations";
    const B: &str = "https://b.example.com/locations";

    struct Fixture {
        store: Arc<MemoryLocationStore>,
        watermarks: WatermarkRegistry,
        session: Arc<TransmissionSession>,
        transport: Arc<ScriptedTransport>,
        clock: Arc<ManualClock>,
        dispatcher: Arc<Dispatcher>,
    }

    fn fixture_with_host(endpoints: &[&str], host: Arc<dyn BackgroundHost>) -> Fixture {
        let targets: Vec<EndpointTarget> = endpoints
            .iter()
            .map(|url| EndpointTarget::new(Url::parse(url).unwrap()))
            .collect();
        let store = Arc::new(MemoryLocationStore::new());
        let watermarks = WatermarkRegistry::new(StateStore::in_memory());
        let session = TransmissionSession::new();
        let transport = ScriptedTransport::new();
        let clock = Arc::new(ManualClock::new(Timestamp::from_millis(NOW)));
        let retention = RetentionManager::new(
            store.clone(),
            watermarks.clone(),
            targets.iter().map(EndpointTarget::id).collect(),
            Duration::from_secs(10 * 86_400),
            clock.clone(),
        );
        let dispatcher = Arc::new(Dispatcher::new(
            targets,
            store.clone(),
            watermarks.clone(),
            session.clone(),
            retention,
            transport.clone(),
            host,
            clock.clone(),
        ));

        Fixture {
            store,
            watermarks,
            session,
            transport,
            clock,
            dispatcher,
        }
    }

    fn fixture(endpoints: &[&str]) -> Fixture {
        fixture_with_host(endpoints, Arc::new(UnboundedHost))
    }

    fn record_aged(secs: u64) -> LocationRecord {
        let created_at = Timestamp::from_millis(NOW).saturating_sub(Duration::from_secs(secs));
        LocationRecord::new(
            created_at,
            Coordinate::new(48.85, 2.35),
            Provenance::Passive,
            json!({ "utc_timestamp": created_at.as_millis() }),
        )
    }

    fn id(url: &str) -> EndpointId {
        EndpointId::new(url)
    }

    fn sent_timestamps(body: &serde_json::Value) -> Vec<i64> {
        body["locations"]
            .as_array()
            .unwrap()
            .iter()
            .map(|l| l["utc_timestamp"].as_i64().unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_single_endpoint_scenario() {
        let f = fixture(&[A]);
        let record = record_aged(700);
        f.store.append(vec![record.clone()]).unwrap();

        let scheduler = Scheduler::new(
            f.store.clone(),
            f.session.clone(),
            f.clock.clone(),
            Duration::from_secs(600),
        );
        assert_eq!(scheduler.evaluate(), Decision::Flush);

        let outcome = f.dispatcher.flush().await;
        assert!(outcome.is_success());

        let calls = f.transport.calls_for(&id(A));
        assert_eq!(calls.len(), 1);
        assert_eq!(sent_timestamps(&calls[0]), vec![record.created_at.as_millis()]);
        assert_eq!(f.watermarks.get(&id(A)), record.created_at);
        assert!(f.store.is_empty());
        assert!(!f.session.is_active());
        assert_eq!(f.session.last_transmission(), Some(f.clock.now()));
    }

    #[tokio::test]
    async fn test_partial_failure_keeps_records_for_failed_endpoint() {
        let f = fixture(&[A, B]);
        let old = record_aged(900);
        let newer = record_aged(800);
        f.store.append(vec![old.clone(), newer.clone()]).unwrap();
        f.watermarks.set(&id(B), old.created_at).unwrap();
        f.transport.fail(&id(B));

        let outcome = f.dispatcher.flush().await;
        let FlushOutcome::Completed { success, reports } = outcome else {
            panic!("round should run");
        };
        assert!(!success);
        assert_eq!(reports[0].endpoint, id(A));
        assert!(reports[0].result.is_ok());
        assert_eq!(reports[0].sent, 2);
        assert!(matches!(reports[1].result, Err(DeliveryError::Transport(_))));

        assert_eq!(f.watermarks.get(&id(A)), newer.created_at);
        assert_eq!(f.watermarks.get(&id(B)), old.created_at);
        // Cutoff follows B, so its pending record is kept
        let remaining = f.store.query(Timestamp::DISTANT_PAST);
        assert_eq!(remaining, vec![newer.clone()]);

        // B recovers: it receives only what it missed, A receives nothing new
        f.transport.recover(&id(B));
        f.clock.advance(Duration::from_secs(400));
        assert!(f.dispatcher.flush().await.is_success());

        let b_calls = f.transport.calls_for(&id(B));
        assert_eq!(sent_timestamps(&b_calls[1]), vec![newer.created_at.as_millis()]);
        let a_calls = f.transport.calls_for(&id(A));
        assert!(sent_timestamps(&a_calls[1]).is_empty());
        assert!(f.store.is_empty());
    }

    #[tokio::test]
    async fn test_acknowledged_records_are_not_resent() {
        let f = fixture(&[A, B]);
        // B never succeeds, so nothing is pruned and A's watermark alone
        // decides what A receives
        f.transport.fail(&id(B));
        let first = record_aged(900);
        f.store.append(vec![first.clone()]).unwrap();
        f.dispatcher.flush().await;

        let second = record_aged(100);
        f.store.append(vec![second.clone()]).unwrap();
        f.dispatcher.flush().await;

        let calls = f.transport.calls_for(&id(A));
        assert_eq!(sent_timestamps(&calls[0]), vec![first.created_at.as_millis()]);
        assert_eq!(sent_timestamps(&calls[1]), vec![second.created_at.as_millis()]);
        assert_eq!(f.store.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_batch_counts_as_success() {
        let f = fixture(&[A]);
        f.watermarks.set(&id(A), Timestamp::from_millis(NOW - 5)).unwrap();

        let outcome = f.dispatcher.flush().await;
        assert!(outcome.is_success());
        assert_eq!(f.watermarks.get(&id(A)), Timestamp::from_millis(NOW - 5));
        assert_eq!(f.transport.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_no_endpoints_is_a_noop() {
        let f = fixture(&[]);
        f.store.append(vec![record_aged(700)]).unwrap();

        let outcome = f.dispatcher.flush().await;
        assert!(matches!(outcome, FlushOutcome::Skipped(SkipReason::NoEndpoints)));
        assert!(!outcome.is_success());
        assert_eq!(f.store.len(), 1);
        assert_eq!(f.session.last_transmission(), None);
    }

    #[tokio::test]
    async fn test_single_flight_under_concurrent_flushes() {
        let f = fixture(&[A, B]);
        f.store.append(vec![record_aged(700)]).unwrap();
        f.transport.set_delay(Duration::from_millis(50));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let dispatcher = f.dispatcher.clone();
            handles.push(tokio::spawn(async move { dispatcher.flush().await }));
        }

        let mut completed = 0;
        for handle in handles {
            match handle.await.unwrap() {
                FlushOutcome::Completed { .. } => completed += 1,
                FlushOutcome::Skipped(reason) => assert_eq!(reason, SkipReason::InFlight),
            }
        }

        // Rounds may run back to back but never overlap
        assert!(completed >= 1);
        assert_eq!(f.transport.max_in_flight(), 2);
        assert_eq!(f.transport.calls().len(), completed * 2);
    }

    #[tokio::test]
    async fn test_expiry_abandons_pending_endpoints() {
        let host = ManualHost::new();
        let f = fixture_with_host(&[A, B], host.clone());
        let record = record_aged(700);
        f.store.append(vec![record.clone()]).unwrap();
        f.transport.hang(&id(B));

        let dispatcher = f.dispatcher.clone();
        let flush = tokio::spawn(async move { dispatcher.flush().await });

        // Wait until A has been acknowledged and B is stuck
        while f.session.pending() != vec![id(B)] {
            tokio::task::yield_now().await;
        }
        host.expire_all();

        let FlushOutcome::Completed { success, reports } = flush.await.unwrap() else {
            panic!("round should run");
        };
        assert!(!success);
        assert!(reports[0].result.is_ok());
        assert!(matches!(reports[1].result, Err(DeliveryError::Abandoned(_))));
        assert_eq!(f.watermarks.get(&id(A)), record.created_at);
        assert_eq!(f.watermarks.recorded(&id(B)), None);
        assert_eq!(f.store.len(), 1);
        assert!(!f.session.is_active());
        assert_eq!(host.ended().len(), 1);
    }

    #[tokio::test]
    async fn test_denied_background_slot_still_flushes() {
        let f = fixture_with_host(&[A], ManualHost::denying());
        f.store.append(vec![record_aged(700)]).unwrap();
        assert!(f.dispatcher.flush().await.is_success());
        assert!(f.store.is_empty());
    }

    #[tokio::test]
    async fn test_future_watermark_is_reset() {
        let f = fixture(&[A]);
        let record = record_aged(700);
        f.store.append(vec![record.clone()]).unwrap();
        f.watermarks.set(&id(A), Timestamp::from_millis(NOW + 60_000)).unwrap();

        assert!(f.dispatcher.flush().await.is_success());
        let calls = f.transport.calls_for(&id(A));
        assert_eq!(sent_timestamps(&calls[0]), vec![record.created_at.as_millis()]);
        assert_eq!(f.watermarks.get(&id(A)), record.created_at);
    }
}
