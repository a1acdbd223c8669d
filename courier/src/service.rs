//! Long-running tracking service.
//!
//! Owns the ingestion worker, which serializes every store append and
//! scheduler evaluation through one command channel, and wires the lifecycle
//! triggers (new fixes, foreground transitions, background fetches) into the
//! scheduler and dispatcher.
use crate::background::{BackgroundHost, TimeBoxedHost};
use crate::clock::{Clock, SystemClock};
use crate::config::{Config, ValidationError};
use crate::dispatcher::{Dispatcher, FlushOutcome};
use crate::metrics_defs::{FLUSH_SKIPPED, QUEUE_LENGTH, RECORDS_INGESTED, STORE_WRITE_FAILED};
use crate::retention::RetentionManager;
use crate::scheduler::{Decision, Scheduler, TransmissionSession};
use crate::sources::{BasicEnricher, Enricher, LocationSource};
use crate::state::{StateError, StateStore};
use crate::store::{LocationStore, StoreError, open_location_store};
use crate::transport::{HttpTransport, Transport};
use crate::types::{EndpointId, EndpointTarget, Fix, LocationRecord, Provenance, Timestamp};
use crate::watermarks::WatermarkRegistry;
use parking_lot::Mutex;
use serde::Serialize;
use shared::{counter, gauge};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// A last known fix older than this is refreshed when the app comes to the
/// foreground.
pub const FOREGROUND_REFRESH_AGE: Duration = Duration::from_secs(15 * 60);

/// Commands waiting for the ingestion worker before callers are made to wait.
const COMMAND_QUEUE_SIZE: usize = 64;

#[derive(thiserror::Error, Debug)]
pub enum ServiceError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ValidationError),

    #[error("tracking is not started")]
    NotTracking,

    #[error("no location is known yet")]
    NoCurrentLocation,

    #[error("no tokio runtime available for the ingestion worker")]
    NoRuntime,

    #[error("ingestion worker stopped unexpectedly")]
    WorkerGone,

    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

enum Command {
    // Append fixes to the store, then evaluate the scheduler.
    Ingest(Vec<(Fix, Provenance)>),
    // Evaluate the scheduler without new data.
    Evaluate,
    // Answered once every command sent before it has been handled.
    Barrier(oneshot::Sender<()>),
    Shutdown,
}

/// Everything the service talks to outside of its own logic.
pub struct Collaborators {
    pub store: Arc<dyn LocationStore>,
    pub state: Arc<StateStore>,
    pub transport: Arc<dyn Transport>,
    pub host: Arc<dyn BackgroundHost>,
    pub source: Arc<dyn LocationSource>,
    pub enricher: Arc<dyn Enricher>,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    /// Production collaborators: stores from the storage config, HTTP
    /// transport and a time-boxed background host.
    pub fn from_config(config: &Config, source: Arc<dyn LocationSource>) -> Self {
        Collaborators {
            store: open_location_store(&config.storage),
            state: StateStore::from_config(&config.storage),
            transport: Arc::new(HttpTransport::new(config.request_timeout())),
            host: Arc::new(TimeBoxedHost::new(config.background_budget())),
            source,
            enricher: Arc::new(BasicEnricher),
            clock: Arc::new(SystemClock),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ServiceStatus {
    pub tracking: bool,
    pub flush_in_progress: bool,
    pub queue_length: usize,
    pub earliest: Option<Timestamp>,
    pub last_transmission: Option<Timestamp>,
    pub watermarks: BTreeMap<EndpointId, Timestamp>,
}

struct Worker {
    tx: mpsc::Sender<Command>,
    handle: JoinHandle<()>,
}

struct Inner {
    store: Arc<dyn LocationStore>,
    watermarks: WatermarkRegistry,
    session: Arc<TransmissionSession>,
    scheduler: Scheduler,
    dispatcher: Arc<Dispatcher>,
    enricher: Arc<dyn Enricher>,
    flushes: Mutex<Vec<JoinHandle<FlushOutcome>>>,
}

impl Inner {
    fn ingest(&self, fixes: Vec<(Fix, Provenance)>) {
        let records: Vec<LocationRecord> = fixes
            .iter()
            .map(|(fix, provenance)| {
                counter!(RECORDS_INGESTED, "provenance" => provenance.as_str()).increment(1);
                self.enricher.record(fix, *provenance)
            })
            .collect();
        tracing::debug!(records = records.len(), "received locations");

        if let Err(err) = self.store.append(records) {
            tracing::error!(error = %err, "failed to persist locations");
            counter!(STORE_WRITE_FAILED).increment(1);
        }
        gauge!(QUEUE_LENGTH).set(self.store.len() as f64);
    }

    fn evaluate(&self) {
        let reason = match self.scheduler.evaluate() {
            Decision::Flush => match self.dispatcher.begin() {
                Ok(round) => {
                    let dispatcher = self.dispatcher.clone();
                    let handle = tokio::spawn(async move { dispatcher.run(round).await });
                    let mut flushes = self.flushes.lock();
                    flushes.retain(|flush| !flush.is_finished());
                    flushes.push(handle);
                    return;
                }
                Err(reason) => reason,
            },
            Decision::Skip(reason) => {
                counter!(FLUSH_SKIPPED, "reason" => reason.as_str()).increment(1);
                reason
            }
        };
        tracing::debug!(reason = %reason, "not flushing");
    }

    async fn run_worker(self: Arc<Self>, mut rx: mpsc::Receiver<Command>) {
        while let Some(command) = rx.recv().await {
            match command {
                Command::Ingest(fixes) => {
                    self.ingest(fixes);
                    self.evaluate();
                }
                Command::Evaluate => self.evaluate(),
                Command::Barrier(done) => {
                    let _ = done.send(());
                }
                Command::Shutdown => break,
            }
        }
        tracing::debug!("ingestion worker stopped");
    }

    async fn wait_for_flushes(&self) {
        let flushes = std::mem::take(&mut *self.flushes.lock());
        for flush in flushes {
            if let Err(err) = flush.await {
                tracing::error!(error = %err, "flush task failed");
            }
        }
    }
}

pub struct TrackingService {
    inner: Arc<Inner>,
    state: Arc<StateStore>,
    source: Arc<dyn LocationSource>,
    clock: Arc<dyn Clock>,
    endpoints: Vec<EndpointTarget>,
    worker: Mutex<Option<Worker>>,
}

impl TrackingService {
    /// Builds the service. If tracking was started in a previous run and
    /// never stopped, it is resumed.
    pub fn new(config: &Config, collaborators: Collaborators) -> Result<Self, ServiceError> {
        let service = Self::build(config, collaborators)?;

        if service.state.read(|s| s.tracking_enabled) {
            tracing::info!("resuming tracking started in a previous run");
            if let Err(err) = service.start() {
                tracing::warn!(error = %err, "could not resume tracking");
            }
        }

        Ok(service)
    }

    /// Builds the service without resuming tracking, so nothing is spawned
    /// and no state is written until `start` is called.
    pub fn build(config: &Config, collaborators: Collaborators) -> Result<Self, ServiceError> {
        config.validate()?;

        let Collaborators {
            store,
            state,
            transport,
            host,
            source,
            enricher,
            clock,
        } = collaborators;

        let watermarks = WatermarkRegistry::new(state.clone());
        let session = TransmissionSession::new();
        let retention = RetentionManager::new(
            store.clone(),
            watermarks.clone(),
            config.endpoints.iter().map(EndpointTarget::id).collect(),
            config.max_retention(),
            clock.clone(),
        );
        let dispatcher = Arc::new(Dispatcher::new(
            config.endpoints.clone(),
            store.clone(),
            watermarks.clone(),
            session.clone(),
            retention,
            transport,
            host,
            clock.clone(),
        ));
        let scheduler = Scheduler::new(
            store.clone(),
            session.clone(),
            clock.clone(),
            config.transmission_interval(),
        );

        Ok(TrackingService {
            inner: Arc::new(Inner {
                store,
                watermarks,
                session,
                scheduler,
                dispatcher,
                enricher,
                flushes: Mutex::new(Vec::new()),
            }),
            state,
            source,
            clock,
            endpoints: config.endpoints.clone(),
            worker: Mutex::new(None),
        })
    }

    pub fn from_config(
        config: &Config,
        source: Arc<dyn LocationSource>,
    ) -> Result<Self, ServiceError> {
        Self::new(config, Collaborators::from_config(config, source))
    }

    /// Production collaborators without resuming tracking, for read-only
    /// inspection of the persisted queue and watermarks.
    pub fn inspect(config: &Config, source: Arc<dyn LocationSource>) -> Result<Self, ServiceError> {
        Self::build(config, Collaborators::from_config(config, source))
    }

    /// Starts the ingestion worker and remembers that tracking is on.
    /// Calling it while tracking is a no-op.
    pub fn start(&self) -> Result<(), ServiceError> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }

        let runtime = tokio::runtime::Handle::try_current().map_err(|_| ServiceError::NoRuntime)?;
        self.state.update(|s| s.tracking_enabled = true)?;

        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_SIZE);
        let handle = runtime.spawn(self.inner.clone().run_worker(rx));
        *worker = Some(Worker { tx, handle });
        drop(worker);

        let urls: Vec<&str> = self.endpoints.iter().map(|e| e.url.as_str()).collect();
        tracing::info!(endpoints = ?urls, "location tracking started");
        Ok(())
    }

    /// Stops the worker, forgets that tracking was on and drops every
    /// queued record.
    pub async fn stop(&self) -> Result<(), ServiceError> {
        self.stop_worker().await;
        self.state.update(|s| s.tracking_enabled = false)?;
        self.inner.store.clear()?;
        gauge!(QUEUE_LENGTH).set(0.0);
        tracing::info!("location tracking stopped");
        Ok(())
    }

    pub fn is_tracking(&self) -> bool {
        self.worker.lock().is_some()
    }

    /// Queues fixes for ingestion. They are stored and the scheduler is
    /// evaluated in the order calls were made. Waits while the worker's
    /// queue is full.
    pub async fn add_locations(&self, fixes: Vec<(Fix, Provenance)>) -> Result<(), ServiceError> {
        if fixes.is_empty() {
            return Ok(());
        }
        self.send(Command::Ingest(fixes)).await
    }

    /// Re-evaluates the scheduler without new data.
    pub async fn evaluate(&self) -> Result<(), ServiceError> {
        self.send(Command::Evaluate).await
    }

    /// The source's last known fix, enriched like a queued record but not
    /// queued.
    pub fn current_location(&self) -> Result<LocationRecord, ServiceError> {
        let fix = self
            .source
            .last_known()
            .ok_or(ServiceError::NoCurrentLocation)?;
        Ok(self.inner.enricher.record(&fix, Provenance::Passive))
    }

    /// Foreground transition. Pushes the last known fix and, if it is older
    /// than `FOREGROUND_REFRESH_AGE`, asks the source for a fresh one.
    pub async fn became_active(&self) -> Result<(), ServiceError> {
        if !self.is_tracking() {
            return Ok(());
        }

        if let Some(last) = self.source.last_known() {
            let age = self.clock.now().since(last.timestamp);
            self.add_locations(vec![(last, Provenance::Passive)]).await?;

            if age > FOREGROUND_REFRESH_AGE
                && let Some(fresh) = self.source.fetch_one().await
            {
                self.add_locations(vec![(fresh, Provenance::Active)]).await?;
            }
        }
        self.evaluate().await
    }

    /// Background fetch opportunity. Returns whether new data was obtained.
    pub async fn background_fetch(&self) -> bool {
        if !self.is_tracking() {
            return false;
        }

        if let Some(last) = self.source.last_known()
            && let Err(err) = self.add_locations(vec![(last, Provenance::Passive)]).await
        {
            tracing::warn!(error = %err, "could not queue last known location");
        }

        let fetched = match self.source.fetch_one().await {
            Some(fix) => self
                .add_locations(vec![(fix, Provenance::Active)])
                .await
                .is_ok(),
            None => false,
        };
        if let Err(err) = self.evaluate().await {
            tracing::warn!(error = %err, "could not evaluate scheduler");
        }
        fetched
    }

    /// Flushes immediately regardless of queue age and the time since the
    /// last round. Only the single-flight guard still applies.
    pub async fn flush_now(&self) -> FlushOutcome {
        let outcome = self.inner.dispatcher.flush().await;
        if let FlushOutcome::Skipped(reason) = &outcome {
            tracing::info!(reason = %reason, "explicit flush skipped");
        }
        outcome
    }

    /// Like `flush_now`, reduced to whether every endpoint acknowledged its
    /// batch. A round that could not start counts as a failure.
    pub async fn send_data(&self) -> bool {
        self.flush_now().await.is_success()
    }

    /// Waits until every command queued so far has been handled and every
    /// flush round it started has finished.
    pub async fn settle(&self) -> Result<(), ServiceError> {
        if self.is_tracking() {
            let (done_tx, done_rx) = oneshot::channel();
            self.send(Command::Barrier(done_tx)).await?;
            done_rx.await.map_err(|_| ServiceError::WorkerGone)?;
        }
        self.inner.wait_for_flushes().await;
        Ok(())
    }

    /// Stops the worker after it drains its queue and waits for running
    /// rounds. Unlike `stop`, tracking resumes on the next launch.
    pub async fn shutdown(&self) {
        self.stop_worker().await;
        self.inner.wait_for_flushes().await;
    }

    pub fn status(&self) -> ServiceStatus {
        ServiceStatus {
            tracking: self.is_tracking(),
            flush_in_progress: self.inner.session.is_active(),
            queue_length: self.inner.store.len(),
            earliest: self.inner.store.earliest().map(|r| r.created_at),
            last_transmission: self.inner.session.last_transmission(),
            watermarks: self.inner.watermarks.snapshot(),
        }
    }

    async fn send(&self, command: Command) -> Result<(), ServiceError> {
        let tx = self
            .worker
            .lock()
            .as_ref()
            .map(|worker| worker.tx.clone())
            .ok_or(ServiceError::NotTracking)?;
        tx.send(command).await.map_err(|_| ServiceError::WorkerGone)
    }

    async fn stop_worker(&self) {
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            let _ = worker.tx.send(Command::Shutdown).await;
            if let Err(err) = worker.handle.await {
                tracing::error!(error = %err, "ingestion worker failed");
            }
        }
    }
}
