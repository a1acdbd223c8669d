use crate::background::{BackgroundHost, ExpiryHandler, TaskToken};
use crate::transport::{Transport, TransportError};
use crate::types::{EndpointId, EndpointTarget};
use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use url::Url;

#[derive(Clone, Debug)]
pub struct ReceivedRequest {
    pub headers: HashMap<String, String>,
    pub body: Value,
}

/// Local HTTP collection endpoint that records every request it receives and
/// answers with a fixed status.
pub struct TestCollector {
    addr: SocketAddr,
    received: Arc<Mutex<Vec<ReceivedRequest>>>,
    handle: JoinHandle<()>,
}

impl TestCollector {
    pub async fn spawn(status: u16) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind to address");
        let addr = listener.local_addr().unwrap();
        let status = StatusCode::from_u16(status).unwrap();
        let received: Arc<Mutex<Vec<ReceivedRequest>>> = Arc::new(Mutex::new(Vec::new()));

        let received_clone = received.clone();
        let handle = tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                let io = TokioIo::new(stream);
                let received = received_clone.clone();

                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let received = received.clone();
                        async move {
                            let (parts, body) = req.into_parts();
                            let bytes = body
                                .collect()
                                .await
                                .map(|collected| collected.to_bytes())
                                .unwrap_or_default();
                            let headers = parts
                                .headers
                                .iter()
                                .filter_map(|(name, value)| {
                                    value.to_str().ok().map(|v| (name.to_string(), v.to_string()))
                                })
                                .collect();
                            let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
                            received.lock().push(ReceivedRequest { headers, body });

                            let mut response = Response::new(Full::new(Bytes::from_static(b"{}")));
                            *response.status_mut() = status;
                            Ok::<_, Infallible>(response)
                        }
                    });

                    if let Err(err) =
                        hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                            .serve_connection(io, service)
                            .await
                    {
                        eprintln!("Error serving connection: {:?}", err);
                    }
                });
            }
        });

        TestCollector {
            addr,
            received,
            handle,
        }
    }

    pub fn url(&self) -> Url {
        Url::parse(&format!("http://{}/locations", self.addr)).unwrap()
    }

    pub fn received(&self) -> Vec<ReceivedRequest> {
        self.received.lock().clone()
    }
}

impl Drop for TestCollector {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// In-process transport with per-endpoint scripted behaviour.
#[derive(Default)]
pub struct ScriptedTransport {
    failing: Mutex<HashSet<EndpointId>>,
    hanging: Mutex<HashSet<EndpointId>>,
    delay: Mutex<Duration>,
    calls: Mutex<Vec<(EndpointId, Value)>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail(&self, endpoint: &EndpointId) {
        self.failing.lock().insert(endpoint.clone());
    }

    pub fn recover(&self, endpoint: &EndpointId) {
        self.failing.lock().remove(endpoint);
    }

    /// The endpoint never answers.
    pub fn hang(&self, endpoint: &EndpointId) {
        self.hanging.lock().insert(endpoint.clone());
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn calls(&self) -> Vec<(EndpointId, Value)> {
        self.calls.lock().clone()
    }

    pub fn calls_for(&self, endpoint: &EndpointId) -> Vec<Value> {
        self.calls
            .lock()
            .iter()
            .filter(|(id, _)| id == endpoint)
            .map(|(_, body)| body.clone())
            .collect()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn post(&self, target: &EndpointTarget, body: &Value) -> Result<(), TransportError> {
        let id = target.id();
        self.calls.lock().push((id.clone(), body.clone()));

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        let hang = self.hanging.lock().contains(&id);
        if hang {
            std::future::pending::<()>().await;
        }

        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.failing.lock().contains(&id) {
            return Err(TransportError::Status(id.to_string(), 500));
        }
        Ok(())
    }
}

/// Host that records calls and lets the test fire expiry by hand.
#[derive(Default)]
pub struct ManualHost {
    handlers: Mutex<Vec<(TaskToken, ExpiryHandler)>>,
    ended: Mutex<Vec<TaskToken>>,
    issued: AtomicUsize,
    pub deny: bool,
}

impl ManualHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn denying() -> Arc<Self> {
        Arc::new(ManualHost {
            deny: true,
            ..Default::default()
        })
    }

    pub fn expire_all(&self) {
        let handlers: Vec<_> = self.handlers.lock().drain(..).collect();
        for (_, handler) in handlers {
            handler();
        }
    }

    pub fn ended(&self) -> Vec<TaskToken> {
        self.ended.lock().clone()
    }
}

impl BackgroundHost for ManualHost {
    fn begin(&self, on_expire: ExpiryHandler) -> Option<TaskToken> {
        if self.deny {
            return None;
        }
        let id = self.issued.fetch_add(1, Ordering::SeqCst) as u64 + 1;
        let token = TaskToken(id);
        self.handlers.lock().push((token, on_expire));
        Some(token)
    }

    fn end(&self, token: TaskToken) {
        self.handlers.lock().retain(|(t, _)| *t != token);
        self.ended.lock().push(token);
    }
}
