//! Bounded execution slots granted by the host while a flush round runs.
//!
//! A host may reclaim the slot at any time by invoking the expiry handler it
//! was given. The guard releases the slot exactly once, whether the round
//! finishes first or the host expires it first.
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskToken(pub u64);

pub type ExpiryHandler = Box<dyn FnOnce() + Send + 'static>;

pub trait BackgroundHost: Send + Sync {
    /// Requests an execution slot. Returns `None` if the host has no budget
    /// left. `on_expire` is invoked if the host reclaims the slot before
    /// `end` is called.
    fn begin(&self, on_expire: ExpiryHandler) -> Option<TaskToken>;

    fn end(&self, token: TaskToken);
}

/// Host for processes that are never suspended. Slots never expire.
pub struct UnboundedHost;

impl BackgroundHost for UnboundedHost {
    fn begin(&self, _on_expire: ExpiryHandler) -> Option<TaskToken> {
        Some(TaskToken(0))
    }

    fn end(&self, _token: TaskToken) {}
}

/// Grants slots of a fixed length, enforced with a tokio timer.
pub struct TimeBoxedHost {
    budget: Duration,
    next_id: AtomicU64,
    slots: Arc<Mutex<HashMap<u64, JoinHandle<()>>>>,
}

impl TimeBoxedHost {
    pub fn new(budget: Duration) -> Self {
        TimeBoxedHost {
            budget,
            next_id: AtomicU64::new(1),
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    #[cfg(test)]
    pub fn active_slots(&self) -> usize {
        self.slots.lock().len()
    }
}

impl BackgroundHost for TimeBoxedHost {
    fn begin(&self, on_expire: ExpiryHandler) -> Option<TaskToken> {
        // Without a runtime the budget cannot be enforced
        let handle = tokio::runtime::Handle::try_current().ok()?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let budget = self.budget;
        let slots = self.slots.clone();

        // Hold the lock while spawning so the timer cannot remove the slot
        // before it is inserted.
        let mut guard = self.slots.lock();
        let timer = handle.spawn(async move {
            tokio::time::sleep(budget).await;
            let still_held = slots.lock().remove(&id).is_some();
            if still_held {
                on_expire();
            }
        });
        guard.insert(id, timer);

        Some(TaskToken(id))
    }

    fn end(&self, token: TaskToken) {
        if let Some(timer) = self.slots.lock().remove(&token.0) {
            timer.abort();
        }
    }
}

struct GuardState {
    host: Arc<dyn BackgroundHost>,
    token: Mutex<Option<TaskToken>>,
    expired_tx: watch::Sender<bool>,
}

impl GuardState {
    fn release(&self) {
        let token = self.token.lock().take();
        if let Some(token) = token {
            self.host.end(token);
        }
    }
}

/// Holds an execution slot for the duration of a flush round. The slot is
/// released when the guard is dropped or when the host expires it.
pub struct BackgroundGuard {
    state: Arc<GuardState>,
    expired_rx: watch::Receiver<bool>,
    #[cfg(test)]
    acquired: bool,
}

impl BackgroundGuard {
    pub fn acquire(host: Arc<dyn BackgroundHost>) -> Self {
        let (expired_tx, expired_rx) = watch::channel(false);
        let state = Arc::new(GuardState {
            host: host.clone(),
            token: Mutex::new(None),
            expired_tx,
        });

        let weak: Weak<GuardState> = Arc::downgrade(&state);
        let token = host.begin(Box::new(move || {
            if let Some(state) = weak.upgrade() {
                tracing::warn!("background execution slot expired");
                state.expired_tx.send_replace(true);
                state.release();
            }
        }));

        let acquired = token.is_some();
        if acquired {
            *state.token.lock() = token;
            // The host may have expired the slot before the token was stored
            if *state.expired_tx.borrow() {
                state.release();
            }
        } else {
            tracing::warn!("no background execution slot available, flushing best-effort");
        }

        BackgroundGuard {
            state,
            expired_rx,
            #[cfg(test)]
            acquired,
        }
    }

    #[cfg(test)]
    pub fn is_acquired(&self) -> bool {
        self.acquired
    }

    #[cfg(test)]
    pub fn is_expired(&self) -> bool {
        *self.expired_rx.borrow()
    }

    /// Resolves once the host reclaims the slot. Never resolves if no slot
    /// was granted or the slot never expires.
    pub async fn expired(&mut self) {
        if self.expired_rx.wait_for(|expired| *expired).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

impl Drop for BackgroundGuard {
    fn drop(&mut self) {
        self.state.release();
    }
}
