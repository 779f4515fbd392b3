//! Inbound side of the relay sub-protocols
//!
//! Every node answers discover with its role token. Only a manager accepts
//! captures; it keeps them in memory and acknowledges each new one.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, trace};

use crate::config::NodeRole;
use crate::wire::{CaptureMessage, CaptureOutcome, SubProtocol, DISCOVER_REQUEST};

/// Captures held before the oldest is evicted.
pub const CAPTURE_STORE_CAPACITY: usize = 10_000;

#[derive(Debug, Default)]
struct StoreInner {
    values: HashSet<String>,
    captures: VecDeque<CaptureMessage>,
}

/// Bounded in-memory log of captures accepted by a manager, unique by `value`.
///
/// Once full, each new capture evicts the oldest one, and the evicted value
/// may be stored again later.
#[derive(Debug)]
pub struct CaptureStore {
    capacity: usize,
    inner: Mutex<StoreInner>,
}

impl CaptureStore {
    pub fn new() -> Self {
        Self::with_capacity(CAPTURE_STORE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(StoreInner::default()),
        }
    }

    /// Returns `Stored` for a new value and `Discarded` for a repeat.
    pub async fn insert(&self, message: CaptureMessage) -> CaptureOutcome {
        let mut inner = self.inner.lock().await;
        if !inner.values.insert(message.value.clone()) {
            return CaptureOutcome::Discarded;
        }
        inner.captures.push_back(message);

        while inner.captures.len() > self.capacity {
            if let Some(evicted) = inner.captures.pop_front() {
                trace!("Evicting capture {}", evicted.value);
                inner.values.remove(&evicted.value);
            }
        }
        CaptureOutcome::Stored
    }

    /// Held captures, oldest first.
    pub async fn snapshot(&self) -> Vec<CaptureMessage> {
        self.inner.lock().await.captures.iter().cloned().collect()
    }
}

impl Default for CaptureStore {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct Responder {
    role: NodeRole,
    store: Arc<CaptureStore>,
}

impl Responder {
    pub fn new(role: NodeRole) -> Self {
        Self {
            role,
            store: Arc::new(CaptureStore::new()),
        }
    }

    pub fn store(&self) -> Arc<CaptureStore> {
        self.store.clone()
    }

    /// Build the response for an inbound request.
    pub async fn answer(&self, protocol: SubProtocol, request: &[u8]) -> Vec<u8> {
        match protocol {
            SubProtocol::Discover => self.answer_discover(request),
            SubProtocol::Capture => self.answer_capture(request).await.ack().as_bytes().to_vec(),
        }
    }

    fn answer_discover(&self, request: &[u8]) -> Vec<u8> {
        if request != DISCOVER_REQUEST.as_bytes() {
            debug!("Ignoring malformed discover request");
            return Vec::new();
        }
        self.role.token().as_bytes().to_vec()
    }

    async fn answer_capture(&self, request: &[u8]) -> CaptureOutcome {
        if self.role != NodeRole::Manager {
            return CaptureOutcome::Discarded;
        }

        let message = match CaptureMessage::from_payload(request) {
            Ok(message) => message,
            Err(e) => {
                debug!("Discarding capture: {}", e);
                return CaptureOutcome::Discarded;
            }
        };

        let value = message.value.clone();
        let outcome = self.store.insert(message).await;
        info!("Capture {} {}", value, outcome);
        outcome
    }
}
