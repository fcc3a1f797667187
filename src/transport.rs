//! Queue Transport Boundary
//!
//! The pipeline produces and consumes byte messages on named topics and
//! never sees anything transport-specific. A broker that is temporarily
//! unavailable is retried indefinitely at a fixed backoff; it is never
//! fatal. `MemoryBroker` is the in-process implementation used by tests,
//! demos, and the default binary wiring.

use crate::shutdown::ShutdownSignal;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::warn;

/// Per-topic buffer depth of the in-memory broker.
const TOPIC_DEPTH: usize = 65_536;

#[derive(Debug, Clone)]
pub enum TransportError {
    /// The broker could not be reached; retried with backoff.
    Unavailable(String),
    /// A message could not be enqueued (topic full or gone).
    SendFailed(String),
    /// The consumed topic was closed; no further messages will arrive.
    Closed,
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable(e) => write!(f, "queue unavailable: {}", e),
            Self::SendFailed(e) => write!(f, "send failed: {}", e),
            Self::Closed => write!(f, "topic closed"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Egress side: fire one byte message at a named topic.
pub trait QueueProducer: Send + Sync {
    fn send(&self, topic: &str, payload: &[u8]) -> Result<(), TransportError>;
}

/// Ingress side: poll the subscribed topic for the next message.
pub trait QueueConsumer: Send {
    /// `Ok(None)` means no message arrived within the timeout.
    fn poll(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, TransportError>;
}

/// Build a transport endpoint, retrying indefinitely at a fixed backoff
/// until it comes up or shutdown is requested. Returns `None` only on
/// shutdown.
pub fn connect_with_backoff<T>(
    what: &str,
    backoff: Duration,
    shutdown: &ShutdownSignal,
    mut attempt: impl FnMut() -> Result<T, TransportError>,
) -> Option<T> {
    loop {
        if shutdown.is_requested() {
            return None;
        }
        match attempt() {
            Ok(endpoint) => return Some(endpoint),
            Err(err) => {
                warn!(
                    endpoint = what,
                    error = %err,
                    backoff_secs = backoff.as_secs(),
                    "waiting for the queue service to become available"
                );
                if shutdown.wait_secs(backoff.as_secs()) {
                    return None;
                }
            }
        }
    }
}

type Topic = (Sender<Vec<u8>>, Receiver<Vec<u8>>);

/// In-process broker: bounded crossbeam channels keyed by topic name.
#[derive(Default)]
pub struct MemoryBroker {
    topics: Mutex<HashMap<String, Topic>>,
}

impl MemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn topic(&self, name: &str) -> Topic {
        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        topics
            .entry(name.to_string())
            .or_insert_with(|| bounded(TOPIC_DEPTH))
            .clone()
    }

    pub fn producer(self: &Arc<Self>) -> MemoryProducer {
        MemoryProducer {
            broker: Arc::clone(self),
        }
    }

    pub fn consumer(self: &Arc<Self>, topic: &str) -> MemoryConsumer {
        MemoryConsumer {
            rx: self.topic(topic).1,
        }
    }

    /// Drain every message currently queued on a topic (test helper).
    pub fn drain(&self, topic: &str) -> Vec<Vec<u8>> {
        let rx = self.topic(topic).1;
        let mut messages = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            messages.push(msg);
        }
        messages
    }
}

#[derive(Clone)]
pub struct MemoryProducer {
    broker: Arc<MemoryBroker>,
}

impl QueueProducer for MemoryProducer {
    fn send(&self, topic: &str, payload: &[u8]) -> Result<(), TransportError> {
        self.broker
            .topic(topic)
            .0
            .try_send(payload.to_vec())
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }
}

pub struct MemoryConsumer {
    rx: Receiver<Vec<u8>>,
}

impl QueueConsumer for MemoryConsumer {
    fn poll(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, TransportError> {
        match self.rx.recv_timeout(timeout) {
            Ok(msg) => Ok(Some(msg)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::Closed),
        }
    }
}
