//! Shared websocket connection pool
//!
//! One live connection per (destination, subscription) key, shared
//! by every job in the process. The first requester creates the
//! handle (insert-if-absent via the DashMap entry API, so a race of
//! simultaneous first-requesters still yields exactly one handle)
//! and spawns the driver that owns the actual stream.
//!
//! Tasks interact only with the handle: read the most recent
//! buffered message, or suspend until a matching one arrives,
//! bounded by a timeout. A handle idle past its TTL is stale; the
//! requesting task evicts it and fails rather than reconnecting
//! mid-task. Reconnect policy lives with the next task to ask for
//! the key, which simply creates a fresh handle.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::sync::broadcast;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};
use url::Url;

use crate::error::RunnerError;

/// Buffered messages kept per handle.
const BUFFER_CAPACITY: usize = 128;

/// Broadcast fan-out depth; slow waiters skip lagged messages.
const CHANNEL_CAPACITY: usize = 64;

// ============================================================================
// KEY
// ============================================================================

/// Canonical pool key: destination URL plus the serialized
/// subscription payload. Two tasks with the same key share one
/// connection; a different subscription is a different connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SocketKey {
    url: String,
    subscription: String,
}

impl SocketKey {
    pub fn new(url: &Url, subscription: &serde_json::Value) -> Self {
        Self {
            url: url.to_string(),
            subscription: subscription.to_string(),
        }
    }
}

impl fmt::Display for SocketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} sub={}", self.url, self.subscription)
    }
}

// ============================================================================
// HANDLE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Connecting,
    Open,
    Closed,
}

/// Shared wrapper around one live connection. All state is behind
/// short-lived locks; no lock is held across an await point.
pub struct SocketHandle {
    key: SocketKey,
    ttl: Duration,
    buffer: Mutex<VecDeque<(Instant, Arc<serde_json::Value>)>>,
    tx: broadcast::Sender<Arc<serde_json::Value>>,
    last_activity: Mutex<Instant>,
    state: Mutex<Connectivity>,
}

impl SocketHandle {
    fn new(key: SocketKey, ttl: Duration) -> Arc<Self> {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Arc::new(Self {
            key,
            ttl,
            buffer: Mutex::new(VecDeque::with_capacity(BUFFER_CAPACITY)),
            tx,
            last_activity: Mutex::new(Instant::now()),
            state: Mutex::new(Connectivity::Connecting),
        })
    }

    pub fn key(&self) -> &SocketKey {
        &self.key
    }

    pub fn connectivity(&self) -> Connectivity {
        *self.state.lock().unwrap()
    }

    pub fn set_connectivity(&self, state: Connectivity) {
        *self.state.lock().unwrap() = state;
    }

    /// True when idle past the handle's TTL. Callers must evict a
    /// stale handle and fail the task with a stale classification.
    pub fn is_stale(&self) -> bool {
        self.last_activity.lock().unwrap().elapsed() > self.ttl
    }

    /// Record an incoming message: buffer it, fan it out to waiters
    /// and refresh the activity timestamp. Called by the driver (or
    /// by tests standing in for one).
    pub fn push_message(&self, message: serde_json::Value) {
        let message = Arc::new(message);
        {
            let mut buffer = self.buffer.lock().unwrap();
            if buffer.len() == BUFFER_CAPACITY {
                buffer.pop_front();
            }
            buffer.push_back((Instant::now(), Arc::clone(&message)));
        }
        *self.last_activity.lock().unwrap() = Instant::now();
        // Send only fails when no task is currently waiting.
        let _ = self.tx.send(message);
    }

    /// Most recent buffered message satisfying the predicate, without
    /// waiting. `max_age` restricts how old the message may be.
    pub fn latest<F>(&self, predicate: F, max_age: Option<Duration>) -> Option<serde_json::Value>
    where
        F: Fn(&serde_json::Value) -> bool,
    {
        let buffer = self.buffer.lock().unwrap();
        buffer
            .iter()
            .rev()
            .filter(|(at, _)| max_age.map_or(true, |limit| at.elapsed() <= limit))
            .find(|(_, msg)| predicate(msg.as_ref()))
            .map(|(_, msg)| (**msg).clone())
    }

    /// Suspend until a matching message arrives, up to `timeout`.
    /// Cancellation is the timeout elapsing; no external interrupt.
    pub async fn await_next<F>(
        &self,
        predicate: F,
        timeout: Duration,
    ) -> Result<serde_json::Value, RunnerError>
    where
        F: Fn(&serde_json::Value) -> bool,
    {
        let mut rx = self.tx.subscribe();
        let waiting = async {
            loop {
                match rx.recv().await {
                    Ok(msg) if predicate(msg.as_ref()) => return Ok((*msg).clone()),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(key = %self.key, skipped, "waiter lagged behind socket fan-out");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(RunnerError::Socket(format!(
                            "connection for {} closed while waiting",
                            self.key
                        )))
                    }
                }
            }
        };

        match tokio::time::timeout(timeout, waiting).await {
            Ok(result) => result,
            Err(_) => Err(RunnerError::SocketTimeout {
                waited_ms: timeout.as_millis() as u64,
            }),
        }
    }
}

// ============================================================================
// POOL
// ============================================================================

/// Process-wide socket registry, injected into execution contexts.
#[derive(Default)]
pub struct SocketPool {
    handles: DashMap<SocketKey, Arc<SocketHandle>>,
}

impl SocketPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert-if-absent. The boolean is true when this call created
    /// the handle, in which case the caller owns spawning a driver.
    pub fn get_or_create(&self, key: SocketKey, ttl: Duration) -> (Arc<SocketHandle>, bool) {
        use dashmap::mapref::entry::Entry;

        match self.handles.entry(key) {
            Entry::Occupied(e) => (Arc::clone(e.get()), false),
            Entry::Vacant(e) => {
                let handle = SocketHandle::new(e.key().clone(), ttl);
                e.insert(Arc::clone(&handle));
                (handle, true)
            }
        }
    }

    /// Drop a handle (stale or closed). The connection driver notices
    /// its receivers are gone and winds down on its own.
    pub fn evict(&self, key: &SocketKey) {
        self.handles.remove(key);
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

// ============================================================================
// DRIVER
// ============================================================================

/// Own the actual stream for one handle: connect, send the
/// subscription payload, then pump text frames into the handle until
/// the connection dies. Message-protocol parsing beyond JSON framing
/// and reconnect/backoff policy are not this layer's concern.
pub async fn drive(handle: Arc<SocketHandle>, url: Url, subscription: serde_json::Value) {
    let (mut stream, _) = match connect_async(url.as_str()).await {
        Ok(ok) => ok,
        Err(e) => {
            warn!(key = %handle.key(), error = %e, "websocket connect failed");
            handle.set_connectivity(Connectivity::Closed);
            return;
        }
    };

    if let Err(e) = stream.send(Message::Text(subscription.to_string().into())).await {
        warn!(key = %handle.key(), error = %e, "subscription send failed");
        handle.set_connectivity(Connectivity::Closed);
        return;
    }

    handle.set_connectivity(Connectivity::Open);
    debug!(key = %handle.key(), "websocket open");

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str(&text) {
                Ok(json) => handle.push_message(json),
                Err(e) => debug!(key = %handle.key(), error = %e, "non-JSON frame dropped"),
            },
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(key = %handle.key(), error = %e, "websocket read failed");
                break;
            }
        }
    }

    handle.set_connectivity(Connectivity::Closed);
    debug!(key = %handle.key(), "websocket closed");
}
