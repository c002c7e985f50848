//! Broker transport seam shared by the ingest pipeline and the command relay.
//!
//! [`Transport`] is implemented by the MQTT adapter in [`crate::mqtt`] and by
//! [`MemoryTransport`], which tests and local wiring use in place of a broker.

use crate::errors::{Error, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
        };
        f.write_str(s)
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Registers a subscription and returns its payload stream. The
    /// subscription survives reconnects; the stream ends only when the
    /// transport is dropped.
    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<Vec<u8>>>;

    /// Hands one message to the transport. Fails with
    /// [`Error::NotConnected`] instead of waiting for a session.
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()>;

    fn state(&self) -> ConnectionState;

    fn watch_state(&self) -> watch::Receiver<ConnectionState>;
}

/// Bounded exponential backoff: `initial`, doubling up to `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let max = max.max(initial);
        Self {
            initial,
            max,
            next: initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.next = self.initial;
    }
}

/// MQTT topic filter matching with `+` and `#` wildcards.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

pub(crate) struct Subscription {
    pub(crate) filter: String,
    pub(crate) tx: mpsc::Sender<Vec<u8>>,
}

/// In-process transport. Messages are delivered with [`MemoryTransport::deliver`]
/// and publishes are recorded for inspection.
pub struct MemoryTransport {
    capacity: usize,
    state_tx: watch::Sender<ConnectionState>,
    subscriptions: Mutex<Vec<Subscription>>,
    published: Mutex<Vec<(String, Vec<u8>)>>,
}

impl MemoryTransport {
    pub fn new(capacity: usize) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Connected);
        Self {
            capacity,
            state_tx,
            subscriptions: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
        }
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }

    /// Routes a message to matching subscribers. Like a broker without
    /// retained messages, nothing is delivered while disconnected.
    pub async fn deliver(&self, topic: &str, payload: &[u8]) -> usize {
        if self.state() != ConnectionState::Connected {
            debug!("Dropping message on {} while disconnected", topic);
            return 0;
        }

        let targets: Vec<mpsc::Sender<Vec<u8>>> = match self.subscriptions.lock() {
            Ok(subs) => subs
                .iter()
                .filter(|s| topic_matches(&s.filter, topic))
                .map(|s| s.tx.clone())
                .collect(),
            Err(_) => return 0,
        };

        let mut delivered = 0;
        for tx in targets {
            if tx.send(payload.to_vec()).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.published
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<Vec<u8>>> {
        let (tx, rx) = mpsc::channel(self.capacity.max(1));
        self.subscriptions
            .lock()
            .map_err(|_| Error::Connection("subscription table poisoned".to_string()))?
            .push(Subscription {
                filter: topic.to_string(),
                tx,
            });
        Ok(rx)
    }

    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
        if self.state() != ConnectionState::Connected {
            return Err(Error::NotConnected);
        }
        self.published
            .lock()
            .map_err(|_| Error::NotConnected)?
            .push((topic.to_string(), payload.to_vec()));
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }
}
