//! Persistence seams for the telemetry log and the command queue.
//!
//! The PostgreSQL implementation lives in [`crate::db`]; [`InMemoryStore`]
//! backs tests and local wiring.

use crate::errors::{Error, Result};
use crate::feed::FeedEvent;
use crate::model::{CommandRow, DeliveryState, StoredSample, TelemetrySample};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::warn;

/// Append-only telemetry log.
#[async_trait]
pub trait TelemetryStore: Send + Sync {
    /// Appends one sample. `created_at` is assigned by the store and never
    /// precedes that of an earlier append.
    async fn append_sample(&self, sample: &TelemetrySample) -> Result<StoredSample>;

    async fn latest_sample(&self) -> Result<Option<StoredSample>>;

    /// Up to `limit` samples, newest first.
    async fn recent_samples(&self, limit: usize) -> Result<Vec<StoredSample>>;
}

/// Operator command queue with delivery bookkeeping.
#[async_trait]
pub trait CommandStore: Send + Sync {
    async fn insert_command(&self, command_type: &str) -> Result<CommandRow>;

    async fn mark_forwarded(&self, id: i64) -> Result<()>;

    async fn mark_failed(&self, id: i64, reason: &str) -> Result<()>;

    async fn get_command(&self, id: i64) -> Result<Option<CommandRow>>;

    /// Commands still `PENDING` or `FAILED` created at or after `cutoff`,
    /// oldest first. Rows older than the newest `FORWARDED` command are
    /// superseded and never returned.
    async fn undelivered_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<CommandRow>>;
}

#[derive(Default)]
struct CommandTable {
    rows: Vec<CommandRow>,
    listeners: Vec<mpsc::Sender<FeedEvent>>,
}

/// In-memory store. Inserted commands are pushed to every receiver obtained
/// from [`InMemoryStore::command_events`], the way the database trigger
/// notifies listeners.
#[derive(Default)]
pub struct InMemoryStore {
    samples: Mutex<Vec<StoredSample>>,
    commands: Mutex<CommandTable>,
    failing_appends: AtomicUsize,
    append_delay: Mutex<Option<Duration>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` appends fail with a transient error.
    pub fn fail_next_appends(&self, count: usize) {
        self.failing_appends.store(count, Ordering::SeqCst);
    }

    pub async fn set_append_delay(&self, delay: Option<Duration>) {
        *self.append_delay.lock().await = delay;
    }

    pub async fn command_events(&self, capacity: usize) -> mpsc::Receiver<FeedEvent> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.commands.lock().await.listeners.push(tx);
        rx
    }

    pub async fn samples(&self) -> Vec<StoredSample> {
        self.samples.lock().await.clone()
    }

    pub async fn commands(&self) -> Vec<CommandRow> {
        self.commands.lock().await.rows.clone()
    }

    async fn update_command<F>(&self, id: i64, update: F) -> Result<()>
    where
        F: FnOnce(&mut CommandRow) + Send,
    {
        let mut table = self.commands.lock().await;
        match table.rows.iter_mut().find(|row| row.id == id) {
            Some(row) => {
                update(row);
                Ok(())
            }
            None => Err(Error::Persistence(format!("command {} not found", id))),
        }
    }
}

#[async_trait]
impl TelemetryStore for InMemoryStore {
    async fn append_sample(&self, sample: &TelemetrySample) -> Result<StoredSample> {
        let delay = *self.append_delay.lock().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failing = self
            .failing_appends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(Error::Persistence("store unavailable".to_string()));
        }

        let mut samples = self.samples.lock().await;
        let now = Utc::now();
        let created_at = samples
            .last()
            .map_or(now, |last| last.created_at.max(now));
        let stored = StoredSample {
            id: samples.len() as i64 + 1,
            sample: sample.clone(),
            created_at,
        };
        samples.push(stored.clone());
        Ok(stored)
    }

    async fn latest_sample(&self) -> Result<Option<StoredSample>> {
        Ok(self.samples.lock().await.last().cloned())
    }

    async fn recent_samples(&self, limit: usize) -> Result<Vec<StoredSample>> {
        Ok(self
            .samples
            .lock()
            .await
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl CommandStore for InMemoryStore {
    async fn insert_command(&self, command_type: &str) -> Result<CommandRow> {
        let mut table = self.commands.lock().await;
        let row = CommandRow {
            id: table.rows.len() as i64 + 1,
            command_type: Some(command_type.to_string()),
            created_at: Utc::now(),
            delivery_state: DeliveryState::Pending,
            forwarded_at: None,
            last_error: None,
        };
        table.rows.push(row.clone());

        table.listeners.retain(|tx| !tx.is_closed());
        for tx in &table.listeners {
            if tx.try_send(FeedEvent::Inserted(row.clone())).is_err() {
                warn!("Command listener lagging, notification for {} lost", row.id);
            }
        }

        Ok(row)
    }

    async fn mark_forwarded(&self, id: i64) -> Result<()> {
        self.update_command(id, |row| {
            row.delivery_state = DeliveryState::Forwarded;
            row.forwarded_at = Some(Utc::now());
            row.last_error = None;
        })
        .await
    }

    async fn mark_failed(&self, id: i64, reason: &str) -> Result<()> {
        let reason = reason.to_string();
        self.update_command(id, move |row| {
            row.delivery_state = DeliveryState::Failed;
            row.last_error = Some(reason);
        })
        .await
    }

    async fn get_command(&self, id: i64) -> Result<Option<CommandRow>> {
        Ok(self
            .commands
            .lock()
            .await
            .rows
            .iter()
            .find(|row| row.id == id)
            .cloned())
    }

    async fn undelivered_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<CommandRow>> {
        let table = self.commands.lock().await;
        let newest_forwarded = table
            .rows
            .iter()
            .filter(|row| row.delivery_state == DeliveryState::Forwarded)
            .map(|row| row.id)
            .max()
            .unwrap_or(0);

        Ok(table
            .rows
            .iter()
            .filter(|row| row.delivery_state != DeliveryState::Forwarded)
            .filter(|row| row.id > newest_forwarded)
            .filter(|row| row.created_at >= cutoff)
            .cloned()
            .collect())
    }
}
