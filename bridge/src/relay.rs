use crate::broker::{ConnectionState, Transport};
use crate::config::Config;
use crate::errors::Result;
use crate::feed::FeedEvent;
use crate::metrics::{COMMANDS_FAILED_TOTAL, COMMANDS_FORWARDED_TOTAL, COMMANDS_REDELIVERED_TOTAL};
use crate::model::{CommandRow, DeviceInstruction};
use crate::store::CommandStore;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub command_topic: String,
    /// Re-forward undelivered commands after a broker reconnect or a change
    /// stream resync. When off, a command that fails to publish stays failed.
    pub redelivery: bool,
    /// Undelivered commands older than this are left alone.
    pub max_age: Duration,
}

impl From<&Config> for RelayConfig {
    fn from(config: &Config) -> Self {
        Self {
            command_topic: config.command_topic.clone(),
            redelivery: config.command_redelivery,
            max_age: config.command_max_age,
        }
    }
}

/// Forwards operator commands from the change stream to the device.
pub struct CommandRelay {
    transport: Arc<dyn Transport>,
    commands: Arc<dyn CommandStore>,
    config: RelayConfig,
    /// Newest command id published to the device. Anything at or below it
    /// is either a duplicate or superseded by a newer instruction.
    last_forwarded: Option<i64>,
}

impl CommandRelay {
    pub fn new(
        transport: Arc<dyn Transport>,
        commands: Arc<dyn CommandStore>,
        config: RelayConfig,
    ) -> Self {
        Self {
            transport,
            commands,
            config,
            last_forwarded: None,
        }
    }

    pub async fn run(mut self, mut events: mpsc::Receiver<FeedEvent>) {
        info!(
            "Starting command relay on topic {} (redelivery={})",
            self.config.command_topic, self.config.redelivery
        );

        let mut state_rx = self.transport.watch_state();
        state_rx.borrow_and_update();
        let mut watching = true;

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(FeedEvent::Inserted(row)) => {
                        if self.is_superseded(row.id) {
                            debug!("Command {} already forwarded or superseded, skipping", row.id);
                            continue;
                        }
                        if let Err(e) = self.forward(&row).await {
                            debug!(
                                "Command {} left {} ({})",
                                row.id,
                                if self.config.redelivery { "for redelivery" } else { "failed" },
                                e
                            );
                        }
                    }
                    Some(FeedEvent::Resynced) => {
                        if self.config.redelivery {
                            self.redeliver("change stream resynced").await;
                        }
                    }
                    None => break,
                },
                changed = state_rx.changed(), if watching => {
                    if changed.is_err() {
                        warn!("Transport state channel closed");
                        watching = false;
                        continue;
                    }
                    let state = *state_rx.borrow_and_update();
                    debug!("Transport state is now {}", state);
                    if state == ConnectionState::Connected && self.config.redelivery {
                        self.redeliver("broker reconnected").await;
                    }
                }
            }
        }

        info!("Command stream closed, relay stopped");
    }

    /// Publishes the device instruction for one command and records the
    /// outcome on the row. Failures are not retried here.
    pub async fn forward(&mut self, row: &CommandRow) -> Result<DeviceInstruction> {
        let instruction = DeviceInstruction::for_command(row.command_type.as_deref());
        info!(
            "Command {} ({:?}) -> {}",
            row.id, row.command_type, instruction
        );

        match self
            .transport
            .publish(&self.config.command_topic, instruction.as_str().as_bytes())
            .await
        {
            Ok(()) => {
                COMMANDS_FORWARDED_TOTAL
                    .with_label_values(&[instruction.as_str()])
                    .inc();
                self.last_forwarded = Some(
                    self.last_forwarded.map_or(row.id, |last| last.max(row.id)),
                );
                if let Err(e) = self.commands.mark_forwarded(row.id).await {
                    warn!("Command {} forwarded but not marked: {}", row.id, e);
                }
                Ok(instruction)
            }
            Err(e) => {
                COMMANDS_FAILED_TOTAL.inc();
                error!("Command {} not forwarded: {}", row.id, e);
                if let Err(mark_err) = self.commands.mark_failed(row.id, &e.to_string()).await {
                    warn!("Command {} failure not recorded: {}", row.id, mark_err);
                }
                Err(e)
            }
        }
    }

    /// Re-forwards undelivered commands within the age window, oldest first,
    /// skipping any that a newer forwarded command has superseded. Returns
    /// how many were published.
    pub async fn redeliver(&mut self, reason: &str) -> usize {
        if self.transport.state() != ConnectionState::Connected {
            debug!("Skipping redelivery ({}): transport not connected", reason);
            return 0;
        }

        let max_age = chrono::Duration::from_std(self.config.max_age)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let cutoff = Utc::now() - max_age;

        let pending = match self.commands.undelivered_since(cutoff).await {
            Ok(pending) => pending,
            Err(e) => {
                error!("Cannot load undelivered commands ({}): {}", reason, e);
                return 0;
            }
        };

        let pending: Vec<CommandRow> = pending
            .into_iter()
            .filter(|row| !self.is_superseded(row.id))
            .collect();

        if pending.is_empty() {
            return 0;
        }

        info!("Redelivering {} command(s): {}", pending.len(), reason);
        let mut delivered = 0;
        for row in &pending {
            if self.forward(row).await.is_err() {
                warn!("Redelivery interrupted, {} command(s) left", pending.len() - delivered);
                break;
            }
            COMMANDS_REDELIVERED_TOTAL.inc();
            delivered += 1;
        }
        delivered
    }

    fn is_superseded(&self, id: i64) -> bool {
        self.last_forwarded.is_some_and(|last| id <= last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryTransport;
    use crate::errors::Error;
    use crate::model::DeliveryState;
    use crate::store::InMemoryStore;

    const TOPIC: &str = "myproject/manual_pump";

    fn relay_config(redelivery: bool) -> RelayConfig {
        RelayConfig {
            command_topic: TOPIC.to_string(),
            redelivery,
            max_age: Duration::from_secs(300),
        }
    }

    fn payloads(transport: &MemoryTransport) -> Vec<String> {
        transport
            .published()
            .into_iter()
            .map(|(topic, payload)| {
                assert_eq!(topic, TOPIC);
                String::from_utf8(payload).unwrap()
            })
            .collect()
    }

    #[tokio::test]
    async fn test_forward_maps_every_command_type() {
        let transport = Arc::new(MemoryTransport::default());
        let store = Arc::new(InMemoryStore::new());
        let mut relay = CommandRelay::new(transport.clone(), store.clone(), relay_config(false));

        for command_type in ["PUMP_ON", "PUMP_OFF", "", "DRAIN_TANKS", "pump_on"] {
            let row = store.insert_command(command_type).await.unwrap();
            relay.forward(&row).await.unwrap();
        }

        assert_eq!(payloads(&transport), vec!["ON", "OFF", "OFF", "OFF", "OFF"]);
        assert!(store
            .commands()
            .await
            .iter()
            .all(|c| c.delivery_state == DeliveryState::Forwarded));
    }

    #[tokio::test]
    async fn test_forward_while_disconnected_marks_failed() {
        let transport = Arc::new(MemoryTransport::default());
        transport.set_state(ConnectionState::Disconnected);
        let store = Arc::new(InMemoryStore::new());
        let mut relay = CommandRelay::new(transport.clone(), store.clone(), relay_config(false));

        let row = store.insert_command("PUMP_OFF").await.unwrap();
        let err = relay.forward(&row).await.unwrap_err();
        assert!(matches!(err, Error::NotConnected));
        assert!(transport.published().is_empty());

        let commands = store.commands().await;
        assert_eq!(commands[0].delivery_state, DeliveryState::Failed);
        assert_eq!(commands[0].last_error.as_deref(), Some("Broker not connected"));
    }

    #[tokio::test]
    async fn test_redeliver_forwards_oldest_first() {
        let transport = Arc::new(MemoryTransport::default());
        transport.set_state(ConnectionState::Disconnected);
        let store = Arc::new(InMemoryStore::new());
        let mut relay = CommandRelay::new(transport.clone(), store.clone(), relay_config(true));

        for command_type in ["PUMP_ON", "PUMP_OFF"] {
            let row = store.insert_command(command_type).await.unwrap();
            assert!(relay.forward(&row).await.is_err());
        }

        assert_eq!(relay.redeliver("test").await, 0);

        transport.set_state(ConnectionState::Connected);
        assert_eq!(relay.redeliver("test").await, 2);
        assert_eq!(payloads(&transport), vec!["ON", "OFF"]);

        // nothing left to deliver
        assert_eq!(relay.redeliver("test").await, 0);
    }

    #[tokio::test]
    async fn test_redeliver_ignores_commands_past_max_age() {
        let transport = Arc::new(MemoryTransport::default());
        let store = Arc::new(InMemoryStore::new());
        let config = RelayConfig {
            max_age: Duration::ZERO,
            ..relay_config(true)
        };
        let mut relay = CommandRelay::new(transport.clone(), store.clone(), config);

        store.insert_command("PUMP_ON").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(relay.redeliver("test").await, 0);
        assert!(transport.published().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_notification_is_skipped() {
        let transport = Arc::new(MemoryTransport::default());
        let store = Arc::new(InMemoryStore::new());
        let relay = CommandRelay::new(transport.clone(), store.clone(), relay_config(true));

        let (tx, rx) = mpsc::channel(8);
        let handle = tokio::spawn(relay.run(rx));

        let row = store.insert_command("PUMP_ON").await.unwrap();
        // the resync pass forwards the pending row before its notification arrives
        tx.send(FeedEvent::Resynced).await.unwrap();
        tx.send(FeedEvent::Inserted(row)).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(payloads(&transport), vec!["ON"]);
    }

    #[tokio::test]
    async fn test_newer_command_supersedes_failed_one() {
        let transport = Arc::new(MemoryTransport::default());
        transport.set_state(ConnectionState::Disconnected);
        let store = Arc::new(InMemoryStore::new());
        let mut relay = CommandRelay::new(transport.clone(), store.clone(), relay_config(true));

        let on = store.insert_command("PUMP_ON").await.unwrap();
        assert!(relay.forward(&on).await.is_err());

        transport.set_state(ConnectionState::Connected);
        let off = store.insert_command("PUMP_OFF").await.unwrap();
        relay.forward(&off).await.unwrap();

        assert_eq!(relay.redeliver("broker reconnected").await, 0);
        assert_eq!(payloads(&transport), vec!["OFF"]);
        assert_eq!(store.commands().await[0].delivery_state, DeliveryState::Failed);
    }

    #[tokio::test]
    async fn test_stale_notification_after_newer_forward_is_skipped() {
        let transport = Arc::new(MemoryTransport::default());
        let store = Arc::new(InMemoryStore::new());
        let relay = CommandRelay::new(transport.clone(), store.clone(), relay_config(false));

        let on = store.insert_command("PUMP_ON").await.unwrap();
        let off = store.insert_command("PUMP_OFF").await.unwrap();

        let (tx, rx) = mpsc::channel(8);
        let handle = tokio::spawn(relay.run(rx));
        tx.send(FeedEvent::Inserted(off)).await.unwrap();
        tx.send(FeedEvent::Inserted(on)).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(payloads(&transport), vec!["OFF"]);
    }

    #[tokio::test]
    async fn test_oversized_command_type_maps_to_off() {
        let transport = Arc::new(MemoryTransport::default());
        let store = Arc::new(InMemoryStore::new());
        let mut relay = CommandRelay::new(transport.clone(), store.clone(), relay_config(false));

        let row = store.insert_command(&"PUMP_ON".repeat(1500)).await.unwrap();
        assert_eq!(relay.forward(&row).await.unwrap(), DeviceInstruction::Off);
        assert_eq!(payloads(&transport), vec!["OFF"]);
    }
}
