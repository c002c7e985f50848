use crate::broker::Backoff;
use crate::errors::{Error, Result};
use crate::model::CommandRow;
use crate::store::CommandStore;
use sqlx::postgres::{PgListener, PgPool};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Channel the `command_queue` insert trigger notifies on.
pub const TRIGGER_NOTIFY_CHANNEL: &str = "command_queue_insert";

/// What the command relay hears from the change stream.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    /// A row was inserted into the command queue.
    Inserted(CommandRow),
    /// The listener (re)connected. Notifications sent while it was away are
    /// lost, so the relay should reconcile against the table.
    Resynced,
}

/// Decodes the command id announced by the insert trigger.
pub fn decode_notification(payload: &str) -> Result<i64> {
    payload
        .trim()
        .parse()
        .map_err(|e| Error::MalformedPayload(format!("command notification {:?}: {}", payload, e)))
}

/// Listens for command-queue inserts and forwards them to the relay until
/// the receiving side goes away. Connection loss is retried with backoff.
pub async fn run_command_feed(
    pool: PgPool,
    channel: String,
    commands: Arc<dyn CommandStore>,
    tx: mpsc::Sender<FeedEvent>,
    mut backoff: Backoff,
) {
    loop {
        if tx.is_closed() {
            return;
        }

        let mut listener = match listen(&pool, &channel).await {
            Ok(listener) => listener,
            Err(e) => {
                let delay = backoff.next_delay();
                error!(
                    "Failed to listen on {}: {}. Retrying in {:?}",
                    channel, e, delay
                );
                tokio::time::sleep(delay).await;
                continue;
            }
        };

        backoff.reset();
        info!("Listening for command inserts on channel {}", channel);
        if tx.send(FeedEvent::Resynced).await.is_err() {
            return;
        }

        loop {
            match listener.try_recv().await {
                Ok(Some(notification)) => {
                    debug!("Command notification: {}", notification.payload());
                    let row = match decode_notification(notification.payload()) {
                        Ok(id) => load_command(commands.as_ref(), id).await,
                        Err(e) => {
                            warn!("Dropping command notification: {}", e);
                            None
                        }
                    };
                    if let Some(row) = row {
                        if tx.send(FeedEvent::Inserted(row)).await.is_err() {
                            info!("Command relay stopped, closing feed");
                            return;
                        }
                    }
                }
                Ok(None) => {
                    warn!("Command feed connection lost, reconnecting");
                    break;
                }
                Err(e) => {
                    error!("Command feed error: {}", e);
                    break;
                }
            }
        }
    }
}

/// A row that cannot be loaded stays `PENDING` and is picked up by the next
/// redelivery pass.
async fn load_command(commands: &dyn CommandStore, id: i64) -> Option<CommandRow> {
    match commands.get_command(id).await {
        Ok(Some(row)) => Some(row),
        Ok(None) => {
            warn!("Command {} announced but not found", id);
            None
        }
        Err(e) => {
            error!("Failed to load command {}: {}", id, e);
            None
        }
    }
}

async fn listen(pool: &PgPool, channel: &str) -> Result<PgListener> {
    let mut listener = PgListener::connect_with(pool).await?;
    listener.listen(channel).await?;
    Ok(listener)
}
