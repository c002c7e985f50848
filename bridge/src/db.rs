use crate::errors::{Error, Result};
use crate::metrics::DB_FAILURES_TOTAL;
use crate::model::{CommandRow, StoredSample, TelemetrySample};
use crate::store::{CommandStore, TelemetryStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::future::Future;
use std::time::Duration;
use tracing::info;

pub async fn make_pool(database_url: &str) -> Result<PgPool> {
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;

    info!("Database connection established");
    info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Migrations completed");

    Ok(pool)
}

/// PostgreSQL-backed telemetry log and command queue.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
    timeout: Duration,
}

#[derive(Debug, sqlx::FromRow)]
struct SampleRow {
    id: i64,
    river_level: f64,
    tank1_level: f64,
    tank2_level: f64,
    rain_status: String,
    status: String,
    buzzer_state: bool,
    led_color: String,
    flow_rate1: f64,
    flow_rate2: f64,
    valve1_state: f64,
    valve2_state: f64,
    created_at: DateTime<Utc>,
}

impl TryFrom<SampleRow> for StoredSample {
    type Error = Error;

    fn try_from(row: SampleRow) -> Result<Self> {
        Ok(StoredSample {
            id: row.id,
            sample: TelemetrySample {
                river_level: row.river_level,
                tank1_level: row.tank1_level,
                tank2_level: row.tank2_level,
                rain_status: row.rain_status.parse().map_err(Error::Persistence)?,
                status: row.status,
                buzzer_state: row.buzzer_state,
                led_color: row.led_color.parse().map_err(Error::Persistence)?,
                flow_rate1: row.flow_rate1,
                flow_rate2: row.flow_rate2,
                valve1_state: row.valve1_state,
                valve2_state: row.valve2_state,
            },
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct CommandRecord {
    id: i64,
    command_type: Option<String>,
    created_at: DateTime<Utc>,
    delivery_state: String,
    forwarded_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

impl TryFrom<CommandRecord> for CommandRow {
    type Error = Error;

    fn try_from(record: CommandRecord) -> Result<Self> {
        Ok(CommandRow {
            id: record.id,
            command_type: record.command_type,
            created_at: record.created_at,
            delivery_state: record.delivery_state.parse().map_err(Error::Persistence)?,
            forwarded_at: record.forwarded_at,
            last_error: record.last_error,
        })
    }
}

const SAMPLE_COLUMNS: &str = "id, river_level, tank1_level, tank2_level, rain_status, status, \
     buzzer_state, led_color, flow_rate1, flow_rate2, valve1_state, valve2_state, created_at";

const COMMAND_COLUMNS: &str =
    "id, command_type, created_at, delivery_state, forwarded_at, last_error";

impl PgStore {
    pub fn new(pool: PgPool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Bounds a query by the store timeout; an elapsed timeout is a
    /// transient persistence error.
    async fn bounded<T, F>(&self, op: &str, query: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, sqlx::Error>> + Send,
    {
        match tokio::time::timeout(self.timeout, query).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                DB_FAILURES_TOTAL.inc();
                Err(Error::Database(e))
            }
            Err(_) => {
                DB_FAILURES_TOTAL.inc();
                Err(Error::Persistence(format!(
                    "{} timed out after {:?}",
                    op, self.timeout
                )))
            }
        }
    }

    async fn set_delivery(&self, id: i64, query: &str, reason: Option<&str>) -> Result<()> {
        let result = self
            .bounded(
                "update command",
                sqlx::query(query).bind(id).bind(reason).execute(&self.pool),
            )
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::Persistence(format!(
                "command {} not found or already forwarded",
                id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl TelemetryStore for PgStore {
    async fn append_sample(&self, sample: &TelemetrySample) -> Result<StoredSample> {
        // created_at never falls behind the newest row, even if the server
        // clock steps backwards.
        let query = r#"
            INSERT INTO flood_logs (
                river_level, tank1_level, tank2_level, rain_status, status,
                buzzer_state, led_color, flow_rate1, flow_rate2,
                valve1_state, valve2_state, created_at
            )
            VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11,
                GREATEST(
                    clock_timestamp(),
                    COALESCE((SELECT max(created_at) FROM flood_logs), '-infinity'::timestamptz)
                )
            )
            RETURNING id, created_at
            "#;

        let (id, created_at): (i64, DateTime<Utc>) = self
            .bounded(
                "insert sample",
                sqlx::query_as(query)
                    .bind(sample.river_level)
                    .bind(sample.tank1_level)
                    .bind(sample.tank2_level)
                    .bind(sample.rain_status.as_str())
                    .bind(&sample.status)
                    .bind(sample.buzzer_state)
                    .bind(sample.led_color.as_str())
                    .bind(sample.flow_rate1)
                    .bind(sample.flow_rate2)
                    .bind(sample.valve1_state)
                    .bind(sample.valve2_state)
                    .fetch_one(&self.pool),
            )
            .await?;

        Ok(StoredSample {
            id,
            sample: sample.clone(),
            created_at,
        })
    }

    async fn latest_sample(&self) -> Result<Option<StoredSample>> {
        let query = format!(
            "SELECT {} FROM flood_logs ORDER BY created_at DESC, id DESC LIMIT 1",
            SAMPLE_COLUMNS
        );

        let row: Option<SampleRow> = self
            .bounded(
                "select latest sample",
                sqlx::query_as(&query).fetch_optional(&self.pool),
            )
            .await?;

        row.map(StoredSample::try_from).transpose()
    }

    async fn recent_samples(&self, limit: usize) -> Result<Vec<StoredSample>> {
        let query = format!(
            "SELECT {} FROM flood_logs ORDER BY created_at DESC, id DESC LIMIT $1",
            SAMPLE_COLUMNS
        );

        let rows: Vec<SampleRow> = self
            .bounded(
                "select recent samples",
                sqlx::query_as(&query)
                    .bind(limit as i64)
                    .fetch_all(&self.pool),
            )
            .await?;

        rows.into_iter().map(StoredSample::try_from).collect()
    }
}

#[async_trait]
impl CommandStore for PgStore {
    async fn insert_command(&self, command_type: &str) -> Result<CommandRow> {
        let query = format!(
            "INSERT INTO command_queue (command_type) VALUES ($1) RETURNING {}",
            COMMAND_COLUMNS
        );

        let record: CommandRecord = self
            .bounded(
                "insert command",
                sqlx::query_as(&query)
                    .bind(command_type)
                    .fetch_one(&self.pool),
            )
            .await?;

        CommandRow::try_from(record)
    }

    async fn mark_forwarded(&self, id: i64) -> Result<()> {
        self.set_delivery(
            id,
            "UPDATE command_queue \
             SET delivery_state = 'FORWARDED', forwarded_at = now(), last_error = $2 \
             WHERE id = $1",
            None,
        )
        .await
    }

    async fn mark_failed(&self, id: i64, reason: &str) -> Result<()> {
        self.set_delivery(
            id,
            "UPDATE command_queue \
             SET delivery_state = 'FAILED', last_error = $2 \
             WHERE id = $1 AND delivery_state <> 'FORWARDED'",
            Some(reason),
        )
        .await
    }

    async fn get_command(&self, id: i64) -> Result<Option<CommandRow>> {
        let query = format!("SELECT {} FROM command_queue WHERE id = $1", COMMAND_COLUMNS);

        let record: Option<CommandRecord> = self
            .bounded(
                "select command",
                sqlx::query_as(&query).bind(id).fetch_optional(&self.pool),
            )
            .await?;

        record.map(CommandRow::try_from).transpose()
    }

    async fn undelivered_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<CommandRow>> {
        let query = format!(
            "SELECT {} FROM command_queue \
             WHERE delivery_state <> 'FORWARDED' AND created_at >= $1 \
               AND id > COALESCE( \
                   (SELECT max(id) FROM command_queue WHERE delivery_state = 'FORWARDED'), 0) \
             ORDER BY created_at ASC, id ASC",
            COMMAND_COLUMNS
        );

        let records: Vec<CommandRecord> = self
            .bounded(
                "select undelivered commands",
                sqlx::query_as(&query).bind(cutoff).fetch_all(&self.pool),
            )
            .await?;

        records.into_iter().map(CommandRow::try_from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DeliveryState, LedColor, RainStatus};

    #[test]
    fn test_sample_row_conversion() {
        let row = SampleRow {
            id: 3,
            river_level: 450.0,
            tank1_level: 300.0,
            tank2_level: 200.0,
            rain_status: "RAINING".to_string(),
            status: "PUMPING OUT".to_string(),
            buzzer_state: true,
            led_color: "BLUE".to_string(),
            flow_rate1: 12.5,
            flow_rate2: 8.0,
            valve1_state: 1.0,
            valve2_state: 0.0,
            created_at: Utc::now(),
        };

        let stored = StoredSample::try_from(row).unwrap();
        assert_eq!(stored.id, 3);
        assert_eq!(stored.sample.rain_status, RainStatus::Raining);
        assert_eq!(stored.sample.led_color, LedColor::Blue);
    }

    #[test]
    fn test_corrupt_row_is_persistence_error() {
        let record = CommandRecord {
            id: 1,
            command_type: Some("PUMP_ON".to_string()),
            created_at: Utc::now(),
            delivery_state: "LOST".to_string(),
            forwarded_at: None,
            last_error: None,
        };
        assert!(matches!(
            CommandRow::try_from(record),
            Err(Error::Persistence(_))
        ));

        let record = CommandRecord {
            id: 1,
            command_type: None,
            created_at: Utc::now(),
            delivery_state: "FAILED".to_string(),
            forwarded_at: None,
            last_error: Some("Broker not connected".to_string()),
        };
        let row = CommandRow::try_from(record).unwrap();
        assert_eq!(row.delivery_state, DeliveryState::Failed);
    }
}
