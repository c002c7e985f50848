use crate::broker::Backoff;
use crate::config::Config;
use crate::errors::{Error, Result};
use crate::metrics::{
    INGEST_LATENCY_SECONDS, MALFORMED_MESSAGES_TOTAL, SAMPLES_DROPPED_TOTAL, SAMPLES_STORED_TOTAL,
};
use crate::model::{StoredSample, TelemetrySample};
use crate::store::TelemetryStore;
use crate::validate::parse_payload;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub max_attempts: u32,
    pub store_timeout: Duration,
    pub retry_initial: Duration,
    pub retry_max: Duration,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            store_timeout: Duration::from_secs(5),
            retry_initial: Duration::from_millis(100),
            retry_max: Duration::from_secs(2),
        }
    }
}

impl From<&Config> for IngestConfig {
    fn from(config: &Config) -> Self {
        Self {
            max_attempts: config.insert_max_retries,
            store_timeout: config.store_timeout,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    Stored(StoredSample),
    Malformed,
    Dropped,
}

/// Consumes the telemetry subscription and appends every well-formed
/// payload to the log, one at a time and in arrival order.
pub async fn run_ingest(
    mut rx: mpsc::Receiver<Vec<u8>>,
    store: Arc<dyn TelemetryStore>,
    config: IngestConfig,
) {
    info!(
        "Starting ingest pipeline with max_attempts={}, store_timeout={:?}",
        config.max_attempts, config.store_timeout
    );

    while let Some(payload) = rx.recv().await {
        ingest_payload(&payload, store.as_ref(), &config).await;
    }

    info!("Telemetry stream closed, ingest pipeline stopped");
}

pub async fn ingest_payload(
    payload: &[u8],
    store: &dyn TelemetryStore,
    config: &IngestConfig,
) -> IngestOutcome {
    let sample = match parse_payload(payload) {
        Ok(sample) => sample,
        Err(e) => {
            MALFORMED_MESSAGES_TOTAL.inc();
            warn!("Dropping telemetry ({} bytes): {}", payload.len(), e);
            return IngestOutcome::Malformed;
        }
    };

    match append_with_retry(store, &sample, config).await {
        Ok(stored) => {
            SAMPLES_STORED_TOTAL.inc();
            debug!(
                "Stored sample {} (status={:?}, led={})",
                stored.id,
                stored.sample.status,
                stored.sample.led_color.as_str()
            );
            IngestOutcome::Stored(stored)
        }
        Err(e) => {
            SAMPLES_DROPPED_TOTAL.inc();
            error!("CRITICAL: telemetry sample dropped: {}", e);
            IngestOutcome::Dropped
        }
    }
}

async fn append_with_retry(
    store: &dyn TelemetryStore,
    sample: &TelemetrySample,
    config: &IngestConfig,
) -> Result<StoredSample> {
    let start = Instant::now();
    let mut backoff = Backoff::new(config.retry_initial, config.retry_max);
    let mut attempt = 0;

    loop {
        attempt += 1;

        let result = match tokio::time::timeout(config.store_timeout, store.append_sample(sample)).await
        {
            Ok(result) => result,
            Err(_) => Err(Error::Persistence(format!(
                "insert timed out after {:?}",
                config.store_timeout
            ))),
        };

        match result {
            Ok(stored) => {
                let elapsed = start.elapsed().as_secs_f64();
                INGEST_LATENCY_SECONDS.observe(elapsed);
                if attempt > 1 {
                    info!(
                        "Sample stored after {} attempts in {:.3}s",
                        attempt, elapsed
                    );
                }
                return Ok(stored);
            }
            Err(e) => {
                if !e.is_transient() {
                    return Err(Error::Persistence(format!("non-retryable: {}", e)));
                }
                if attempt >= config.max_attempts {
                    return Err(Error::Persistence(format!(
                        "gave up after {} attempts: {}",
                        attempt, e
                    )));
                }

                let delay = backoff.next_delay();
                warn!(
                    "Failed to store sample (attempt {}/{}): {}. Retrying in {:?}",
                    attempt, config.max_attempts, e, delay
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
