use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Broker connection failed: {0}")]
    Connection(String),

    #[error("Broker not connected")]
    NotConnected,

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("MQTT error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether a failed store write is worth another attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Persistence(_) => true,
            Error::Database(db_err) => is_transient_db_error(db_err),
            Error::Io(_) => true,

            Error::Connection(_)
            | Error::NotConnected
            | Error::MalformedPayload(_)
            | Error::Mqtt(_)
            | Error::Migration(_)
            | Error::Json(_)
            | Error::Config(_) => false,
        }
    }
}

fn is_transient_db_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| {
            code == "08000" || // connection_exception
            code == "08003" || // connection_does_not_exist
            code == "08006" || // connection_failure
            code == "57P03" || // cannot_connect_now
            code == "53300" // too_many_connections
        }),
        _ => false,
    }
}

pub type Result<T> = std::result::Result<T, Error>;
