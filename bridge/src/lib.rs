//! Telemetry and command bridge for the flood-control installation.
//!
//! Device telemetry arrives over MQTT and is appended to the `flood_logs`
//! table; operator commands inserted into `command_queue` are picked up from
//! the change stream and published back to the device as `ON`/`OFF`.

pub mod broker;
pub mod config;
pub mod db;
pub mod errors;
pub mod feed;
pub mod ingest;
pub mod metrics;
pub mod model;
pub mod mqtt;
pub mod relay;
pub mod rest;
pub mod store;
pub mod validate;
