mod telemetry;

use clap::Parser;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::time::Duration;
use telemetry::Installation;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Field-device simulator for the flood-control installation.
#[derive(Debug, Parser)]
struct Args {
    #[arg(long, env = "MQTT_BROKER", default_value = "localhost")]
    broker: String,

    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    port: u16,

    #[arg(long, env = "TELEMETRY_TOPIC", default_value = "myproject/report")]
    telemetry_topic: String,

    #[arg(long, env = "COMMAND_TOPIC", default_value = "myproject/manual_pump")]
    command_topic: String,

    /// Milliseconds between reports
    #[arg(long, env = "INTERVAL_MS", default_value_t = 2000)]
    interval_ms: u64,

    /// Chance that a weather change brings rain
    #[arg(long, env = "RAIN_PROBABILITY", default_value_t = 0.4)]
    rain_probability: f64,

    /// Fraction of reports deliberately sent truncated
    #[arg(long, env = "MALFORMED_RATIO", default_value_t = 0.0)]
    malformed_ratio: f64,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("Starting flood device simulator");
    info!(
        "Broker: {}:{}, report every {}ms on {}",
        args.broker, args.port, args.interval_ms, args.telemetry_topic
    );

    let client_id = format!("flood-device-{}", uuid::Uuid::new_v4());

    let mut mqtt_options = MqttOptions::new(&client_id, &args.broker, args.port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(true);

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 100);
    let (command_tx, mut command_rx) = mpsc::channel::<String>(16);

    // Spawn eventloop handler; resubscribes after every reconnect
    let command_topic = args.command_topic.clone();
    let sub_client = client.clone();
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("Connected, listening for commands on {}", command_topic);
                    if let Err(e) = sub_client.try_subscribe(command_topic.as_str(), QoS::AtMostOnce) {
                        error!("Failed to subscribe to {}: {}", command_topic, e);
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let payload = String::from_utf8_lossy(&publish.payload).to_string();
                    if command_tx.send(payload).await.is_err() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    error!("MQTT eventloop error: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });

    let mut rng = rand::thread_rng();
    let mut installation = Installation::default();
    let mut ticker = tokio::time::interval(Duration::from_millis(args.interval_ms.max(10)));
    let mut counter = 0u64;

    loop {
        tokio::select! {
            Some(command) = command_rx.recv() => {
                installation.apply_command(&command);
                info!("Command {:?} received, manual pump {}", command,
                    if installation.manual_pump() { "ON" } else { "OFF (auto)" });
            }
            _ = ticker.tick() => {
                installation.step(&mut rng, args.rain_probability);
                let report = installation.report();

                let mut payload = match serde_json::to_string(&report) {
                    Ok(p) => p,
                    Err(e) => {
                        error!("Failed to serialize telemetry: {}", e);
                        continue;
                    }
                };
                if rand::Rng::gen_bool(&mut rng, telemetry::probability(args.malformed_ratio)) {
                    payload.truncate(payload.len() / 2);
                    debug!("Sending truncated report");
                }

                match client.publish(&args.telemetry_topic, QoS::AtMostOnce, false, payload).await {
                    Ok(_) => {
                        counter += 1;
                        debug!("Report {}: river={} status={}", counter, report.river_level, report.status);
                    }
                    Err(e) => {
                        warn!("Failed to publish: {}", e);
                    }
                }

                if counter % 100 == 0 && counter > 0 {
                    info!("Published {} reports", counter);
                }
            }
        }
    }
}
