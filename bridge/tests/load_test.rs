//! Broker load tests. They need a running broker and bridge:
//! `cargo test -p bridge --test load_test -- --ignored`

use bridge::model::{LedColor, RainStatus, TelemetrySample};
use rand::Rng;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::time::{Duration, Instant};
use tokio::time::sleep;

const TELEMETRY_TOPIC: &str = "myproject/report";
const COMMAND_TOPIC: &str = "myproject/manual_pump";

fn random_sample(rng: &mut impl Rng) -> TelemetrySample {
    let raining = rng.gen_bool(0.3);
    TelemetrySample {
        river_level: rng.gen_range(50.0..600.0),
        tank1_level: rng.gen_range(0.0..500.0),
        tank2_level: rng.gen_range(0.0..500.0),
        rain_status: if raining { RainStatus::Raining } else { RainStatus::Normal },
        status: if raining { "PUMPING OUT" } else { "NORMAL" }.to_string(),
        buzzer_state: rng.gen_bool(0.1),
        led_color: if raining { LedColor::Blue } else { LedColor::Green },
        flow_rate1: rng.gen_range(0.0..20.0),
        flow_rate2: rng.gen_range(0.0..20.0),
        valve1_state: if rng.gen_bool(0.5) { 1.0 } else { 0.0 },
        valve2_state: if rng.gen_bool(0.5) { 1.0 } else { 0.0 },
    }
}

#[tokio::test]
#[ignore]
async fn test_sustained_device_reports() {
    let total_messages = 5_000;
    let target_rate = 500;

    let mut mqtt_options = MqttOptions::new("load-test-device", "localhost", 1883);
    mqtt_options.set_keep_alive(Duration::from_secs(30));

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 10_000);

    tokio::spawn(async move {
        loop {
            if let Err(e) = eventloop.poll().await {
                eprintln!("MQTT error: {}", e);
                break;
            }
        }
    });

    sleep(Duration::from_millis(500)).await;

    let mut rng = rand::thread_rng();
    let start = Instant::now();
    let mut sent_count = 0;
    let mut error_count = 0;

    let burst_size = 50;
    let delay_per_burst = Duration::from_micros((burst_size * 1_000_000) / target_rate);

    for _ in 0..(total_messages / burst_size) {
        for _ in 0..burst_size {
            let payload = serde_json::to_string(&random_sample(&mut rng)).unwrap();
            match client
                .publish(TELEMETRY_TOPIC, QoS::AtLeastOnce, false, payload)
                .await
            {
                Ok(_) => sent_count += 1,
                Err(e) => {
                    error_count += 1;
                    if error_count < 10 {
                        eprintln!("Send error: {}", e);
                    }
                }
            }
        }
        sleep(delay_per_burst).await;
    }

    let duration = start.elapsed();
    println!(
        "Sent {} reports in {:.2}s ({:.0} msg/s), {} errors",
        sent_count,
        duration.as_secs_f64(),
        sent_count as f64 / duration.as_secs_f64(),
        error_count
    );

    assert_eq!(error_count, 0, "publish errors: {}", error_count);
    assert_eq!(sent_count, total_messages);
}

/// Watches the command topic while an operator inserts commands, and checks
/// only `ON`/`OFF` ever reach the device.
#[tokio::test]
#[ignore]
async fn test_command_topic_carries_only_on_off() {
    let mut mqtt_options = MqttOptions::new("load-test-listener", "localhost", 1883);
    mqtt_options.set_keep_alive(Duration::from_secs(30));

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 100);
    client
        .subscribe(COMMAND_TOPIC, QoS::AtMostOnce)
        .await
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(30);
    let mut seen = 0;
    while Instant::now() < deadline {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, eventloop.poll()).await {
            Ok(Ok(Event::Incoming(Packet::Publish(publish)))) => {
                let payload = String::from_utf8_lossy(&publish.payload).to_string();
                assert!(payload == "ON" || payload == "OFF", "unexpected payload {:?}", payload);
                seen += 1;
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => panic!("MQTT error: {}", e),
            Err(_) => break,
        }
    }

    println!("Observed {} command(s)", seen);
}
