use crate::broker::{topic_matches, Backoff, ConnectionState, Subscription, Transport};
use crate::config::Config;
use crate::errors::{Error, Result};
use crate::metrics::{BROKER_CONNECTED, BROKER_RECONNECTS_TOTAL, CHANNEL_FULL_TOTAL, MESSAGES_TOTAL};
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, mpsc::error::TrySendError, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const REQUEST_CHANNEL_CAPACITY: usize = 100;

type Subscriptions = Arc<Mutex<Vec<Subscription>>>;

/// MQTT session shared by the telemetry subscription and the command publisher.
///
/// A background task owns the rumqttc event loop. It tracks the connection
/// state, backs off between reconnect attempts, re-issues subscriptions on
/// every ConnAck, and fans incoming publishes out to subscribers.
pub struct MqttAdapter {
    client: AsyncClient,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    subscriptions: Subscriptions,
    capacity: usize,
    publish_timeout: Duration,
    driver: JoinHandle<()>,
}

impl MqttAdapter {
    /// Starts the session and waits for the first ConnAck. Fails with
    /// [`Error::Connection`] when the broker cannot be reached within
    /// `config.connect_timeout`.
    pub async fn connect(config: &Config, client_id: String) -> Result<Self> {
        info!(
            "Connecting to MQTT broker at {}:{} as {}",
            config.mqtt_broker, config.mqtt_port, client_id
        );

        let mut mqtt_options = MqttOptions::new(client_id, &config.mqtt_broker, config.mqtt_port);
        mqtt_options.set_keep_alive(config.mqtt_keep_alive);
        mqtt_options.set_clean_session(true);
        if let (Some(username), Some(password)) = (&config.mqtt_username, &config.mqtt_password) {
            mqtt_options.set_credentials(username, password);
        }

        let (client, eventloop) = AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY);

        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        let state_tx = Arc::new(state_tx);
        let subscriptions: Subscriptions = Arc::new(Mutex::new(Vec::new()));

        let driver = tokio::spawn(drive_event_loop(
            eventloop,
            client.clone(),
            state_tx.clone(),
            subscriptions.clone(),
            Backoff::new(config.reconnect_backoff_initial, config.reconnect_backoff_max),
        ));

        let adapter = Self {
            client,
            state_tx,
            subscriptions,
            capacity: config.channel_capacity,
            publish_timeout: config.publish_timeout,
            driver,
        };

        adapter.wait_connected(config.connect_timeout).await?;
        Ok(adapter)
    }

    async fn wait_connected(&self, limit: Duration) -> Result<()> {
        let mut state_rx = self.state_tx.subscribe();
        let connected = async {
            state_rx
                .wait_for(|state| *state == ConnectionState::Connected)
                .await
                .map(|_| ())
        };

        match tokio::time::timeout(limit, connected).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(Error::Connection("event loop stopped".to_string())),
            Err(_) => Err(Error::Connection(format!(
                "no session established within {:?}",
                limit
            ))),
        }
    }
}

/// Connects, retrying with backoff until the broker accepts a session.
pub async fn connect_with_retry(config: &Config, client_id: String) -> MqttAdapter {
    let mut backoff = Backoff::new(config.reconnect_backoff_initial, config.reconnect_backoff_max);

    loop {
        match MqttAdapter::connect(config, client_id.clone()).await {
            Ok(adapter) => return adapter,
            Err(e) => {
                let delay = backoff.next_delay();
                error!("{}. Retrying in {:?}", e, delay);
                tokio::time::sleep(delay).await;
            }
        }
    }
}

impl Drop for MqttAdapter {
    fn drop(&mut self) {
        self.driver.abort();
        BROKER_CONNECTED.set(0.0);
    }
}

#[async_trait]
impl Transport for MqttAdapter {
    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<Vec<u8>>> {
        let (tx, rx) = mpsc::channel(self.capacity.max(1));
        self.subscriptions
            .lock()
            .map_err(|_| Error::Connection("subscription table poisoned".to_string()))?
            .push(Subscription {
                filter: topic.to_string(),
                tx,
            });

        // Otherwise the next ConnAck subscribes.
        if self.state() == ConnectionState::Connected {
            self.client
                .subscribe(topic, QoS::AtLeastOnce)
                .await
                .map_err(Error::Mqtt)?;
            info!("Subscribed to {}", topic);
        } else {
            info!("Subscription to {} deferred until connected", topic);
        }

        Ok(rx)
    }

    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
        if self.state() != ConnectionState::Connected {
            return Err(Error::NotConnected);
        }

        let request = self
            .client
            .publish(topic, QoS::AtMostOnce, false, payload.to_vec());

        match tokio::time::timeout(self.publish_timeout, request).await {
            Ok(Ok(())) => {
                debug!("Published {} bytes on {}", payload.len(), topic);
                Ok(())
            }
            Ok(Err(e)) => {
                warn!("Publish on {} rejected by client: {}", topic, e);
                Err(Error::NotConnected)
            }
            Err(_) => {
                warn!(
                    "Publish on {} not accepted within {:?}",
                    topic, self.publish_timeout
                );
                Err(Error::NotConnected)
            }
        }
    }

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }
}

async fn drive_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    subscriptions: Subscriptions,
    mut backoff: Backoff,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                info!("MQTT session established (session_present={})", ack.session_present);
                backoff.reset();
                // Connected first, so a concurrent subscribe() either lands in
                // this resubscribe pass or issues its own request.
                state_tx.send_replace(ConnectionState::Connected);
                BROKER_CONNECTED.set(1.0);
                resubscribe(&client, &subscriptions);
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                MESSAGES_TOTAL.inc();

                debug!(
                    "Received message on topic {}, size: {} bytes",
                    publish.topic,
                    publish.payload.len()
                );

                route(&subscriptions, &publish.topic, &publish.payload);
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                debug!("Subscription acknowledged (pkid={})", ack.pkid);
            }
            Ok(_) => {}
            Err(e) => {
                let previous = state_tx.send_replace(ConnectionState::Disconnected);
                BROKER_CONNECTED.set(0.0);
                if previous == ConnectionState::Connected {
                    BROKER_RECONNECTS_TOTAL.inc();
                }

                let delay = backoff.next_delay();
                error!("MQTT error: {}. Reconnecting in {:?}", e, delay);
                tokio::time::sleep(delay).await;

                state_tx.send_replace(ConnectionState::Connecting);
            }
        }
    }
}

/// Runs inside the event loop task, so it must not wait on the request channel.
fn resubscribe(client: &AsyncClient, subscriptions: &Subscriptions) {
    let Ok(subs) = subscriptions.lock() else {
        error!("Subscription table poisoned, cannot resubscribe");
        return;
    };

    for sub in subs.iter() {
        match client.try_subscribe(sub.filter.as_str(), QoS::AtLeastOnce) {
            Ok(()) => info!("Subscribed to {}", sub.filter),
            Err(e) => error!("Failed to subscribe to {}: {}", sub.filter, e),
        }
    }
}

/// Fans a message out to matching subscribers. A full subscriber buffer
/// drops the message rather than stalling the event loop, which also
/// carries outgoing publishes.
fn route(subscriptions: &Subscriptions, topic: &str, payload: &[u8]) {
    let Ok(subs) = subscriptions.lock() else {
        error!("Subscription table poisoned, dropping message on {}", topic);
        return;
    };

    let mut matched = false;
    for sub in subs.iter().filter(|s| topic_matches(&s.filter, topic)) {
        matched = true;
        match sub.tx.try_send(payload.to_vec()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                CHANNEL_FULL_TOTAL.inc();
                warn!("Subscriber buffer for {} full, dropping message", sub.filter);
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Subscriber for {} has gone away", sub.filter);
            }
        }
    }

    if !matched {
        debug!("No subscriber for topic {}", topic);
    }
}
