//! Message bus interface and implementations.
//!
//! The pipeline publishes one "Image" message per encoded frame and never
//! retries: delivery is the bus's contract (QoS 1 on MQTT). Attributes ride
//! as MQTT v5 user properties so the payload stays the raw encoded bytes.
//!
//! `MqttBus` drives a rumqttc v5 client with a background thread draining
//! connection events; `InMemoryBus` backs tests.

use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use rumqttc::v5::mqttbytes::v5::{Packet, PublishProperties};
use rumqttc::v5::{mqttbytes::QoS, Client, Connection, Event, MqttOptions};

use crate::config::ConfigStore;

/// Message type name for encoded frames.
pub const MESSAGE_TYPE_IMAGE: &str = "Image";

/// One encoded frame, ready for publishing. Fire-and-forget: the bus owns
/// delivery once `send` returns.
#[derive(Clone, Debug)]
pub struct ImageMessage {
    pub id: String,
    pub timestamp: String,
    pub counter: u64,
    pub rows: u32,
    pub cols: u32,
    /// Encoded image bytes (the bus payload).
    pub data: Vec<u8>,
    pub format: String,
    pub jpeg_quality: Option<u8>,
}

impl ImageMessage {
    /// Attribute pairs carried alongside the payload.
    pub fn attributes(&self) -> Vec<(String, String)> {
        let mut attributes = vec![
            ("id".to_string(), self.id.clone()),
            ("timestamp".to_string(), self.timestamp.clone()),
            ("counter".to_string(), self.counter.to_string()),
            ("rows".to_string(), self.rows.to_string()),
            ("cols".to_string(), self.cols.to_string()),
            ("format".to_string(), self.format.clone()),
        ];
        if let Some(quality) = self.jpeg_quality {
            attributes.push(("jpegQuality".to_string(), quality.to_string()));
        }
        attributes
    }

    /// Rebuild a message from a payload and its attribute pairs.
    /// Returns `None` when a required attribute is missing or malformed.
    pub fn from_attributes(data: Vec<u8>, attributes: &[(String, String)]) -> Option<Self> {
        let lookup = |name: &str| {
            attributes
                .iter()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.as_str())
        };
        Some(Self {
            id: lookup("id")?.to_string(),
            timestamp: lookup("timestamp")?.to_string(),
            counter: lookup("counter")?.parse().ok()?,
            rows: lookup("rows")?.parse().ok()?,
            cols: lookup("cols")?.parse().ok()?,
            data,
            format: lookup("format")?.to_string(),
            jpeg_quality: lookup("jpegQuality").and_then(|raw| raw.parse().ok()),
        })
    }
}

/// Publish/subscribe transport used by the pipeline.
pub trait MessageBus: Send + Sync {
    fn send(&self, message: &ImageMessage) -> Result<()>;

    fn subscribe(&self, message_type: &str) -> Result<()>;

    /// Blocks up to `timeout`; `None` on timeout.
    fn receive(&self, timeout: Duration) -> Result<Option<ImageMessage>>;
}

// ----------------------------------------------------------------------------
// MQTT implementation
// ----------------------------------------------------------------------------

const SECTION_BUS: &str = "Bus";
const DEFAULT_BROKER_HOST: &str = "127.0.0.1";
const DEFAULT_BROKER_PORT: i64 = 1883;

/// MQTT bus. Messages publish on `<prefix>/<type>` with QoS 1.
pub struct MqttBus {
    client: Client,
    topic_prefix: String,
    incoming: Mutex<Receiver<ImageMessage>>,
    event_loop: Option<JoinHandle<()>>,
}

impl MqttBus {
    /// Connect using the `Bus` section of the store. `instance` names this
    /// process on the broker and is the default topic prefix.
    pub fn initialize(store: &mut ConfigStore, instance: &str) -> Result<Self> {
        let host = store.get_or_set_str(SECTION_BUS, "BrokerHost", DEFAULT_BROKER_HOST)?;
        let port = store.get_or_set_i64(SECTION_BUS, "BrokerPort", DEFAULT_BROKER_PORT)?;
        let port = u16::try_from(port).context("Bus.BrokerPort out of range")?;
        let topic_prefix = store.get_or_set_str(SECTION_BUS, "TopicPrefix", instance)?;
        let username = store.get_or_set_str(SECTION_BUS, "Username", "")?;
        let password = store.get_or_set_str(SECTION_BUS, "Password", "")?;

        let client_id = format!("{}-{}", instance, std::process::id());
        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(Duration::from_secs(30));
        options.set_clean_start(true);
        if !username.is_empty() {
            options.set_credentials(username, password);
        }

        let (client, connection) = Client::new(options, 64);
        let (incoming_tx, incoming_rx) = mpsc::channel();
        let event_loop = std::thread::Builder::new()
            .name("bus-events".to_string())
            .spawn(move || run_event_loop(connection, incoming_tx))
            .expect("failed to spawn bus event thread");

        Ok(Self {
            client,
            topic_prefix,
            incoming: Mutex::new(incoming_rx),
            event_loop: Some(event_loop),
        })
    }

    fn topic(&self, message_type: &str) -> String {
        format!("{}/{}", self.topic_prefix, message_type)
    }
}

fn run_event_loop(mut connection: Connection, incoming: mpsc::Sender<ImageMessage>) {
    for event in connection.iter() {
        match event {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let attributes = publish
                    .properties
                    .as_ref()
                    .map(|props| props.user_properties.clone())
                    .unwrap_or_default();
                match ImageMessage::from_attributes(publish.payload.to_vec(), &attributes) {
                    Some(message) => {
                        if incoming.send(message).is_err() {
                            break;
                        }
                    }
                    None => log::warn!(
                        "dropping bus message without image attributes on {:?}",
                        publish.topic
                    ),
                }
            }
            Ok(Event::Incoming(_)) | Ok(Event::Outgoing(_)) => {}
            Err(err) => {
                log::warn!("bus connection error: {}", err);
                break;
            }
        }
    }
}

impl MessageBus for MqttBus {
    fn send(&self, message: &ImageMessage) -> Result<()> {
        let properties = PublishProperties {
            user_properties: message.attributes(),
            ..PublishProperties::default()
        };
        self.client
            .publish_with_properties(
                self.topic(MESSAGE_TYPE_IMAGE),
                QoS::AtLeastOnce,
                false,
                message.data.clone(),
                properties,
            )
            .with_context(|| format!("failed to publish {}", message.id))?;
        Ok(())
    }

    fn subscribe(&self, message_type: &str) -> Result<()> {
        self.client
            .subscribe(self.topic(message_type), QoS::AtLeastOnce)
            .with_context(|| format!("failed to subscribe to {}", message_type))?;
        Ok(())
    }

    fn receive(&self, timeout: Duration) -> Result<Option<ImageMessage>> {
        let incoming = self.incoming.lock().expect("bus receiver mutex poisoned");
        match incoming.recv_timeout(timeout) {
            Ok(message) => Ok(Some(message)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Ok(None),
        }
    }
}

impl Drop for MqttBus {
    fn drop(&mut self) {
        let _ = self.client.disconnect();
        if let Some(handle) = self.event_loop.take() {
            let _ = handle.join();
        }
    }
}

// ----------------------------------------------------------------------------
// In-memory implementation for tests
// ----------------------------------------------------------------------------

/// Loopback bus: `send` enqueues, `receive` dequeues, everything stays in
/// process.
#[derive(Default)]
pub struct InMemoryBus {
    inbox: Mutex<VecDeque<ImageMessage>>,
    delivered: Condvar,
    subscriptions: Mutex<Vec<String>>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything published and not yet consumed via `receive`.
    pub fn published(&self) -> Vec<ImageMessage> {
        self.inbox
            .lock()
            .expect("in-memory bus mutex poisoned")
            .iter()
            .cloned()
            .collect()
    }

    pub fn published_count(&self) -> usize {
        self.inbox.lock().expect("in-memory bus mutex poisoned").len()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions
            .lock()
            .expect("in-memory bus mutex poisoned")
            .clone()
    }
}

impl MessageBus for InMemoryBus {
    fn send(&self, message: &ImageMessage) -> Result<()> {
        self.inbox
            .lock()
            .expect("in-memory bus mutex poisoned")
            .push_back(message.clone());
        self.delivered.notify_all();
        Ok(())
    }

    fn subscribe(&self, message_type: &str) -> Result<()> {
        self.subscriptions
            .lock()
            .expect("in-memory bus mutex poisoned")
            .push(message_type.to_string());
        Ok(())
    }

    fn receive(&self, timeout: Duration) -> Result<Option<ImageMessage>> {
        let deadline = Instant::now() + timeout;
        let mut inbox = self.inbox.lock().expect("in-memory bus mutex poisoned");
        loop {
            if let Some(message) = inbox.pop_front() {
                return Ok(Some(message));
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return Ok(None);
            };
            let (guard, _) = self
                .delivered
                .wait_timeout(inbox, remaining)
                .expect("in-memory bus mutex poisoned");
            inbox = guard;
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
