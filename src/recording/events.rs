//! Recording and detection events and the sinks they go to.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use anyhow::{anyhow, Context, Result};
use rumqttc::v5::{mqttbytes::QoS, Client, Connection, Event as MqttEvent, MqttOptions};
use serde::Serialize;

use crate::config::MqttSettings;
use crate::detect::Detection;

use super::store::RecordingStore;

const MQTT_KEEP_ALIVE_SECS: u64 = 60;
const MQTT_CHANNEL_CAPACITY: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    RecordingStart,
    RecordingStop,
    DetectionHit,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::RecordingStart => "recording_start",
            EventKind::RecordingStop => "recording_stop",
            EventKind::DetectionHit => "detection_hit",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Event {
    pub kind: EventKind,
    pub stream: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    /// Unix seconds.
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub detections: Vec<Detection>,
}

impl Event {
    pub fn new(kind: EventKind, stream: &str, description: impl Into<String>) -> Self {
        Self {
            kind,
            stream: stream.to_string(),
            description: description.into(),
            file_path: None,
            timestamp: chrono::Utc::now().timestamp(),
            detections: Vec::new(),
        }
    }

    pub fn with_file(mut self, path: impl Into<String>) -> Self {
        self.file_path = Some(path.into());
        self
    }

    pub fn with_detections(mut self, detections: Vec<Detection>) -> Self {
        self.detections = detections;
        self
    }
}

pub trait EventSink: Send + Sync {
    fn publish(&self, event: &Event) -> Result<()>;
}

/// Writes events to the log only.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogSink;

impl EventSink for LogSink {
    fn publish(&self, event: &Event) -> Result<()> {
        log::info!(
            "event {}: {} {}{}",
            event.stream,
            event.kind,
            event.description,
            event
                .file_path
                .as_deref()
                .map(|p| format!(" ({})", p))
                .unwrap_or_default()
        );
        Ok(())
    }
}

/// Persists events through a [`RecordingStore`].
pub struct StoreSink {
    store: Arc<dyn RecordingStore>,
}

impl StoreSink {
    pub fn new(store: Arc<dyn RecordingStore>) -> Self {
        Self { store }
    }
}

impl EventSink for StoreSink {
    fn publish(&self, event: &Event) -> Result<()> {
        self.store.add_event(event).map(|_| ())
    }
}

/// Keeps every event in memory. Used by tests.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<Event>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.events
            .lock()
            .map(|e| e.iter().filter(|ev| ev.kind == kind).count())
            .unwrap_or(0)
    }
}

impl EventSink for MemorySink {
    fn publish(&self, event: &Event) -> Result<()> {
        self.events
            .lock()
            .map_err(|_| anyhow!("memory sink lock poisoned"))?
            .push(event.clone());
        Ok(())
    }
}

/// Sends every event to each inner sink; one failing sink does not stop the rest.
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

impl EventSink for FanoutSink {
    fn publish(&self, event: &Event) -> Result<()> {
        let mut first_err = None;
        for sink in &self.sinks {
            if let Err(err) = sink.publish(event) {
                log::warn!("event {}: sink failed: {:#}", event.stream, err);
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

/// `<prefix>/<stream>/<kind>`
pub fn mqtt_topic(prefix: &str, event: &Event) -> String {
    format!(
        "{}/{}/{}",
        prefix.trim_end_matches('/'),
        event.stream,
        event.kind.as_str()
    )
}

/// Publishes events as JSON at QoS 1. The connection is driven by its own thread.
pub struct MqttSink {
    client: Client,
    topic_prefix: String,
    connection_handle: Mutex<Option<JoinHandle<()>>>,
}

impl MqttSink {
    pub fn connect(settings: &MqttSettings) -> Result<Self> {
        let mut options = MqttOptions::new(&settings.client_id, &settings.host, settings.port);
        options.set_keep_alive(std::time::Duration::from_secs(MQTT_KEEP_ALIVE_SECS));
        options.set_clean_start(true);
        if let Some(user) = &settings.username {
            options.set_credentials(user.clone(), settings.password.clone().unwrap_or_default());
        }
        let (client, connection) = Client::new(options, MQTT_CHANNEL_CAPACITY);
        let handle = std::thread::Builder::new()
            .name("mqtt-events".to_string())
            .spawn(move || drive_connection(connection))
            .context("spawn mqtt connection thread")?;
        log::info!(
            "events: mqtt sink -> {}:{} (prefix {})",
            settings.host,
            settings.port,
            settings.topic_prefix
        );
        Ok(Self {
            client,
            topic_prefix: settings.topic_prefix.clone(),
            connection_handle: Mutex::new(Some(handle)),
        })
    }

    pub fn disconnect(&self) -> Result<()> {
        self.client.disconnect()?;
        let handle = self
            .connection_handle
            .lock()
            .map_err(|_| anyhow!("mqtt sink lock poisoned"))?
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        Ok(())
    }
}

fn drive_connection(mut connection: Connection) {
    for event in connection.iter() {
        match event {
            Ok(MqttEvent::Incoming(_)) | Ok(MqttEvent::Outgoing(_)) => {}
            Err(e) => {
                log::warn!("events: mqtt connection error: {}", e);
                break;
            }
        }
    }
}

impl EventSink for MqttSink {
    fn publish(&self, event: &Event) -> Result<()> {
        let payload = serde_json::to_vec(event)?;
        let topic = mqtt_topic(&self.topic_prefix, event);
        self.client
            .try_publish(topic, QoS::AtLeastOnce, false, payload)
            .map_err(|e| anyhow!("mqtt publish failed: {}", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_and_payload_shape() {
        let event = Event::new(EventKind::DetectionHit, "cam1", "person (0.91)")
            .with_detections(vec![Detection::new("person", 0.91)]);
        assert_eq!(mqtt_topic("nvr/", &event), "nvr/cam1/detection_hit");
        let json: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "DETECTION_HIT");
        assert_eq!(json["stream"], "cam1");
        assert_eq!(json["detections"][0]["label"], "person");
        assert!(json.get("file_path").is_none());
    }

    #[test]
    fn fanout_reaches_every_sink() {
        let a = Arc::new(MemorySink::new());
        let b = Arc::new(MemorySink::new());
        let fanout = FanoutSink::new(vec![a.clone(), b.clone(), Arc::new(LogSink)]);
        fanout
            .publish(&Event::new(EventKind::RecordingStart, "cam1", "started").with_file("/x.mp4"))
            .unwrap();
        assert_eq!(a.count(EventKind::RecordingStart), 1);
        assert_eq!(b.events()[0].file_path.as_deref(), Some("/x.mp4"));
    }
}
