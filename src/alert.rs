//! Alert dispatch for newly pending decisions.
//!
//! Dispatch is fire-and-forget from the arbiter's point of view: a failed notify is logged
//! and counted, and the decision stays pending until a response or the timeout.

use std::time::Duration;

use anyhow::{anyhow, Result};
use rumqttc::v5::{mqttbytes::QoS, Client, Connection, Event, MqttOptions};
use rumqttc::Transport;
use serde::Serialize;

use crate::frame::{BoundingBox, Snapshot};
use crate::gallery::Category;
use crate::{now_ms, DetectionEvent, EventId};

const PAYLOAD_ONLINE: &str = "online";
const PAYLOAD_OFFLINE: &str = "offline";

/// What the operator needs to decide on one event.
#[derive(Clone, Copy, Debug)]
pub struct Alert<'a> {
    pub event: &'a DetectionEvent,
    pub snapshot: Option<&'a Snapshot>,
    pub speech: Option<&'a str>,
    /// Time left before the decision times out.
    pub respond_within: Duration,
}

pub trait AlertDispatch: Send {
    fn name(&self) -> &'static str;

    fn notify(&mut self, alert: &Alert<'_>) -> Result<()>;
}

#[derive(Serialize)]
struct AlertPayload<'a> {
    event_id: EventId,
    frame_id: u64,
    person_name: &'a str,
    is_known: bool,
    category: Category,
    confidence: f32,
    similarity: f32,
    bbox: BoundingBox,
    speech: Option<&'a str>,
    snapshot_bytes: usize,
    respond_within_secs: u64,
    sent_at: u64,
}

impl<'a> AlertPayload<'a> {
    fn from_alert(alert: &Alert<'a>) -> Self {
        let event = alert.event;
        Self {
            event_id: event.id,
            frame_id: event.frame_id,
            person_name: event.label(),
            is_known: event.is_known,
            category: event.category,
            confidence: event.confidence,
            similarity: event.person_identity.similarity,
            bbox: event.bbox,
            speech: alert.speech,
            snapshot_bytes: alert.snapshot.map_or(0, Snapshot::byte_len),
            respond_within_secs: alert.respond_within.as_secs(),
            sent_at: now_ms(),
        }
    }
}

// ----------------------------------------------------------------------------
// Log
// ----------------------------------------------------------------------------

/// Writes alerts to the process log. Default when no broker is configured.
#[derive(Default)]
pub struct LogDispatch;

impl AlertDispatch for LogDispatch {
    fn name(&self) -> &'static str {
        "log"
    }

    fn notify(&mut self, alert: &Alert<'_>) -> Result<()> {
        let payload = serde_json::to_string(&AlertPayload::from_alert(alert))?;
        log::info!("ALERT {}", payload);
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// MQTT
// ----------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MqttEndpoint {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

impl MqttEndpoint {
    /// `host[:port]`, `mqtt://host[:port]` or `mqtts://host[:port]`.
    pub fn parse(broker: &str) -> Result<Self> {
        let (use_tls, rest) = if let Some(rest) = broker.strip_prefix("mqtts://") {
            (true, rest)
        } else if let Some(rest) = broker.strip_prefix("mqtt://") {
            (false, rest)
        } else {
            (false, broker)
        };
        let default_port = if use_tls { 8883 } else { 1883 };
        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => (
                host,
                port.parse::<u16>()
                    .map_err(|_| anyhow!("invalid MQTT port in '{}'", broker))?,
            ),
            None => (rest, default_port),
        };
        if host.is_empty() {
            return Err(anyhow!("MQTT broker host is empty in '{}'", broker));
        }
        Ok(Self {
            host: host.to_string(),
            port,
            use_tls,
        })
    }
}

/// Publishes alerts as JSON to `<prefix>/alert` with QoS 1.
pub struct MqttDispatch {
    client: Client,
    alert_topic: String,
    status_topic: String,
    connection_handle: Option<std::thread::JoinHandle<()>>,
}

impl MqttDispatch {
    pub fn connect(broker: &str, client_id: &str, topic_prefix: &str) -> Result<Self> {
        let endpoint = MqttEndpoint::parse(broker)?;
        let status_topic = format!("{}/status", topic_prefix);

        let mut options = MqttOptions::new(client_id, &endpoint.host, endpoint.port);
        options.set_keep_alive(Duration::from_secs(60));
        options.set_clean_start(true);
        let will = rumqttc::v5::mqttbytes::v5::LastWill::new(
            status_topic.as_str(),
            PAYLOAD_OFFLINE.as_bytes().to_vec(),
            QoS::AtLeastOnce,
            true,
            None,
        );
        options.set_last_will(will);
        if endpoint.use_tls {
            options.set_transport(Transport::tls_with_default_config());
        }

        let (client, connection) = Client::new(options, 10);
        let connection_handle = spawn_connection(connection)?;
        client
            .try_publish(
                status_topic.as_str(),
                QoS::AtLeastOnce,
                true,
                PAYLOAD_ONLINE.as_bytes().to_vec(),
            )
            .map_err(|e| anyhow!("MQTT status publish failed: {}", e))?;
        log::info!(
            "alerts: publishing to {}:{} (TLS: {}) under {}",
            endpoint.host,
            endpoint.port,
            endpoint.use_tls,
            topic_prefix
        );
        Ok(Self {
            client,
            alert_topic: format!("{}/alert", topic_prefix),
            status_topic,
            connection_handle: Some(connection_handle),
        })
    }
}

fn spawn_connection(mut connection: Connection) -> Result<std::thread::JoinHandle<()>> {
    Ok(std::thread::Builder::new()
        .name("mqtt-connection".to_string())
        .spawn(move || {
            for event in connection.iter() {
                match event {
                    Ok(Event::Incoming(_)) | Ok(Event::Outgoing(_)) => {}
                    Err(e) => {
                        log::warn!("MQTT connection error: {}", e);
                        break;
                    }
                }
            }
        })?)
}

impl AlertDispatch for MqttDispatch {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    fn notify(&mut self, alert: &Alert<'_>) -> Result<()> {
        let payload = serde_json::to_vec(&AlertPayload::from_alert(alert))?;
        // try_publish: a stalled broker must not block the arbiter
        self.client
            .try_publish(self.alert_topic.as_str(), QoS::AtLeastOnce, false, payload)
            .map_err(|e| anyhow!("MQTT alert publish failed: {}", e))
    }
}

impl Drop for MqttDispatch {
    fn drop(&mut self) {
        let _ = self.client.try_publish(
            self.status_topic.as_str(),
            QoS::AtLeastOnce,
            true,
            PAYLOAD_OFFLINE.as_bytes().to_vec(),
        );
        if self.client.try_disconnect().is_err() {
            return;
        }
        if let Some(handle) = self.connection_handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::event;
    use crate::Resolution;

    #[test]
    fn endpoint_parsing_defaults_ports_by_scheme() -> Result<()> {
        assert_eq!(
            MqttEndpoint::parse("broker.local")?,
            MqttEndpoint {
                host: "broker.local".into(),
                port: 1883,
                use_tls: false
            }
        );
        assert_eq!(MqttEndpoint::parse("mqtts://broker.local")?.port, 8883);
        assert_eq!(MqttEndpoint::parse("mqtt://10.0.0.2:2883")?.port, 2883);
        assert!(MqttEndpoint::parse("mqtt://:1883").is_err());
        assert!(MqttEndpoint::parse("broker:notaport").is_err());
        Ok(())
    }

    #[test]
    fn payload_names_unknown_visitors() -> Result<()> {
        let ev = event(3, 1_000, Resolution::Pending);
        let alert = Alert {
            event: &ev,
            snapshot: None,
            speech: Some("hello"),
            respond_within: Duration::from_secs(45),
        };
        let json = serde_json::to_value(AlertPayload::from_alert(&alert))?;
        assert_eq!(json["person_name"], "Unknown");
        assert_eq!(json["event_id"], 3);
        assert_eq!(json["respond_within_secs"], 45);
        assert_eq!(json["category"], "unknown");
        Ok(())
    }

    #[test]
    fn log_dispatch_accepts_alerts() -> Result<()> {
        let ev = event(1, 1_000, Resolution::Pending);
        LogDispatch.notify(&Alert {
            event: &ev,
            snapshot: None,
            speech: None,
            respond_within: Duration::from_secs(1),
        })
    }
}
