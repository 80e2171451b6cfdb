use anyhow::{anyhow, Context, Result};
use rumqttc::v5::{mqttbytes::QoS, Client, Connection, ConnectionError, Event, MqttOptions};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::command::{CommandPublisher, CommandRecord};

const DEFAULT_MQTT_PORT: u16 = 1883;
const REQUEST_CAPACITY: usize = 16;
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// Publishes command records to an MQTT topic at QoS 0.
///
/// `try_publish` never blocks: when the request queue is full the record is
/// dropped and the next iteration's record takes its place.
pub struct MqttCommandPublisher {
    client: Client,
    topic: String,
    shutdown: Arc<AtomicBool>,
    connection_handle: Option<JoinHandle<()>>,
}

impl MqttCommandPublisher {
    /// `broker` is `host[:port]`.
    pub fn connect(broker: &str, client_id: &str, topic: &str) -> Result<Self> {
        let (host, port) = split_host_port(broker)?;
        let endpoint = format!("mqtt://{}:{}/{}", host, port, topic);
        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(Duration::from_secs(5));
        options.set_clean_start(true);
        let (client, connection) = Client::new(options, REQUEST_CAPACITY);

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = Arc::clone(&shutdown);
        let handle = std::thread::Builder::new()
            .name("mqtt-events".into())
            .spawn(move || drive_connection(connection, shutdown_thread))
            .context("spawn mqtt connection thread")?;

        log::info!("publishing commands to {}", endpoint);
        Ok(Self {
            client,
            topic: topic.to_string(),
            shutdown,
            connection_handle: Some(handle),
        })
    }

    pub fn disconnect(mut self) -> Result<()> {
        self.stop()
    }

    fn stop(&mut self) -> Result<()> {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let result = self.client.try_disconnect();
        if let Some(handle) = self.connection_handle.take() {
            let _ = handle.join();
        }
        result.map_err(|e| anyhow!("mqtt disconnect failed: {}", e))
    }
}

fn drive_connection(mut connection: Connection, shutdown: Arc<AtomicBool>) {
    for event in connection.iter() {
        if !handle_event(event, &shutdown) {
            break;
        }
    }
}

/// Returns false once shutdown is requested, whatever the event.
fn handle_event(event: Result<Event, ConnectionError>, shutdown: &AtomicBool) -> bool {
    if shutdown.load(Ordering::SeqCst) {
        return false;
    }
    if let Err(e) = event {
        log::warn!("MQTT connection error: {}", e);
        std::thread::sleep(RECONNECT_BACKOFF);
    }
    true
}

impl CommandPublisher for MqttCommandPublisher {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    fn publish(&mut self, record: &CommandRecord) -> Result<()> {
        let payload = record.to_json()?;
        self.client
            .try_publish(self.topic.clone(), QoS::AtMostOnce, false, payload.into_bytes())
            .map_err(|e| anyhow!("mqtt publish dropped: {}", e))
    }
}

impl Drop for MqttCommandPublisher {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            log::debug!("{}", e);
        }
    }
}

fn split_host_port(broker: &str) -> Result<(String, u16)> {
    let broker = broker.trim();
    if broker.is_empty() {
        return Err(anyhow!("mqtt broker address is empty"));
    }
    match broker.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            let port = port
                .parse()
                .map_err(|_| anyhow!("invalid mqtt port in '{}'", broker))?;
            Ok((host.to_string(), port))
        }
        Some(_) => Err(anyhow!("invalid mqtt broker address '{}'", broker)),
        None => Ok((broker.to_string(), DEFAULT_MQTT_PORT)),
    }
}
