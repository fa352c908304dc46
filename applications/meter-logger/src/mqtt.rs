use crate::config::MqttConfig;
use crate::error::{AppError, Result};
use crate::reading::LoggedRow;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

// Use the MQTT v5 API surface only
use rumqttc::v5 as mqtt5;
use rumqttc::Transport;

pub type MqttOptions = mqtt5::MqttOptions;
pub type AsyncClient = mqtt5::AsyncClient;
pub type EventLoop = mqtt5::EventLoop;

pub fn build_options(cfg: &MqttConfig) -> MqttOptions {
    let client_id = format!("meter-logger-{}", Uuid::new_v4());
    let mut opts = MqttOptions::new(client_id, &cfg.host, cfg.port);
    opts.set_keep_alive(Duration::from_secs(cfg.keep_alive_secs.unwrap_or(30)));
    opts.set_clean_start(cfg.clean_session.unwrap_or(true));
    if let (Some(u), Some(p)) = (&cfg.username, &cfg.password) {
        opts.set_credentials(u.clone(), p.clone());
    }
    if cfg.port == 8883 {
        opts.set_transport(Transport::tls_with_default_config());
    }
    opts
}

pub fn new(options: MqttOptions) -> (AsyncClient, EventLoop) {
    mqtt5::AsyncClient::new(options, 50)
}

pub fn qos(v: u8) -> mqtt5::mqttbytes::QoS {
    match v {
        2 => mqtt5::mqttbytes::QoS::ExactlyOnce,
        0 => mqtt5::mqttbytes::QoS::AtMostOnce,
        _ => mqtt5::mqttbytes::QoS::AtLeastOnce,
    }
}

/// Drive the client's event loop in the background. rumqttc reconnects on the
/// next poll after an error, so errors are only logged and spaced out.
pub fn spawn_event_loop(mut eventloop: EventLoop) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if let Err(e) = eventloop.poll().await {
                warn!("mqtt error: {e}; reconnecting after short delay");
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    })
}

/// Best-effort relay of accepted rows. The local store stays the record of
/// truth, so a full or disconnected client never holds up polling.
pub struct RowPublisher {
    client: AsyncClient,
    topic: String,
    qos: mqtt5::mqttbytes::QoS,
}

impl RowPublisher {
    pub fn new(client: AsyncClient, cfg: &MqttConfig) -> Self {
        Self {
            client,
            topic: cfg.topic.clone(),
            qos: qos(cfg.qos),
        }
    }

    pub fn publish(&self, row: &LoggedRow) -> Result<()> {
        let payload = encode_row(row)?;
        self.client
            .try_publish(self.topic.clone(), self.qos, false, payload)
            .map_err(|e| AppError::Mqtt(e.to_string()))?;
        debug!(meter_id = %row.reading.meter_id, topic = %self.topic, "row relayed");
        Ok(())
    }

    pub async fn disconnect(&self) {
        if let Err(e) = self.client.disconnect().await {
            debug!("mqtt disconnect: {e}");
        }
    }
}

/// Wire form of a row: flat JSON with an RFC 3339 timestamp.
pub fn encode_row(row: &LoggedRow) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(row)?)
}
