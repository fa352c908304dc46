use crate::config::MqttConfig;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

// Use the MQTT v5 API surface only
use rumqttc::v5 as mqtt5;
use rumqttc::Transport;

pub type MqttOptions = mqtt5::MqttOptions;
pub type AsyncClient = mqtt5::AsyncClient;
pub type EventLoop = mqtt5::EventLoop;
pub type Incoming = mqtt5::Incoming;

pub fn build_options(cfg: &MqttConfig) -> MqttOptions {
    let client_id = format!("meter-bridge-{}", Uuid::new_v4());
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

/// Run the event loop in its own task and forward publish payloads.
///
/// The subscription is renewed on every connection acknowledgement, so a
/// broker restart with a clean session does not silently end the stream.
/// The task stops when the receiver is dropped.
pub fn spawn_subscriber(client: AsyncClient, mut eventloop: EventLoop, cfg: &MqttConfig) -> (mpsc::Receiver<Vec<u8>>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel::<Vec<u8>>(1024);
    let topic = cfg.topic.clone();
    let qos = qos(cfg.qos);
    let handle = tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(mqtt5::Event::Incoming(Incoming::ConnAck(_))) => {
                    match client.try_subscribe(topic.clone(), qos) {
                        Ok(()) => info!(topic = %topic, "subscribed"),
                        Err(e) => warn!(topic = %topic, "subscribe failed: {e}"),
                    }
                }
                Ok(mqtt5::Event::Incoming(Incoming::Publish(p))) => {
                    if tx.send(p.payload.to_vec()).await.is_err() {
                        break;
                    }
                }
                Ok(_) => continue,
                Err(e) => {
                    warn!("mqtt error: {e}; reconnecting after short delay");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
    (rx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_options_tls_port() {
        let cfg = MqttConfig {
            host: "broker".into(),
            port: 8883,
            username: None,
            password: None,
            keep_alive_secs: Some(10),
            clean_session: Some(false),
            topic: "t".into(),
            qos: 0,
        };
        let opts = build_options(&cfg);
        assert_eq!(opts.broker_address(), ("broker".to_string(), 8883));
        assert_eq!(opts.keep_alive(), Duration::from_secs(10));
        assert!(!opts.clean_start());
        assert!(opts.client_id().starts_with("meter-bridge-"));
    }

    #[test]
    fn test_qos_mapping() {
        assert_eq!(qos(0), mqtt5::mqttbytes::QoS::AtMostOnce);
        assert_eq!(qos(1), mqtt5::mqttbytes::QoS::AtLeastOnce);
        assert_eq!(qos(2), mqtt5::mqttbytes::QoS::ExactlyOnce);
    }
}
