// mqttprom Exporter - MQTT subscription
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Broker connection.
//!
//! Subscribes to the configured topic filter on every (re)connection and
//! hands each publish to the ingest queue without blocking the event loop.

use std::fs;
use std::path::Path;
use std::time::Duration;

use mqttprom::config::MqttConfig;
use mqttprom::{BridgeError, IngestQueue};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS, TlsConfiguration, Transport};
use tracing::{debug, info, warn};

use crate::error::ExporterError;

/// Environment variable overriding `mqtt.user`
pub const ENV_USER: &str = "MQTTPROM_MQTT_USER";
/// Environment variable overriding `mqtt.password`
pub const ENV_PASSWORD: &str = "MQTTPROM_MQTT_PASSWORD";

const RECONNECT_DELAY: Duration = Duration::from_secs(10);
const KEEP_ALIVE: Duration = Duration::from_secs(30);
const REQUEST_CHANNEL_CAPACITY: usize = 10;

/// Broker address parsed from `mqtt.server`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Broker {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl Broker {
    /// Parse `scheme://host[:port]`
    ///
    /// `tcp` and `mqtt` default to port 1883, `ssl` and `mqtts` to 8883 over TLS.
    pub fn parse(server: &str) -> Result<Self, ExporterError> {
        let (scheme, rest) = server
            .split_once("://")
            .ok_or_else(|| ExporterError::Mqtt(format!("missing scheme in '{}'", server)))?;
        let (tls, default_port) = match scheme {
            "tcp" | "mqtt" => (false, 1883),
            "ssl" | "tls" | "mqtts" => (true, 8883),
            other => {
                return Err(ExporterError::Mqtt(format!(
                    "unsupported scheme '{}'",
                    other
                )))
            }
        };

        let authority = rest.trim_end_matches('/');
        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| ExporterError::Mqtt(format!("invalid port in '{}'", server)))?;
                (host, port)
            }
            None => (authority, default_port),
        };
        if host.is_empty() {
            return Err(ExporterError::Mqtt(format!("missing host in '{}'", server)));
        }

        Ok(Self {
            host: host.to_string(),
            port,
            tls,
        })
    }
}

/// Map a numeric QoS level
pub fn qos(level: u8) -> Result<QoS, ExporterError> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(ExporterError::Mqtt(format!("invalid qos {}", other))),
    }
}

/// Apply credential overrides
///
/// With `password_is_file`, the password override names a file whose
/// content is the password.
pub fn apply_credentials(
    config: &mut MqttConfig,
    user: Option<String>,
    password: Option<String>,
    password_is_file: bool,
) -> Result<(), ExporterError> {
    if let Some(user) = user {
        config.user = user;
    }
    if let Some(password) = password {
        config.password = if password_is_file {
            read_secret(Path::new(&password))?
        } else {
            password
        };
    }
    Ok(())
}

fn read_secret(path: &Path) -> Result<String, ExporterError> {
    let raw = fs::read_to_string(path)?;
    Ok(raw.trim_end_matches(['\r', '\n']).to_string())
}

fn client_id(config: &MqttConfig) -> String {
    if config.client_id.is_empty() {
        format!("mqttprom-{}", std::process::id())
    } else {
        config.client_id.clone()
    }
}

fn transport(config: &MqttConfig) -> Result<Transport, ExporterError> {
    let ca = match config.ca_cert {
        Some(ref path) => fs::read(path)?,
        None => return Ok(Transport::tls_with_default_config()),
    };
    let client_auth = match (&config.client_cert, &config.client_key) {
        (Some(cert), Some(key)) => Some((fs::read(cert)?, fs::read(key)?)),
        (None, None) => None,
        _ => {
            return Err(ExporterError::Mqtt(
                "client_cert and client_key must be set together".to_string(),
            ))
        }
    };
    Ok(Transport::tls_with_config(TlsConfiguration::Simple {
        ca,
        alpn: None,
        client_auth,
    }))
}

/// Build the connection options for `config`
pub fn connect_options(config: &MqttConfig) -> Result<MqttOptions, ExporterError> {
    let broker = Broker::parse(&config.server)?;
    let mut options = MqttOptions::new(client_id(config), broker.host, broker.port);
    options.set_keep_alive(KEEP_ALIVE);
    options.set_clean_session(true);
    if !config.user.is_empty() {
        options.set_credentials(config.user.clone(), config.password.clone());
    }
    if broker.tls {
        options.set_transport(transport(config)?);
    }
    Ok(options)
}

/// Drive the MQTT event loop until the ingest queue closes
pub async fn run(options: MqttOptions, topic: String, qos: QoS, queue: IngestQueue) {
    let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!(topic = %topic, "Connected to broker, subscribing");
                if let Err(e) = client.try_subscribe(topic.clone(), qos) {
                    warn!(topic = %topic, error = %e, "Failed to subscribe");
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                match queue.try_on_message(publish.topic, publish.payload.to_vec()) {
                    Ok(()) => {}
                    Err(BridgeError::QueueClosed) => {
                        info!("Ingest queue closed, leaving event loop");
                        return;
                    }
                    Err(e) => debug!(error = %e, "Message dropped"),
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!(
                    error = %e,
                    retry_in = ?RECONNECT_DELAY,
                    "MQTT connection error"
                );
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_parse_tcp() {
        assert_eq!(
            Broker::parse("tcp://127.0.0.1:1883").unwrap(),
            Broker {
                host: "127.0.0.1".to_string(),
                port: 1883,
                tls: false
            }
        );
        assert_eq!(Broker::parse("mqtt://broker").unwrap().port, 1883);
    }

    #[test]
    fn test_parse_tls() {
        let broker = Broker::parse("ssl://broker.example.com").unwrap();
        assert!(broker.tls);
        assert_eq!(broker.port, 8883);
        assert_eq!(Broker::parse("mqtts://broker:8884/").unwrap().port, 8884);
    }

    #[test]
    fn test_parse_invalid() {
        assert!(Broker::parse("broker:1883").is_err());
        assert!(Broker::parse("ws://broker").is_err());
        assert!(Broker::parse("tcp://broker:port").is_err());
        assert!(Broker::parse("tcp://:1883").is_err());
    }

    #[test]
    fn test_qos() {
        assert_eq!(qos(1).unwrap(), QoS::AtLeastOnce);
        assert!(qos(3).is_err());
    }

    #[test]
    fn test_credentials_override() {
        let mut config = MqttConfig::default();
        config.user = "file-user".to_string();
        apply_credentials(&mut config, Some("env-user".to_string()), None, false).unwrap();
        assert_eq!(config.user, "env-user");
        assert_eq!(config.password, "");

        apply_credentials(&mut config, None, Some("secret".to_string()), false).unwrap();
        assert_eq!(config.password, "secret");
    }

    #[test]
    fn test_password_from_file() {
        let file = NamedTempFile::new().unwrap();
        fs::write(file.path(), "s3cret\n").unwrap();

        let mut config = MqttConfig::default();
        let path = file.path().display().to_string();
        apply_credentials(&mut config, None, Some(path), true).unwrap();
        assert_eq!(config.password, "s3cret");
    }

    #[test]
    fn test_default_client_id() {
        let config = MqttConfig::default();
        assert_eq!(client_id(&config), format!("mqttprom-{}", std::process::id()));
    }

    #[test]
    fn test_connect_options() {
        let mut config = MqttConfig::default();
        config.server = "tcp://broker:1884".to_string();
        config.client_id = "bridge".to_string();
        let options = connect_options(&config).unwrap();
        assert_eq!(options.broker_address(), ("broker".to_string(), 1884));
        assert_eq!(options.client_id(), "bridge");
    }
}
