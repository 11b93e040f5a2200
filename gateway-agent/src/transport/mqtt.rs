use async_trait::async_trait;
use rumqttc::{AsyncClient, EventLoop, MqttOptions, QoS, TlsConfiguration, Transport};
use std::time::Duration;
use tracing::warn;

use super::{Publisher, TransportError};
use crate::config::MqttConfig;

/// Device-local MQTT publisher
#[derive(Clone)]
pub struct MqttPublisher {
    client: AsyncClient,
    qos: QoS,
    retain: bool,
}

impl MqttPublisher {
    pub fn new(client: AsyncClient, cfg: &MqttConfig) -> Self {
        Self {
            client,
            qos: qos_from(cfg.qos),
            retain: cfg.retain,
        }
    }

    pub fn client(&self) -> &AsyncClient {
        &self.client
    }

    pub fn qos(&self) -> QoS {
        self.qos
    }
}

#[async_trait]
impl Publisher for MqttPublisher {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        self.client.publish(topic, self.qos, self.retain, payload).await?;
        Ok(())
    }
}

pub fn qos_from(level: u8) -> QoS {
    match level {
        2 => QoS::ExactlyOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::AtMostOnce,
    }
}

/// URL schemes that select a TLS connection
const TLS_SCHEMES: [&str; 3] = ["ssl", "mqtts", "tls"];

fn scheme(url: &str) -> Option<&str> {
    url.split_once("://").map(|(scheme, _)| scheme)
}

fn uses_tls(cfg: &MqttConfig) -> bool {
    cfg.mtls || scheme(&cfg.url).is_some_and(|s| TLS_SCHEMES.contains(&s.to_ascii_lowercase().as_str()))
}

/// `tcp://host:port`, `ssl://host:port` or `host:port` -> `(host, port)`.
/// The port defaults to 8883 for TLS schemes and 1883 otherwise.
pub fn parse_broker_url(url: &str) -> Result<(String, u16), TransportError> {
    let default_port = match scheme(url) {
        Some(s) if TLS_SCHEMES.contains(&s.to_ascii_lowercase().as_str()) => 8883,
        _ => 1883,
    };
    let rest = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let rest = rest.trim_end_matches('/');
    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| TransportError::Unavailable(format!("invalid MQTT port in {url}")))?;
            (host, port)
        }
        None => (rest, default_port),
    };
    if host.is_empty() {
        return Err(TransportError::Unavailable(format!("missing MQTT host in {url}")));
    }
    Ok((host.to_string(), port))
}

/// PEM material from inline contents, falling back to a file path.
fn pem(content: &str, path: &str, what: &str) -> Result<Option<Vec<u8>>, TransportError> {
    if !content.trim().is_empty() {
        return Ok(Some(content.as_bytes().to_vec()));
    }
    if path.trim().is_empty() {
        return Ok(None);
    }
    std::fs::read(path)
        .map(Some)
        .map_err(|e| TransportError::Unavailable(format!("failed to read {what} {path}: {e}")))
}

/// TLS settings for the broker connection. A CA is always required; `mtls`
/// also requires a client certificate and key.
pub fn tls_configuration(cfg: &MqttConfig) -> Result<TlsConfiguration, TransportError> {
    let ca = pem(&cfg.ca_cert, &cfg.ca_path, "CA certificate")?
        .ok_or_else(|| TransportError::Unavailable("MQTT TLS requires a CA certificate".into()))?;

    let client_auth = if cfg.mtls {
        let cert = pem(&cfg.client_cert, &cfg.cert_path, "client certificate")?;
        let key = pem(&cfg.client_key, &cfg.priv_key_path, "client key")?;
        match (cert, key) {
            (Some(cert), Some(key)) => Some((cert, key)),
            _ => {
                return Err(TransportError::Unavailable(
                    "MQTT mTLS requires a client certificate and key".into(),
                ))
            }
        }
    } else {
        None
    };

    if cfg.skip_tls_ver {
        warn!("Server certificate verification cannot be skipped; verifying against the configured CA");
    }
    Ok(TlsConfiguration::Simple {
        ca,
        alpn: None,
        client_auth,
    })
}

/// Builds the MQTT client and its event loop. The loop must be polled by the bridge.
pub fn connect(cfg: &MqttConfig, client_id: &str) -> Result<(AsyncClient, EventLoop), TransportError> {
    let (host, port) = parse_broker_url(&cfg.url)?;
    let mut opts = MqttOptions::new(client_id, host, port);
    opts.set_keep_alive(Duration::from_secs(30));
    opts.set_clean_session(true);
    if !cfg.username.is_empty() {
        opts.set_credentials(cfg.username.clone(), cfg.password.clone());
    }
    if uses_tls(cfg) {
        opts.set_transport(Transport::tls_with_config(tls_configuration(cfg)?));
    }
    Ok(AsyncClient::new(opts, 64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_urls() {
        assert_eq!(parse_broker_url("tcp://localhost:1883").unwrap(), ("localhost".into(), 1883));
        assert_eq!(parse_broker_url("mqtt://10.0.0.5:8883/").unwrap(), ("10.0.0.5".into(), 8883));
        assert_eq!(parse_broker_url("broker").unwrap(), ("broker".into(), 1883));
        assert!(parse_broker_url("tcp://:1883").is_err());
        assert!(parse_broker_url("tcp://host:abc").is_err());
        assert_eq!(parse_broker_url("ssl://broker.example").unwrap(), ("broker.example".into(), 8883));
    }

    fn tls_config(url: &str) -> MqttConfig {
        MqttConfig {
            url: url.into(),
            ca_cert: "CA PEM".into(),
            ..MqttConfig::default()
        }
    }

    #[test]
    fn plain_url_connects_over_tcp() {
        let (_, eventloop) = connect(&MqttConfig::default(), "t").unwrap();
        assert!(matches!(eventloop.mqtt_options.transport(), Transport::Tcp));
    }

    #[test]
    fn ssl_url_connects_over_tls() {
        let (_, eventloop) = connect(&tls_config("ssl://broker.example:8883"), "t").unwrap();
        match eventloop.mqtt_options.transport() {
            Transport::Tls(TlsConfiguration::Simple { ca, client_auth, .. }) => {
                assert_eq!(ca, b"CA PEM".to_vec());
                assert!(client_auth.is_none());
            }
            _ => panic!("expected a TLS transport"),
        }
    }

    #[test]
    fn mtls_passes_client_credentials() {
        let mut cfg = tls_config("tcp://broker.example:8883");
        cfg.mtls = true;
        cfg.client_cert = "CERT".into();
        cfg.client_key = "KEY".into();
        let (_, eventloop) = connect(&cfg, "t").unwrap();
        match eventloop.mqtt_options.transport() {
            Transport::Tls(TlsConfiguration::Simple { client_auth, .. }) => {
                assert_eq!(client_auth, Some((b"CERT".to_vec(), b"KEY".to_vec())));
            }
            _ => panic!("expected a TLS transport"),
        }
    }

    #[test]
    fn tls_material_is_read_from_paths() {
        let dir = tempfile::tempdir().unwrap();
        let write = |name: &str, body: &str| {
            let path = dir.path().join(name);
            std::fs::write(&path, body).unwrap();
            path.display().to_string()
        };
        let cfg = MqttConfig {
            url: "mqtts://broker.example".into(),
            mtls: true,
            ca_path: write("ca.pem", "CA FILE"),
            cert_path: write("client.pem", "CERT FILE"),
            priv_key_path: write("client.key", "KEY FILE"),
            ..MqttConfig::default()
        };
        match tls_configuration(&cfg).unwrap() {
            TlsConfiguration::Simple { ca, client_auth, .. } => {
                assert_eq!(ca, b"CA FILE".to_vec());
                assert_eq!(client_auth, Some((b"CERT FILE".to_vec(), b"KEY FILE".to_vec())));
            }
            _ => panic!("expected simple TLS settings"),
        }
    }

    #[test]
    fn incomplete_tls_material_is_rejected() {
        let mut cfg = tls_config("ssl://broker.example");
        cfg.ca_cert.clear();
        assert!(matches!(connect(&cfg, "t"), Err(TransportError::Unavailable(_))));

        let mut cfg = tls_config("ssl://broker.example");
        cfg.mtls = true;
        cfg.client_cert = "CERT".into();
        assert!(matches!(connect(&cfg, "t"), Err(TransportError::Unavailable(_))));

        let mut cfg = tls_config("ssl://broker.example");
        cfg.ca_path = "/nonexistent/ca.pem".into();
        cfg.ca_cert.clear();
        assert!(matches!(tls_configuration(&cfg), Err(TransportError::Unavailable(_))));
    }

    #[test]
    fn qos_levels() {
        assert_eq!(qos_from(0), QoS::AtMostOnce);
        assert_eq!(qos_from(1), QoS::AtLeastOnce);
        assert_eq!(qos_from(2), QoS::ExactlyOnce);
    }
}
