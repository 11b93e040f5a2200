//! Bootstrap retrieval
//!
//! On startup the agent may ask a provisioning service for its configuration:
//! `GET <url>/<id>` with `Authorization: Thing <key>`. The answer names the
//! control and data channels, carries the MQTT credentials, and embeds a JSON
//! `content` document whose `agent` section overrides local settings and whose
//! optional `export` section seeds the export service's config file.
//! A failed or unparseable answer is retried. Exhausting the retries is not
//! fatal: the agent keeps its local configuration.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::{
    write_if_absent, Config, ConfigError, HeartbeatConfig, LogConfig, MqttConfig, ServerConfig, TerminalConfig,
    ENV_PREFIX,
};
use crate::transport::data_topic;

pub const DEFAULT_BOOTSTRAP_URL: &str = "http://localhost:9013/things/bootstrap";
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(10);
pub const EXPORT_CONFIG_FILE: &str = "/configs/export/config.toml";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: String, value: String },
    #[error("bootstrap request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("bootstrap service answered {0}")]
    Status(u16),
    #[error("invalid bootstrap content: {0}")]
    Content(#[from] serde_json::Error),
    #[error("malformed bootstrap config: {0}")]
    Malformed(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Where and how to fetch the device configuration
#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    pub url: String,
    pub id: String,
    pub key: String,
    /// Number of attempts; 0 disables bootstrapping
    pub retries: u64,
    pub retry_delay: Duration,
    pub skip_tls: bool,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_BOOTSTRAP_URL.to_string(),
            id: String::new(),
            key: String::new(),
            retries: 0,
            retry_delay: DEFAULT_RETRY_DELAY,
            skip_tls: false,
        }
    }
}

impl BootstrapConfig {
    pub fn from_env() -> Result<Self, BootstrapError> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Reads `GATEWAY_AGENT_BOOTSTRAP_*` values from an arbitrary lookup.
    pub fn from_vars<F>(lookup: F) -> Result<Self, BootstrapError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}BOOTSTRAP_{name}"));
        let mut cfg = Self::default();
        if let Some(v) = var("URL") {
            cfg.url = v;
        }
        if let Some(v) = var("ID") {
            cfg.id = v;
        }
        if let Some(v) = var("KEY") {
            cfg.key = v;
        }
        if let Some(v) = var("RETRIES") {
            cfg.retries = parse_value("RETRIES", &v)?;
        }
        if let Some(v) = var("RETRY_DELAY_SECONDS") {
            cfg.retry_delay = Duration::from_secs(parse_value("RETRY_DELAY_SECONDS", &v)?);
        }
        if let Some(v) = var("SKIP_TLS") {
            cfg.skip_tls = parse_value("SKIP_TLS", &v)?;
        }
        Ok(cfg)
    }

    /// One request to the provisioning service. The embedded `content` document
    /// is parsed here, so an unreadable one fails the attempt.
    pub async fn fetch(&self) -> Result<DeviceConfig, BootstrapError> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(self.skip_tls)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        let url = format!("{}/{}", self.url.trim_end_matches('/'), self.id);

        let response = client
            .get(&url)
            .header(reqwest::header::AUTHORIZATION, format!("Thing {}", self.key))
            .send()
            .await?;
        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            return Err(BootstrapError::Status(status.as_u16()));
        }
        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

/// Device configuration as served by the provisioning service
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub mainflux_id: String,
    pub mainflux_key: String,
    pub mainflux_channels: Vec<BootstrapChannel>,
    pub client_key: String,
    pub client_cert: String,
    pub ca_cert: String,
    /// Per-service sections, embedded as a JSON string
    #[serde(deserialize_with = "embedded_json")]
    pub content: ServicesContent,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BootstrapChannel {
    pub id: String,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl BootstrapChannel {
    fn is_data(&self) -> bool {
        self.metadata.get("type").and_then(|v| v.as_str()) == Some("data")
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServicesContent {
    pub agent: AgentSection,
    pub export: Option<ExportConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub server: Option<ServerConfig>,
    pub log: Option<LogConfig>,
    pub mqtt: Option<MqttConfig>,
    pub heartbeat: Option<HeartbeatConfig>,
    pub terminal: Option<TerminalConfig>,
}

/// Export service configuration. Only the fields the agent fills in are typed;
/// everything else is carried through unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    pub file: String,
    pub mqtt: ExportMqtt,
    pub routes: Vec<ExportRoute>,
    #[serde(flatten)]
    pub other: toml::Table,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportMqtt {
    pub username: String,
    pub password: String,
    pub client_cert: String,
    pub client_cert_key: String,
    pub client_cert_path: String,
    pub client_priv_key_path: String,
    #[serde(flatten)]
    pub other: toml::Table,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportRoute {
    pub mqtt_topic: String,
    #[serde(flatten)]
    pub other: toml::Table,
}

impl ExportConfig {
    /// Fills credentials and route topics the provisioning service left empty.
    pub fn fill_from(&mut self, config: &Config) {
        let mqtt = &mut self.mqtt;
        fill(&mut mqtt.username, &config.mqtt.username);
        fill(&mut mqtt.password, &config.mqtt.password);
        fill(&mut mqtt.client_cert, &config.mqtt.client_cert);
        fill(&mut mqtt.client_cert_key, &config.mqtt.client_key);
        fill(&mut mqtt.client_cert_path, &config.mqtt.cert_path);
        fill(&mut mqtt.client_priv_key_path, &config.mqtt.priv_key_path);
        let topic = data_topic(&config.channels.data);
        for route in &mut self.routes {
            fill(&mut route.mqtt_topic, &topic);
        }
    }

    /// Writes the export config unless its file already exists. Failures are
    /// logged; the agent does not depend on the export service.
    pub async fn save_if_absent(&self) {
        let file = if self.file.is_empty() { EXPORT_CONFIG_FILE } else { self.file.as_str() };
        let content = match toml::to_string_pretty(self) {
            Ok(content) => content,
            Err(e) => {
                warn!("Failed to serialize export config: {}", e);
                return;
            }
        };
        match write_if_absent(Path::new(file), content.as_bytes()).await {
            Ok(true) => info!("Saved export config file {}", file),
            Ok(false) => info!("Export config file {} exists", file),
            Err(e) => warn!("Failed to save export config file {}: {}", file, e),
        }
    }
}

fn fill(field: &mut String, value: &str) {
    if field.is_empty() {
        field.push_str(value);
    }
}

fn embedded_json<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let raw = String::deserialize(deserializer)?;
    if raw.trim().is_empty() {
        return Ok(T::default());
    }
    serde_json::from_str(&raw).map_err(serde::de::Error::custom)
}

/// Overlays a fetched device configuration onto `base`.
pub fn apply(device: DeviceConfig, base: Config) -> Result<Config, BootstrapError> {
    let [first, second, ..] = device.mainflux_channels.as_slice() else {
        return Err(BootstrapError::Malformed(format!(
            "expected control and data channels, got {}",
            device.mainflux_channels.len()
        )));
    };
    let (control, data) = if first.is_data() { (second, first) } else { (first, second) };

    let agent = device.content.agent;

    let mut config = base;
    config.channels.control = control.id.clone();
    config.channels.data = data.id.clone();
    if let Some(server) = agent.server {
        config.server = server;
    }
    if let Some(log) = agent.log {
        config.log = log;
    }
    if let Some(mqtt) = agent.mqtt {
        config.mqtt = mqtt;
    }
    if let Some(heartbeat) = agent.heartbeat {
        config.heartbeat = heartbeat;
    }
    if let Some(terminal) = agent.terminal {
        config.terminal = terminal;
    }

    config.mqtt.username = device.mainflux_id;
    config.mqtt.password = device.mainflux_key;
    config.mqtt.ca_cert = device.ca_cert;
    config.mqtt.client_cert = device.client_cert;
    config.mqtt.client_key = device.client_key;
    Ok(config)
}

/// Fetches, applies and saves the device configuration. `Ok(None)` means the
/// agent continues with `base`, either because bootstrapping is disabled or
/// because every attempt failed.
pub async fn bootstrap(cfg: &BootstrapConfig, base: Config) -> Result<Option<Config>, BootstrapError> {
    if cfg.retries == 0 {
        info!("No bootstrapping, local configuration will be used");
        return Ok(None);
    }
    info!("Requesting config {} from {}", cfg.id, cfg.url);

    let mut attempt = 0;
    let device = loop {
        attempt += 1;
        match cfg.fetch().await {
            Ok(device) => break device,
            Err(e) => {
                error!("Fetching bootstrap failed: {}", e);
                if attempt >= cfg.retries {
                    warn!("Bootstrap retries exhausted, continuing with local config");
                    return Ok(None);
                }
                debug!("Retrying in {:?} ({} attempts left)", cfg.retry_delay, cfg.retries - attempt);
                tokio::time::sleep(cfg.retry_delay).await;
            }
        }
    };

    let export = device.content.export.clone();
    let config = apply(device, base)?;
    if let Some(mut export) = export {
        export.fill_from(&config);
        export.save_if_absent().await;
    }
    config.save().await?;
    info!("Bootstrap config saved to {}", config.file.display());
    Ok(Some(config))
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, BootstrapError> {
    value.trim().parse::<T>().map_err(|_| BootstrapError::InvalidValue {
        key: format!("{ENV_PREFIX}BOOTSTRAP_{key}"),
        value: value.to_string(),
    })
}
