//! Agent configuration
//!
//! Handles:
//! - TOML document persisted at `Config.file`
//! - `GATEWAY_AGENT_*` environment overrides
//! - Validation before a configuration becomes live
//! - Atomic save (temp file + rename)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CONFIG_FILE: &str = "config.toml";
pub const ENV_PREFIX: &str = "GATEWAY_AGENT_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("config serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: String, value: String },
    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub channels: ChannelsConfig,
    pub log: LogConfig,
    pub mqtt: MqttConfig,
    pub heartbeat: HeartbeatConfig,
    pub terminal: TerminalConfig,
    pub file: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub nats_url: String,
    pub port: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelsConfig {
    pub control: String,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub url: String,
    pub username: String,
    pub password: String,
    pub mtls: bool,
    pub skip_tls_ver: bool,
    pub retain: bool,
    pub qos: u8,
    pub ca_path: String,
    pub cert_path: String,
    pub priv_key_path: String,
    /// PEM contents handed out by the provisioning service
    pub ca_cert: String,
    pub client_cert: String,
    pub client_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Seconds without a heartbeat before a service is reported offline
    pub interval: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalConfig {
    /// Seconds without output before a session is closed
    pub session_timeout: u64,
    pub shell: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            channels: ChannelsConfig::default(),
            log: LogConfig::default(),
            mqtt: MqttConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            terminal: TerminalConfig::default(),
            file: PathBuf::from(DEFAULT_CONFIG_FILE),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            nats_url: "nats://127.0.0.1:4222".to_string(),
            port: 9999,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { level: "info".to_string() }
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            url: "tcp://127.0.0.1:1883".to_string(),
            username: String::new(),
            password: String::new(),
            mtls: false,
            skip_tls_ver: true,
            retain: false,
            qos: 0,
            ca_path: String::new(),
            cert_path: String::new(),
            priv_key_path: String::new(),
            ca_cert: String::new(),
            client_cert: String::new(),
            client_key: String::new(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self { interval: 10 }
    }
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            session_timeout: 60,
            shell: "bash".to_string(),
        }
    }
}

impl Config {
    /// Loads the document at `path`, falling back to defaults when it does not exist.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let content = tokio::fs::read_to_string(path).await?;
            toml::from_str::<Config>(&content)?
        } else {
            Config::default()
        };
        config.file = path.to_path_buf();
        Ok(config)
    }

    /// Path of the configuration document, from `GATEWAY_AGENT_CONFIG_FILE`.
    pub fn path_from_env() -> PathBuf {
        std::env::var(format!("{ENV_PREFIX}CONFIG_FILE"))
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE))
    }

    /// Applies `GATEWAY_AGENT_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_vars(|key| std::env::var(key).ok())
    }

    /// Applies overrides from an arbitrary lookup. Keys are full variable names.
    pub fn apply_vars<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(v) = var("NATS_URL") {
            self.server.nats_url = v;
        }
        if let Some(v) = var("HTTP_PORT") {
            self.server.port = parse_value("HTTP_PORT", &v)?;
        }
        if let Some(v) = var("CONTROL_CHANNEL") {
            self.channels.control = v;
        }
        if let Some(v) = var("DATA_CHANNEL") {
            self.channels.data = v;
        }
        if let Some(v) = var("LOG_LEVEL") {
            self.log.level = v;
        }
        if let Some(v) = var("MQTT_URL") {
            self.mqtt.url = v;
        }
        if let Some(v) = var("MQTT_USERNAME") {
            self.mqtt.username = v;
        }
        if let Some(v) = var("MQTT_PASSWORD") {
            self.mqtt.password = v;
        }
        if let Some(v) = var("MQTT_MTLS") {
            self.mqtt.mtls = parse_value("MQTT_MTLS", &v)?;
        }
        if let Some(v) = var("MQTT_SKIP_TLS") {
            self.mqtt.skip_tls_ver = parse_value("MQTT_SKIP_TLS", &v)?;
        }
        if let Some(v) = var("MQTT_RETAIN") {
            self.mqtt.retain = parse_value("MQTT_RETAIN", &v)?;
        }
        if let Some(v) = var("MQTT_QOS") {
            self.mqtt.qos = parse_value("MQTT_QOS", &v)?;
        }
        if let Some(v) = var("MQTT_CA") {
            self.mqtt.ca_path = v;
        }
        if let Some(v) = var("MQTT_CLIENT_CERT") {
            self.mqtt.cert_path = v;
        }
        if let Some(v) = var("MQTT_CLIENT_PK") {
            self.mqtt.priv_key_path = v;
        }
        if let Some(v) = var("HEARTBEAT_INTERVAL") {
            self.heartbeat.interval = parse_value("HEARTBEAT_INTERVAL", &v)?;
        }
        if let Some(v) = var("TERMINAL_SESSION_TIMEOUT") {
            self.terminal.session_timeout = parse_value("TERMINAL_SESSION_TIMEOUT", &v)?;
        }
        if let Some(v) = var("TERMINAL_SHELL") {
            self.terminal.shell = v;
        }
        Ok(())
    }

    /// Rejects configurations the agent cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channels.control.trim().is_empty() {
            return Err(ConfigError::Invalid("channels.control is required".into()));
        }
        if self.mqtt.url.trim().is_empty() {
            return Err(ConfigError::Invalid("mqtt.url is required".into()));
        }
        if self.server.nats_url.trim().is_empty() {
            return Err(ConfigError::Invalid("server.nats_url is required".into()));
        }
        if self.mqtt.qos > 2 {
            return Err(ConfigError::Invalid(format!("mqtt.qos {} out of range", self.mqtt.qos)));
        }
        if self.heartbeat.interval == 0 {
            return Err(ConfigError::Invalid("heartbeat.interval must be positive".into()));
        }
        if self.terminal.session_timeout == 0 {
            return Err(ConfigError::Invalid("terminal.session_timeout must be positive".into()));
        }
        Ok(())
    }

    /// Writes the document next to its target and renames it into place.
    pub async fn save(&self) -> Result<(), ConfigError> {
        if let Some(parent) = self.file.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let content = toml::to_string_pretty(self)?;
        let mut tmp = self.file.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &self.file).await?;
        Ok(())
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat.interval)
    }
}

/// Creates `path` with `content` unless it already exists; returns whether it
/// wrote. The content goes to a sibling temp file that is then hard-linked into
/// place, so the target either appears complete or not at all.
pub async fn write_if_absent(path: &Path, content: &[u8]) -> std::io::Result<bool> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(format!(".{}.tmp", uuid::Uuid::new_v4()));
    let tmp = PathBuf::from(tmp);

    let linked = match tokio::fs::write(&tmp, content).await {
        Ok(()) => tokio::fs::hard_link(&tmp, path).await,
        Err(e) => Err(e),
    };
    let _ = tokio::fs::remove_file(&tmp).await;

    match linked {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e),
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse::<T>().map_err(|_| ConfigError::InvalidValue {
        key: format!("{ENV_PREFIX}{key}"),
        value: value.to_string(),
    })
}
