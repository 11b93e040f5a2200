//! Agent service: the command dispatcher
//!
//! Owns the live configuration, the heartbeat registry and the terminal
//! manager, and routes decoded control commands to them. The bridge and the
//! HTTP façade both drive the agent through this type only.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Serialize;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::commands::{self, Command, Request, TerminalCommand};
use crate::config::{write_if_absent, ChannelsConfig, Config};
use crate::error::{AgentError, ErrorKind, Result};
use crate::execution::{CommandExecutor, EXEC_TIMEOUT};
use crate::heartbeat::{HeartbeatRegistry, ServiceInfo, SWEEP_PERIOD};
use crate::senml::{self, CodecError};
use crate::state::{new_rw_state, SharedRw};
use crate::terminal::{self, TerminalManager};
use crate::transport::{
    data_topic, response_topic, service_command_subject, Publisher, SharedPublisher, TransportError,
};

/// Logical topic of the control response channel
pub const CONTROL_TOPIC: &str = "control";
/// Logical topic of the data channel
pub const DATA_TOPIC: &str = "data";
/// Record name of error responses
pub const ERROR_RECORD_NAME: &str = "error";

/// Maps a logical topic onto the channels of `channels`.
pub fn resolve_topic(channels: &ChannelsConfig, topic: &str) -> String {
    match topic {
        CONTROL_TOPIC => response_topic(&channels.control),
        DATA_TOPIC => data_topic(&channels.data),
        other => format!("{}/{}", response_topic(&channels.control), other),
    }
}

/// Device-local publisher that resolves logical topics against the live config
pub struct ChannelPublisher {
    inner: SharedPublisher,
    config: SharedRw<Config>,
}

impl ChannelPublisher {
    pub fn new(inner: SharedPublisher, config: SharedRw<Config>) -> Self {
        Self { inner, config }
    }

    pub fn resolve(&self, topic: &str) -> String {
        resolve_topic(&self.config.read().channels, topic)
    }
}

#[async_trait]
impl Publisher for ChannelPublisher {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> std::result::Result<(), TransportError> {
        let topic = self.resolve(topic);
        self.inner.publish(&topic, payload).await
    }
}

/// Result of pushing a service configuration file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Written,
    /// The target already existed and was left untouched
    Skipped,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    kind: ErrorKind,
    message: &'a str,
}

pub struct AgentService {
    config: SharedRw<Config>,
    /// Serializes persist-then-swap reconfigurations
    reconfigure: tokio::sync::Mutex<()>,
    registry: HeartbeatRegistry,
    terminals: TerminalManager,
    local: Arc<ChannelPublisher>,
    broker: SharedPublisher,
}

impl AgentService {
    pub fn new(config: Config, local: SharedPublisher, broker: SharedPublisher) -> Self {
        Self::with_terminal_tick(config, local, broker, terminal::TICK)
    }

    /// Same as [`AgentService::new`] with a custom countdown resolution.
    pub fn with_terminal_tick(
        config: Config,
        local: SharedPublisher,
        broker: SharedPublisher,
        tick: Duration,
    ) -> Self {
        let registry = HeartbeatRegistry::new(config.heartbeat_timeout());
        let config = new_rw_state(config);
        let local = Arc::new(ChannelPublisher::new(local, config.clone()));
        let terminals = TerminalManager::new(local.clone(), config.clone(), tick);
        Self {
            config,
            reconfigure: tokio::sync::Mutex::new(()),
            registry,
            terminals,
            local,
            broker,
        }
    }

    pub fn registry(&self) -> &HeartbeatRegistry {
        &self.registry
    }

    pub fn terminals(&self) -> &TerminalManager {
        &self.terminals
    }

    /// Starts the registry-wide liveness sweep.
    pub fn spawn_sweeper(&self) -> tokio::task::JoinHandle<()> {
        self.registry.spawn_sweeper(SWEEP_PERIOD)
    }

    /// Decodes and runs a control request. Returns the response pack for
    /// commands that answer; `control` and `term` commands do not.
    pub async fn execute(&self, uuid: &str, payload: &[u8]) -> Result<Option<Vec<u8>>> {
        let request = Request::decode(payload, uuid)?;
        debug!("Executing {:?} for {}", request.command, request.uuid);
        self.run(&request.uuid, request.command).await
    }

    pub async fn run(&self, uuid: &str, command: Command) -> Result<Option<Vec<u8>>> {
        match command {
            Command::ViewServices => {
                let services = to_json(&self.services())?;
                response_pack(uuid, commands::VIEW, &services)
            }
            Command::ViewConfig => {
                let config = to_json(&self.config())?;
                response_pack(uuid, commands::VIEW, &config)
            }
            Command::SaveServiceConfig { path, content } => {
                self.write_service_config(uuid, &path, &content).await?;
                response_pack(uuid, commands::SAVE, "")
            }
            Command::Exec { program, args } => {
                let result = CommandExecutor::run(&program, &args, EXEC_TIMEOUT).await?;
                if !result.success {
                    debug!("{} exited with {:?}", program, result.exit_code);
                }
                response_pack(uuid, &program, &result.output)
            }
            Command::Control { service, subtopic, body } => {
                self.forward(&service, &subtopic, body.into_bytes()).await?;
                Ok(None)
            }
            Command::Terminal(command) => {
                self.terminal_command(uuid, command).await?;
                Ok(None)
            }
        }
    }

    /// Forwards a `control` request to the addressed service on the broker.
    pub async fn control(&self, uuid: &str, payload: &[u8]) -> Result<()> {
        let request = Request::decode(payload, uuid)?;
        match request.command {
            Command::Control { service, subtopic, body } => {
                self.forward(&service, &subtopic, body.into_bytes()).await
            }
            other => Err(AgentError::Malformed(format!(
                "expected a service command, got {}",
                other.response_name()
            ))),
        }
    }

    /// Publishes `payload` verbatim on `commands.<service>.<subtopic>`.
    pub async fn forward(&self, service: &str, subtopic: &str, payload: Vec<u8>) -> Result<()> {
        let subject = service_command_subject(service, subtopic);
        self.broker.publish(&subject, payload).await?;
        debug!("Forwarded command to {}", subject);
        Ok(())
    }

    /// Validates `config`, persists it, then makes it the live configuration.
    pub async fn add_config(&self, mut config: Config) -> Result<()> {
        config.validate()?;
        let _guard = self.reconfigure.lock().await;
        if config.file.as_os_str().is_empty() {
            config.file = self.config.read().file.clone();
        }
        config.save().await?;

        let timeout = config.heartbeat_timeout();
        *self.config.write() = config;
        self.registry.set_timeout(timeout);
        info!("Configuration replaced");
        Ok(())
    }

    /// Handles the value of a `config` command that pushes a service file:
    /// `save,<path>,<base64>`.
    pub async fn service_config(&self, uuid: &str, value: &str) -> Result<SaveOutcome> {
        match commands::parse_config(value)? {
            Command::SaveServiceConfig { path, content } => {
                self.write_service_config(uuid, &path, &content).await
            }
            _ => Err(AgentError::Malformed(format!("not a config save command: {value}"))),
        }
    }

    async fn write_service_config(&self, uuid: &str, path: &str, content: &str) -> Result<SaveOutcome> {
        let target = target_path(path)?;
        let decoded = STANDARD
            .decode(content.trim())
            .map_err(|e| AgentError::Malformed(format!("invalid base64 config: {e}")))?;
        let text = std::str::from_utf8(&decoded)
            .map_err(|e| AgentError::Malformed(format!("config is not UTF-8: {e}")))?;
        text.parse::<toml::Table>()
            .map_err(|e| AgentError::Malformed(format!("config is not a valid document: {e}")))?;

        if !write_if_absent(&target, &decoded).await? {
            info!("Config file {} exists, not overwriting (requested by {})", target.display(), uuid);
            return Ok(SaveOutcome::Skipped);
        }
        info!("Wrote config file {} for {}", target.display(), uuid);
        Ok(SaveOutcome::Written)
    }

    pub fn config(&self) -> Config {
        self.config.read().clone()
    }

    pub fn services(&self) -> Vec<ServiceInfo> {
        self.registry.snapshot()
    }

    /// Publishes on the device-local transport; `topic` is logical.
    pub async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.local.publish(topic, payload).await?;
        Ok(())
    }

    /// Handles the base64 value of a `term` command.
    pub async fn terminal(&self, uuid: &str, value: &str) -> Result<()> {
        let command = TerminalCommand::decode(value)?;
        self.terminal_command(uuid, command).await
    }

    async fn terminal_command(&self, uuid: &str, command: TerminalCommand) -> Result<()> {
        match command {
            TerminalCommand::Open => self.terminals.open(uuid).map(|_| ()),
            TerminalCommand::Close => self.terminals.close(uuid),
            TerminalCommand::Input(input) => self.terminals.send(uuid, input).await,
        }
    }

    /// Sends a response pack on the control response channel.
    pub async fn respond(&self, payload: Vec<u8>) -> Result<()> {
        self.publish(CONTROL_TOPIC, payload).await
    }

    /// Error record answering a failed request.
    pub fn error_response(uuid: &str, err: &AgentError) -> Result<Vec<u8>> {
        let message = err.to_string();
        let body = to_json(&ErrorBody { kind: err.kind(), message: &message })?;
        Ok(senml::encode(uuid, ERROR_RECORD_NAME, &body)?)
    }

    /// Runs a request and publishes its outcome on the response channel.
    pub async fn handle_request(&self, payload: &[u8]) {
        let uuid = commands::request_uuid(payload).unwrap_or_default();
        let response = match self.execute(&uuid, payload).await {
            Ok(Some(response)) => response,
            Ok(None) => return,
            Err(e) => {
                warn!("Request from '{}' failed: {}", uuid, e);
                match Self::error_response(&uuid, &e) {
                    Ok(response) => response,
                    Err(e) => {
                        warn!("Failed to encode error response: {}", e);
                        return;
                    }
                }
            }
        };
        if let Err(e) = self.respond(response).await {
            warn!("Failed to publish response to '{}': {}", uuid, e);
        }
    }
}

fn response_pack(uuid: &str, name: &str, value: &str) -> Result<Option<Vec<u8>>> {
    Ok(Some(senml::encode(uuid, name, value)?))
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value).map_err(CodecError::from)?)
}

fn target_path(path: &str) -> Result<PathBuf> {
    let path = Path::new(path.trim());
    if path.as_os_str().is_empty() {
        return Err(AgentError::Malformed("empty config path".into()));
    }
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(AgentError::Malformed(format!("config path {} escapes its directory", path.display())));
    }
    Ok(path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heartbeat::ServiceStatus;
    use crate::transport::testing::Recorder;

    struct Fixture {
        service: AgentService,
        local: Arc<Recorder>,
        broker: Arc<Recorder>,
        dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.channels.control = "ctrl".into();
        config.channels.data = "data-ch".into();
        config.file = dir.path().join("agent.toml");
        let local = Arc::new(Recorder::default());
        let broker = Arc::new(Recorder::default());
        let service = AgentService::new(config, local.clone(), broker.clone());
        Fixture { service, local, broker, dir }
    }

    fn single(payload: &[u8]) -> senml::Record {
        let mut records = senml::decode(payload).unwrap();
        assert_eq!(records.len(), 1);
        records.remove(0)
    }

    #[tokio::test]
    async fn config_view_returns_services() {
        let f = fixture();
        f.service.registry().heartbeat("duster", "test");

        let response = f
            .service
            .execute("", br#"[{"bn":"1:","n":"config","vs":"view"}]"#)
            .await
            .unwrap()
            .unwrap();
        let record = single(&response);
        assert_eq!(record.base_name.as_deref(), Some("1"));
        assert_eq!(record.name.as_deref(), Some("view"));

        let services: Vec<ServiceInfo> = serde_json::from_str(record.string_value.as_deref().unwrap()).unwrap();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].name, "duster");
        assert_eq!(services[0].status, ServiceStatus::Online);
    }

    #[tokio::test]
    async fn config_view_agent_returns_config() {
        let f = fixture();
        let response = f
            .service
            .execute("", br#"[{"bn":"7:","n":"config","vs":"view,agent"}]"#)
            .await
            .unwrap()
            .unwrap();
        let record = single(&response);
        let config: Config = serde_json::from_str(record.string_value.as_deref().unwrap()).unwrap();
        assert_eq!(config, f.service.config());
    }

    #[tokio::test]
    async fn unknown_command_is_reported_as_such() {
        let f = fixture();
        let err = f
            .service
            .execute("", br#"[{"bn":"1:","n":"reboot","vs":"now"}]"#)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownCommand);
        assert!(f.local.published().is_empty());
    }

    #[tokio::test]
    async fn control_forwards_to_broker_subject() {
        let f = fixture();
        f.service
            .control("1", br#"[{"bn":"1:","n":"control","vs":"services/export/restart,now"}]"#)
            .await
            .unwrap();
        let sent = f.broker.published();
        assert_eq!(sent, vec![("commands.export.restart".to_string(), b"now".to_vec())]);
    }

    #[tokio::test]
    async fn undecodable_control_never_publishes() {
        let f = fixture();
        for payload in [&b"not json"[..], b"{}", b"[]", br#"[{"n":"control","vs":"nowhere"}]"#] {
            assert!(f.service.control("1", payload).await.is_err());
        }
        assert!(f.broker.published().is_empty());
    }

    #[tokio::test]
    async fn service_config_writes_once() {
        let f = fixture();
        let target = f.dir.path().join("svc").join("config.toml");
        let first = "[export]\nport = 8170\n";
        let value = format!("save,{},{}", target.display(), STANDARD.encode(first));

        assert_eq!(f.service.service_config("1", &value).await.unwrap(), SaveOutcome::Written);
        assert_eq!(std::fs::read_to_string(&target).unwrap(), first);

        let second = format!("save,{},{}", target.display(), STANDARD.encode("[export]\nport = 1\n"));
        assert_eq!(f.service.service_config("1", &second).await.unwrap(), SaveOutcome::Skipped);
        assert_eq!(std::fs::read_to_string(&target).unwrap(), first);
    }

    #[tokio::test]
    async fn service_config_rejects_bad_input() {
        let f = fixture();
        let target = f.dir.path().join("x.toml");

        let bad_b64 = format!("save,{},***", target.display());
        let err = f.service.service_config("1", &bad_b64).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Malformed);

        let not_toml = format!("save,{},{}", target.display(), STANDARD.encode("= = ="));
        let err = f.service.service_config("1", &not_toml).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Malformed);

        let escape = format!("save,../x.toml,{}", STANDARD.encode("a = 1"));
        let err = f.service.service_config("1", &escape).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Malformed);
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn failed_service_config_write_leaves_no_file() {
        let f = fixture();
        let target = f.dir.path().join("svc").join(format!("{}.toml", "s".repeat(230)));
        let value = format!("save,{},{}", target.display(), STANDARD.encode("a = 1\n"));

        let err = f.service.service_config("1", &value).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Resource);
        assert!(!target.exists());
        assert_eq!(std::fs::read_dir(target.parent().unwrap()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn add_config_validates_persists_and_swaps() {
        let f = fixture();
        let before = f.service.config();

        let mut invalid = before.clone();
        invalid.channels.control.clear();
        let err = f.service.add_config(invalid).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(f.service.config(), before);

        let mut next = before.clone();
        next.channels.control = "ctrl-2".into();
        next.heartbeat.interval = 30;
        f.service.add_config(next.clone()).await.unwrap();
        assert_eq!(f.service.config(), next);

        let stored = Config::load(&before.file).await.unwrap();
        assert_eq!(stored.channels.control, "ctrl-2");
        assert_eq!(stored.heartbeat.interval, 30);
    }

    #[tokio::test]
    async fn publish_resolves_logical_topics() {
        let f = fixture();
        f.service.publish("control", b"a".to_vec()).await.unwrap();
        f.service.publish("data", b"b".to_vec()).await.unwrap();
        f.service.publish("term/u1", b"c".to_vec()).await.unwrap();

        let topics: Vec<String> = f.local.published().into_iter().map(|(t, _)| t).collect();
        assert_eq!(
            topics,
            [
                "channels/ctrl/messages/res",
                "channels/data-ch/messages",
                "channels/ctrl/messages/res/term/u1"
            ]
        );
    }

    #[tokio::test]
    async fn exec_answers_with_program_output() {
        let f = fixture();
        let response = f
            .service
            .execute("", br#"[{"bn":"3:","n":"exec","vs":"echo,hi"}]"#)
            .await
            .unwrap()
            .unwrap();
        let record = single(&response);
        assert_eq!(record.name.as_deref(), Some("echo"));
        assert_eq!(record.string_value.as_deref(), Some("hi\n"));
    }

    #[tokio::test]
    async fn failed_request_is_answered_with_error_record() {
        let f = fixture();
        f.service.handle_request(br#"[{"bn":"9:","n":"config","vs":"purge"}]"#).await;

        let responses = f.local.on_topic("channels/ctrl/messages/res");
        assert_eq!(responses.len(), 1);
        let record = single(&responses[0]);
        assert_eq!(record.base_name.as_deref(), Some("9"));
        assert_eq!(record.name.as_deref(), Some("error"));
        let body: serde_json::Value = serde_json::from_str(record.string_value.as_deref().unwrap()).unwrap();
        assert_eq!(body["kind"], "unknown_command");
    }

    #[tokio::test]
    async fn closing_unknown_terminal_is_not_found() {
        let f = fixture();
        let err = f.service.terminal("u1", &STANDARD.encode("close")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
