//! Control-channel command decoding
//!
//! Record 0 of a request pack names the command (`n`), identifies the caller
//! (`bn`, `"<uuid>:"`) and carries comma-separated arguments (`vs`). The pack
//! is decoded once into [`Command`]; everything after that is an exhaustive match.

use base64::{engine::general_purpose::STANDARD, Engine as _};

use crate::error::{AgentError, Result};
use crate::senml::{self, Record};
use crate::transport::parse_service_path;

pub const CONFIG: &str = "config";
pub const EXEC: &str = "exec";
pub const CONTROL: &str = "control";
pub const TERM: &str = "term";

pub const VIEW: &str = "view";
pub const SAVE: &str = "save";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `config` / `view`: heartbeat registry snapshot
    ViewServices,
    /// `config` / `view,agent`: live agent configuration
    ViewConfig,
    /// `config` / `save,<path>,<base64>`: push a configuration file for a service
    SaveServiceConfig { path: String, content: String },
    /// `exec` / `<program>,<arg>...`
    Exec { program: String, args: Vec<String> },
    /// `control` / `services/<service>/<subtopic>,<body>`
    Control { service: String, subtopic: String, body: String },
    /// `term` / base64 terminal instruction
    Terminal(TerminalCommand),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalCommand {
    Open,
    Close,
    Input(Vec<u8>),
}

/// A decoded control request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub uuid: String,
    pub command: Command,
}

impl Request {
    /// Decodes a request pack; `fallback_uuid` is used when record 0 has no base name.
    pub fn decode(payload: &[u8], fallback_uuid: &str) -> Result<Self> {
        let records = senml::decode(payload)?;
        let first = records
            .first()
            .ok_or_else(|| AgentError::Malformed("empty measurement pack".into()))?;
        let uuid = record_uuid(first).unwrap_or_else(|| fallback_uuid.to_string());
        let name = first
            .name
            .as_deref()
            .ok_or_else(|| AgentError::Malformed("missing command name".into()))?;
        let value = first
            .string_value
            .as_deref()
            .ok_or_else(|| AgentError::Malformed(format!("missing value for {name}")))?;
        Ok(Self {
            uuid,
            command: Command::parse(name, value)?,
        })
    }
}

/// Caller uuid carried by a request, if the payload decodes at all.
pub fn request_uuid(payload: &[u8]) -> Option<String> {
    senml::decode(payload).ok()?.first().and_then(record_uuid)
}

fn record_uuid(record: &Record) -> Option<String> {
    record
        .base_name
        .as_deref()
        .map(|bn| bn.trim_end_matches(':').to_string())
        .filter(|uuid| !uuid.is_empty())
}

impl Command {
    pub fn parse(name: &str, value: &str) -> Result<Self> {
        match name {
            CONFIG => parse_config(value),
            EXEC => parse_exec(value),
            CONTROL => parse_control(value),
            TERM => Ok(Command::Terminal(TerminalCommand::decode(value)?)),
            other => Err(AgentError::UnknownCommand(other.to_string())),
        }
    }

    /// Record name used for the response to this command.
    pub fn response_name(&self) -> &str {
        match self {
            Command::ViewServices | Command::ViewConfig => VIEW,
            Command::SaveServiceConfig { .. } => SAVE,
            Command::Exec { program, .. } => program,
            Command::Control { .. } => CONTROL,
            Command::Terminal(_) => TERM,
        }
    }
}

/// Parses the value of a `config` command.
pub fn parse_config(value: &str) -> Result<Command> {
    let args: Vec<&str> = value.split(',').map(str::trim).collect();
    match args.as_slice() {
        [VIEW] => Ok(Command::ViewServices),
        [VIEW, "agent"] => Ok(Command::ViewConfig),
        [VIEW, other] => Err(AgentError::UnknownCommand(format!("config view {other}"))),
        [SAVE, path, content] if !path.is_empty() && !content.is_empty() => {
            Ok(Command::SaveServiceConfig {
                path: path.to_string(),
                content: content.to_string(),
            })
        }
        [SAVE, ..] => Err(AgentError::Malformed("config save expects <path>,<base64>".into())),
        [""] => Err(AgentError::Malformed("empty config command".into())),
        [other, ..] => Err(AgentError::UnknownCommand(format!("config {other}"))),
        [] => Err(AgentError::Malformed("empty config command".into())),
    }
}

fn parse_exec(value: &str) -> Result<Command> {
    let mut parts = value.split(',').map(str::trim).filter(|s| !s.is_empty());
    let program = parts
        .next()
        .ok_or_else(|| AgentError::Malformed("exec expects <program>[,<arg>...]".into()))?;
    Ok(Command::Exec {
        program: program.to_string(),
        args: parts.map(str::to_string).collect(),
    })
}

/// Parses `services/<service>/<subtopic>[,<body>]`.
pub fn parse_control(value: &str) -> Result<Command> {
    let (path, body) = value.split_once(',').unwrap_or((value, ""));
    let (service, subtopic) = parse_service_path(path.trim())
        .ok_or_else(|| AgentError::Malformed(format!("invalid service address {:?}", path.trim())))?;
    Ok(Command::Control {
        service: service.to_string(),
        subtopic: subtopic.to_string(),
        body: body.to_string(),
    })
}

impl TerminalCommand {
    /// Decodes a base64 terminal instruction: `open`, `close` or `c,<chars>`.
    pub fn decode(value: &str) -> Result<Self> {
        let raw = STANDARD
            .decode(value.trim())
            .map_err(|e| AgentError::Malformed(format!("invalid terminal payload: {e}")))?;
        let (head, rest) = match raw.iter().position(|b| *b == b',') {
            Some(i) => (&raw[..i], Some(&raw[i + 1..])),
            None => (&raw[..], None),
        };
        match (head, rest) {
            (b"c", Some(chars)) => Ok(TerminalCommand::Input(chars.to_vec())),
            (b"c", None) => Err(AgentError::Malformed("terminal input without characters".into())),
            (b"open", _) => Ok(TerminalCommand::Open),
            (b"close", _) => Ok(TerminalCommand::Close),
            (other, _) => Err(AgentError::UnknownCommand(format!(
                "term {}",
                String::from_utf8_lossy(other)
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn b64(s: &str) -> String {
        STANDARD.encode(s)
    }

    #[test]
    fn decodes_config_view_request() {
        let request = Request::decode(br#"[{"bn":"1:","n":"config","vs":"view"}]"#, "").unwrap();
        assert_eq!(request.uuid, "1");
        assert_eq!(request.command, Command::ViewServices);
        assert_eq!(request.command.response_name(), "view");
    }

    #[test]
    fn config_variants() {
        assert_eq!(parse_config("view, agent").unwrap(), Command::ViewConfig);
        assert_eq!(
            parse_config("save,/etc/svc/config.toml,aGVsbG8=").unwrap(),
            Command::SaveServiceConfig {
                path: "/etc/svc/config.toml".into(),
                content: "aGVsbG8=".into()
            }
        );
        assert_eq!(parse_config("save,/only/path").unwrap_err().kind(), ErrorKind::Malformed);
        assert_eq!(parse_config("purge").unwrap_err().kind(), ErrorKind::UnknownCommand);
        assert_eq!(parse_config("").unwrap_err().kind(), ErrorKind::Malformed);
    }

    #[test]
    fn exec_splits_arguments() {
        assert_eq!(
            Command::parse("exec", "ls, -l,/tmp").unwrap(),
            Command::Exec {
                program: "ls".into(),
                args: vec!["-l".into(), "/tmp".into()]
            }
        );
        assert_eq!(Command::parse("exec", " , ").unwrap_err().kind(), ErrorKind::Malformed);
    }

    #[test]
    fn control_addresses_a_service() {
        assert_eq!(
            Command::parse("control", "services/export/restart,now").unwrap(),
            Command::Control {
                service: "export".into(),
                subtopic: "restart".into(),
                body: "now".into()
            }
        );
        assert_eq!(
            Command::parse("control", "export/restart").unwrap_err().kind(),
            ErrorKind::Malformed
        );
    }

    #[test]
    fn terminal_instructions() {
        assert_eq!(TerminalCommand::decode(&b64("open")).unwrap(), TerminalCommand::Open);
        assert_eq!(TerminalCommand::decode(&b64("close")).unwrap(), TerminalCommand::Close);
        assert_eq!(
            TerminalCommand::decode(&b64("c,ls -la\n")).unwrap(),
            TerminalCommand::Input(b"ls -la\n".to_vec())
        );
        assert_eq!(
            TerminalCommand::decode(&b64("c,a,b")).unwrap(),
            TerminalCommand::Input(b"a,b".to_vec())
        );
        assert_eq!(TerminalCommand::decode("%%%").unwrap_err().kind(), ErrorKind::Malformed);
        assert_eq!(
            TerminalCommand::decode(&b64("resize,80x24")).unwrap_err().kind(),
            ErrorKind::UnknownCommand
        );
    }

    #[test]
    fn unknown_and_malformed_are_distinct() {
        let unknown = Request::decode(br#"[{"bn":"1:","n":"reboot","vs":"now"}]"#, "").unwrap_err();
        assert_eq!(unknown.kind(), ErrorKind::UnknownCommand);

        let malformed = Request::decode(b"{not json", "").unwrap_err();
        assert_eq!(malformed.kind(), ErrorKind::Malformed);

        let empty = Request::decode(b"[]", "").unwrap_err();
        assert_eq!(empty.kind(), ErrorKind::Malformed);

        let no_value = Request::decode(br#"[{"bn":"1:","n":"config"}]"#, "").unwrap_err();
        assert_eq!(no_value.kind(), ErrorKind::Malformed);
    }

    #[test]
    fn fallback_uuid_and_peek() {
        let request = Request::decode(br#"[{"n":"config","vs":"view"}]"#, "caller").unwrap();
        assert_eq!(request.uuid, "caller");
        assert_eq!(request_uuid(br#"[{"bn":"abc:","n":"x","vs":"y"}]"#).as_deref(), Some("abc"));
        assert_eq!(request_uuid(b"garbage"), None);
    }
}
