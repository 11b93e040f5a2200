//! Transport seams
//!
//! The agent talks to two transports: the device-local MQTT channel and the
//! cluster broker. Both are reached through [`Publisher`] so the dispatcher can
//! be driven by stubs in tests.

pub mod broker;
pub mod mqtt;
#[cfg(test)]
pub(crate) mod testing;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("MQTT error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),
    #[error("broker error: {0}")]
    Broker(String),
    #[error("{0}")]
    Unavailable(String),
}

/// Fire-and-forget publish on one transport
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;
}

pub type SharedPublisher = Arc<dyn Publisher>;

/// Broker wildcard every co-located service heartbeats on
pub const HEARTBEAT_SUBJECT: &str = "heartbeat.*.*";
pub const COMMANDS_PREFIX: &str = "commands";
pub const TERMINAL_PREFIX: &str = "term";

pub fn request_topic(control: &str) -> String {
    format!("channels/{control}/messages/req")
}

pub fn response_topic(control: &str) -> String {
    format!("channels/{control}/messages/res")
}

pub fn data_topic(data: &str) -> String {
    format!("channels/{data}/messages")
}

pub fn services_filter(control: &str) -> String {
    format!("channels/{control}/messages/services/#")
}

pub fn terminal_topic(uuid: &str) -> String {
    format!("{TERMINAL_PREFIX}/{uuid}")
}

/// `commands.<service>.<subtopic>`; nested subtopic levels become subject tokens.
pub fn service_command_subject(service: &str, subtopic: &str) -> String {
    format!("{COMMANDS_PREFIX}.{service}.{}", subtopic.replace('/', "."))
}

/// Splits `services/<service>/<subtopic...>` into its service and subtopic.
pub fn parse_service_path(path: &str) -> Option<(&str, &str)> {
    let rest = path.strip_prefix("services/")?;
    let (service, subtopic) = rest.split_once('/')?;
    if service.is_empty() || subtopic.is_empty() {
        return None;
    }
    Some((service, subtopic))
}

/// Extracts service and subtopic from an inbound MQTT topic on the control channel.
pub fn parse_service_topic<'a>(control: &str, topic: &'a str) -> Option<(&'a str, &'a str)> {
    let prefix = format!("channels/{control}/messages/");
    parse_service_path(topic.strip_prefix(prefix.as_str())?)
}

/// `heartbeat.<name>.<type>` -> `(name, type)`
pub fn parse_heartbeat_subject(subject: &str) -> Option<(&str, &str)> {
    let mut tokens = subject.split('.');
    if tokens.next()? != "heartbeat" {
        return None;
    }
    let name = tokens.next().filter(|s| !s.is_empty())?;
    let kind = tokens.next().filter(|s| !s.is_empty())?;
    Some((name, kind))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_channel_topics() {
        assert_eq!(request_topic("c1"), "channels/c1/messages/req");
        assert_eq!(response_topic("c1"), "channels/c1/messages/res");
        assert_eq!(services_filter("c1"), "channels/c1/messages/services/#");
        assert_eq!(data_topic("d1"), "channels/d1/messages");
        assert_eq!(terminal_topic("u-1"), "term/u-1");
    }

    #[test]
    fn service_topics_map_to_command_subjects() {
        let topic = "channels/c1/messages/services/export/restart";
        let (svc, sub) = parse_service_topic("c1", topic).unwrap();
        assert_eq!((svc, sub), ("export", "restart"));
        assert_eq!(service_command_subject(svc, sub), "commands.export.restart");
        assert_eq!(service_command_subject("export", "a/b"), "commands.export.a.b");

        assert!(parse_service_topic("c2", topic).is_none());
        assert!(parse_service_path("services/export").is_none());
        assert!(parse_service_path("services//x").is_none());
    }

    #[test]
    fn heartbeat_subjects() {
        assert_eq!(parse_heartbeat_subject("heartbeat.duster.test"), Some(("duster", "test")));
        assert_eq!(parse_heartbeat_subject("heartbeat.duster"), None);
        assert_eq!(parse_heartbeat_subject("commands.duster.test"), None);
    }
}
