/*!
Test harness for the gateway agent

- Builds an `AgentService` on two `MockPublisher`s and a temporary config file
- Injects control requests, service messages and heartbeats the way the bridge does
- Polls for published responses and checks message count expectations
*/

use crate::mqtt_stub::{MockMessage, MockPublisher};
use anyhow::Result;
use gateway_agent::bridge;
use gateway_agent::heartbeat::Transition;
use gateway_agent::senml::Record;
use gateway_agent::transport::{request_topic, response_topic};
use gateway_agent::{AgentService, Config};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Countdown resolution used by harness terminals
pub const TEST_TICK: Duration = Duration::from_millis(50);

pub struct TestHarness {
    pub service: Arc<AgentService>,
    /// Device-local MQTT side
    pub local: MockPublisher,
    /// Cluster broker side
    pub broker: MockPublisher,
    dir: tempfile::TempDir,
    expectations: Vec<Expectation>,
}

#[derive(Debug)]
struct Expectation {
    topic: String,
    expected_count: usize,
}

impl TestHarness {
    pub fn new() -> Result<Self> {
        Self::with_config(|_| {})
    }

    /// Harness whose config is adjusted by `customize` before the agent starts.
    pub fn with_config<F: FnOnce(&mut Config)>(customize: F) -> Result<Self> {
        env_logger::try_init().ok();

        let dir = tempfile::tempdir()?;
        let mut config = Config::default();
        config.channels.control = "ctrl-test".into();
        config.channels.data = "data-test".into();
        config.terminal.shell = "sh".into();
        config.terminal.session_timeout = 100;
        config.file = dir.path().join("agent.toml");
        customize(&mut config);

        let local = MockPublisher::new();
        let broker = MockPublisher::new();
        let service = Arc::new(AgentService::with_terminal_tick(
            config,
            Arc::new(local.clone()),
            Arc::new(broker.clone()),
            TEST_TICK,
        ));

        Ok(Self {
            service,
            local,
            broker,
            dir,
            expectations: Vec::new(),
        })
    }

    /// Scratch directory removed with the harness
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn control_channel(&self) -> String {
        self.service.config().channels.control
    }

    pub fn response_topic(&self) -> String {
        response_topic(&self.control_channel())
    }

    /// Delivers a control request as if it arrived on the request topic
    pub async fn send_request(&self, payload: &[u8]) {
        let topic = request_topic(&self.control_channel());
        bridge::dispatch(&self.service, &topic, payload.to_vec()).await;
        log::info!("📨 Sent request on {}", topic);
    }

    /// Delivers an opaque message on `channels/<control>/messages/services/<service>/<subtopic>`
    pub async fn send_service_message(&self, service: &str, subtopic: &str, payload: &[u8]) {
        let topic = format!(
            "channels/{}/messages/services/{}/{}",
            self.control_channel(),
            service,
            subtopic
        );
        bridge::dispatch(&self.service, &topic, payload.to_vec()).await;
    }

    /// Simulates a broker heartbeat on `heartbeat.<name>.<type>`
    pub fn send_heartbeat(&self, name: &str, service_type: &str) -> Option<Transition> {
        log::info!("💓 Sent heartbeat for {}.{}", name, service_type);
        self.service
            .registry()
            .handle_subject(&format!("heartbeat.{name}.{service_type}"))
    }

    /// Waits until a message shows up on `topic` on the device-local side
    pub async fn wait_for_message(&self, topic: &str, timeout_ms: u64) -> Option<MockMessage> {
        let start = std::time::Instant::now();
        while start.elapsed() < Duration::from_millis(timeout_ms) {
            if let Some(msg) = self.local.find_messages_by_topic(topic).pop() {
                log::info!("✅ Received expected message on {}", topic);
                return Some(msg);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        log::warn!("⏰ Timeout waiting for message on {}", topic);
        None
    }

    /// Waits until any message on `topic` decodes to records matching `predicate`
    pub async fn wait_for_records<P>(&self, topic: &str, timeout_ms: u64, predicate: P) -> Result<Option<Vec<Record>>>
    where
        P: Fn(&[Record]) -> bool,
    {
        let start = std::time::Instant::now();
        while start.elapsed() < Duration::from_millis(timeout_ms) {
            for msg in self.local.find_messages_by_topic(topic) {
                let records = gateway_agent::senml::decode(&msg.payload)?;
                if predicate(&records) {
                    return Ok(Some(records));
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        Ok(None)
    }

    /// First record of the latest response on the control channel
    pub fn last_response(&self) -> Result<Option<Record>> {
        let records = self.local.get_last_records(&self.response_topic())?;
        Ok(records.and_then(|records| records.into_iter().next()))
    }

    /// Expects exactly `count` messages on `topic` (either transport)
    pub fn expect_messages(&mut self, topic: &str, count: usize) -> &mut Self {
        self.expectations.push(Expectation {
            topic: topic.to_string(),
            expected_count: count,
        });
        self
    }

    pub fn verify_expectations(&self) -> Result<()> {
        for expectation in &self.expectations {
            let actual_count = self.local.find_messages_by_topic(&expectation.topic).len()
                + self.broker.find_messages_by_topic(&expectation.topic).len();
            if actual_count != expectation.expected_count {
                anyhow::bail!(
                    "Expectation failed for topic '{}': expected {} messages, got {}",
                    expectation.topic,
                    expectation.expected_count,
                    actual_count
                );
            }
        }
        log::info!("🎉 {} expectations verified", self.expectations.len());
        Ok(())
    }

    pub fn get_stats(&self) -> TestStats {
        let mut topic_counts = HashMap::new();
        let local = self.local.get_published_messages();
        let broker = self.broker.get_published_messages();
        for msg in local.iter().chain(broker.iter()) {
            *topic_counts.entry(msg.topic.clone()).or_insert(0) += 1;
        }
        TestStats {
            total_messages: local.len() + broker.len(),
            topic_counts,
        }
    }

    pub fn reset(&mut self) {
        self.local.clear();
        self.broker.clear();
        self.expectations.clear();
        log::info!("🧹 Test harness reset");
    }
}

#[derive(Debug)]
pub struct TestStats {
    pub total_messages: usize,
    pub topic_counts: HashMap<String, usize>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt_stub::RequestBuilder;

    #[tokio::test]
    async fn test_harness_basic_functionality() {
        let mut harness = TestHarness::new().unwrap();
        let response_topic = harness.response_topic();
        harness.expect_messages(&response_topic, 1);

        harness.send_request(&RequestBuilder::new("1").config_view()).await;

        harness.verify_expectations().unwrap();
        let record = harness.last_response().unwrap().unwrap();
        assert_eq!(record.name.as_deref(), Some("view"));
        assert_eq!(harness.get_stats().total_messages, 1);

        harness.reset();
        assert_eq!(harness.get_stats().total_messages, 0);
    }

    #[tokio::test]
    async fn test_customized_config() {
        let harness = TestHarness::with_config(|config| config.channels.control = "other".into()).unwrap();
        assert_eq!(harness.response_topic(), "channels/other/messages/res");
    }
}
