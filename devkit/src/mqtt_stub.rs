/*!
Mock transport publisher for development without brokers

Records every publish so tests can assert on what the agent sent, on the
device-local channel or on the broker. Can be switched to failing mode to
exercise transport error paths.
*/

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use gateway_agent::senml::{self, Record};
use gateway_agent::transport::{Publisher, TransportError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct MockMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Mock publisher usable as either agent transport
#[derive(Clone, Default)]
pub struct MockPublisher {
    published_messages: Arc<Mutex<Vec<MockMessage>>>,
    failing: Arc<AtomicBool>,
}

impl MockPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following publish fail with a transport error
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn get_published_messages(&self) -> Vec<MockMessage> {
        self.published_messages.lock().clone()
    }

    pub fn find_messages_by_topic(&self, topic: &str) -> Vec<MockMessage> {
        self.published_messages
            .lock()
            .iter()
            .filter(|msg| msg.topic == topic)
            .cloned()
            .collect()
    }

    /// Decodes the last message on a topic as a measurement pack
    pub fn get_last_records(&self, topic: &str) -> anyhow::Result<Option<Vec<Record>>> {
        match self.find_messages_by_topic(topic).last() {
            Some(msg) => Ok(Some(senml::decode(&msg.payload)?)),
            None => Ok(None),
        }
    }

    pub fn clear(&self) {
        self.published_messages.lock().clear();
    }
}

#[async_trait]
impl Publisher for MockPublisher {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        if self.failing.load(Ordering::SeqCst) {
            log::warn!("❌ [MOCK] Refusing publish to {}", topic);
            return Err(TransportError::Unavailable(format!("mock publisher failing ({topic})")));
        }
        log::info!("📤 [MOCK] Published to {}: {} bytes", topic, payload.len());
        self.published_messages.lock().push(MockMessage {
            topic: topic.to_string(),
            payload,
        });
        Ok(())
    }
}

/// Builds control-channel request packs for one caller uuid
pub struct RequestBuilder {
    uuid: String,
}

impl RequestBuilder {
    pub fn new<S: Into<String>>(uuid: S) -> Self {
        Self { uuid: uuid.into() }
    }

    /// `[{"bn": "<uuid>:", "n": <name>, "vs": <value>}]`
    pub fn raw(&self, name: &str, value: &str) -> Vec<u8> {
        serde_json::json!([{
            "bn": format!("{}:", self.uuid),
            "n": name,
            "vs": value,
        }])
        .to_string()
        .into_bytes()
    }

    pub fn config_view(&self) -> Vec<u8> {
        self.raw("config", "view")
    }

    pub fn config_view_agent(&self) -> Vec<u8> {
        self.raw("config", "view,agent")
    }

    pub fn config_save(&self, path: &str, content: &str) -> Vec<u8> {
        self.raw("config", &format!("save,{},{}", path, STANDARD.encode(content)))
    }

    pub fn exec(&self, program: &str, args: &[&str]) -> Vec<u8> {
        let mut value = program.to_string();
        for arg in args {
            value.push(',');
            value.push_str(arg);
        }
        self.raw("exec", &value)
    }

    pub fn control(&self, service: &str, subtopic: &str, body: &str) -> Vec<u8> {
        self.raw("control", &format!("services/{service}/{subtopic},{body}"))
    }

    pub fn term_open(&self) -> Vec<u8> {
        self.raw("term", &STANDARD.encode("open"))
    }

    pub fn term_close(&self) -> Vec<u8> {
        self.raw("term", &STANDARD.encode("close"))
    }

    pub fn term_input(&self, chars: &str) -> Vec<u8> {
        self.raw("term", &STANDARD.encode(format!("c,{chars}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_publisher_records() {
        let publisher = MockPublisher::new();
        publisher.publish("test/topic", b"test message".to_vec()).await.unwrap();

        let messages = publisher.get_published_messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].topic, "test/topic");
        assert_eq!(messages[0].payload, b"test message");
        assert!(publisher.find_messages_by_topic("other").is_empty());
    }

    #[tokio::test]
    async fn test_failing_mode() {
        let publisher = MockPublisher::new();
        publisher.set_failing(true);
        assert!(publisher.publish("t", vec![1]).await.is_err());
        publisher.set_failing(false);
        assert!(publisher.publish("t", vec![1]).await.is_ok());
        assert_eq!(publisher.get_published_messages().len(), 1);
    }

    #[tokio::test]
    async fn test_last_records() {
        let publisher = MockPublisher::new();
        publisher
            .publish("res", senml::encode("u1", "view", "[]").unwrap())
            .await
            .unwrap();
        let records = publisher.get_last_records("res").unwrap().unwrap();
        assert_eq!(records[0].key(), "u1view");
    }

    #[test]
    fn test_request_builders() {
        let builder = RequestBuilder::new("42");
        let records = senml::decode(&builder.exec("ls", &["-l", "/tmp"])).unwrap();
        assert_eq!(records[0].base_name.as_deref(), Some("42:"));
        assert_eq!(records[0].string_value.as_deref(), Some("ls,-l,/tmp"));

        let records = senml::decode(&builder.term_input("ls\n")).unwrap();
        let decoded = STANDARD.decode(records[0].string_value.as_deref().unwrap()).unwrap();
        assert_eq!(decoded, b"c,ls\n");
    }
}
