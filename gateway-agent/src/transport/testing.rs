use async_trait::async_trait;
use parking_lot::Mutex;

use super::{Publisher, TransportError};

/// In-crate publisher stub for unit tests
#[derive(Default)]
pub struct Recorder {
    sent: Mutex<Vec<(String, Vec<u8>)>>,
    fail: bool,
}

impl Recorder {
    pub fn failing() -> Self {
        Self { fail: true, ..Default::default() }
    }

    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.sent.lock().clone()
    }

    pub fn on_topic(&self, topic: &str) -> Vec<Vec<u8>> {
        self.sent
            .lock()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, p)| p.clone())
            .collect()
    }
}

#[async_trait]
impl Publisher for Recorder {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        if self.fail {
            return Err(TransportError::Unavailable("publisher down".into()));
        }
        self.sent.lock().push((topic.to_string(), payload));
        Ok(())
    }
}
