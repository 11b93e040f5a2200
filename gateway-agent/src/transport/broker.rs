use async_trait::async_trait;

use super::{Publisher, TransportError};

/// Cluster broker publisher (NATS)
#[derive(Clone)]
pub struct BrokerPublisher {
    client: async_nats::Client,
}

impl BrokerPublisher {
    pub fn new(client: async_nats::Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &async_nats::Client {
        &self.client
    }
}

#[async_trait]
impl Publisher for BrokerPublisher {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        self.client
            .publish(subject.to_string(), payload.into())
            .await
            .map_err(|e| TransportError::Broker(e.to_string()))
    }
}

pub async fn connect(url: &str) -> Result<async_nats::Client, TransportError> {
    async_nats::connect(url)
        .await
        .map_err(|e| TransportError::Broker(format!("connect to {url}: {e}")))
}
