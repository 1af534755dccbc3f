//! Job dispatch onto the analysis work queue.
//!
//! The ingestion path publishes one message per admitted digest; the
//! external analysis pipeline is the sole consumer. Publish failures are
//! hard errors for the caller, never swallowed.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("queue connect failed: {0}")]
    Connect(String),
    #[error("queue publish failed: {0}")]
    Publish(String),
}

#[async_trait]
pub trait JobDispatcher: Send + Sync {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), DispatchError>;
}

/// NATS-backed dispatcher.
pub struct NatsDispatcher {
    client: async_nats::Client,
}

impl NatsDispatcher {
    pub async fn connect(url: &str) -> Result<Self, DispatchError> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| DispatchError::Connect(e.to_string()))?;
        tracing::info!("Connected to NATS at {}", url);
        Ok(Self { client })
    }
}

#[async_trait]
impl JobDispatcher for NatsDispatcher {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), DispatchError> {
        self.client
            .publish(topic.to_string(), Bytes::copy_from_slice(payload))
            .await
            .map_err(|e| DispatchError::Publish(e.to_string()))?;
        // Publishes are buffered client-side; flush so a broker failure
        // surfaces to this request instead of being silently dropped.
        self.client
            .flush()
            .await
            .map_err(|e| DispatchError::Publish(e.to_string()))?;
        Ok(())
    }
}
