use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::ClientConfig;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{RelayError, Result};
use crate::models::MessageEvent;

/// Kafka producer wrapper for user message events.
///
/// Serializes the event as JSON and sends it keyed by the sender's email, so
/// all events from one sender stay on one partition. `publish` returns the
/// broker acknowledgment outcome to the caller; on error, delivery state is
/// unknown and the caller must not assume the message was persisted.
#[derive(Clone)]
pub struct MessageProducer {
    producer: FutureProducer,
    topic: String,
    timeout: Duration,
}

impl MessageProducer {
    pub fn new(brokers: &str, topic: String) -> Result<Self> {
        let producer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            .set("queue.buffering.max.messages", "100000")
            .set("acks", "all")
            .set("compression.type", "lz4")
            .create()
            .map_err(RelayError::Kafka)?;

        Ok(Self {
            producer,
            topic,
            timeout: Duration::from_secs(5),
        })
    }

    /// Publish an event keyed by the sender's identity.
    ///
    /// Preconditions (non-empty key and body) are enforced at the producing
    /// edge before this is called; no re-validation happens here.
    pub async fn publish(&self, key: &str, event: &MessageEvent) -> Result<()> {
        let payload = serde_json::to_vec(event)?;
        let record = FutureRecord::to(&self.topic).payload(&payload).key(key);

        debug!("Publishing event to topic {} (key={})", self.topic, key);

        match timeout(self.timeout, self.producer.send(record, self.timeout)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err((e, _))) => Err(RelayError::Kafka(e)),
            Err(_) => {
                warn!("Kafka send timed out after {:?}", self.timeout);
                Err(RelayError::Internal("Kafka publish timeout".into()))
            }
        }
    }

    /// Flush in-flight sends; call on every exit path of the owning process.
    pub fn flush(&self, timeout: Duration) -> Result<()> {
        self.producer.flush(timeout).map_err(RelayError::Kafka)
    }
}
