//! Kafka consumer group for user message events.
//!
//! Joins a fixed consumer group, decodes each delivered event and persists it
//! through a [`MessageStore`]. Offset discipline is "mark then commit on
//! cadence": the loop stores the offset of every handled message (including
//! failed ones) and librdkafka commits stored offsets on its auto-commit
//! interval, so a crash between mark and commit can reprocess a message.
//!
//! Failure policy, reproduced from the producing system's documented
//! behavior:
//! - malformed payloads are logged and skipped permanently; retrying them
//!   would stall every later valid message on the partition;
//! - a failed store write is logged and the message is skipped as well, so a
//!   store outage drops records rather than blocking the partition. This is
//!   the at-most-once-leaning baseline, not a bug.

use async_trait::async_trait;
use futures::StreamExt;
use rdkafka::client::ClientContext;
use rdkafka::consumer::{CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::error::{KafkaError, KafkaResult, RDKafkaErrorCode};
use rdkafka::message::{BorrowedMessage, Message as KafkaMessage};
use rdkafka::{ClientConfig, TopicPartitionList};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::KafkaConfig;
use crate::error::Result;
use crate::models::{Message, MessageEvent};
use crate::repositories::MessageStore;

/// Per-message failure classes. Both are recovered inside the claim loop and
/// never surface past the handler.
#[derive(Debug, Error)]
pub enum HandleError {
    #[error("decode error: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("persist error: {0}")]
    Persist(#[source] crate::error::RelayError),
}

/// Hooks invoked around the claim loop, implemented once by the concrete
/// handler. `setup` runs before the first message, `cleanup` on every exit
/// path of the loop.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Warm-up hook, no-op by default.
    async fn setup(&self) -> Result<()> {
        Ok(())
    }

    /// Teardown hook, no-op by default.
    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }

    /// Process one message payload in delivery order.
    async fn handle(&self, payload: &[u8]) -> std::result::Result<Message, HandleError>;
}

/// The concrete handler: decode the payload as a [`MessageEvent`] and write
/// it to the store.
pub struct PersistingHandler {
    store: Arc<dyn MessageStore>,
}

impl PersistingHandler {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl EventHandler for PersistingHandler {
    async fn handle(&self, payload: &[u8]) -> std::result::Result<Message, HandleError> {
        let event: MessageEvent =
            serde_json::from_slice(payload).map_err(HandleError::Decode)?;

        self.store
            .create(&event.email, &event.message)
            .await
            .map_err(HandleError::Persist)
    }
}

/// Consumer context surfacing group membership transitions.
///
/// Rebalance callbacks run on the librdkafka coordinator thread; revocation
/// of the current assignment is followed by a rejoin, so these logs are the
/// observable form of the Joining/Assigned/Consuming/Rebalancing states.
pub struct RelayConsumerContext;

impl ClientContext for RelayConsumerContext {}

impl ConsumerContext for RelayConsumerContext {
    fn pre_rebalance(&self, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(tpl) => {
                info!(partitions = ?tpl, "Group rebalance: assignment revoked")
            }
            Rebalance::Assign(tpl) => debug!(partitions = ?tpl, "Group rebalance: assigning"),
            Rebalance::Error(e) => error!(error = ?e, "Group rebalance error"),
        }
    }

    fn post_rebalance(&self, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Assign(tpl) => {
                info!(partitions = ?tpl, "Group rebalance: assignment granted")
            }
            Rebalance::Revoke(tpl) => debug!(partitions = ?tpl, "Group rebalance: revoked"),
            Rebalance::Error(e) => error!(error = ?e, "Group rebalance error"),
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(()) => debug!(offsets = ?offsets, "Offsets committed"),
            Err(e) => warn!(error = %e, "Offset commit failed"),
        }
    }
}

type RelayStreamConsumer = StreamConsumer<RelayConsumerContext>;

/// Whether a consumer error ends the run.
///
/// librdkafka marks the client fatal when it cannot recover on its own, for
/// example a fenced member after exceeding `max.poll.interval.ms`. Everything
/// else (broker transport hiccups, timeouts) is retried in place after a
/// short backoff.
fn is_fatal(err: &KafkaError) -> bool {
    matches!(err.rdkafka_error_code(), Some(RDKafkaErrorCode::Fatal))
}

/// Kafka consumer group member relaying message events into the store.
pub struct MessageConsumer {
    consumer: RelayStreamConsumer,
    handler: Arc<dyn EventHandler>,
    shutdown_rx: watch::Receiver<bool>,
}

impl MessageConsumer {
    /// Create a consumer joined to the configured group and topic.
    ///
    /// `enable.auto.offset.store=false` makes offset storage explicit: the
    /// loop marks a message consumed only after its per-message work is done,
    /// and the auto-commit interval picks up stored offsets from there.
    pub fn new(
        config: &KafkaConfig,
        handler: Arc<dyn EventHandler>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Result<Self> {
        let consumer: RelayStreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &config.group_id)
            .set("enable.auto.commit", "true")
            .set("auto.commit.interval.ms", "5000")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", "45000")
            .set("max.poll.interval.ms", "300000")
            .create_with_context(RelayConsumerContext)?;

        consumer.subscribe(&[&config.topic])?;

        info!(
            brokers = %config.brokers,
            topic = %config.topic,
            group_id = %config.group_id,
            "Message consumer initialized"
        );

        Ok(Self {
            consumer,
            handler,
            shutdown_rx,
        })
    }

    /// Run the claim loop until shutdown, stream end or a fatal client error.
    ///
    /// Cancellation is cooperative: the signal is checked between messages,
    /// never mid-message, so an in-flight store write completes or fails on
    /// its own.
    pub async fn run(&mut self) -> Result<()> {
        self.handler.setup().await?;

        info!("Starting message consumer loop");

        let mut message_stream = self.consumer.stream();
        let mut fatal: Option<KafkaError> = None;

        loop {
            tokio::select! {
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping consumer");
                        break;
                    }
                }

                message = message_stream.next() => {
                    match message {
                        Some(Ok(msg)) => {
                            self.process_message(&msg).await;
                        }
                        Some(Err(e)) => {
                            if is_fatal(&e) {
                                error!(error = %e, "Unrecoverable Kafka consumer error");
                                fatal = Some(e);
                                break;
                            }
                            error!(error = %e, "Kafka consumer error");
                            // Transient broker errors: back off briefly and keep consuming
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                        None => {
                            warn!("Message stream ended unexpectedly");
                            break;
                        }
                    }
                }
            }
        }

        drop(message_stream);

        // Flush marked offsets before leaving the group so a clean shutdown
        // does not redeliver already-handled messages.
        if let Err(e) = self.consumer.commit_consumer_state(CommitMode::Sync) {
            debug!(error = %e, "Final offset commit skipped");
        }

        self.handler.cleanup().await?;

        // A fatal client state propagates to the lifecycle controller, which
        // exits non-zero and leaves the restart decision to the supervisor.
        if let Some(e) = fatal {
            return Err(e.into());
        }

        info!("Message consumer stopped");
        Ok(())
    }

    /// Process a single delivery and mark it consumed.
    ///
    /// The offset is stored on every path: success, decode failure and
    /// persist failure all advance past the message.
    async fn process_message(&self, msg: &BorrowedMessage<'_>) {
        let partition = msg.partition();
        let offset = msg.offset();

        match msg.payload() {
            Some(payload) => match self.handler.handle(payload).await {
                Ok(saved) => {
                    info!(
                        partition,
                        offset,
                        id = saved.id,
                        email = %saved.email,
                        "Message persisted"
                    );
                }
                Err(HandleError::Decode(e)) => {
                    warn!(
                        partition,
                        offset,
                        error = %e,
                        "Failed to decode message, skipping"
                    );
                }
                Err(HandleError::Persist(e)) => {
                    error!(
                        partition,
                        offset,
                        error = %e,
                        "Failed to persist message, skipping"
                    );
                }
            },
            None => {
                debug!(partition, offset, "Empty message payload, skipping");
            }
        }

        if let Err(e) = self.consumer.store_offset_from_message(msg) {
            error!(partition, offset, error = %e, "Failed to store offset");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_client_errors_end_the_run() {
        assert!(is_fatal(&KafkaError::MessageConsumption(
            RDKafkaErrorCode::Fatal
        )));
    }

    #[test]
    fn test_transient_errors_are_retried_in_place() {
        assert!(!is_fatal(&KafkaError::MessageConsumption(
            RDKafkaErrorCode::BrokerTransportFailure
        )));
        assert!(!is_fatal(&KafkaError::MessageConsumption(
            RDKafkaErrorCode::RequestTimedOut
        )));
        assert!(!is_fatal(&KafkaError::MessageConsumption(
            RDKafkaErrorCode::AllBrokersDown
        )));
    }
}
