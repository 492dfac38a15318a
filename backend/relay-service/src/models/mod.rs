use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};

/// Wire-format event published by the message-producing service.
///
/// Expected payload:
/// ```json
/// {
///   "email": "a@x.com",
///   "message": "hello"
/// }
/// ```
///
/// The sender's email is also supplied out-of-band as the Kafka message key,
/// so all events from one sender land on the same partition in order.
/// Unknown fields are tolerated on decode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEvent {
    /// Sender identity, doubles as the partition key
    pub email: String,

    /// User-authored message body
    pub message: String,
}

impl MessageEvent {
    pub fn new(email: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            message: message.into(),
        }
    }

    /// Validate an event at the producing edge.
    ///
    /// The producer itself does not re-validate; this is for callers that
    /// accept user input before publishing.
    pub fn validate(&self) -> Result<()> {
        if self.email.is_empty() {
            return Err(RelayError::Validation("email is empty".to_string()));
        }

        if self.message.is_empty() {
            return Err(RelayError::Validation("message is empty".to_string()));
        }

        Ok(())
    }
}

/// Persisted form of a successfully processed event.
///
/// `id` and `received_at` are assigned by the store on insert; rows are never
/// mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Message {
    pub id: i64,
    pub email: String,
    pub message: String,
    pub received_at: DateTime<Utc>,
}
