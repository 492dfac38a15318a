//! Unit tests for the relay consumer's per-message processing
//!
//! This test module covers the documented failure policy with an in-memory
//! store and no live broker:
//! - valid payloads produce exactly one record
//! - malformed payloads are skipped and never written
//! - a store failure drops the message without blocking later ones
//! - same-key events persist in delivery order, without deduplication

use async_trait::async_trait;
use chrono::Utc;
use relay_service::error::{RelayError, Result};
use relay_service::models::Message;
use relay_service::repositories::MessageStore;
use relay_service::services::kafka_consumer::{EventHandler, HandleError, PersistingHandler};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// In-memory stand-in for the Postgres repository.
struct MockStore {
    records: Mutex<Vec<Message>>,
    fail_next: AtomicBool,
}

impl MockStore {
    fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            fail_next: AtomicBool::new(false),
        }
    }

    fn fail_next_create(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    async fn records(&self) -> Vec<Message> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl MessageStore for MockStore {
    async fn create(&self, email: &str, message: &str) -> Result<Message> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(RelayError::Database("connection refused".to_string()));
        }

        let mut records = self.records.lock().await;
        let record = Message {
            id: records.len() as i64 + 1,
            email: email.to_string(),
            message: message.to_string(),
            received_at: Utc::now(),
        };
        records.push(record.clone());
        Ok(record)
    }

    async fn get_by_email(&self, email: &str) -> Result<Vec<Message>> {
        let records = self.records.lock().await;
        Ok(records
            .iter()
            .filter(|r| r.email == email)
            .cloned()
            .collect())
    }
}

fn handler_with_store() -> (PersistingHandler, Arc<MockStore>) {
    let store = Arc::new(MockStore::new());
    (PersistingHandler::new(store.clone()), store)
}

#[tokio::test]
async fn test_valid_payload_persists_one_record() {
    let (handler, store) = handler_with_store();

    let saved = handler
        .handle(br#"{"email":"a@x.com","message":"hello"}"#)
        .await
        .expect("valid payload should persist");

    assert_eq!(saved.email, "a@x.com");
    assert_eq!(saved.message, "hello");

    let records = store.records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, saved.id);
}

#[tokio::test]
async fn test_malformed_payload_is_decode_error_and_writes_nothing() {
    let (handler, store) = handler_with_store();

    let result = handler.handle(b"this is not json").await;
    assert!(matches!(result, Err(HandleError::Decode(_))));

    // Missing required field is also a decode failure, not a partial write
    let result = handler.handle(br#"{"email":"a@x.com"}"#).await;
    assert!(matches!(result, Err(HandleError::Decode(_))));

    assert!(store.records().await.is_empty());
}

#[tokio::test]
async fn test_malformed_payload_does_not_block_later_messages() {
    let (handler, store) = handler_with_store();

    let _ = handler.handle(b"\x00\x01garbage").await;
    handler
        .handle(br#"{"email":"b@x.com","message":"still works"}"#)
        .await
        .expect("valid message after a malformed one should persist");

    let records = store.records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].email, "b@x.com");
}

#[tokio::test]
async fn test_store_failure_drops_message_without_retry() {
    let (handler, store) = handler_with_store();

    store.fail_next_create();
    let result = handler
        .handle(br#"{"email":"a@x.com","message":"lost"}"#)
        .await;
    assert!(matches!(result, Err(HandleError::Persist(_))));

    // The failed message is not retried; the next one goes through
    handler
        .handle(br#"{"email":"a@x.com","message":"kept"}"#)
        .await
        .expect("message after a store failure should persist");

    let records = store.records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].message, "kept");
}

#[tokio::test]
async fn test_same_key_events_persist_in_delivery_order() {
    let (handler, store) = handler_with_store();

    for i in 0..5 {
        let payload = format!(r#"{{"email":"a@x.com","message":"msg-{}"}}"#, i);
        handler
            .handle(payload.as_bytes())
            .await
            .expect("sequential messages should persist");
    }

    let records = store.get_by_email("a@x.com").await.unwrap();
    assert_eq!(records.len(), 5);
    for (i, record) in records.iter().enumerate() {
        assert_eq!(record.message, format!("msg-{}", i));
    }
    // ids are monotonic in delivery order
    assert!(records.windows(2).all(|w| w[0].id < w[1].id));
}

#[tokio::test]
async fn test_identical_events_produce_distinct_records() {
    let (handler, store) = handler_with_store();

    let payload = br#"{"email":"a@x.com","message":"hello"}"#;
    let first = handler.handle(payload).await.unwrap();
    let second = handler.handle(payload).await.unwrap();

    // No deduplication is performed: two publishes, two records
    assert_ne!(first.id, second.id);
    assert_eq!(store.records().await.len(), 2);
}

#[tokio::test]
async fn test_unknown_fields_in_payload_are_tolerated() {
    let (handler, store) = handler_with_store();

    handler
        .handle(br#"{"email":"a@x.com","message":"hello","schema_version":2}"#)
        .await
        .expect("unknown fields should not fail decoding");

    assert_eq!(store.records().await.len(), 1);
}

#[tokio::test]
async fn test_setup_and_cleanup_default_to_noop() {
    let (handler, _store) = handler_with_store();

    handler.setup().await.expect("default setup is a no-op");
    handler.cleanup().await.expect("default cleanup is a no-op");
}
