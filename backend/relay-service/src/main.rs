//! Relay Worker - Kafka consumer group member persisting user message events
//!
//! Joins the message-relay consumer group, decodes each event and writes it
//! into Postgres. The producing HTTP service publishes events through
//! `relay_service::MessageProducer`; this binary owns the consuming side and
//! the shutdown sequencing.
//!
//! Environment variables:
//! - DATABASE_URL: PostgreSQL URL for the messages table (required)
//! - KAFKA_BROKERS: Kafka broker addresses (default: "localhost:9092")
//! - KAFKA_TOPIC: Topic to consume (default: "message.events")
//! - KAFKA_GROUP_ID: Consumer group ID (default: "message-relay-group")
//! - SHUTDOWN_GRACE_SECS: Drain window on shutdown (default: 30)

use anyhow::{Context, Result};
use db_pool::{create_pool as create_pg_pool, DbConfig as DbPoolConfig};
use relay_service::repositories::{MessageRepository, MessageStore};
use relay_service::services::kafka_consumer::{MessageConsumer, PersistingHandler};
use relay_service::RelayConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("relay_worker=info".parse().expect("valid directive"))
                .add_directive("relay_service=info".parse().expect("valid directive")),
        )
        .init();

    info!("Starting relay worker");

    // Load configuration
    dotenvy::dotenv().ok();
    let config = RelayConfig::from_env().context("Failed to load configuration")?;
    info!(
        brokers = %config.kafka.brokers,
        topic = %config.kafka.topic,
        group_id = %config.kafka.group_id,
        "Configuration loaded"
    );

    let shutdown_grace = std::env::var("SHUTDOWN_GRACE_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(30));

    // Initialize database (standardized pool)
    let mut db_cfg = DbPoolConfig::for_service("relay-service");
    if db_cfg.database_url.is_empty() {
        db_cfg.database_url = config.database.url.clone();
    }
    if db_cfg.max_connections < config.database.max_connections {
        db_cfg.max_connections = config.database.max_connections;
    }
    db_cfg.log_config();

    let db_pool = create_pg_pool(db_cfg)
        .await
        .context("Failed to create database pool")?;

    // Run migrations
    sqlx::migrate!("./migrations")
        .run(&db_pool)
        .await
        .context("Failed to run migrations")?;
    info!("Migrations completed");

    // Wire up the sink and the handler
    let store: Arc<dyn MessageStore> = Arc::new(MessageRepository::new(db_pool.clone()));
    let handler = Arc::new(PersistingHandler::new(store));

    // Setup shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Handle SIGTERM/SIGINT for graceful shutdown
    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for ctrl+c");
        info!("Shutdown signal received");
        let _ = shutdown_tx_clone.send(true);
    });

    // Create and run the consumer
    let mut consumer = MessageConsumer::new(&config.kafka, handler, shutdown_rx.clone())
        .context("Failed to create Kafka consumer")?;
    info!("Kafka consumer initialized");

    let mut consumer_handle = tokio::spawn(async move { consumer.run().await });

    // Wait for either a fatal consumer exit or the shutdown signal; after the
    // signal, bound the drain so a stuck claim loop cannot hang the process.
    let mut shutdown_watch = shutdown_rx.clone();
    let run_result = tokio::select! {
        res = &mut consumer_handle => Some(res),
        _ = shutdown_watch.changed() => None,
    };

    let run_result = match run_result {
        Some(res) => res,
        None => match tokio::time::timeout(shutdown_grace, &mut consumer_handle).await {
            Ok(res) => res,
            Err(_) => {
                warn!(
                    grace_secs = shutdown_grace.as_secs(),
                    "Consumer did not drain within grace period, aborting"
                );
                consumer_handle.abort();
                db_pool.close().await;
                return Ok(());
            }
        },
    };

    // Transport-level failures are fatal to this run; restarting the join
    // cycle is the supervisor's call, so exit non-zero instead of looping.
    let outcome = match run_result {
        Ok(Ok(())) => {
            info!("Consumer stopped cleanly");
            Ok(())
        }
        Ok(Err(e)) => {
            error!(error = %e, "Consumer terminated with error");
            Err(anyhow::anyhow!(e))
        }
        Err(e) => {
            error!(error = %e, "Consumer task panicked");
            Err(anyhow::anyhow!(e))
        }
    };

    db_pool.close().await;
    info!("Relay worker shut down");

    outcome
}
