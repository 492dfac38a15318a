pub mod config;
pub mod error;
pub mod models;
pub mod repositories;
pub mod services;

pub use config::RelayConfig;
pub use error::{RelayError, Result};
pub use models::{Message, MessageEvent};
pub use repositories::{MessageRepository, MessageStore};
pub use services::{EventHandler, MessageConsumer, MessageProducer, PersistingHandler};
