pub mod kafka_consumer;
pub mod kafka_producer;

pub use kafka_consumer::{EventHandler, HandleError, MessageConsumer, PersistingHandler};
pub use kafka_producer::MessageProducer;
