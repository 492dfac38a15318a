mod messages;

pub use messages::{MessageRepository, MessageStore};
