// Messaging layer: broker plumbing and the retry/dead-letter policy.

pub mod queues;
pub mod retry;

pub use queues::{connect_rabbitmq, publish_json, run_consumer, setup_stage_channels, MessageHandler};
pub use retry::{RetryError, RetryPolicy};
