// Processing coordination: per-document counters, feedback handling and the
// live status broadcast.

pub mod broadcast;
pub mod feedback;
pub mod state_store;

pub use broadcast::{AmqpBroadcaster, ChannelBroadcaster, StatusBroadcaster};
pub use feedback::{FeedbackDispatcher, FeedbackHandler};
pub use state_store::{
    InMemoryStateStore, ProcessingProgress, ProcessingStateStore, RedisStateStore,
    ResilientStateStore,
};
