//! # Persistent Subscriptions
//!
//! Competing-consumer subscriptions over an event-sourced stream store.
//!
//! ## Core Concepts
//!
//! - **Subscription**: a named group reading one stream, identified as
//!   `stream:group`
//! - **Clients**: competing consumers; each event is held by one client at a time
//! - **Ack / Nack**: clients confirm, retry, skip or park what they receive
//! - **Checkpoints**: the highest position below which everything is processed
//! - **Parking**: messages that keep failing move to a dead-letter stream
//!
//! Storage is reached through the capability traits in [`collaborators`];
//! the log, index and transport live elsewhere.
//!
//! ## Example
//!
//! ```ignore
//! use persistent_subscriptions::{PersistentSubscription, PersistentSubscriptionParams};
//!
//! let mut subscription = PersistentSubscription::new(
//!     PersistentSubscriptionParams::new("orders", "billing")
//!         .with_event_loader(loader)
//!         .with_checkpoint_reader(checkpoints.clone())
//!         .with_checkpoint_writer(checkpoints)
//!         .with_message_parker(parker),
//! )?;
//!
//! let (envelope, handle) = ChannelEnvelope::unbounded();
//! subscription.add_client(correlation_id, connection_id, envelope, 10, "ops", "10.0.0.5")?;
//! subscription.notify_live_subscription_message(event);
//! ```

pub mod collaborators;
pub mod error;
pub mod subscriptions;
pub mod types;

// Re-exports
pub use collaborators::{
    Callback, CheckpointReader, CheckpointWriter, EventLoader, MessageParker, ReadBatch,
    SubscriptionBackend,
};
pub use error::{Result, SubscriptionError};
pub use subscriptions::{
    ChannelEnvelope, ClientHandle, ClientInfo, ClientMessage, ConsumerStrategy, DropReason,
    Envelope, NakAction, OutstandingMessage, OutstandingMessageCache, PersistentSubscription,
    PersistentSubscriptionParams, SharedSubscription, StartFrom, StartMessageResult,
    StreamBuffer, SubscriptionManager, SubscriptionSettings, SubscriptionStats,
    SubscriptionStatus,
};
pub use types::*;
