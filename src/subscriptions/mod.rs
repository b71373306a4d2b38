//! Competing-consumer persistent subscriptions.
//!
//! A persistent subscription delivers the events of one stream to a pool of
//! clients in the same group, each event to one client at a time:
//! - Catch-up reads and the live tail are merged by a [`StreamBuffer`]
//! - Messages held by clients are tracked in an [`OutstandingMessageCache`]
//! - Acks free client slots; nacks retry, skip or park
//! - Clock ticks retry timed-out messages and write checkpoints
//!
//! # Example
//!
//! ```ignore
//! let manager = SubscriptionManager::new(backend);
//! manager.create_subscription("orders", "billing", SubscriptionSettings::default())?;
//!
//! let (envelope, handle) = ChannelEnvelope::unbounded();
//! manager.connect("orders", "billing", Uuid::new_v4(), connection_id, envelope, 10, "ops", "10.0.0.5")?;
//!
//! loop {
//!     match handle.recv() {
//!         Ok(ClientMessage::EventAppeared { subscription_id, event, .. }) => {
//!             manager.ack(&subscription_id, correlation_id, &[event.original_event_id()])?;
//!         }
//!         Ok(ClientMessage::SubscriptionDropped { .. }) | Err(_) => break,
//!     }
//! }
//! ```

mod buffer;
mod clients;
mod manager;
mod outstanding;
mod persistent;
mod stats;
mod types;

pub use buffer::StreamBuffer;
pub use clients::{ChannelEnvelope, Client, ClientCollection, ClientInfo, Envelope, PushResult};
pub use manager::{SharedSubscription, SubscriptionManager};
pub use outstanding::{OutstandingMessage, OutstandingMessageCache};
pub use persistent::{
    checkpoint_stream_id, parked_stream_id, subscription_id, PersistentSubscription,
    PersistentSubscriptionParams,
};
pub use stats::SubscriptionStats;
pub use types::{
    ClientHandle, ClientMessage, ConsumerStrategy, DropReason, NakAction, StartFrom,
    StartMessageResult, SubscriptionSettings, SubscriptionStatus,
};
