//! Capability traits for the storage services a subscription depends on.
//!
//! Every operation is asynchronous: it returns immediately and reports its
//! outcome through a one-shot callback, possibly from another thread. The
//! subscription never lets a callback touch its state directly; callbacks
//! post a completion into the subscription's queue and the owner applies it.

use crate::error::Result;
use crate::types::{Position, ResolvedEvent};
use std::sync::Arc;

/// One-shot completion callback.
pub type Callback<T> = Box<dyn FnOnce(T) + Send + 'static>;

/// A page of events returned by a catch-up read.
#[derive(Clone, Debug, Default)]
pub struct ReadBatch {
    pub events: Vec<ResolvedEvent>,
    /// Position to continue reading from.
    pub next_position: Position,
    pub is_end_of_stream: bool,
}

/// Reads committed events from a stream.
pub trait EventLoader: Send + Sync {
    /// Read up to `count_to_load` events from `stream_id` starting at
    /// `start`. Must invoke `on_events_found` exactly once.
    fn begin_read_events(
        &self,
        stream_id: &str,
        start: Position,
        count_to_load: usize,
        batch_size: usize,
        resolve_link_tos: bool,
        on_events_found: Callback<ReadBatch>,
    );
}

/// Loads the last persisted checkpoint of a subscription.
pub trait CheckpointReader: Send + Sync {
    /// Must invoke `on_state_loaded` exactly once, with `None` when no
    /// checkpoint was ever written.
    fn begin_load_state(&self, subscription_id: &str, on_state_loaded: Callback<Option<Position>>);
}

/// Persists checkpoints of a subscription.
pub trait CheckpointWriter: Send + Sync {
    fn begin_write_state(&self, position: Position);

    fn begin_delete(&self, on_deleted: Callback<Result<()>>);
}

/// Dead-letter storage for messages that could not be processed.
pub trait MessageParker: Send + Sync {
    fn begin_park_message(&self, event: &ResolvedEvent, reason: &str, on_parked: Callback<Result<()>>);

    /// Report the position one past the last parked message, `None` if
    /// nothing was ever parked.
    fn begin_read_end_sequence(&self, on_completed: Callback<Option<Position>>);

    /// Mark every parked message below `sequence` as reprocessed.
    fn begin_mark_parked_messages_reprocessed(&self, sequence: Position);

    fn begin_delete(&self, on_deleted: Callback<Result<()>>);
}

/// Supplies the collaborators of each subscription a manager creates.
pub trait SubscriptionBackend: Send + Sync {
    fn event_loader(&self) -> Arc<dyn EventLoader>;

    fn checkpoint_reader(&self) -> Arc<dyn CheckpointReader>;

    fn checkpoint_writer(&self, subscription_id: &str) -> Arc<dyn CheckpointWriter>;

    fn message_parker(&self, subscription_id: &str) -> Arc<dyn MessageParker>;
}
