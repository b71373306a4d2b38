//! Subscription settings, client-facing messages and handles.

use crate::error::{Result, SubscriptionError};
use crate::types::{EventId, Position, ResolvedEvent};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Where a subscription without a checkpoint starts reading.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartFrom {
    /// Replay the whole stream.
    Beginning,
    /// Only events written after the subscription goes live.
    Current,
    /// Replay from an explicit event number.
    Position(Position),
}

impl StartFrom {
    /// First position read during catch-up, `None` when starting live.
    pub fn catch_up_position(&self) -> Option<Position> {
        match self {
            StartFrom::Beginning => Some(Position(0)),
            StartFrom::Current => None,
            StartFrom::Position(p) => Some(*p),
        }
    }
}

/// How ready messages are spread over the connected clients.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerStrategy {
    /// Rotate across clients with spare capacity.
    #[default]
    RoundRobin,
    /// Fill the current client before moving to the next one.
    DispatchToSingle,
}

/// Configuration for a persistent subscription.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubscriptionSettings {
    /// Deliver the target of link events instead of the link.
    pub resolve_link_tos: bool,

    /// Start position used when no checkpoint exists.
    /// Default: Current
    pub start_from: StartFrom,

    /// Time a client may hold a message before it is retried.
    /// Default: 30s
    pub message_timeout: Duration,

    /// Retries allowed before a message is parked.
    /// Default: 10
    pub max_retry_count: u32,

    /// Processed messages required before any checkpoint is written.
    /// Default: 10
    pub min_checkpoint_count: u64,

    /// Processed messages that force a checkpoint regardless of time.
    /// Default: 1000
    pub max_checkpoint_count: u64,

    /// Time after which a checkpoint is written once `min_checkpoint_count`
    /// is met.
    /// Default: 2s
    pub checkpoint_after: Duration,

    /// Events requested per catch-up read.
    /// Default: 20
    pub read_batch_size: usize,

    /// Max messages buffered for delivery.
    /// Default: 500
    pub buffer_size: usize,

    /// Max live messages held while catching up.
    /// Default: 500
    pub live_buffer_size: usize,

    /// Max connected push clients (0 = unlimited).
    pub max_subscriber_count: usize,

    pub consumer_strategy: ConsumerStrategy,

    /// Track per-client latency figures in statistics.
    pub extra_statistics: bool,
}

impl Default for SubscriptionSettings {
    fn default() -> Self {
        Self {
            resolve_link_tos: false,
            start_from: StartFrom::Current,
            message_timeout: Duration::from_secs(30),
            max_retry_count: 10,
            min_checkpoint_count: 10,
            max_checkpoint_count: 1000,
            checkpoint_after: Duration::from_secs(2),
            read_batch_size: 20,
            buffer_size: 500,
            live_buffer_size: 500,
            max_subscriber_count: 0,
            consumer_strategy: ConsumerStrategy::RoundRobin,
            extra_statistics: false,
        }
    }
}

impl SubscriptionSettings {
    /// Reject settings that can never move an event.
    pub fn validate(&self) -> Result<()> {
        if self.read_batch_size == 0 {
            return Err(SubscriptionError::InvalidArgument(
                "read_batch_size must be positive".into(),
            ));
        }
        if self.buffer_size == 0 || self.live_buffer_size == 0 {
            return Err(SubscriptionError::InvalidArgument(
                "buffer sizes must be positive".into(),
            ));
        }
        if self.read_batch_size >= self.buffer_size {
            return Err(SubscriptionError::InvalidArgument(format!(
                "read_batch_size {} must be smaller than buffer_size {}",
                self.read_batch_size, self.buffer_size
            )));
        }
        if self.min_checkpoint_count > self.max_checkpoint_count {
            return Err(SubscriptionError::InvalidArgument(format!(
                "min_checkpoint_count {} exceeds max_checkpoint_count {}",
                self.min_checkpoint_count, self.max_checkpoint_count
            )));
        }
        Ok(())
    }
}

/// Action requested by a client that could not process messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NakAction {
    Unknown,
    /// Move the message to the parked stream.
    Park,
    /// Redeliver the message.
    Retry,
    /// Drop the message without parking it.
    Skip,
}

/// Lifecycle state of a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    /// Waiting for the checkpoint reader.
    AwaitingCheckpoint,
    /// Replaying history.
    Behind,
    /// Delivering the live tail.
    Live,
    Deleted,
}

/// Result of registering a message as outstanding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartMessageResult {
    Success,
    SkippedDuplicate,
}

/// Messages sent to a client through its envelope.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// A message for the client to process and then ack or nack.
    EventAppeared {
        subscription_id: String,
        event: ResolvedEvent,
        retry_count: u32,
    },

    /// The client was removed from the subscription.
    SubscriptionDropped {
        subscription_id: String,
        reason: DropReason,
    },
}

impl ClientMessage {
    /// Event id of an `EventAppeared` message.
    pub fn event_id(&self) -> Option<EventId> {
        match self {
            ClientMessage::EventAppeared { event, .. } => Some(event.original_event_id()),
            ClientMessage::SubscriptionDropped { .. } => None,
        }
    }
}

/// Why a client was dropped.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Client asked to leave.
    Unsubscribed,
    /// Subscription was deleted.
    SubscriptionDeleted,
    /// Subscription was stopped or replaced.
    Shutdown,
}

/// Receiving side of a [`ChannelEnvelope`](super::ChannelEnvelope).
pub struct ClientHandle {
    pub receiver: crossbeam_channel::Receiver<ClientMessage>,
}

impl ClientHandle {
    /// Receive the next message (blocking).
    pub fn recv(&self) -> std::result::Result<ClientMessage, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message (non-blocking).
    pub fn try_recv(&self) -> std::result::Result<ClientMessage, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: Duration,
    ) -> std::result::Result<ClientMessage, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Drain everything currently queued.
    pub fn drain(&self) -> Vec<ClientMessage> {
        self.receiver.try_iter().collect()
    }
}
