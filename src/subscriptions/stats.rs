//! Point-in-time statistics of a subscription.

use crate::types::Position;
use serde::Serialize;

use super::clients::ClientInfo;
use super::types::{ConsumerStrategy, SubscriptionStatus};

/// Snapshot reported to the management surface.
#[derive(Clone, Debug, Serialize)]
pub struct SubscriptionStats {
    pub subscription_id: String,
    pub stream_id: String,
    pub group_name: String,
    pub status: SubscriptionStatus,
    pub consumer_strategy: ConsumerStrategy,
    pub connection_count: usize,
    pub connections: Vec<ClientInfo>,
    /// Messages handed out and not yet acked or nacked.
    pub outstanding_messages: usize,
    /// Messages ready for delivery, retries included.
    pub buffered_messages: usize,
    pub live_buffer_count: usize,
    pub retry_buffer_count: usize,
    pub read_buffer_count: usize,
    /// Messages handed out since the subscription started.
    pub total_items_processed: u64,
    pub last_processed_position: Option<Position>,
    pub last_known_position: Option<Position>,
    pub last_checkpoint: Option<Position>,
    pub parked_stream_id: String,
    pub checkpoint_stream_id: String,
}

impl SubscriptionStats {
    pub fn to_json(&self) -> crate::Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}
