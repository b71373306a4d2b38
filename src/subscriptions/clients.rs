//! Push clients competing for the messages of one subscription.

use crate::types::{EventId, ResolvedEvent, Timestamp};
use crossbeam_channel::{bounded, unbounded, Sender};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use super::types::{ClientHandle, ClientMessage, ConsumerStrategy, DropReason};

/// Reply channel of a connected client.
///
/// Implemented per transport; the subscription only ever calls `reply`.
pub trait Envelope: Send + Sync {
    fn reply(&self, message: ClientMessage);
}

/// Envelope backed by a crossbeam channel.
pub struct ChannelEnvelope {
    sender: Sender<ClientMessage>,
}

impl ChannelEnvelope {
    /// Create an envelope and the handle the client receives on.
    pub fn unbounded() -> (Arc<Self>, ClientHandle) {
        let (sender, receiver) = unbounded();
        (Arc::new(Self { sender }), ClientHandle { receiver })
    }

    /// Create an envelope with a bounded queue. Messages that do not fit
    /// are dropped and will come back through the timeout sweep.
    pub fn bounded(capacity: usize) -> (Arc<Self>, ClientHandle) {
        let (sender, receiver) = bounded(capacity);
        (Arc::new(Self { sender }), ClientHandle { receiver })
    }
}

impl Envelope for ChannelEnvelope {
    fn reply(&self, message: ClientMessage) {
        // A full or disconnected client is handled by message timeouts.
        let _ = self.sender.try_send(message);
    }
}

/// A push client connected to a subscription.
pub struct Client {
    correlation_id: Uuid,
    connection_id: Uuid,
    envelope: Arc<dyn Envelope>,
    max_in_flight: usize,
    username: String,
    remote_from: String,
    connected_at: Timestamp,
    /// Held messages and when each was sent.
    in_flight: HashMap<EventId, Instant>,
    total_items: u64,
    track_latency: bool,
    acked: u64,
    total_ack_latency: Duration,
    last_ack_latency: Option<Duration>,
}

impl Client {
    pub fn new(
        correlation_id: Uuid,
        connection_id: Uuid,
        envelope: Arc<dyn Envelope>,
        max_in_flight: usize,
        username: impl Into<String>,
        remote_from: impl Into<String>,
    ) -> Self {
        Self {
            correlation_id,
            connection_id,
            envelope,
            max_in_flight,
            username: username.into(),
            remote_from: remote_from.into(),
            connected_at: Timestamp::now(),
            in_flight: HashMap::new(),
            total_items: 0,
            track_latency: false,
            acked: 0,
            total_ack_latency: Duration::ZERO,
            last_ack_latency: None,
        }
    }

    /// Record the time between sending a message and its ack.
    pub fn with_latency_tracking(mut self, enabled: bool) -> Self {
        self.track_latency = enabled;
        self
    }

    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    pub fn available_slots(&self) -> usize {
        self.max_in_flight.saturating_sub(self.in_flight.len())
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Send a message if the client has a free slot.
    fn push(&mut self, subscription_id: &str, event: &ResolvedEvent, retry_count: u32) -> bool {
        if self.available_slots() == 0 {
            return false;
        }
        self.in_flight.insert(event.original_event_id(), Instant::now());
        self.total_items += 1;
        self.envelope.reply(ClientMessage::EventAppeared {
            subscription_id: subscription_id.to_string(),
            event: event.clone(),
            retry_count,
        });
        true
    }

    fn remove_in_flight(&mut self, event_id: EventId) -> bool {
        self.in_flight.remove(&event_id).is_some()
    }

    fn acknowledge(&mut self, event_id: EventId) -> bool {
        let Some(sent) = self.in_flight.remove(&event_id) else {
            return false;
        };
        if self.track_latency {
            let latency = sent.elapsed();
            self.acked += 1;
            self.total_ack_latency += latency;
            self.last_ack_latency = Some(latency);
        }
        true
    }

    /// Mean time from send to ack, when latency is tracked.
    pub fn average_ack_latency(&self) -> Option<Duration> {
        if !self.track_latency || self.acked == 0 {
            return None;
        }
        Some(self.total_ack_latency.div_f64(self.acked as f64))
    }

    fn send_dropped(&self, subscription_id: &str, reason: DropReason) {
        self.envelope.reply(ClientMessage::SubscriptionDropped {
            subscription_id: subscription_id.to_string(),
            reason,
        });
    }

    pub fn info(&self) -> ClientInfo {
        ClientInfo {
            correlation_id: self.correlation_id,
            connection_id: self.connection_id,
            username: self.username.clone(),
            remote_from: self.remote_from.clone(),
            connected_at: self.connected_at.0,
            max_in_flight: self.max_in_flight,
            in_flight: self.in_flight_count(),
            available_slots: self.available_slots(),
            total_items: self.total_items,
            average_latency_ms: self.average_ack_latency().map(|d| d.as_secs_f64() * 1000.0),
            last_latency_ms: self
                .last_ack_latency
                .filter(|_| self.track_latency)
                .map(|d| d.as_secs_f64() * 1000.0),
        }
    }
}

/// Snapshot of one client for statistics.
#[derive(Clone, Debug, Serialize)]
pub struct ClientInfo {
    pub correlation_id: Uuid,
    pub connection_id: Uuid,
    pub username: String,
    pub remote_from: String,
    /// Microseconds since Unix epoch.
    pub connected_at: i64,
    pub max_in_flight: usize,
    pub in_flight: usize,
    pub available_slots: usize,
    pub total_items: u64,
    /// Only reported when the subscription tracks extra statistics.
    pub average_latency_ms: Option<f64>,
    pub last_latency_ms: Option<f64>,
}

/// Outcome of offering one message to the pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PushResult {
    /// Delivered to the client with this correlation id.
    Sent(Uuid),
    /// No client has a free slot.
    NoMoreCapacity,
}

/// Clients of a subscription in rotation order.
///
/// The front of the queue is the next client offered a message. Both
/// strategies walk the queue at most once per message:
/// - round robin moves each visited client to the back, so the next message
///   starts with a different client;
/// - dispatch-to-single keeps sending to the front client and only rotates
///   it away once it is full.
pub struct ClientCollection {
    strategy: ConsumerStrategy,
    clients: VecDeque<Client>,
}

impl ClientCollection {
    pub fn new(strategy: ConsumerStrategy) -> Self {
        Self {
            strategy,
            clients: VecDeque::new(),
        }
    }

    pub fn strategy(&self) -> ConsumerStrategy {
        self.strategy
    }

    pub fn add_client(&mut self, client: Client) {
        self.clients.push_back(client);
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn has_capacity(&self) -> bool {
        self.clients.iter().any(|c| c.available_slots() > 0)
    }

    /// Offer a message to the next eligible client.
    pub fn push_message_to_client(
        &mut self,
        subscription_id: &str,
        event: &ResolvedEvent,
        retry_count: u32,
    ) -> PushResult {
        for _ in 0..self.clients.len() {
            match self.strategy {
                ConsumerStrategy::RoundRobin => {
                    let Some(mut client) = self.clients.pop_front() else {
                        break;
                    };
                    let pushed = client.push(subscription_id, event, retry_count);
                    let id = client.correlation_id;
                    self.clients.push_back(client);
                    if pushed {
                        return PushResult::Sent(id);
                    }
                }
                ConsumerStrategy::DispatchToSingle => {
                    if let Some(client) = self.clients.front_mut() {
                        if client.push(subscription_id, event, retry_count) {
                            return PushResult::Sent(client.correlation_id);
                        }
                    }
                    self.clients.rotate_left(1);
                }
            }
        }
        PushResult::NoMoreCapacity
    }

    /// Free the slot a client holds for `event_id`.
    pub fn remove_processing_message(&mut self, client_id: Uuid, event_id: EventId) -> bool {
        self.clients
            .iter_mut()
            .find(|c| c.correlation_id == client_id)
            .is_some_and(|c| c.remove_in_flight(event_id))
    }

    /// Free the slot of an acked message, recording its latency.
    pub fn acknowledge_message(&mut self, client_id: Uuid, event_id: EventId) -> bool {
        self.clients
            .iter_mut()
            .find(|c| c.correlation_id == client_id)
            .is_some_and(|c| c.acknowledge(event_id))
    }

    /// Remove a client, returning the ids of the messages it still held.
    pub fn remove_client_by_correlation_id(
        &mut self,
        subscription_id: &str,
        correlation_id: Uuid,
        send_drop_notification: bool,
    ) -> Option<Vec<EventId>> {
        let index = self
            .clients
            .iter()
            .position(|c| c.correlation_id == correlation_id)?;
        let client = self.clients.remove(index)?;
        if send_drop_notification {
            client.send_dropped(subscription_id, DropReason::Unsubscribed);
        }
        Some(client.in_flight.into_keys().collect())
    }

    /// Remove every client of a connection, returning the ids of the
    /// messages they still held.
    pub fn remove_clients_by_connection_id(&mut self, connection_id: Uuid) -> Vec<EventId> {
        let mut lost = Vec::new();
        self.clients.retain_mut(|c| {
            if c.connection_id == connection_id {
                lost.extend(c.in_flight.drain().map(|(id, _)| id));
                false
            } else {
                true
            }
        });
        lost
    }

    /// Drop every client, notifying each one.
    pub fn shutdown_all(&mut self, subscription_id: &str, reason: DropReason) {
        for client in self.clients.drain(..) {
            client.send_dropped(subscription_id, reason.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Client> + '_ {
        self.clients.iter()
    }
}
