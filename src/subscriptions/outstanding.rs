//! Messages currently held by clients, indexed by expiry and position.

use crate::types::{EventId, Position, ResolvedEvent};
use std::collections::{BTreeSet, HashMap};
use std::time::Instant;
use uuid::Uuid;

use super::types::StartMessageResult;

/// A message handed to (or waiting to be handed to) a client.
#[derive(Clone, Debug)]
pub struct OutstandingMessage {
    pub event_id: EventId,
    /// Correlation id of the client holding the message (None for pull).
    pub client_id: Option<Uuid>,
    pub event: ResolvedEvent,
    pub retry_count: u32,
    /// Replayed from the parked stream rather than read from the source.
    pub is_replayed: bool,
}

impl OutstandingMessage {
    pub fn new(event: ResolvedEvent, retry_count: u32) -> Self {
        Self {
            event_id: event.original_event_id(),
            client_id: None,
            event,
            retry_count,
            is_replayed: false,
        }
    }

    pub fn replayed(event: ResolvedEvent) -> Self {
        Self {
            is_replayed: true,
            ..Self::new(event, 0)
        }
    }

    pub fn position(&self) -> Position {
        self.event.original_position()
    }

    /// Same message queued for another delivery attempt.
    pub fn next_attempt(&self) -> Self {
        Self {
            event_id: self.event_id,
            client_id: None,
            event: self.event.clone(),
            retry_count: self.retry_count + 1,
            is_replayed: self.is_replayed,
        }
    }
}

struct CacheEntry {
    message: OutstandingMessage,
    expires: Instant,
}

/// Outstanding messages with O(log n) insert/remove and ordered queries.
///
/// Two secondary indices are kept in step with the primary map: one ordered
/// by expiry for the timeout sweep and one ordered by position for the
/// checkpoint watermark.
#[derive(Default)]
pub struct OutstandingMessageCache {
    messages: HashMap<EventId, CacheEntry>,
    by_expiry: BTreeSet<(Instant, EventId)>,
    by_position: BTreeSet<(Position, EventId)>,
}

impl OutstandingMessageCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a message as outstanding until `expires`.
    ///
    /// A message whose event id is already cached is left untouched.
    pub fn start_message(&mut self, message: OutstandingMessage, expires: Instant) -> StartMessageResult {
        if self.messages.contains_key(&message.event_id) {
            return StartMessageResult::SkippedDuplicate;
        }

        let id = message.event_id;
        self.by_expiry.insert((expires, id));
        self.by_position.insert((message.position(), id));
        self.messages.insert(id, CacheEntry { message, expires });
        StartMessageResult::Success
    }

    /// Remove a message, returning it if it was present.
    pub fn remove(&mut self, event_id: EventId) -> Option<OutstandingMessage> {
        let entry = self.messages.remove(&event_id)?;
        self.by_expiry.remove(&(entry.expires, event_id));
        self.by_position.remove(&(entry.message.position(), event_id));
        Some(entry.message)
    }

    pub fn get_message_by_id(&self, event_id: EventId) -> Option<&OutstandingMessage> {
        self.messages.get(&event_id).map(|e| &e.message)
    }

    pub fn contains(&self, event_id: EventId) -> bool {
        self.messages.contains_key(&event_id)
    }

    /// Messages whose expiry is at or before `now`, earliest first.
    pub fn messages_expiring_before(&self, now: Instant) -> impl Iterator<Item = &OutstandingMessage> + '_ {
        self.by_expiry
            .iter()
            .take_while(move |(expires, _)| *expires <= now)
            .filter_map(|(_, id)| self.messages.get(id).map(|e| &e.message))
    }

    /// Lowest position among outstanding messages, `None` when empty.
    pub fn lowest_position(&self) -> Option<Position> {
        self.by_position.first().map(|(position, _)| *position)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// All outstanding messages in position order.
    pub fn iter(&self) -> impl Iterator<Item = &OutstandingMessage> + '_ {
        self.by_position
            .iter()
            .filter_map(|(_, id)| self.messages.get(id).map(|e| &e.message))
    }
}
