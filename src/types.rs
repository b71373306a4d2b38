//! Core types shared by the subscription engine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Unique identifier for an event.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventId(pub Uuid);

impl EventId {
    /// Generate a fresh random id.
    pub fn new() -> Self {
        EventId(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventId({})", self.0)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Event number within a stream.
///
/// "No position" is expressed as `Option<Position>::None`. `None` orders
/// below every `Some`, so it acts as the negative-infinity sentinel for
/// watermark comparisons.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Position(pub u64);

impl fmt::Debug for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pos({})", self.0)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Position {
    pub fn next(self) -> Self {
        Position(self.0 + 1)
    }

    pub fn prev(self) -> Option<Self> {
        if self.0 > 0 {
            Some(Position(self.0 - 1))
        } else {
            None
        }
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_micros() as i64)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// A committed event as stored in a stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecordedEvent {
    pub event_id: EventId,

    /// Stream the event was written to.
    pub stream_id: String,

    /// Position within `stream_id`.
    pub event_number: Position,

    /// Application-defined type.
    pub event_type: String,

    pub data: Vec<u8>,
    pub metadata: Vec<u8>,
    pub created: Timestamp,
}

impl RecordedEvent {
    /// Create an event with raw bytes.
    pub fn raw(
        stream_id: impl Into<String>,
        event_number: Position,
        event_type: impl Into<String>,
        data: Vec<u8>,
    ) -> Self {
        Self {
            event_id: EventId::new(),
            stream_id: stream_id.into(),
            event_number,
            event_type: event_type.into(),
            data,
            metadata: Vec::new(),
            created: Timestamp::now(),
        }
    }

    /// Create an event with a JSON payload.
    pub fn json(
        stream_id: impl Into<String>,
        event_number: Position,
        event_type: impl Into<String>,
        payload: &impl Serialize,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::raw(
            stream_id,
            event_number,
            event_type,
            serde_json::to_vec(payload)?,
        ))
    }

    pub fn with_event_id(mut self, event_id: EventId) -> Self {
        self.event_id = event_id;
        self
    }
}

/// An event together with the link that resolved to it, if any.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResolvedEvent {
    pub event: RecordedEvent,
    pub link: Option<RecordedEvent>,
}

impl ResolvedEvent {
    pub fn new(event: RecordedEvent) -> Self {
        Self { event, link: None }
    }

    pub fn with_link(event: RecordedEvent, link: RecordedEvent) -> Self {
        Self {
            event,
            link: Some(link),
        }
    }

    /// The event as read from the subscribed stream: the link when the event
    /// was reached through one, otherwise the event itself.
    pub fn original_event(&self) -> &RecordedEvent {
        self.link.as_ref().unwrap_or(&self.event)
    }

    pub fn original_event_id(&self) -> EventId {
        self.original_event().event_id
    }

    pub fn original_position(&self) -> Position {
        self.original_event().event_number
    }

    pub fn original_stream_id(&self) -> &str {
        &self.original_event().stream_id
    }
}

impl From<RecordedEvent> for ResolvedEvent {
    fn from(event: RecordedEvent) -> Self {
        ResolvedEvent::new(event)
    }
}
