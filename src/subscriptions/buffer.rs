//! Ordered merge of catch-up reads, the live tail and retries.

use crate::types::Position;
use std::collections::VecDeque;

use super::outstanding::OutstandingMessage;

/// Single-stream sequencer feeding a subscription.
///
/// While catching up, read messages go straight into the deliverable queue
/// and live messages wait in a bounded pending queue. The read frontier is
/// the next position the catch-up reader is expected to produce. Once the
/// earliest pending live message sits exactly at the frontier there is no
/// gap left: pending live messages are appended and the buffer is live.
pub struct StreamBuffer {
    max_buffer_size: usize,
    max_live_buffer_size: usize,
    /// Messages to redeliver, delivered before anything else.
    retry: VecDeque<OutstandingMessage>,
    /// Deliverable read and live messages.
    buffer: VecDeque<OutstandingMessage>,
    /// Live messages received while catching up.
    pending_live: VecDeque<OutstandingMessage>,
    read_frontier: Option<Position>,
    live: bool,
}

impl StreamBuffer {
    /// Create a buffer that starts in catch-up mode.
    pub fn new(max_buffer_size: usize, max_live_buffer_size: usize) -> Self {
        Self {
            max_buffer_size,
            max_live_buffer_size,
            retry: VecDeque::new(),
            buffer: VecDeque::new(),
            pending_live: VecDeque::new(),
            read_frontier: None,
            live: false,
        }
    }

    pub fn is_live(&self) -> bool {
        self.live
    }

    /// Next position expected from the catch-up reader.
    pub fn read_frontier(&self) -> Option<Position> {
        self.read_frontier
    }

    /// Add a message produced by a catch-up read.
    pub fn add_read_message(&mut self, message: OutstandingMessage) {
        if self.live {
            return;
        }
        let next = message.position().next();
        self.buffer.push_back(message);
        if self.read_frontier.map_or(true, |f| next > f) {
            self.read_frontier = Some(next);
        }
        self.try_join_live();
    }

    /// Add a message from the live tail.
    pub fn add_live_message(&mut self, message: OutstandingMessage) {
        if self.live {
            if self.buffer.len() < self.max_buffer_size {
                self.buffer.push_back(message);
                return;
            }
            // Too far ahead of the consumers: fall back to reading history
            // from this message on.
            self.live = false;
            self.read_frontier = Some(message.position());
            self.pending_live.clear();
            return;
        }

        if self.pending_live.len() >= self.max_live_buffer_size {
            self.pending_live.pop_front();
        }
        self.pending_live.push_back(message);
        self.try_join_live();
    }

    /// Queue a message for redelivery.
    ///
    /// Retries are ordered by position. Replayed parked messages always go
    /// after ordinary retries.
    pub fn add_retry(&mut self, message: OutstandingMessage) {
        if message.is_replayed {
            self.retry.push_back(message);
            return;
        }
        let position = message.position();
        let index = self
            .retry
            .iter()
            .position(|m| m.is_replayed || m.position() > position)
            .unwrap_or(self.retry.len());
        self.retry.insert(index, message);
    }

    /// Record the position the catch-up reader will continue from.
    pub fn advance_read_frontier(&mut self, next: Position) {
        if self.live {
            return;
        }
        if self.read_frontier.map_or(true, |f| next > f) {
            self.read_frontier = Some(next);
        }
        self.try_join_live();
    }

    /// Catch-up hit the end of the stream: go live unless live messages
    /// beyond the frontier show there is still history left to read.
    pub fn try_move_to_live(&mut self) -> bool {
        if self.live {
            return true;
        }
        self.try_join_live();
        if !self.live && self.pending_live.is_empty() {
            self.live = true;
        }
        self.live
    }

    /// Go live unconditionally, releasing every pending live message.
    pub fn move_to_live(&mut self) {
        if self.live {
            return;
        }
        self.buffer.extend(self.pending_live.drain(..));
        self.live = true;
    }

    /// Drop pending live messages already covered by reads and join the live
    /// tail when the next pending message is exactly at the frontier.
    fn try_join_live(&mut self) {
        let Some(frontier) = self.read_frontier else {
            return;
        };
        while self
            .pending_live
            .front()
            .is_some_and(|m| m.position() < frontier)
        {
            self.pending_live.pop_front();
        }
        if self
            .pending_live
            .front()
            .is_some_and(|m| m.position() == frontier)
        {
            self.buffer.extend(self.pending_live.drain(..));
            self.live = true;
        }
    }

    /// Pop the earliest undelivered message.
    pub fn try_dequeue(&mut self) -> Option<OutstandingMessage> {
        self.retry.pop_front().or_else(|| self.buffer.pop_front())
    }

    pub fn try_peek(&self) -> Option<&OutstandingMessage> {
        self.retry.front().or_else(|| self.buffer.front())
    }

    /// Whether a read of `count` more messages fits in the buffer.
    pub fn can_accept(&self, count: usize) -> bool {
        self.buffer_count() + count < self.max_buffer_size
    }

    /// Lowest position waiting for redelivery. Replayed parked messages are
    /// ignored since they lie behind the checkpoint already.
    pub fn lowest_retry(&self) -> Option<Position> {
        self.retry
            .iter()
            .filter(|m| !m.is_replayed)
            .map(|m| m.position())
            .min()
    }

    /// Undelivered messages, retries included.
    pub fn buffer_count(&self) -> usize {
        self.retry.len() + self.buffer.len()
    }

    pub fn live_buffer_count(&self) -> usize {
        self.pending_live.len()
    }

    pub fn retry_buffer_count(&self) -> usize {
        self.retry.len()
    }

    pub fn read_buffer_count(&self) -> usize {
        self.buffer.len()
    }
}
