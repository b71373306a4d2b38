//! The competing-consumer subscription itself.

use crate::collaborators::{CheckpointReader, CheckpointWriter, EventLoader, MessageParker, ReadBatch};
use crate::error::{Result, SubscriptionError};
use crate::types::{EventId, Position, ResolvedEvent};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::buffer::StreamBuffer;
use super::clients::{Client, ClientCollection, Envelope, PushResult};
use super::outstanding::{OutstandingMessage, OutstandingMessageCache};
use super::stats::SubscriptionStats;
use super::types::{
    DropReason, NakAction, StartFrom, StartMessageResult, SubscriptionSettings, SubscriptionStatus,
};

/// Attempts made to park a message before giving up on it.
const MAX_PARK_ATTEMPTS: u32 = 5;

/// Smallest page requested from the event loader.
const MIN_READ_COUNT: usize = 10;

/// Stable id of the subscription on `stream_id` for `group_name`.
pub fn subscription_id(stream_id: &str, group_name: &str) -> String {
    format!("{}:{}", stream_id, group_name)
}

/// Stream holding the parked messages of a subscription.
pub fn parked_stream_id(stream_id: &str, group_name: &str) -> String {
    format!("$persistentsubscription-{}::{}-parked", stream_id, group_name)
}

/// Stream holding the checkpoints of a subscription.
pub fn checkpoint_stream_id(stream_id: &str, group_name: &str) -> String {
    format!("$persistentsubscription-{}::{}-checkpoint", stream_id, group_name)
}

/// Everything needed to build a [`PersistentSubscription`].
#[derive(Default)]
pub struct PersistentSubscriptionParams {
    pub stream_id: String,
    pub group_name: String,
    pub settings: SubscriptionSettings,
    pub event_loader: Option<Arc<dyn EventLoader>>,
    pub checkpoint_reader: Option<Arc<dyn CheckpointReader>>,
    pub checkpoint_writer: Option<Arc<dyn CheckpointWriter>>,
    pub message_parker: Option<Arc<dyn MessageParker>>,
}

impl PersistentSubscriptionParams {
    pub fn new(stream_id: impl Into<String>, group_name: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            group_name: group_name.into(),
            ..Default::default()
        }
    }

    pub fn with_settings(mut self, settings: SubscriptionSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_event_loader(mut self, loader: Arc<dyn EventLoader>) -> Self {
        self.event_loader = Some(loader);
        self
    }

    pub fn with_checkpoint_reader(mut self, reader: Arc<dyn CheckpointReader>) -> Self {
        self.checkpoint_reader = Some(reader);
        self
    }

    pub fn with_checkpoint_writer(mut self, writer: Arc<dyn CheckpointWriter>) -> Self {
        self.checkpoint_writer = Some(writer);
        self
    }

    pub fn with_message_parker(mut self, parker: Arc<dyn MessageParker>) -> Self {
        self.message_parker = Some(parker);
        self
    }
}

fn require<T: ?Sized>(value: Option<Arc<T>>, name: &str) -> Result<Arc<T>> {
    value.ok_or_else(|| SubscriptionError::InvalidArgument(format!("{} is required", name)))
}

/// Collaborator results waiting to be applied by the owner.
enum Completion {
    CheckpointLoaded(Option<Position>),
    ReadCompleted(ReadBatch),
    Parked {
        event: ResolvedEvent,
        reason: String,
        attempt: u32,
        result: Result<()>,
    },
    ParkedEndSequence(Option<Position>),
    ParkedRead {
        batch: ReadBatch,
        end: Position,
    },
    Deleted {
        what: &'static str,
        result: Result<()>,
    },
}

/// A persistent subscription of one group to one stream.
///
/// All methods take `&mut self`: the owner serializes access (an actor loop
/// or one mutex per subscription). Collaborator callbacks only enqueue
/// completions; they are applied before every public method returns, or
/// explicitly through [`process_completions`](Self::process_completions).
pub struct PersistentSubscription {
    subscription_id: String,
    stream_id: String,
    group_name: String,
    settings: SubscriptionSettings,

    event_loader: Arc<dyn EventLoader>,
    checkpoint_reader: Arc<dyn CheckpointReader>,
    checkpoint_writer: Arc<dyn CheckpointWriter>,
    message_parker: Arc<dyn MessageParker>,

    status: SubscriptionStatus,
    outstanding_page_request: bool,
    next_event_to_pull_from: Position,
    replaying_parked: bool,

    stream_buffer: StreamBuffer,
    outstanding: OutstandingMessageCache,
    clients: ClientCollection,

    last_checkpoint: Option<Position>,
    last_checkpoint_time: Instant,
    processed_since_checkpoint: u64,
    /// Highest position handed out, replays excluded.
    last_dispatched: Option<Position>,
    last_known_position: Option<Position>,
    total_items_processed: u64,

    completions_tx: Sender<Completion>,
    completions_rx: Receiver<Completion>,
}

impl PersistentSubscription {
    /// Build a subscription and start loading its checkpoint.
    pub fn new(params: PersistentSubscriptionParams) -> Result<Self> {
        if params.stream_id.is_empty() {
            return Err(SubscriptionError::InvalidArgument("stream_id is required".into()));
        }
        if params.group_name.is_empty() {
            return Err(SubscriptionError::InvalidArgument("group_name is required".into()));
        }
        let event_loader = require(params.event_loader, "event_loader")?;
        let checkpoint_reader = require(params.checkpoint_reader, "checkpoint_reader")?;
        let checkpoint_writer = require(params.checkpoint_writer, "checkpoint_writer")?;
        let message_parker = require(params.message_parker, "message_parker")?;
        params.settings.validate()?;

        let settings = params.settings;
        let (completions_tx, completions_rx) = unbounded();

        let mut subscription = Self {
            subscription_id: subscription_id(&params.stream_id, &params.group_name),
            stream_id: params.stream_id,
            group_name: params.group_name,
            event_loader,
            checkpoint_reader,
            checkpoint_writer,
            message_parker,
            status: SubscriptionStatus::AwaitingCheckpoint,
            outstanding_page_request: false,
            next_event_to_pull_from: Position(0),
            replaying_parked: false,
            stream_buffer: StreamBuffer::new(settings.buffer_size, settings.live_buffer_size),
            outstanding: OutstandingMessageCache::new(),
            clients: ClientCollection::new(settings.consumer_strategy),
            last_checkpoint: None,
            last_checkpoint_time: Instant::now(),
            processed_since_checkpoint: 0,
            last_dispatched: None,
            last_known_position: None,
            total_items_processed: 0,
            settings,
            completions_tx,
            completions_rx,
        };

        debug!(subscription = %subscription.subscription_id, "loading checkpoint");
        let tx = subscription.completions_tx.clone();
        subscription.checkpoint_reader.begin_load_state(
            &subscription.subscription_id,
            Box::new(move |checkpoint| {
                let _ = tx.send(Completion::CheckpointLoaded(checkpoint));
            }),
        );
        subscription.process_completions();

        Ok(subscription)
    }

    // --- Accessors ---

    pub fn subscription_id(&self) -> &str {
        &self.subscription_id
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn group_name(&self) -> &str {
        &self.group_name
    }

    pub fn settings(&self) -> &SubscriptionSettings {
        &self.settings
    }

    pub fn status(&self) -> SubscriptionStatus {
        self.status
    }

    pub fn is_live(&self) -> bool {
        self.status == SubscriptionStatus::Live
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn outstanding_message_count(&self) -> usize {
        self.outstanding.len()
    }

    pub fn buffered_message_count(&self) -> usize {
        self.stream_buffer.buffer_count()
    }

    pub fn last_checkpoint(&self) -> Option<Position> {
        self.last_checkpoint
    }

    /// Retry count of an outstanding message.
    pub fn retry_count(&self, event_id: EventId) -> Option<u32> {
        self.outstanding.get_message_by_id(event_id).map(|m| m.retry_count)
    }

    pub fn parked_stream_id(&self) -> String {
        parked_stream_id(&self.stream_id, &self.group_name)
    }

    fn is_active(&self) -> bool {
        matches!(self.status, SubscriptionStatus::Behind | SubscriptionStatus::Live)
    }

    // --- Clients ---

    /// Register a push client and hand it whatever is ready.
    pub fn add_client(
        &mut self,
        correlation_id: Uuid,
        connection_id: Uuid,
        envelope: Arc<dyn Envelope>,
        max_in_flight: usize,
        username: &str,
        remote_from: &str,
    ) -> Result<()> {
        if self.status == SubscriptionStatus::Deleted {
            return Err(SubscriptionError::Deleted(self.subscription_id.clone()));
        }
        let limit = self.settings.max_subscriber_count;
        if limit > 0 && self.clients.len() >= limit {
            return Err(SubscriptionError::MaxSubscribersReached(self.subscription_id.clone()));
        }

        info!(
            subscription = %self.subscription_id,
            %correlation_id,
            %connection_id,
            username,
            remote_from,
            max_in_flight,
            "client connected"
        );
        self.clients.add_client(Client::new(
            correlation_id,
            connection_id,
            envelope,
            max_in_flight,
            username,
            remote_from,
        )
        .with_latency_tracking(self.settings.extra_statistics));
        self.try_pushing_messages_to_clients();
        self.process_completions();
        Ok(())
    }

    /// Remove one client; its un-acked messages are redelivered right away.
    pub fn remove_client_by_correlation_id(&mut self, correlation_id: Uuid, send_drop_notification: bool) {
        let Some(lost) = self.clients.remove_client_by_correlation_id(
            &self.subscription_id,
            correlation_id,
            send_drop_notification,
        ) else {
            return;
        };
        info!(subscription = %self.subscription_id, %correlation_id, lost = lost.len(), "client removed");
        self.requeue_lost_messages(lost);
        self.process_completions();
    }

    /// Remove every client on a connection; their un-acked messages are
    /// redelivered right away.
    pub fn remove_client_by_connection_id(&mut self, connection_id: Uuid) {
        let lost = self.clients.remove_clients_by_connection_id(connection_id);
        if !lost.is_empty() {
            info!(subscription = %self.subscription_id, %connection_id, lost = lost.len(), "connection dropped");
        }
        self.requeue_lost_messages(lost);
        self.process_completions();
    }

    fn requeue_lost_messages(&mut self, lost: Vec<EventId>) {
        let mut messages: Vec<OutstandingMessage> = lost
            .into_iter()
            .filter_map(|id| self.outstanding.get_message_by_id(id).cloned())
            .collect();
        messages.sort_by_key(|m| m.position());
        for message in messages {
            if !self.action_taken_for_retried_message(&message) {
                self.retry_message(message);
            }
        }
        self.try_pushing_messages_to_clients();
    }

    /// Drop every client, for instance when the subscription is replaced.
    pub fn shutdown(&mut self) {
        self.clients.shutdown_all(&self.subscription_id, DropReason::Shutdown);
    }

    // --- Ingestion ---

    /// Feed a page of catch-up events.
    pub fn handle_read_completed(&mut self, events: Vec<ResolvedEvent>, next_position: Position, is_end_of_stream: bool) {
        self.on_read_completed(ReadBatch {
            events,
            next_position,
            is_end_of_stream,
        });
        self.process_completions();
    }

    /// Feed one event from the live tail.
    pub fn notify_live_subscription_message(&mut self, event: ResolvedEvent) {
        self.on_live_message(event);
        self.process_completions();
    }

    fn on_live_message(&mut self, event: ResolvedEvent) {
        if self.status == SubscriptionStatus::Deleted {
            return;
        }
        let position = event.original_position();
        if let StartFrom::Position(start) = self.settings.start_from {
            if position < start {
                return;
            }
        }
        self.note_known_position(position);

        let was_live = self.stream_buffer.is_live();
        self.stream_buffer.add_live_message(OutstandingMessage::new(event, 0));
        if !self.is_active() {
            return;
        }

        if self.stream_buffer.is_live() {
            self.set_live();
        } else if was_live {
            debug!(subscription = %self.subscription_id, %position, "live buffer full, falling behind");
            self.status = SubscriptionStatus::Behind;
            self.next_event_to_pull_from = self.stream_buffer.read_frontier().unwrap_or(position);
            self.try_reading_new_batch();
        }
        self.try_pushing_messages_to_clients();
    }

    fn on_checkpoint_loaded(&mut self, checkpoint: Option<Position>) {
        if self.status != SubscriptionStatus::AwaitingCheckpoint {
            return;
        }
        self.status = SubscriptionStatus::Behind;
        self.last_checkpoint_time = Instant::now();

        match checkpoint {
            Some(checkpoint) => {
                debug!(subscription = %self.subscription_id, %checkpoint, "checkpoint loaded");
                self.last_checkpoint = Some(checkpoint);
                self.last_dispatched = Some(checkpoint);
                self.next_event_to_pull_from = checkpoint.next();
                self.stream_buffer.advance_read_frontier(checkpoint.next());
            }
            None => {
                debug!(
                    subscription = %self.subscription_id,
                    start_from = ?self.settings.start_from,
                    "no checkpoint found"
                );
                match self.settings.start_from.catch_up_position() {
                    Some(start) => {
                        self.next_event_to_pull_from = start;
                        self.stream_buffer.advance_read_frontier(start);
                    }
                    None => self.stream_buffer.move_to_live(),
                }
            }
        }

        self.try_reading_new_batch();
        self.try_pushing_messages_to_clients();
    }

    fn try_reading_new_batch(&mut self) {
        if !self.is_active() || self.outstanding_page_request {
            return;
        }
        if self.stream_buffer.is_live() {
            self.set_live();
            return;
        }
        if !self.stream_buffer.can_accept(self.settings.read_batch_size) {
            return;
        }

        self.outstanding_page_request = true;
        self.status = SubscriptionStatus::Behind;
        debug!(
            subscription = %self.subscription_id,
            from = %self.next_event_to_pull_from,
            "reading next batch"
        );
        let tx = self.completions_tx.clone();
        self.event_loader.begin_read_events(
            &self.stream_id,
            self.next_event_to_pull_from,
            self.settings.read_batch_size.max(MIN_READ_COUNT),
            self.settings.read_batch_size,
            self.settings.resolve_link_tos,
            Box::new(move |batch| {
                let _ = tx.send(Completion::ReadCompleted(batch));
            }),
        );
    }

    fn on_read_completed(&mut self, batch: ReadBatch) {
        if !self.outstanding_page_request {
            return;
        }
        self.outstanding_page_request = false;
        if !self.is_active() {
            return;
        }
        if self.stream_buffer.is_live() {
            self.set_live();
            self.try_pushing_messages_to_clients();
            return;
        }

        let was_empty = batch.events.is_empty();
        for event in batch.events {
            self.note_known_position(event.original_position());
            self.stream_buffer.add_read_message(OutstandingMessage::new(event, 0));
        }
        self.stream_buffer.advance_read_frontier(batch.next_position);
        self.next_event_to_pull_from = batch.next_position;

        if self.stream_buffer.is_live() || (batch.is_end_of_stream && self.stream_buffer.try_move_to_live()) {
            debug!(subscription = %self.subscription_id, "caught up, now live");
            self.set_live();
        } else if batch.is_end_of_stream && was_empty {
            // The live tail is ahead of what the reader can see yet; the next
            // clock tick reads again.
        } else {
            self.try_reading_new_batch();
        }
        self.try_pushing_messages_to_clients();
    }

    fn set_live(&mut self) {
        if self.is_active() {
            self.status = SubscriptionStatus::Live;
        }
    }

    fn note_known_position(&mut self, position: Position) {
        if Some(position) > self.last_known_position {
            self.last_known_position = Some(position);
        }
    }

    // --- Dispatch ---

    fn try_pushing_messages_to_clients(&mut self) {
        if !self.is_active() {
            return;
        }
        loop {
            if !self.clients.has_capacity() {
                return;
            }
            let result = match self.stream_buffer.try_peek() {
                Some(message) => self.clients.push_message_to_client(
                    &self.subscription_id,
                    &message.event,
                    message.retry_count,
                ),
                None => return,
            };
            let PushResult::Sent(client_id) = result else {
                return;
            };
            if let Some(mut message) = self.stream_buffer.try_dequeue() {
                message.client_id = Some(client_id);
                self.mark_begin_processing(message);
            }
        }
    }

    fn mark_begin_processing(&mut self, message: OutstandingMessage) {
        self.total_items_processed += 1;
        let position = message.position();
        if !message.is_replayed && Some(position) > self.last_dispatched {
            self.last_dispatched = Some(position);
        }

        let event_id = message.event_id;
        let client_id = message.client_id;
        let expires = Instant::now() + self.settings.message_timeout;
        if self.outstanding.start_message(message, expires) == StartMessageResult::SkippedDuplicate {
            warn!(
                subscription = %self.subscription_id,
                %event_id,
                %position,
                "skipping message with duplicate event id"
            );
            let holder = self.outstanding.get_message_by_id(event_id).and_then(|m| m.client_id);
            if let Some(client_id) = client_id.filter(|id| Some(*id) != holder) {
                self.clients.remove_processing_message(client_id, event_id);
            }
        }
    }

    /// Pull up to `count` ready messages for a client that does not push.
    ///
    /// Returned messages are outstanding under the usual timeout and are
    /// acked or nacked like pushed ones.
    pub fn get_next_n_or_less_messages(&mut self, count: usize) -> Vec<ResolvedEvent> {
        let mut events = Vec::new();
        if !self.is_active() {
            return events;
        }
        while events.len() < count {
            let Some(message) = self.stream_buffer.try_dequeue() else {
                break;
            };
            events.push(message.event.clone());
            self.mark_begin_processing(message);
        }
        self.try_reading_new_batch();
        self.process_completions();
        events
    }

    // --- Acknowledgement ---

    /// Mark messages as processed.
    pub fn acknowledge_messages_processed(&mut self, correlation_id: Uuid, event_ids: &[EventId]) {
        for &event_id in event_ids {
            if self.complete_message(event_id, true).is_some() {
                debug!(subscription = %self.subscription_id, %correlation_id, %event_id, "message acked");
            }
        }
        self.after_client_feedback(Instant::now());
    }

    /// Reject messages, with the action the client wants taken.
    pub fn not_acknowledge_messages_processed(
        &mut self,
        correlation_id: Uuid,
        event_ids: &[EventId],
        action: NakAction,
        reason: &str,
    ) {
        for &event_id in event_ids {
            info!(
                subscription = %self.subscription_id,
                %correlation_id,
                %event_id,
                ?action,
                reason,
                "message nacked"
            );
            self.handle_nacked_message(action, event_id, reason);
        }
        self.after_client_feedback(Instant::now());
    }

    fn handle_nacked_message(&mut self, action: NakAction, event_id: EventId, reason: &str) {
        match action {
            NakAction::Retry | NakAction::Unknown => {
                if let Some(message) = self.outstanding.get_message_by_id(event_id).cloned() {
                    if !self.action_taken_for_retried_message(&message) {
                        self.retry_message(message);
                    }
                }
            }
            NakAction::Park => {
                if self.outstanding.contains(event_id) {
                    self.park_message(event_id, format!("Client explicitly NAK'ed message.\n{}", reason));
                }
            }
            NakAction::Skip => {
                self.complete_message(event_id, false);
            }
        }
    }

    fn after_client_feedback(&mut self, now: Instant) {
        if self.is_active() {
            self.try_mark_checkpoint(now);
            // Pushing first makes room for the read when the buffer is full.
            self.try_pushing_messages_to_clients();
            self.try_reading_new_batch();
            self.try_pushing_messages_to_clients();
        }
        self.process_completions();
    }

    /// Drop a message for good (ack, skip or park), freeing its slot.
    fn complete_message(&mut self, event_id: EventId, acked: bool) -> Option<OutstandingMessage> {
        let message = self.outstanding.remove(event_id)?;
        if let Some(client_id) = message.client_id {
            if acked {
                self.clients.acknowledge_message(client_id, event_id);
            } else {
                self.clients.remove_processing_message(client_id, event_id);
            }
        }
        self.processed_since_checkpoint += 1;
        Some(message)
    }

    /// Park the message instead of retrying it once retries are exhausted.
    fn action_taken_for_retried_message(&mut self, message: &OutstandingMessage) -> bool {
        if message.retry_count < self.settings.max_retry_count {
            return false;
        }
        self.park_message(
            message.event_id,
            format!("Client retried too many times ({})", message.retry_count),
        );
        true
    }

    fn retry_message(&mut self, message: OutstandingMessage) {
        self.outstanding.remove(message.event_id);
        if let Some(client_id) = message.client_id {
            self.clients.remove_processing_message(client_id, message.event_id);
        }
        self.stream_buffer.add_retry(message.next_attempt());
    }

    fn park_message(&mut self, event_id: EventId, reason: String) {
        let Some(message) = self.complete_message(event_id, false) else {
            return;
        };
        self.begin_park(message.event, reason, 0);
    }

    fn begin_park(&self, event: ResolvedEvent, reason: String, attempt: u32) {
        let tx = self.completions_tx.clone();
        let parked = event.clone();
        let parked_reason = reason.clone();
        self.message_parker.begin_park_message(
            &event,
            &reason,
            Box::new(move |result| {
                let _ = tx.send(Completion::Parked {
                    event: parked,
                    reason: parked_reason,
                    attempt,
                    result,
                });
            }),
        );
    }

    fn on_parked(&mut self, event: ResolvedEvent, reason: String, attempt: u32, result: Result<()>) {
        let event_id = event.original_event_id();
        let position = event.original_position();
        match result {
            Ok(()) => {
                debug!(subscription = %self.subscription_id, %event_id, %position, "message parked");
            }
            Err(e) if attempt + 1 < MAX_PARK_ATTEMPTS => {
                warn!(
                    subscription = %self.subscription_id,
                    %event_id,
                    %position,
                    error = %e,
                    "unable to park message, retrying"
                );
                self.begin_park(event, reason, attempt + 1);
            }
            Err(e) => {
                error!(
                    subscription = %self.subscription_id,
                    %event_id,
                    %position,
                    error = %e,
                    attempts = MAX_PARK_ATTEMPTS,
                    "unable to park message, possible message loss"
                );
            }
        }
    }

    // --- Timeouts and checkpoints ---

    /// Retry or park messages that expired by `now`, then evaluate the
    /// checkpoint policy and resume catch-up reads.
    pub fn notify_clock_tick(&mut self, now: Instant) {
        if self.is_active() {
            let expired: Vec<OutstandingMessage> =
                self.outstanding.messages_expiring_before(now).cloned().collect();
            for message in expired {
                debug!(
                    subscription = %self.subscription_id,
                    event_id = %message.event_id,
                    retry_count = message.retry_count,
                    "message timed out"
                );
                if !self.action_taken_for_retried_message(&message) {
                    self.retry_message(message);
                }
            }
            self.try_pushing_messages_to_clients();
            self.try_mark_checkpoint(now);
            if self.status == SubscriptionStatus::Behind {
                self.try_reading_new_batch();
                self.try_pushing_messages_to_clients();
            }
        }
        self.process_completions();
    }

    /// Highest position every message at or below which is processed.
    fn checkpoint_candidate(&self) -> Option<Position> {
        let mut candidate = self.last_dispatched;
        if let Some(lowest) = self.outstanding.lowest_position() {
            candidate = candidate.min(lowest.prev());
        }
        if let Some(lowest) = self.stream_buffer.lowest_retry() {
            candidate = candidate.min(lowest.prev());
        }
        candidate
    }

    fn try_mark_checkpoint(&mut self, now: Instant) {
        let processed = self.processed_since_checkpoint;
        if processed < self.settings.min_checkpoint_count {
            return;
        }
        let elapsed = now.saturating_duration_since(self.last_checkpoint_time);
        if processed < self.settings.max_checkpoint_count && elapsed < self.settings.checkpoint_after {
            return;
        }
        let Some(position) = self.checkpoint_candidate() else {
            return;
        };
        if Some(position) <= self.last_checkpoint {
            return;
        }

        debug!(subscription = %self.subscription_id, %position, processed, "writing checkpoint");
        self.last_checkpoint = Some(position);
        self.last_checkpoint_time = now;
        self.processed_since_checkpoint = 0;
        self.checkpoint_writer.begin_write_state(position);
    }

    // --- Parked messages ---

    /// Move every parked message back into the subscription.
    pub fn retry_parked_messages(&mut self) {
        if self.status == SubscriptionStatus::Deleted || self.replaying_parked {
            return;
        }
        self.replaying_parked = true;
        info!(subscription = %self.subscription_id, "replaying parked messages");
        let tx = self.completions_tx.clone();
        self.message_parker.begin_read_end_sequence(Box::new(move |end| {
            let _ = tx.send(Completion::ParkedEndSequence(end));
        }));
        self.process_completions();
    }

    /// Queue one event for redelivery.
    pub fn retry_single_message(&mut self, event: ResolvedEvent) {
        self.stream_buffer.add_retry(OutstandingMessage::new(event, 0));
        self.try_pushing_messages_to_clients();
        self.process_completions();
    }

    fn on_parked_end_sequence(&mut self, end: Option<Position>) {
        match end {
            Some(end) if end > Position(0) => self.read_parked_batch(Position(0), end),
            _ => {
                debug!(subscription = %self.subscription_id, "no parked messages to replay");
                self.replaying_parked = false;
            }
        }
    }

    fn read_parked_batch(&self, start: Position, end: Position) {
        let remaining = (end.0 - start.0) as usize;
        let count = self.settings.read_batch_size.min(remaining).max(1);
        let tx = self.completions_tx.clone();
        self.event_loader.begin_read_events(
            &self.parked_stream_id(),
            start,
            count,
            count,
            true,
            Box::new(move |batch| {
                let _ = tx.send(Completion::ParkedRead { batch, end });
            }),
        );
    }

    fn on_parked_read(&mut self, batch: ReadBatch, end: Position) {
        if self.status == SubscriptionStatus::Deleted {
            self.replaying_parked = false;
            return;
        }
        for parked in batch.events {
            if parked.original_position() >= end {
                continue;
            }
            // Parked copies are links; deliver the event they point to.
            self.stream_buffer
                .add_retry(OutstandingMessage::replayed(ResolvedEvent::new(parked.event)));
        }

        if batch.is_end_of_stream || batch.next_position >= end {
            info!(subscription = %self.subscription_id, %end, "parked messages replayed");
            self.message_parker.begin_mark_parked_messages_reprocessed(end);
            self.replaying_parked = false;
        } else {
            self.read_parked_batch(batch.next_position, end);
        }
        self.try_pushing_messages_to_clients();
    }

    // --- Lifecycle ---

    /// Remove checkpoint and parked state. Repeated calls do nothing.
    pub fn delete(&mut self) {
        if self.status == SubscriptionStatus::Deleted {
            return;
        }
        info!(subscription = %self.subscription_id, "deleting subscription");
        self.status = SubscriptionStatus::Deleted;
        self.clients
            .shutdown_all(&self.subscription_id, DropReason::SubscriptionDeleted);

        let tx = self.completions_tx.clone();
        self.checkpoint_writer.begin_delete(Box::new(move |result| {
            let _ = tx.send(Completion::Deleted {
                what: "checkpoint",
                result,
            });
        }));
        let tx = self.completions_tx.clone();
        self.message_parker.begin_delete(Box::new(move |result| {
            let _ = tx.send(Completion::Deleted {
                what: "parked messages",
                result,
            });
        }));
        self.process_completions();
    }

    /// Apply collaborator results that arrived since the last call.
    pub fn process_completions(&mut self) {
        while let Ok(completion) = self.completions_rx.try_recv() {
            match completion {
                Completion::CheckpointLoaded(checkpoint) => self.on_checkpoint_loaded(checkpoint),
                Completion::ReadCompleted(batch) => self.on_read_completed(batch),
                Completion::Parked {
                    event,
                    reason,
                    attempt,
                    result,
                } => self.on_parked(event, reason, attempt, result),
                Completion::ParkedEndSequence(end) => self.on_parked_end_sequence(end),
                Completion::ParkedRead { batch, end } => self.on_parked_read(batch, end),
                Completion::Deleted { what, result } => match result {
                    Ok(()) => debug!(subscription = %self.subscription_id, what, "deleted"),
                    Err(e) => warn!(subscription = %self.subscription_id, what, error = %e, "delete failed"),
                },
            }
        }
    }

    pub fn statistics(&self) -> SubscriptionStats {
        SubscriptionStats {
            subscription_id: self.subscription_id.clone(),
            stream_id: self.stream_id.clone(),
            group_name: self.group_name.clone(),
            status: self.status,
            consumer_strategy: self.clients.strategy(),
            connection_count: self.clients.len(),
            connections: self.clients.iter().map(Client::info).collect(),
            outstanding_messages: self.outstanding.len(),
            buffered_messages: self.stream_buffer.buffer_count(),
            live_buffer_count: self.stream_buffer.live_buffer_count(),
            retry_buffer_count: self.stream_buffer.retry_buffer_count(),
            read_buffer_count: self.stream_buffer.read_buffer_count(),
            total_items_processed: self.total_items_processed,
            last_processed_position: self.last_dispatched,
            last_known_position: self.last_known_position,
            last_checkpoint: self.last_checkpoint,
            parked_stream_id: self.parked_stream_id(),
            checkpoint_stream_id: checkpoint_stream_id(&self.stream_id, &self.group_name),
        }
    }
}
