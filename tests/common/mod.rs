//! In-memory collaborators shared by the integration tests.

#![allow(dead_code)]

use parking_lot::Mutex;
use persistent_subscriptions::{
    Callback, ChannelEnvelope, CheckpointReader, CheckpointWriter, ClientHandle, ClientMessage,
    EventLoader, MessageParker, PersistentSubscription, PersistentSubscriptionParams, Position,
    ReadBatch, RecordedEvent, ResolvedEvent, Result, SubscriptionBackend, SubscriptionError,
    SubscriptionSettings,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

pub const STREAM: &str = "orders";
pub const GROUP: &str = "billing";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

pub fn event_at(stream_id: &str, position: u64) -> ResolvedEvent {
    ResolvedEvent::new(RecordedEvent::raw(
        stream_id,
        Position(position),
        "OrderPlaced",
        format!("{{\"n\":{}}}", position).into_bytes(),
    ))
}

pub fn events(range: std::ops::Range<u64>) -> Vec<ResolvedEvent> {
    range.map(|p| event_at(STREAM, p)).collect()
}

// --- Event loader ---

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadRequest {
    pub stream_id: String,
    pub start: Position,
    pub count: usize,
}

/// Event loader that either answers from in-memory streams or records the
/// request and leaves the test to deliver the page.
pub struct FakeEventLoader {
    streams: Mutex<HashMap<String, Vec<ResolvedEvent>>>,
    requests: Mutex<Vec<ReadRequest>>,
    pending: Mutex<Vec<Callback<ReadBatch>>>,
    manual: bool,
}

impl FakeEventLoader {
    /// Records requests; pages are delivered by the test.
    pub fn manual() -> Arc<Self> {
        Self::build(true)
    }

    /// Answers synchronously from the stored streams.
    pub fn in_memory() -> Arc<Self> {
        Self::build(false)
    }

    fn build(manual: bool) -> Arc<Self> {
        Arc::new(Self {
            streams: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            pending: Mutex::new(Vec::new()),
            manual,
        })
    }

    pub fn append(&self, stream_id: &str, event: ResolvedEvent) {
        self.streams
            .lock()
            .entry(stream_id.to_string())
            .or_default()
            .push(event);
    }

    pub fn requests(&self) -> Vec<ReadRequest> {
        self.requests.lock().clone()
    }

    /// Deliver a page to the oldest pending manual request.
    pub fn complete_next(&self, batch: ReadBatch) -> bool {
        let callback = {
            let mut pending = self.pending.lock();
            if pending.is_empty() {
                return false;
            }
            pending.remove(0)
        };
        callback(batch);
        true
    }
}

impl EventLoader for FakeEventLoader {
    fn begin_read_events(
        &self,
        stream_id: &str,
        start: Position,
        count_to_load: usize,
        _batch_size: usize,
        _resolve_link_tos: bool,
        on_events_found: Callback<ReadBatch>,
    ) {
        self.requests.lock().push(ReadRequest {
            stream_id: stream_id.to_string(),
            start,
            count: count_to_load,
        });
        if self.manual {
            self.pending.lock().push(on_events_found);
            return;
        }

        let batch = {
            let streams = self.streams.lock();
            let stream = streams.get(stream_id).map(Vec::as_slice).unwrap_or(&[]);
            let from = (start.0 as usize).min(stream.len());
            let page: Vec<ResolvedEvent> = stream[from..].iter().take(count_to_load).cloned().collect();
            let next = from + page.len();
            ReadBatch {
                events: page,
                next_position: Position(next as u64),
                is_end_of_stream: next >= stream.len(),
            }
        };
        on_events_found(batch);
    }
}

// --- Checkpoints ---

pub struct FakeCheckpointStore {
    initial: Option<Position>,
    manual: bool,
    pending: Mutex<Option<Callback<Option<Position>>>>,
    written: Mutex<Vec<Position>>,
    deletes: AtomicUsize,
}

impl FakeCheckpointStore {
    pub fn empty() -> Arc<Self> {
        Self::with_checkpoint(None)
    }

    pub fn with_checkpoint(initial: Option<Position>) -> Arc<Self> {
        Arc::new(Self {
            initial,
            manual: false,
            pending: Mutex::new(None),
            written: Mutex::new(Vec::new()),
            deletes: AtomicUsize::new(0),
        })
    }

    /// Holds the load until `complete_load` is called.
    pub fn manual(initial: Option<Position>) -> Arc<Self> {
        Arc::new(Self {
            initial,
            manual: true,
            pending: Mutex::new(None),
            written: Mutex::new(Vec::new()),
            deletes: AtomicUsize::new(0),
        })
    }

    pub fn complete_load(&self) {
        if let Some(callback) = self.pending.lock().take() {
            callback(self.initial);
        }
    }

    pub fn written(&self) -> Vec<Position> {
        self.written.lock().clone()
    }

    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }
}

impl CheckpointReader for FakeCheckpointStore {
    fn begin_load_state(&self, _subscription_id: &str, on_state_loaded: Callback<Option<Position>>) {
        if self.manual {
            *self.pending.lock() = Some(on_state_loaded);
        } else {
            on_state_loaded(self.initial);
        }
    }
}

impl CheckpointWriter for FakeCheckpointStore {
    fn begin_write_state(&self, position: Position) {
        self.written.lock().push(position);
    }

    fn begin_delete(&self, on_deleted: Callback<Result<()>>) {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        on_deleted(Ok(()));
    }
}

// --- Parker ---

pub struct FakeMessageParker {
    parked: Mutex<Vec<(ResolvedEvent, String)>>,
    attempts: AtomicUsize,
    failures_remaining: AtomicU32,
    reprocessed: Mutex<Vec<Position>>,
    deletes: AtomicUsize,
    /// Also write parked messages as links into this loader stream.
    mirror: Option<(Arc<FakeEventLoader>, String)>,
}

impl FakeMessageParker {
    pub fn new() -> Arc<Self> {
        Self::build(0, None)
    }

    /// Fails the first `failures` park attempts.
    pub fn failing(failures: u32) -> Arc<Self> {
        Self::build(failures, None)
    }

    /// Writes parked messages to `parked_stream` of `loader`.
    pub fn mirrored(loader: Arc<FakeEventLoader>, parked_stream: String) -> Arc<Self> {
        Self::build(0, Some((loader, parked_stream)))
    }

    fn build(failures: u32, mirror: Option<(Arc<FakeEventLoader>, String)>) -> Arc<Self> {
        Arc::new(Self {
            parked: Mutex::new(Vec::new()),
            attempts: AtomicUsize::new(0),
            failures_remaining: AtomicU32::new(failures),
            reprocessed: Mutex::new(Vec::new()),
            deletes: AtomicUsize::new(0),
            mirror,
        })
    }

    pub fn parked(&self) -> Vec<(ResolvedEvent, String)> {
        self.parked.lock().clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn reprocessed(&self) -> Vec<Position> {
        self.reprocessed.lock().clone()
    }

    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }
}

impl MessageParker for FakeMessageParker {
    fn begin_park_message(&self, event: &ResolvedEvent, reason: &str, on_parked: Callback<Result<()>>) {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            on_parked(Err(SubscriptionError::Collaborator("parked stream unavailable".into())));
            return;
        }

        let sequence = {
            let mut parked = self.parked.lock();
            parked.push((event.clone(), reason.to_string()));
            parked.len() as u64 - 1
        };
        if let Some((loader, stream)) = &self.mirror {
            let target = event.original_event();
            let link = RecordedEvent::raw(
                stream.as_str(),
                Position(sequence),
                "$>",
                format!("{}@{}", target.event_number, target.stream_id).into_bytes(),
            );
            loader.append(stream, ResolvedEvent::with_link(event.event.clone(), link));
        }
        on_parked(Ok(()));
    }

    fn begin_read_end_sequence(&self, on_completed: Callback<Option<Position>>) {
        let len = self.parked.lock().len() as u64;
        on_completed((len > 0).then_some(Position(len)));
    }

    fn begin_mark_parked_messages_reprocessed(&self, sequence: Position) {
        self.reprocessed.lock().push(sequence);
    }

    fn begin_delete(&self, on_deleted: Callback<Result<()>>) {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        on_deleted(Ok(()));
    }
}

// --- Wiring ---

pub struct Fixture {
    pub loader: Arc<FakeEventLoader>,
    pub checkpoints: Arc<FakeCheckpointStore>,
    pub parker: Arc<FakeMessageParker>,
}

impl Fixture {
    pub fn new() -> Self {
        Self {
            loader: FakeEventLoader::manual(),
            checkpoints: FakeCheckpointStore::empty(),
            parker: FakeMessageParker::new(),
        }
    }

    pub fn params(&self, settings: SubscriptionSettings) -> PersistentSubscriptionParams {
        PersistentSubscriptionParams::new(STREAM, GROUP)
            .with_settings(settings)
            .with_event_loader(self.loader.clone())
            .with_checkpoint_reader(self.checkpoints.clone())
            .with_checkpoint_writer(self.checkpoints.clone())
            .with_message_parker(self.parker.clone())
    }

    pub fn subscription(&self, settings: SubscriptionSettings) -> PersistentSubscription {
        PersistentSubscription::new(self.params(settings)).unwrap()
    }
}

impl SubscriptionBackend for Fixture {
    fn event_loader(&self) -> Arc<dyn EventLoader> {
        self.loader.clone()
    }

    fn checkpoint_reader(&self) -> Arc<dyn CheckpointReader> {
        self.checkpoints.clone()
    }

    fn checkpoint_writer(&self, _subscription_id: &str) -> Arc<dyn CheckpointWriter> {
        self.checkpoints.clone()
    }

    fn message_parker(&self, _subscription_id: &str) -> Arc<dyn MessageParker> {
        self.parker.clone()
    }
}

// --- Clients ---

pub struct TestClient {
    pub correlation_id: Uuid,
    pub connection_id: Uuid,
    pub handle: ClientHandle,
}

impl TestClient {
    /// Events delivered since the last call, with their retry counts.
    pub fn received(&self) -> Vec<(ResolvedEvent, u32)> {
        self.handle
            .drain()
            .into_iter()
            .filter_map(|m| match m {
                ClientMessage::EventAppeared {
                    event, retry_count, ..
                } => Some((event, retry_count)),
                ClientMessage::SubscriptionDropped { .. } => None,
            })
            .collect()
    }

    pub fn received_positions(&self) -> Vec<u64> {
        self.received()
            .into_iter()
            .map(|(e, _)| e.original_position().0)
            .collect()
    }
}

pub fn connect(subscription: &mut PersistentSubscription, max_in_flight: usize) -> TestClient {
    let (envelope, handle) = ChannelEnvelope::unbounded();
    let client = TestClient {
        correlation_id: Uuid::new_v4(),
        connection_id: Uuid::new_v4(),
        handle,
    };
    subscription
        .add_client(
            client.correlation_id,
            client.connection_id,
            envelope,
            max_in_flight,
            "ops",
            "127.0.0.1:2113",
        )
        .unwrap();
    client
}
