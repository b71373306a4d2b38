//! Registry of persistent subscriptions keyed by `stream:group`.

use crate::collaborators::SubscriptionBackend;
use crate::error::{Result, SubscriptionError};
use crate::types::{EventId, ResolvedEvent};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;
use uuid::Uuid;

use super::clients::Envelope;
use super::persistent::{subscription_id, PersistentSubscription, PersistentSubscriptionParams};
use super::stats::SubscriptionStats;
use super::types::{NakAction, SubscriptionSettings};

/// A subscription behind its own lock.
pub type SharedSubscription = Arc<Mutex<PersistentSubscription>>;

struct Entry {
    stream_id: String,
    subscription: SharedSubscription,
}

/// Creates, looks up and drives persistent subscriptions.
///
/// Each subscription has its own mutex; the registry lock is only held long
/// enough to clone the handle, never while a subscription runs.
pub struct SubscriptionManager {
    backend: Arc<dyn SubscriptionBackend>,
    /// Active subscriptions by id.
    subscriptions: RwLock<HashMap<String, Entry>>,
}

impl SubscriptionManager {
    pub fn new(backend: Arc<dyn SubscriptionBackend>) -> Self {
        Self {
            backend,
            subscriptions: RwLock::new(HashMap::new()),
        }
    }

    fn build(&self, stream_id: &str, group_name: &str, settings: SubscriptionSettings) -> Result<PersistentSubscription> {
        let id = subscription_id(stream_id, group_name);
        PersistentSubscription::new(
            PersistentSubscriptionParams::new(stream_id, group_name)
                .with_settings(settings)
                .with_event_loader(self.backend.event_loader())
                .with_checkpoint_reader(self.backend.checkpoint_reader())
                .with_checkpoint_writer(self.backend.checkpoint_writer(&id))
                .with_message_parker(self.backend.message_parker(&id)),
        )
    }

    /// Create a subscription. Returns its id.
    pub fn create_subscription(
        &self,
        stream_id: &str,
        group_name: &str,
        settings: SubscriptionSettings,
    ) -> Result<String> {
        settings.validate()?;
        let id = subscription_id(stream_id, group_name);
        if self.subscriptions.read().contains_key(&id) {
            return Err(SubscriptionError::AlreadyExists(id));
        }

        let subscription = self.build(stream_id, group_name, settings)?;
        let mut subs = self.subscriptions.write();
        if subs.contains_key(&id) {
            return Err(SubscriptionError::AlreadyExists(id));
        }
        subs.insert(
            id.clone(),
            Entry {
                stream_id: stream_id.to_string(),
                subscription: Arc::new(Mutex::new(subscription)),
            },
        );
        info!(subscription = %id, "subscription created");
        Ok(id)
    }

    /// Replace the settings of a subscription.
    ///
    /// Connected clients are dropped and must reconnect; progress resumes
    /// from the stored checkpoint.
    pub fn update_subscription(
        &self,
        stream_id: &str,
        group_name: &str,
        settings: SubscriptionSettings,
    ) -> Result<()> {
        settings.validate()?;
        let existing = self.get(stream_id, group_name)?;
        let replacement = self.build(stream_id, group_name, settings)?;
        let id = subscription_id(stream_id, group_name);
        self.replace_if_current(&id, stream_id, &existing, replacement)?;

        existing.lock().shutdown();
        info!(subscription = %id, "subscription updated");
        Ok(())
    }

    /// Swap in `replacement` only while `id` still maps to `expected`.
    fn replace_if_current(
        &self,
        id: &str,
        stream_id: &str,
        expected: &SharedSubscription,
        replacement: PersistentSubscription,
    ) -> Result<()> {
        let mut subs = self.subscriptions.write();
        match subs.get(id) {
            Some(entry) if Arc::ptr_eq(&entry.subscription, expected) => {}
            _ => return Err(SubscriptionError::NotFound(id.to_string())),
        }
        subs.insert(
            id.to_string(),
            Entry {
                stream_id: stream_id.to_string(),
                subscription: Arc::new(Mutex::new(replacement)),
            },
        );
        Ok(())
    }

    /// Delete a subscription together with its checkpoint and parked messages.
    pub fn delete_subscription(&self, stream_id: &str, group_name: &str) -> Result<()> {
        let id = subscription_id(stream_id, group_name);
        let entry = self
            .subscriptions
            .write()
            .remove(&id)
            .ok_or_else(|| SubscriptionError::NotFound(id.clone()))?;
        entry.subscription.lock().delete();
        Ok(())
    }

    /// Get a subscription by stream and group.
    pub fn get(&self, stream_id: &str, group_name: &str) -> Result<SharedSubscription> {
        self.get_by_id(&subscription_id(stream_id, group_name))
    }

    fn get_by_id(&self, id: &str) -> Result<SharedSubscription> {
        self.subscriptions
            .read()
            .get(id)
            .map(|e| Arc::clone(&e.subscription))
            .ok_or_else(|| SubscriptionError::NotFound(id.to_string()))
    }

    fn all(&self) -> Vec<SharedSubscription> {
        self.subscriptions
            .read()
            .values()
            .map(|e| Arc::clone(&e.subscription))
            .collect()
    }

    fn on_stream(&self, stream_id: &str) -> Vec<SharedSubscription> {
        self.subscriptions
            .read()
            .values()
            .filter(|e| e.stream_id == stream_id)
            .map(|e| Arc::clone(&e.subscription))
            .collect()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    // --- Clients ---

    /// Connect a push client.
    #[allow(clippy::too_many_arguments)]
    pub fn connect(
        &self,
        stream_id: &str,
        group_name: &str,
        correlation_id: Uuid,
        connection_id: Uuid,
        envelope: Arc<dyn Envelope>,
        max_in_flight: usize,
        username: &str,
        remote_from: &str,
    ) -> Result<()> {
        self.get(stream_id, group_name)?.lock().add_client(
            correlation_id,
            connection_id,
            envelope,
            max_in_flight,
            username,
            remote_from,
        )
    }

    /// A client left a subscription.
    pub fn unsubscribe(&self, subscription_id: &str, correlation_id: Uuid) -> Result<()> {
        self.get_by_id(subscription_id)?
            .lock()
            .remove_client_by_correlation_id(correlation_id, true);
        Ok(())
    }

    /// A connection closed; remove its clients from every subscription.
    pub fn disconnect(&self, connection_id: Uuid) {
        for subscription in self.all() {
            subscription.lock().remove_client_by_connection_id(connection_id);
        }
    }

    /// Serve a pull client.
    pub fn read_next(&self, subscription_id: &str, count: usize) -> Result<Vec<ResolvedEvent>> {
        Ok(self
            .get_by_id(subscription_id)?
            .lock()
            .get_next_n_or_less_messages(count))
    }

    pub fn ack(&self, subscription_id: &str, correlation_id: Uuid, event_ids: &[EventId]) -> Result<()> {
        self.get_by_id(subscription_id)?
            .lock()
            .acknowledge_messages_processed(correlation_id, event_ids);
        Ok(())
    }

    pub fn nack(
        &self,
        subscription_id: &str,
        correlation_id: Uuid,
        event_ids: &[EventId],
        action: NakAction,
        reason: &str,
    ) -> Result<()> {
        self.get_by_id(subscription_id)?
            .lock()
            .not_acknowledge_messages_processed(correlation_id, event_ids, action, reason);
        Ok(())
    }

    /// Move the parked messages of a subscription back into it.
    pub fn replay_parked(&self, stream_id: &str, group_name: &str) -> Result<()> {
        self.get(stream_id, group_name)?.lock().retry_parked_messages();
        Ok(())
    }

    // --- Driving ---

    /// Hand a newly committed event to every subscription on its stream.
    pub fn publish_live(&self, event: &ResolvedEvent) {
        for subscription in self.on_stream(event.original_stream_id()) {
            subscription
                .lock()
                .notify_live_subscription_message(event.clone());
        }
    }

    /// Advance timeouts and checkpoints of every subscription.
    pub fn tick(&self, now: Instant) {
        for subscription in self.all() {
            subscription.lock().notify_clock_tick(now);
        }
    }

    /// Apply collaborator results that completed off-thread.
    pub fn process_completions(&self) {
        for subscription in self.all() {
            subscription.lock().process_completions();
        }
    }

    // --- Statistics ---

    pub fn statistics(&self) -> Vec<SubscriptionStats> {
        let mut stats: Vec<SubscriptionStats> = self.all().iter().map(|s| s.lock().statistics()).collect();
        stats.sort_by(|a, b| a.subscription_id.cmp(&b.subscription_id));
        stats
    }

    pub fn stream_statistics(&self, stream_id: &str) -> Vec<SubscriptionStats> {
        let mut stats: Vec<SubscriptionStats> = self
            .on_stream(stream_id)
            .iter()
            .map(|s| s.lock().statistics())
            .collect();
        stats.sort_by(|a, b| a.group_name.cmp(&b.group_name));
        stats
    }

    pub fn subscription_statistics(&self, stream_id: &str, group_name: &str) -> Result<SubscriptionStats> {
        Ok(self.get(stream_id, group_name)?.lock().statistics())
    }
}
