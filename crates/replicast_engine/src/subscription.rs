//! Channel subscriptions and per-channel message loops.

use crate::error::{EngineError, EngineResult};
use crate::store::{ApplyOutcome, ReplicaObserver, ReplicaStore, SharedStore};
use crate::transport::{Subscription, Transport};
use parking_lot::{Mutex, RwLock, RwLockWriteGuard};
use replicast_protocol::{ChannelMessage, ChannelName};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A channel together with its store and observers.
pub struct ChannelBinding {
    channel: ChannelName,
    store: SharedStore,
    observers: RwLock<Vec<Arc<dyn ReplicaObserver>>>,
}

impl ChannelBinding {
    /// Creates a binding with an empty store.
    pub fn new(channel: ChannelName) -> Self {
        Self {
            store: ReplicaStore::shared(channel.clone()),
            channel,
            observers: RwLock::new(Vec::new()),
        }
    }

    /// Returns the channel.
    pub fn channel(&self) -> &ChannelName {
        &self.channel
    }

    /// Returns the channel's store.
    pub fn store(&self) -> SharedStore {
        Arc::clone(&self.store)
    }

    /// Registers an observer notified after every applied message.
    pub fn add_observer(&self, observer: Arc<dyn ReplicaObserver>) {
        self.observers.write().push(observer);
    }

    /// Decodes and applies one raw message.
    ///
    /// Malformed messages are logged, counted and dropped; the store is left
    /// untouched and `None` is returned. Observers run before this returns.
    pub fn dispatch(&self, raw: &Value) -> Option<ApplyOutcome> {
        let message = match ChannelMessage::decode(raw).map_err(EngineError::from) {
            Ok(message) => message,
            Err(e) => {
                warn!(channel = %self.channel, error = %e, "dropping message");
                self.store.write().record_malformed(e.to_string());
                return None;
            }
        };

        let mut store = self.store.write();
        let outcome = store.apply(message);
        log_outcome(&store, &outcome);

        let store = RwLockWriteGuard::downgrade(store);
        for observer in self.observers.read().iter() {
            observer.on_applied(&store, &outcome);
        }
        Some(outcome)
    }
}

impl std::fmt::Debug for ChannelBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelBinding")
            .field("channel", &self.channel)
            .field("observers", &self.observers.read().len())
            .finish()
    }
}

fn log_outcome(store: &ReplicaStore, outcome: &ApplyOutcome) {
    let channel = store.channel();
    match outcome {
        ApplyOutcome::Initialized { count, generation } => {
            info!(%channel, count, generation, "replica initialized");
        }
        ApplyOutcome::Added { id } => debug!(%channel, %id, count = store.len(), "entity added"),
        ApplyOutcome::Replaced { id } => {
            debug!(%channel, %id, count = store.len(), "entity replaced")
        }
        ApplyOutcome::Updated { id, fields } => {
            debug!(%channel, %id, fields = ?fields, "entity updated")
        }
        ApplyOutcome::Deleted { entity } => {
            debug!(%channel, id = %entity.id(), count = store.len(), "entity deleted")
        }
        // logged by the store
        ApplyOutcome::UnknownReference { .. } | ApplyOutcome::Unrecognized { .. } => {}
    }
}

/// Opens one subscription per channel and runs its message loop.
pub struct SubscriptionManager<T: Transport> {
    transport: Arc<T>,
    bindings: Vec<Arc<ChannelBinding>>,
    tasks: Mutex<HashMap<ChannelName, JoinHandle<()>>>,
}

impl<T: Transport> SubscriptionManager<T> {
    /// Creates a manager with an empty store per channel, in order.
    pub fn new(transport: Arc<T>, channels: &[ChannelName]) -> Self {
        Self {
            transport,
            bindings: channels
                .iter()
                .cloned()
                .map(|c| Arc::new(ChannelBinding::new(c)))
                .collect(),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the configured channels in order.
    pub fn channels(&self) -> Vec<ChannelName> {
        self.bindings.iter().map(|b| b.channel().clone()).collect()
    }

    /// Returns the binding for a channel.
    pub fn binding(&self, channel: &ChannelName) -> Option<&Arc<ChannelBinding>> {
        self.bindings.iter().find(|b| b.channel() == channel)
    }

    /// Returns the store for a channel.
    pub fn store(&self, channel: &ChannelName) -> Option<SharedStore> {
        self.binding(channel).map(|b| b.store())
    }

    /// Returns every store in channel order.
    pub fn stores(&self) -> Vec<SharedStore> {
        self.bindings.iter().map(|b| b.store()).collect()
    }

    /// Registers an observer on a channel.
    pub fn add_observer(
        &self,
        channel: &ChannelName,
        observer: Arc<dyn ReplicaObserver>,
    ) -> EngineResult<()> {
        let binding = self
            .binding(channel)
            .ok_or_else(|| EngineError::Config(format!("channel {channel} is not configured")))?;
        binding.add_observer(observer);
        Ok(())
    }

    /// Replaces every channel loop with a fresh subscription.
    ///
    /// Channels are subscribed once each, in configuration order. A failure
    /// is logged against its channel and does not affect the others.
    /// Returns the number of channels subscribed.
    pub async fn subscribe_all(&self) -> usize {
        self.invalidate_all();

        let mut subscribed = 0;
        for binding in &self.bindings {
            let channel = binding.channel();
            match self.transport.subscribe(channel).await {
                Ok(subscription) => {
                    binding.store.write().record_subscription();
                    let task = tokio::spawn(run_channel(Arc::clone(binding), subscription));
                    if let Some(stale) = self.tasks.lock().insert(channel.clone(), task) {
                        stale.abort();
                    }
                    info!(%channel, "subscribed");
                    subscribed += 1;
                }
                Err(e) => {
                    warn!(%channel, error = %e, "subscription failed");
                    binding.store.write().record_failure(e.to_string());
                }
            }
        }
        subscribed
    }

    /// Stops every channel loop.
    ///
    /// Loops stop at their next await point, so a message being applied is
    /// always applied completely.
    pub fn invalidate_all(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            debug!(loops = tasks.len(), "stopping channel loops");
        }
        for (_, task) in tasks.drain() {
            task.abort();
        }
    }

    /// Returns the channels whose loop is still running.
    pub fn active_channels(&self) -> Vec<ChannelName> {
        let tasks = self.tasks.lock();
        self.bindings
            .iter()
            .map(|b| b.channel())
            .filter(|c| tasks.get(*c).is_some_and(|t| !t.is_finished()))
            .cloned()
            .collect()
    }

    /// Stops every loop, waits for them and unsubscribes each channel.
    pub async fn shutdown(&self) {
        let tasks: Vec<_> = self.tasks.lock().drain().map(|(_, t)| t).collect();
        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            // cancelled loops report a JoinError, which is expected here
            let _ = task.await;
        }

        for binding in &self.bindings {
            if let Err(e) = self.transport.unsubscribe(binding.channel()).await {
                debug!(channel = %binding.channel(), error = %e, "unsubscribe failed");
            }
        }
    }
}

impl<T: Transport> Drop for SubscriptionManager<T> {
    fn drop(&mut self) {
        self.invalidate_all();
    }
}

async fn run_channel(binding: Arc<ChannelBinding>, mut subscription: Subscription) {
    while let Some(item) = subscription.next().await {
        match item {
            Ok(raw) => {
                binding.dispatch(&raw);
            }
            Err(e) => {
                let err = EngineError::subscription(subscription.channel(), e.to_string());
                warn!(
                    channel = %binding.channel(),
                    error = %err,
                    retryable = e.is_retryable(),
                    "channel loop ended"
                );
                binding.store.write().record_failure(e.to_string());
                return;
            }
        }
    }
    debug!(channel = %binding.channel(), "channel stream closed");
}
