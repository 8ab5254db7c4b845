//! The conversation registry.
//!
//! Holds the active conversation managers keyed by ID. Lookups touch the
//! entry; a background sweeper evicts managers idle past a threshold with
//! no subscribers attached. Eviction cancels the turn-loop context, closes
//! every subscriber buffer, and releases the toolset.

use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use quill_store::{ConversationRow, Store};

use crate::errors::Result;
use crate::manager::ConversationManager;

/// Builds a manager for a loaded conversation row. Receives a weak handle
/// to the registry so bridges can materialize child conversations without
/// a reference cycle.
pub type ManagerFactory = Arc<
    dyn Fn(&ConversationRow, Weak<ConversationRegistry>) -> Result<Arc<ConversationManager>>
        + Send
        + Sync,
>;

/// Registry of active conversation managers.
pub struct ConversationRegistry {
    managers: DashMap<String, Arc<ConversationManager>>,
    store: Arc<Store>,
    factory: ManagerFactory,
    idle_timeout: Duration,
}

impl ConversationRegistry {
    /// Create a registry. Managers idle longer than `idle_timeout` with no
    /// subscribers are evicted by the sweeper.
    #[must_use]
    pub fn new(store: Arc<Store>, factory: ManagerFactory, idle_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            managers: DashMap::new(),
            store,
            factory,
            idle_timeout,
        })
    }

    /// Load or construct the manager for a conversation. The conversation
    /// must exist in the store; lookups touch the entry.
    pub fn get_or_create(self: &Arc<Self>, conversation_id: &str) -> Result<Arc<ConversationManager>> {
        if let Some(manager) = self.managers.get(conversation_id) {
            manager.touch();
            return Ok(manager.clone());
        }

        let row = self.store.get_conversation(conversation_id)?;
        match self.managers.entry(conversation_id.to_owned()) {
            Entry::Occupied(entry) => {
                entry.get().touch();
                Ok(entry.get().clone())
            }
            Entry::Vacant(entry) => {
                let manager = (self.factory)(&row, Arc::downgrade(self))?;
                manager.touch();
                entry.insert(manager.clone());
                debug!(conversation_id, "conversation manager created");
                Ok(manager)
            }
        }
    }

    /// The active manager, if any. Touches the entry.
    #[must_use]
    pub fn get(&self, conversation_id: &str) -> Option<Arc<ConversationManager>> {
        let manager = self.managers.get(conversation_id)?;
        manager.touch();
        Some(manager.clone())
    }

    /// Shut down and drop a manager.
    pub fn evict(&self, conversation_id: &str) {
        if let Some((_, manager)) = self.managers.remove(conversation_id) {
            manager.shutdown();
            info!(conversation_id, "conversation manager evicted");
        }
    }

    /// Number of active managers.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.managers.len()
    }

    /// One sweep: evict every manager past the idle threshold with no
    /// subscribers attached.
    pub fn sweep(&self) {
        let expired: Vec<String> = self
            .managers
            .iter()
            .filter(|entry| {
                entry.idle_for() >= self.idle_timeout && entry.subscriber_count() == 0
            })
            .map(|entry| entry.key().clone())
            .collect();
        for conversation_id in expired {
            self.evict(&conversation_id);
        }
    }

    /// Start the background sweeper. Runs until `cancel` fires.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        cancel: CancellationToken,
        interval: Duration,
    ) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => registry.sweep(),
                }
            }
            debug!("conversation sweeper stopped");
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
