use crate::core::errors::ExchangeError;
use crate::core::types::{StreamEvent, SubscriptionId, SubscriptionState};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Callback bound to a subscription; receives the raw `data` object of each frame
pub type FrameHandler = Arc<dyn Fn(&StreamEvent<Value>) + Send + Sync>;

struct Entry {
    topics: Vec<String>,
    handler: FrameHandler,
    state: SubscriptionState,
    request_id: u64,
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("topics", &self.topics)
            .field("state", &self.state)
            .field("request_id", &self.request_id)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
struct Tables {
    entries: HashMap<SubscriptionId, Entry>,
    by_topic: HashMap<String, SubscriptionId>,
}

/// Snapshot of one registered subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionInfo {
    pub id: SubscriptionId,
    pub topics: Vec<String>,
    pub state: SubscriptionState,
    pub request_id: u64,
}

/// Logical subscriptions multiplexed on one connection.
///
/// A topic belongs to at most one live subscription, so a frame's stream name
/// resolves to at most one handler. Locks are held only for the map update,
/// never while a handler runs.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    next_id: AtomicU64,
    tables: RwLock<Tables>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Register a subscription whose SUBSCRIBE frame is about to be sent
    pub fn insert_pending(
        &self,
        id: SubscriptionId,
        topics: Vec<String>,
        handler: FrameHandler,
        request_id: u64,
    ) -> Result<(), ExchangeError> {
        if topics.is_empty() {
            return Err(ExchangeError::InvalidParameters(
                "subscription needs at least one topic".to_string(),
            ));
        }

        let mut tables = self.tables.write();
        for (i, topic) in topics.iter().enumerate() {
            if tables.by_topic.contains_key(topic) || topics[..i].contains(topic) {
                return Err(ExchangeError::InvalidParameters(format!(
                    "topic '{}' is already subscribed",
                    topic
                )));
            }
        }
        for topic in &topics {
            tables.by_topic.insert(topic.clone(), id);
        }
        tables.entries.insert(
            id,
            Entry {
                topics,
                handler,
                state: SubscriptionState::Pending,
                request_id,
            },
        );
        Ok(())
    }

    /// Promote a pending subscription after a successful acknowledgement.
    ///
    /// Returns false when the entry was removed in the meantime; a removed
    /// subscription is never resurrected.
    pub fn activate(&self, id: SubscriptionId) -> bool {
        let mut tables = self.tables.write();
        match tables.entries.get_mut(&id) {
            Some(entry) if entry.state == SubscriptionState::Pending => {
                entry.state = SubscriptionState::Active;
                true
            }
            _ => false,
        }
    }

    /// Remove a subscription in any state, returning what it held
    pub fn remove(&self, id: SubscriptionId) -> Option<SubscriptionInfo> {
        let mut tables = self.tables.write();
        let entry = tables.entries.remove(&id)?;
        for topic in &entry.topics {
            tables.by_topic.remove(topic);
        }
        Some(SubscriptionInfo {
            id,
            topics: entry.topics,
            state: entry.state,
            request_id: entry.request_id,
        })
    }

    /// Remove every subscription
    pub fn drain(&self) -> Vec<SubscriptionInfo> {
        let mut tables = self.tables.write();
        tables.by_topic.clear();
        let mut drained: Vec<_> = tables
            .entries
            .drain()
            .map(|(id, entry)| SubscriptionInfo {
                id,
                topics: entry.topics,
                state: entry.state,
                request_id: entry.request_id,
            })
            .collect();
        drained.sort_by_key(|info| info.id);
        drained
    }

    /// Handler of the Active subscription holding `topic`, compared exactly
    pub fn active_handler(&self, topic: &str) -> Option<(SubscriptionId, FrameHandler)> {
        let tables = self.tables.read();
        let id = *tables.by_topic.get(topic)?;
        let entry = tables.entries.get(&id)?;
        if entry.state != SubscriptionState::Active {
            return None;
        }
        Some((id, Arc::clone(&entry.handler)))
    }

    pub fn info(&self, id: SubscriptionId) -> Option<SubscriptionInfo> {
        let tables = self.tables.read();
        tables.entries.get(&id).map(|entry| SubscriptionInfo {
            id,
            topics: entry.topics.clone(),
            state: entry.state,
            request_id: entry.request_id,
        })
    }

    pub fn len(&self) -> usize {
        self.tables.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
