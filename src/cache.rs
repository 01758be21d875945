//! Message cache — the ordered message list for the one active thread.
//!
//! Every mutation writes to the store and then re-reads the full list, so the
//! cache never drifts from what is durable (consistency over minimal I/O).

use anyhow::Result;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::model::Message;
use crate::storage::Storage;

// ─── Active thread handle ─────────────────────────────────────────────────────

/// Shared handle to the id of the currently selected thread.
///
/// The cache and the orchestrator hold the same instance, so a thread switch
/// is observed by both — this is what makes stale completion responses
/// detectable (the handler compares the id it captured against the current
/// one before touching any cache).
#[derive(Default)]
pub struct ActiveThread {
    id: RwLock<Option<String>>,
}

impl ActiveThread {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self) -> Option<String> {
        self.id.read().await.clone()
    }

    pub async fn set(&self, id: Option<String>) {
        *self.id.write().await = id;
    }

    /// True when `id` is still the selected thread.
    pub async fn is_current(&self, id: &str) -> bool {
        self.id.read().await.as_deref() == Some(id)
    }
}

// ─── Cache ────────────────────────────────────────────────────────────────────

struct CacheState {
    messages: Vec<Message>,
    loading: bool,
}

/// Store-backed message list for exactly one thread at a time.
pub struct MessageCache {
    storage: Arc<Storage>,
    active: Arc<ActiveThread>,
    state: RwLock<CacheState>,
}

impl MessageCache {
    pub fn new(storage: Arc<Storage>, active: Arc<ActiveThread>) -> Self {
        Self {
            storage,
            active,
            state: RwLock::new(CacheState {
                messages: Vec::new(),
                loading: false,
            }),
        }
    }

    /// Snapshot of the cached message list.
    pub async fn messages(&self) -> Vec<Message> {
        self.state.read().await.messages.clone()
    }

    pub async fn is_loading(&self) -> bool {
        self.state.read().await.loading
    }

    /// Select a thread (or none) and re-fetch its messages.
    pub async fn set_active_thread(&self, id: Option<String>) -> Result<()> {
        self.active.set(id).await;
        self.refetch().await
    }

    /// Reload the message list for the active thread from the store.
    pub async fn refetch(&self) -> Result<()> {
        let Some(thread_id) = self.active.get().await else {
            let mut state = self.state.write().await;
            state.messages.clear();
            state.loading = false;
            return Ok(());
        };

        self.state.write().await.loading = true;
        let result = self.storage.list_messages(Some(&thread_id)).await;
        let mut state = self.state.write().await;
        state.loading = false;
        let messages = result?;
        debug!(thread = %thread_id, count = messages.len(), "message cache refetched");
        state.messages = messages;
        Ok(())
    }

    /// Persist a message, then re-read the full list.
    pub async fn create_message(&self, message: &Message) -> Result<()> {
        self.storage.create_message(message).await?;
        self.refetch().await
    }

    /// Delete one message, then re-read the full list. Returns whether a row
    /// was removed.
    pub async fn delete_message(&self, thread_id: &str, message_id: &str) -> Result<bool> {
        let deleted = self.storage.delete_message(thread_id, message_id).await?;
        self.refetch().await?;
        Ok(deleted)
    }

    /// Delete every message of a thread, then re-read. Returns the count.
    pub async fn delete_messages(&self, thread_id: &str) -> Result<u64> {
        let deleted = self.storage.delete_messages(thread_id).await?;
        self.refetch().await?;
        Ok(deleted)
    }
}
