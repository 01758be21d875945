//! Thread registry — in-memory view of all threads, kept fresh via a
//! pull-based refresh plus the broadcast refresh bus.
//!
//! A periodic tick also re-runs the fetch so relative-time displays
//! ("3 minutes ago") stay current without requiring an explicit mutation.

use anyhow::Result;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::events::RefreshBus;
use crate::model::Thread;
use crate::storage::Storage;

pub struct ThreadRegistry {
    storage: Arc<Storage>,
    bus: RefreshBus,
    threads: RwLock<Vec<Thread>>,
}

impl ThreadRegistry {
    pub fn new(storage: Arc<Storage>, bus: RefreshBus) -> Self {
        Self {
            storage,
            bus,
            threads: RwLock::new(Vec::new()),
        }
    }

    /// Snapshot of the in-memory thread list (newest first).
    pub async fn threads(&self) -> Vec<Thread> {
        self.threads.read().await.clone()
    }

    /// Reload the full thread list from the store into memory.
    pub async fn fetch_threads(&self) -> Result<()> {
        let threads = self.storage.list_threads().await?;
        *self.threads.write().await = threads;
        Ok(())
    }

    /// Create and persist a new thread; returns its id.
    pub async fn create_thread(&self, title: &str, kind: &str) -> Result<String> {
        let thread = Thread::new(title, kind);
        self.storage.create_thread(&thread).await?;
        info!(id = %thread.id, title = %thread.title, "thread created");
        let id = thread.id.clone();
        self.fetch_threads().await?;
        self.bus.emit();
        Ok(id)
    }

    /// Delete a thread and all of its messages. Returns `false` when no
    /// thread had this id.
    ///
    /// The cascade is best-effort, not transactional: messages go first, so
    /// a crash in between leaves an empty thread rather than orphans.
    pub async fn delete_thread(&self, id: &str) -> Result<bool> {
        let messages = self.storage.delete_messages(id).await?;
        let deleted = self.storage.delete_thread(id).await?;
        if deleted {
            info!(id = %id, messages, "thread deleted");
        }
        self.fetch_threads().await?;
        self.bus.emit();
        Ok(deleted)
    }

    /// Emit a refresh signal; every subscribed registry instance re-runs
    /// `fetch_threads` on receipt.
    pub fn refresh(&self) {
        self.bus.emit();
    }

    /// Spawn the background task that re-fetches on refresh signals and on a
    /// periodic tick. The task runs until the handle is aborted.
    pub fn spawn_refresh_task(self: &Arc<Self>, interval: std::time::Duration) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        let mut rx = self.bus.subscribe();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.tick().await; // skip immediate tick
            loop {
                tokio::select! {
                    signal = rx.recv() => {
                        match signal {
                            Ok(_) => debug!("registry refresh signal received"),
                            // Lagged just means we missed coalescable signals;
                            // fall through to the fetch.
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        }
                    }
                    _ = tick.tick() => {}
                }
                if let Err(e) = registry.fetch_threads().await {
                    warn!(err = %e, "registry fetch failed");
                }
            }
        })
    }
}
