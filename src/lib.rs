//! Local-first persistence and orchestration for agent conversations.
//!
//! The crate owns durable storage of conversation threads and messages,
//! reconciliation between that store and the in-memory active-conversation
//! caches, deduplication of long-running agent actions, and recovery from
//! network failures without losing history. UI rendering, agent response
//! generation, and action business logic live outside — collaborators call
//! in through [`ChatContext`].

pub mod cache;
pub mod completion;
pub mod config;
pub mod error;
pub mod events;
pub mod model;
pub mod orchestrator;
pub mod registry;
pub mod storage;

use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use cache::{ActiveThread, MessageCache};
use completion::{CompletionClient, HttpCompletionClient};
use config::ChatConfig;
use error::ChatError;
use events::RefreshBus;
use orchestrator::Orchestrator;
use registry::ThreadRegistry;
use storage::Storage;

/// Shared state wiring the store into the registry, cache, and orchestrator.
///
/// Constructed once at application startup; the store is injected into every
/// component rather than living in a global. Dropping the context (after
/// [`ChatContext::shutdown`]) tears everything down.
pub struct ChatContext {
    pub config: Arc<ChatConfig>,
    pub storage: Arc<Storage>,
    pub bus: RefreshBus,
    pub registry: Arc<ThreadRegistry>,
    pub cache: Arc<MessageCache>,
    pub orchestrator: Arc<Orchestrator>,
    active: Arc<ActiveThread>,
    refresh_task: tokio::task::JoinHandle<()>,
}

impl ChatContext {
    /// Open the store and wire up all components with the real HTTP
    /// completion client.
    pub async fn new(config: ChatConfig) -> Result<Self, ChatError> {
        let client = HttpCompletionClient::new(
            config.completion_url.clone(),
            Duration::from_secs(config.request_timeout_secs),
        )?;
        Self::with_client(config, Arc::new(client)).await
    }

    /// Open the store and wire up all components around an injected
    /// completion client.
    pub async fn with_client(
        config: ChatConfig,
        client: Arc<dyn CompletionClient>,
    ) -> Result<Self, ChatError> {
        let config = Arc::new(config);
        let storage = Arc::new(
            Storage::new_with_slow_query(&config.data_dir, config.slow_query_threshold_ms).await?,
        );

        // Actions left running by a crashed process cannot make progress.
        let recovered = storage.recover_stale_actions().await?;
        let pruned = storage.prune_threads(config.thread_prune_days).await?;
        if pruned > 0 {
            info!(pruned, "pruned idle threads");
        }
        if recovered > 0 || pruned > 0 {
            storage.vacuum().await?;
        }

        let bus = RefreshBus::new();
        let active = Arc::new(ActiveThread::new());
        let registry = Arc::new(ThreadRegistry::new(Arc::clone(&storage), bus.clone()));
        registry.fetch_threads().await?;
        let refresh_task =
            registry.spawn_refresh_task(Duration::from_secs(config.refresh_interval_secs));

        let cache = Arc::new(MessageCache::new(Arc::clone(&storage), Arc::clone(&active)));
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&storage),
            Arc::clone(&registry),
            client,
            Arc::clone(&config),
            Arc::clone(&active),
        ));

        Ok(Self {
            config,
            storage,
            bus,
            registry,
            cache,
            orchestrator,
            active,
            refresh_task,
        })
    }

    /// Id of the currently selected thread, if any.
    pub async fn active_thread(&self) -> Option<String> {
        self.active.get().await
    }

    /// Select a thread (or none); both the message cache and the
    /// orchestrator's volatile cache re-fetch for the new selection.
    pub async fn select_thread(&self, id: Option<String>) -> Result<(), ChatError> {
        self.orchestrator.set_active_thread(id.clone()).await?;
        self.cache.set_active_thread(id).await?;
        Ok(())
    }

    /// Stop the background refresh task and close the store.
    pub async fn shutdown(&self) {
        self.refresh_task.abort();
        self.storage.close().await;
    }
}
