//! Conversation orchestrator — the core state machine.
//!
//! Coordinates sending messages, optimistic cache updates, remote-call
//! timeout/retry handling, and the action-message lifecycle. The volatile
//! message list is mutated before any awaited I/O so the UI reflects user
//! intent immediately; durable persistence is enqueued and best-effort.

use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::cache::ActiveThread;
use crate::completion::{
    CompletionClient, CompletionRequest, CompletionTurn, CODE_OK, OPAQUE_CONTENT_PLACEHOLDER,
};
use crate::config::ChatConfig;
use crate::error::ChatError;
use crate::model::{
    derive_title, new_message_id, ActionPayload, ActionState, Message, ResultKind, RetryDescriptor,
    Role,
};
use crate::registry::ThreadRegistry;
use crate::storage::{MessagePatch, Storage, ThreadPatch};

/// Synthetic agent notice appended after an action is cancelled.
const CANCELLED_NOTICE: &str = "Operation cancelled.";

struct ConvoState {
    messages: Vec<Message>,
    loading: bool,
}

pub struct Orchestrator {
    storage: Arc<Storage>,
    registry: Arc<ThreadRegistry>,
    client: Arc<dyn CompletionClient>,
    config: Arc<ChatConfig>,
    active: Arc<ActiveThread>,
    state: RwLock<ConvoState>,
}

impl Orchestrator {
    pub fn new(
        storage: Arc<Storage>,
        registry: Arc<ThreadRegistry>,
        client: Arc<dyn CompletionClient>,
        config: Arc<ChatConfig>,
        active: Arc<ActiveThread>,
    ) -> Self {
        Self {
            storage,
            registry,
            client,
            config,
            active,
            state: RwLock::new(ConvoState {
                messages: Vec::new(),
                loading: false,
            }),
        }
    }

    /// Snapshot of the volatile message list.
    pub async fn messages(&self) -> Vec<Message> {
        self.state.read().await.messages.clone()
    }

    pub async fn is_loading(&self) -> bool {
        self.state.read().await.loading
    }

    /// Select a thread (or none) and rebuild the volatile cache from the
    /// store. A completion call still in flight for the previous thread will
    /// observe the switch and discard its result.
    pub async fn set_active_thread(&self, id: Option<String>) -> Result<(), ChatError> {
        self.active.set(id.clone()).await;
        let messages = match id.as_deref() {
            Some(thread_id) => self.storage.list_messages(Some(thread_id)).await?,
            None => Vec::new(),
        };
        self.state.write().await.messages = messages;
        Ok(())
    }

    // ─── Sending ────────────────────────────────────────────────────────────

    /// Send a user message and run one completion round against the remote
    /// agent.
    ///
    /// Creates a thread on first use. The user message lands in the volatile
    /// cache before any awaited I/O on the send path; its durable write is
    /// enqueued and never blocks the call. Remote failures are recorded as
    /// retryable terminal messages rather than returned — the only error this
    /// surfaces is a store failure while creating the very first thread,
    /// because without a thread id there is nothing to append under.
    pub async fn send_message(&self, content: &str) -> Result<(), ChatError> {
        self.set_loading(true).await;

        let thread_id = match self.active.get().await {
            Some(id) => id,
            None => {
                let title = derive_title(content);
                let id = match self.registry.create_thread(&title, "chat").await {
                    Ok(id) => id,
                    Err(e) => {
                        self.set_loading(false).await;
                        return Err(ChatError::Persistence(e));
                    }
                };
                self.active.set(Some(id.clone())).await;
                id
            }
        };

        // Optimistic append; the durable write is fire-and-forget.
        let user_message = Message::text(&thread_id, Role::User, content);
        let user_message_id = user_message.message_id.clone();
        self.state.write().await.messages.push(user_message.clone());
        self.enqueue_persist(user_message);

        let agent_message_id = new_message_id();
        self.run_completion(&thread_id, content, &user_message_id, &agent_message_id)
            .await;
        Ok(())
    }

    /// Re-issue a failed remote call from its retry descriptor.
    ///
    /// Removes the terminal failure record at the tail (cache + store), then
    /// repeats the completion round with a fresh agent-message id, using the
    /// descriptor's original user message as the user turn.
    pub async fn retry_message(&self, descriptor: &RetryDescriptor) {
        self.set_loading(true).await;

        let tail = self.state.read().await.messages.last().cloned();
        if let Some(tail) = tail {
            if tail.result_kind.is_failure() && tail.thread_id == descriptor.thread_id {
                self.state.write().await.messages.pop();
                if let Err(e) = self
                    .storage
                    .delete_message(&tail.thread_id, &tail.message_id)
                    .await
                {
                    warn!(message_id = %tail.message_id, err = %e,
                          "failed to delete failure record before retry");
                }
            }
        }

        let agent_message_id = new_message_id();
        self.run_completion(
            &descriptor.thread_id,
            &descriptor.original_user_message,
            &descriptor.user_message_id,
            &agent_message_id,
        )
        .await;
    }

    /// Append an agent-authored message directly, with no network call.
    /// Used for synthetic system notices. Returns `false` when no thread is
    /// active.
    pub async fn send_completion_message(&self, content: &str) -> bool {
        let Some(thread_id) = self.active.get().await else {
            return false;
        };
        let message = Message::text(&thread_id, Role::Agent, content);
        self.state.write().await.messages.push(message.clone());
        self.enqueue_persist(message);
        self.registry.refresh();
        true
    }

    // ─── Actions ────────────────────────────────────────────────────────────

    /// Insert a fresh action message with `running` status, purging every
    /// existing action message for the active thread first (cache + store) so
    /// at most one action exists per thread. Returns the new action's id, or
    /// `None` when no thread is active.
    pub async fn send_action_message(
        &self,
        payload: ActionPayload,
    ) -> Result<Option<String>, ChatError> {
        let Some(thread_id) = self.active.get().await else {
            return Ok(None);
        };

        self.state
            .write()
            .await
            .messages
            .retain(|m| !(m.thread_id == thread_id && m.result_kind == ResultKind::Action));
        let stored = self.storage.list_messages(Some(&thread_id)).await?;
        for stale in stored.iter().filter(|m| m.result_kind == ResultKind::Action) {
            if let Err(e) = self
                .storage
                .delete_message(&thread_id, &stale.message_id)
                .await
            {
                warn!(message_id = %stale.message_id, err = %e, "failed to purge action message");
            }
        }

        let message = Message {
            thread_id: thread_id.clone(),
            message_id: new_message_id(),
            role: Role::Agent,
            kind: "action".to_string(),
            content: payload.content,
            timestamp: Utc::now(),
            result_kind: ResultKind::Action,
            action_state: Some(ActionState::running(payload.current_step, payload.params)),
        };
        let id = message.message_id.clone();
        self.state.write().await.messages.push(message.clone());
        self.storage.create_message(&message).await?;
        if let Err(e) = self
            .storage
            .update_thread(&thread_id, &ThreadPatch::touched(message.timestamp))
            .await
        {
            warn!(thread = %thread_id, err = %e, "failed to bump thread timestamp");
        }
        Ok(Some(id))
    }

    /// Update or remove an action message.
    ///
    /// `None` removes it from the cache immediately, deletes it from the
    /// store, and re-verifies the deletion (retrying once on a stale read);
    /// returns whether a deletion occurred. `Some` persists the new embedded
    /// state and rebuilds the entire volatile cache from the store — the
    /// store is the source of truth on that path.
    pub async fn update_action_message(
        &self,
        action_id: &str,
        update: Option<ActionState>,
    ) -> Result<bool, ChatError> {
        let Some(thread_id) = self.active.get().await else {
            return Ok(false);
        };

        match update {
            None => {
                self.state
                    .write()
                    .await
                    .messages
                    .retain(|m| m.message_id != action_id);
                let mut deleted = self.storage.delete_message(&thread_id, action_id).await?;
                if self
                    .storage
                    .find_message(&thread_id, action_id)
                    .await?
                    .is_some()
                {
                    debug!(message_id = %action_id, "stale read after delete, retrying once");
                    deleted = self.storage.delete_message(&thread_id, action_id).await? || deleted;
                }
                Ok(deleted)
            }
            Some(state) => {
                let patch = MessagePatch {
                    action_state: Some(state),
                    ..Default::default()
                };
                let updated = self
                    .storage
                    .update_message(&thread_id, action_id, &patch)
                    .await?;
                let messages = self.storage.list_messages(Some(&thread_id)).await?;
                self.state.write().await.messages = messages;
                Ok(updated)
            }
        }
    }

    /// Cancel the most recent action message, if any, and append a
    /// cancellation notice. Returns whether an action was removed.
    pub async fn stop_current_action(&self) -> Result<bool, ChatError> {
        let latest = self
            .state
            .read()
            .await
            .messages
            .iter()
            .rev()
            .find(|m| m.result_kind == ResultKind::Action)
            .map(|m| m.message_id.clone());
        let Some(action_id) = latest else {
            return Ok(false);
        };
        let removed = self.update_action_message(&action_id, None).await?;
        self.send_completion_message(CANCELLED_NOTICE).await;
        Ok(removed)
    }

    // ─── Completion round ───────────────────────────────────────────────────

    /// Steps 4–10 of the send flow: build the payload, call the remote
    /// endpoint under the deadline, and record the outcome — unless the
    /// active thread changed while the call was in flight, in which case the
    /// result is discarded. The loading flag is cleared on every path.
    async fn run_completion(
        &self,
        thread_id: &str,
        original_user_message: &str,
        user_message_id: &str,
        agent_message_id: &str,
    ) {
        let request = self
            .build_request(user_message_id, original_user_message)
            .await;

        let deadline = Duration::from_secs(self.config.request_timeout_secs);
        let outcome = match tokio::time::timeout(deadline, self.client.complete(&request)).await {
            Ok(result) => result,
            Err(_) => Err(ChatError::TransportTimeout(deadline.as_secs())),
        };

        // A thread switch mid-flight makes this result stale: leave every
        // cache untouched.
        if !self.active.is_current(thread_id).await {
            debug!(thread = %thread_id, "discarding completion result for deselected thread");
            self.set_loading(false).await;
            return;
        }

        match outcome {
            Ok(resp) if resp.code == CODE_OK => {
                let mut reply = Message::text(thread_id, Role::Agent, resp.data);
                reply.message_id = agent_message_id.to_string();
                reply.result_kind = ResultKind::parse(&resp.result_kind).unwrap_or(ResultKind::Text);
                self.state.write().await.messages.push(reply.clone());
                self.enqueue_persist(reply);
                self.registry.refresh();
            }
            Ok(resp) => {
                self.append_failure(
                    thread_id,
                    ResultKind::Error,
                    original_user_message,
                    user_message_id,
                    agent_message_id,
                    Some(format!("completion endpoint returned code {}", resp.code)),
                )
                .await;
            }
            Err(ChatError::TransportTimeout(secs)) => {
                warn!(thread = %thread_id, secs, "completion request timed out");
                self.append_failure(
                    thread_id,
                    ResultKind::Timeout,
                    original_user_message,
                    user_message_id,
                    agent_message_id,
                    None,
                )
                .await;
            }
            Err(e) => {
                warn!(thread = %thread_id, err = %e, "completion request failed");
                self.append_failure(
                    thread_id,
                    ResultKind::Error,
                    original_user_message,
                    user_message_id,
                    agent_message_id,
                    Some(e.to_string()),
                )
                .await;
            }
        }
        self.set_loading(false).await;
    }

    /// Build the outbound payload: the last `history_window` cached messages
    /// followed by the user turn. See [`build_turns`] for the filtering.
    async fn build_request(
        &self,
        user_message_id: &str,
        original_user_message: &str,
    ) -> CompletionRequest {
        let cached = self.state.read().await.messages.clone();
        let history: Vec<Message> = cached
            .into_iter()
            .filter(|m| m.message_id != user_message_id)
            .collect();

        let mut turns = build_turns(&history, self.config.history_window);
        turns.push(CompletionTurn {
            role: Role::User.wire_str().to_string(),
            content: original_user_message.to_string(),
            message_id: user_message_id.to_string(),
            result_kind: ResultKind::Text.as_str().to_string(),
            timestamp: Utc::now(),
        });
        CompletionRequest {
            messages: turns,
            language: self.config.language.clone(),
        }
    }

    /// Append a terminal `timeout` / `error` record carrying a retry
    /// descriptor, and enqueue its durable write.
    async fn append_failure(
        &self,
        thread_id: &str,
        kind: ResultKind,
        original_user_message: &str,
        user_message_id: &str,
        agent_message_id: &str,
        error: Option<String>,
    ) {
        let descriptor = RetryDescriptor {
            original_user_message: original_user_message.to_string(),
            thread_id: thread_id.to_string(),
            user_message_id: user_message_id.to_string(),
            agent_message_id: agent_message_id.to_string(),
            timestamp: Utc::now(),
            locale: self.config.language.clone(),
            error,
        };
        let content = serde_json::to_string(&descriptor)
            .unwrap_or_else(|_| descriptor.original_user_message.clone());
        let mut message = Message::text(thread_id, Role::Agent, content);
        message.result_kind = kind;
        self.state.write().await.messages.push(message.clone());
        self.enqueue_persist(message);
    }

    // ─── Persistence ────────────────────────────────────────────────────────

    /// Enqueue the durable write for an optimistically cached message.
    /// Failures are logged at WARN and never surfaced — the volatile cache
    /// remains the operative state.
    fn enqueue_persist(&self, message: Message) {
        let storage = Arc::clone(&self.storage);
        tokio::spawn(async move {
            if let Err(e) = persist_message(&storage, &message).await {
                warn!(message_id = %message.message_id, err = %e, "message persistence failed");
            }
        });
    }

    async fn set_loading(&self, loading: bool) {
        self.state.write().await.loading = loading;
    }
}

async fn persist_message(storage: &Storage, message: &Message) -> anyhow::Result<()> {
    storage.create_message(message).await?;
    storage
        .update_thread(&message.thread_id, &ThreadPatch::touched(message.timestamp))
        .await?;
    Ok(())
}

/// Convert the tail of the cached history into wire turns.
///
/// Two payload rules apply:
/// - an action message that never reached a terminal state is dropped when a
///   `timeout` / `error` record in the window references it — failed
///   in-flight actions are not replayed as conversation context;
/// - every remaining non-text message has its content replaced by the opaque
///   placeholder.
fn build_turns(history: &[Message], window: usize) -> Vec<CompletionTurn> {
    let start = history.len().saturating_sub(window);
    let history = &history[start..];

    let mut failed_refs: HashSet<String> = HashSet::new();
    for message in history.iter().filter(|m| m.result_kind.is_failure()) {
        if let Ok(descriptor) = serde_json::from_str::<RetryDescriptor>(&message.content) {
            failed_refs.insert(descriptor.agent_message_id);
            failed_refs.insert(descriptor.user_message_id);
        }
    }

    history
        .iter()
        .filter(|m| {
            if m.result_kind != ResultKind::Action {
                return true;
            }
            let terminal = m
                .action_state
                .as_ref()
                .map(|s| s.status.is_terminal())
                .unwrap_or(false);
            terminal || !failed_refs.contains(m.message_id.as_str())
        })
        .map(|m| {
            let content = if m.result_kind == ResultKind::Text {
                m.content.clone()
            } else {
                OPAQUE_CONTENT_PLACEHOLDER.to_string()
            };
            CompletionTurn {
                role: m.role.wire_str().to_string(),
                content,
                message_id: m.message_id.clone(),
                result_kind: m.result_kind.as_str().to_string(),
                timestamp: m.timestamp,
            }
        })
        .collect()
}

// ─── Tests ────────────────────────────────────────────────────────────────────
