//! Thread and message data models for conversation persistence.
//!
//! These types are stored in SQLite and serialized over the completion wire.
//! Thread IDs use the `TH-{uuid8}` format; message IDs are UUID v4.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Titles derived from a first user message are truncated to this many
/// characters.
const TITLE_MAX_CHARS: usize = 20;

// ─── Enums ────────────────────────────────────────────────────────────────────

/// Author of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Agent,
}

impl Role {
    /// Return the canonical SQL string stored in `messages.role`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Agent => "agent",
        }
    }

    /// Role name used on the completion wire (`"user"` / `"assistant"`).
    pub fn wire_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Agent => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "agent" => Some(Role::Agent),
            _ => None,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a message's content represents.
///
/// `Timeout` and `Error` are terminal records appended when the remote call
/// fails; their content is a serialized [`RetryDescriptor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultKind {
    Text,
    Action,
    Timeout,
    Error,
}

impl ResultKind {
    /// Return the canonical SQL string stored in `messages.result_kind`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultKind::Text => "text",
            ResultKind::Action => "action",
            ResultKind::Timeout => "timeout",
            ResultKind::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(ResultKind::Text),
            "action" => Some(ResultKind::Action),
            "timeout" => Some(ResultKind::Timeout),
            "error" => Some(ResultKind::Error),
            _ => None,
        }
    }

    /// Terminal failure records left at the tail of a thread by a failed
    /// remote call. Both carry a retry descriptor.
    pub fn is_failure(&self) -> bool {
        matches!(self, ResultKind::Timeout | ResultKind::Error)
    }
}

impl std::fmt::Display for ResultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a long-running action message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    Idle,
    Running,
    Completed,
    Failed,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Idle => "idle",
            ActionStatus::Running => "running",
            ActionStatus::Completed => "completed",
            ActionStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(ActionStatus::Idle),
            "running" => Some(ActionStatus::Running),
            "completed" => Some(ActionStatus::Completed),
            "failed" => Some(ActionStatus::Failed),
            _ => None,
        }
    }

    /// Completed and Failed actions never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ActionStatus::Completed | ActionStatus::Failed)
    }
}

impl std::fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Models ───────────────────────────────────────────────────────────────────

/// A conversation session grouping an ordered sequence of messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thread {
    pub id: String,
    pub title: String,
    /// Free-form category tag (e.g. `"chat"`); opaque to this crate.
    pub kind: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Thread {
    /// Build a new thread with `created_at == updated_at == now`.
    pub fn new(title: impl Into<String>, kind: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: new_thread_id(),
            title: title.into(),
            kind: kind.into(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// One message within a thread, keyed by `(thread_id, message_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub thread_id: String,
    pub message_id: String,
    pub role: Role,
    /// Free-form message category (e.g. `"chat"`); opaque to this crate.
    pub kind: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub result_kind: ResultKind,
    /// Present only when `result_kind == ResultKind::Action`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_state: Option<ActionState>,
}

impl Message {
    /// Build a plain text message authored now.
    pub fn text(thread_id: impl Into<String>, role: Role, content: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            message_id: new_message_id(),
            role,
            kind: "chat".to_string(),
            content: content.into(),
            timestamp: Utc::now(),
            result_kind: ResultKind::Text,
            action_state: None,
        }
    }
}

/// Thinking output grouped by workflow step, in emission order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThinkingGroup {
    pub step_id: String,
    pub messages: Vec<String>,
}

/// Embedded sub-state of an action message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionState {
    pub status: ActionStatus,
    pub current_step: String,
    /// Opaque parameters forwarded to whatever executes the action.
    pub params: serde_json::Value,
    pub thinking_messages: Vec<ThinkingGroup>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

impl ActionState {
    /// A freshly started action.
    pub fn running(current_step: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            status: ActionStatus::Running,
            current_step: current_step.into(),
            params,
            thinking_messages: Vec::new(),
            error: None,
            start_time: Some(Utc::now()),
            end_time: None,
        }
    }
}

/// Input to `Orchestrator::send_action_message`.
#[derive(Debug, Clone)]
pub struct ActionPayload {
    /// Display content of the action message.
    pub content: String,
    /// Identifier of the step the action starts on.
    pub current_step: String,
    /// Opaque parameters stored in the embedded [`ActionState`].
    pub params: serde_json::Value,
}

/// Everything needed to re-issue a failed remote call.
///
/// Serialized as the content of `timeout` / `error` messages so a reload
/// does not lose the retry path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryDescriptor {
    pub original_user_message: String,
    pub thread_id: String,
    pub user_message_id: String,
    /// Id the agent reply would have carried; a retry generates a fresh one.
    pub agent_message_id: String,
    pub timestamp: DateTime<Utc>,
    pub locale: String,
    /// Underlying error text; `None` for plain deadline timeouts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ─── Id and title helpers ─────────────────────────────────────────────────────

/// Construct a thread ID in the canonical `TH-{uuid8}` format.
pub fn new_thread_id() -> String {
    let u = uuid::Uuid::new_v4().to_string();
    let short = u.split('-').next().unwrap_or(&u[..8]);
    format!("TH-{}", short)
}

/// Construct a message ID (UUID v4).
pub fn new_message_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Derive a thread title from the first user message: the content truncated
/// to 20 characters, with an ellipsis when anything was cut.
pub fn derive_title(content: &str) -> String {
    let mut title: String = content.chars().take(TITLE_MAX_CHARS).collect();
    if content.chars().count() > TITLE_MAX_CHARS {
        title.push('…');
    }
    title
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enum_sql_strings_round_trip() {
        for kind in [
            ResultKind::Text,
            ResultKind::Action,
            ResultKind::Timeout,
            ResultKind::Error,
        ] {
            assert_eq!(ResultKind::parse(kind.as_str()), Some(kind));
        }
        for status in [
            ActionStatus::Idle,
            ActionStatus::Running,
            ActionStatus::Completed,
            ActionStatus::Failed,
        ] {
            assert_eq!(ActionStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(Role::parse("agent"), Some(Role::Agent));
        assert_eq!(Role::parse("assistant"), None);
    }

    #[test]
    fn agent_role_maps_to_assistant_on_the_wire() {
        assert_eq!(Role::Agent.wire_str(), "assistant");
        assert_eq!(Role::User.wire_str(), "user");
    }

    #[test]
    fn thread_id_has_canonical_format() {
        let id = new_thread_id();
        assert!(id.starts_with("TH-"));
        assert_eq!(id.len(), 11);
    }

    #[test]
    fn short_titles_are_kept_verbatim() {
        assert_eq!(derive_title("hello"), "hello");
    }

    #[test]
    fn long_titles_are_truncated_with_ellipsis() {
        let title = derive_title("what is the weather like in Lisbon today?");
        assert_eq!(title.chars().count(), TITLE_MAX_CHARS + 1);
        assert!(title.ends_with('…'));
    }

    #[test]
    fn truncation_respects_multibyte_boundaries() {
        let content = "日本語のとても長いメッセージをタイトルにする場合の確認";
        let title = derive_title(content);
        assert!(title.ends_with('…'));
        assert_eq!(title.chars().count(), TITLE_MAX_CHARS + 1);
    }

    #[test]
    fn retry_descriptor_serialises_to_camel_case() {
        let d = RetryDescriptor {
            original_user_message: "hi".into(),
            thread_id: "TH-1".into(),
            user_message_id: "u1".into(),
            agent_message_id: "a1".into(),
            timestamp: Utc::now(),
            locale: "en".into(),
            error: None,
        };
        let json = serde_json::to_string(&d).unwrap();
        assert!(json.contains("\"originalUserMessage\""));
        assert!(json.contains("\"agentMessageId\""));
        assert!(!json.contains("\"error\""));
    }

    #[test]
    fn action_state_omits_empty_optionals() {
        let state = ActionState {
            status: ActionStatus::Idle,
            current_step: String::new(),
            params: serde_json::json!({}),
            thinking_messages: vec![],
            error: None,
            start_time: None,
            end_time: None,
        };
        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("\"status\":\"idle\""));
        assert!(!json.contains("start_time"));
    }
}
