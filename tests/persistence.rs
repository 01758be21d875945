//! Integration tests for the persistent store: round-trips, idempotent
//! inserts, ordering, counts, startup recovery, and pruning.
//! These use Storage directly (no orchestrator) — they run in CI.

use chrono::{Duration, Utc};
use parley::model::{
    new_message_id, ActionState, ActionStatus, Message, ResultKind, Role, Thread,
};
use parley::storage::{MessagePatch, Storage, ThreadPatch};
use tempfile::TempDir;

/// Helper: create a fresh Storage in a temp dir
async fn make_storage(dir: &TempDir) -> Storage {
    Storage::new(dir.path()).await.expect("storage init failed")
}

fn thread_at(title: &str, minutes_ago: i64) -> Thread {
    let at = Utc::now() - Duration::minutes(minutes_ago);
    Thread {
        id: parley::model::new_thread_id(),
        title: title.to_string(),
        kind: "chat".to_string(),
        created_at: at,
        updated_at: at,
    }
}

fn message_at(thread_id: &str, content: &str, minutes_ago: i64) -> Message {
    let mut m = Message::text(thread_id, Role::User, content);
    m.timestamp = Utc::now() - Duration::minutes(minutes_ago);
    m
}

#[tokio::test]
async fn message_round_trips_unchanged() {
    let dir = TempDir::new().unwrap();
    let storage = make_storage(&dir).await;

    let thread = Thread::new("round trip", "chat");
    storage.create_thread(&thread).await.unwrap();

    let mut message = Message::text(&thread.id, Role::Agent, "swap queued");
    message.kind = "action".to_string();
    message.result_kind = ResultKind::Action;
    message.action_state = Some(ActionState {
        status: ActionStatus::Running,
        current_step: "quote".to_string(),
        params: serde_json::json!({ "amount": 5, "pair": "ETH/USDC" }),
        thinking_messages: vec![parley::model::ThinkingGroup {
            step_id: "quote".to_string(),
            messages: vec!["fetching route".to_string()],
        }],
        error: None,
        start_time: Some(message.timestamp),
        end_time: None,
    });
    storage.create_message(&message).await.unwrap();

    let found = storage
        .find_message(&thread.id, &message.message_id)
        .await
        .unwrap()
        .expect("message should exist");
    assert_eq!(found, message);
}

#[tokio::test]
async fn thread_creation_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let storage = make_storage(&dir).await;

    let thread = Thread::new("first title", "chat");
    storage.create_thread(&thread).await.unwrap();

    // Same id again with a different title — must be a no-op.
    let mut duplicate = thread.clone();
    duplicate.title = "other title".to_string();
    storage.create_thread(&duplicate).await.unwrap();

    assert_eq!(storage.count_threads().await.unwrap(), 1);
    let found = storage.find_thread(&thread.id).await.unwrap().unwrap();
    assert_eq!(found.title, "first title");
}

#[tokio::test]
async fn message_creation_is_idempotent_on_composite_key() {
    let dir = TempDir::new().unwrap();
    let storage = make_storage(&dir).await;

    let message = Message::text("TH-x", Role::User, "original");
    storage.create_message(&message).await.unwrap();

    let mut duplicate = message.clone();
    duplicate.content = "changed".to_string();
    storage.create_message(&duplicate).await.unwrap();

    assert_eq!(storage.count_messages().await.unwrap(), 1);
    let found = storage
        .find_message("TH-x", &message.message_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.content, "original");
}

#[tokio::test]
async fn thread_count_tracks_creations_minus_deletions() {
    let dir = TempDir::new().unwrap();
    let storage = make_storage(&dir).await;

    let mut ids = Vec::new();
    for i in 0..5 {
        let thread = Thread::new(format!("thread {i}"), "chat");
        storage.create_thread(&thread).await.unwrap();
        ids.push(thread.id);
    }
    assert_eq!(storage.count_threads().await.unwrap(), 5);

    assert!(storage.delete_thread(&ids[0]).await.unwrap());
    assert!(storage.delete_thread(&ids[3]).await.unwrap());
    // Deleting a missing id reports false and changes nothing.
    assert!(!storage.delete_thread("TH-missing").await.unwrap());

    assert_eq!(storage.count_threads().await.unwrap(), 3);
}

#[tokio::test]
async fn threads_list_newest_first() {
    let dir = TempDir::new().unwrap();
    let storage = make_storage(&dir).await;

    for (title, age) in [("old", 30), ("middle", 20), ("new", 10)] {
        storage.create_thread(&thread_at(title, age)).await.unwrap();
    }

    let titles: Vec<String> = storage
        .list_threads()
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.title)
        .collect();
    assert_eq!(titles, vec!["new", "middle", "old"]);
}

#[tokio::test]
async fn messages_list_in_timestamp_order() {
    let dir = TempDir::new().unwrap();
    let storage = make_storage(&dir).await;

    // Insert out of chronological order.
    for (content, age) in [("second", 20), ("third", 10), ("first", 30)] {
        storage
            .create_message(&message_at("TH-a", content, age))
            .await
            .unwrap();
    }
    // A message in another thread must not leak into the filtered listing.
    storage
        .create_message(&message_at("TH-b", "elsewhere", 5))
        .await
        .unwrap();

    let contents: Vec<String> = storage
        .list_messages(Some("TH-a"))
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.content)
        .collect();
    assert_eq!(contents, vec!["first", "second", "third"]);

    // The unfiltered listing spans threads.
    assert_eq!(storage.list_messages(None).await.unwrap().len(), 4);
}

#[tokio::test]
async fn thread_patch_updates_only_named_fields() {
    let dir = TempDir::new().unwrap();
    let storage = make_storage(&dir).await;

    let thread = thread_at("patchable", 60);
    storage.create_thread(&thread).await.unwrap();

    let bumped = Utc::now();
    let patch = ThreadPatch {
        title: Some("renamed".to_string()),
        updated_at: Some(bumped),
    };
    assert!(storage.update_thread(&thread.id, &patch).await.unwrap());

    let found = storage.find_thread(&thread.id).await.unwrap().unwrap();
    assert_eq!(found.title, "renamed");
    assert!(found.updated_at > found.created_at);
    assert_eq!(found.created_at, thread.created_at);

    // Missing id is a no-op reporting false.
    assert!(!storage.update_thread("TH-missing", &patch).await.unwrap());
}

#[tokio::test]
async fn message_patch_updates_only_named_fields() {
    let dir = TempDir::new().unwrap();
    let storage = make_storage(&dir).await;

    let message = Message::text("TH-a", Role::Agent, "before");
    storage.create_message(&message).await.unwrap();

    let patch = MessagePatch {
        content: Some("after".to_string()),
        ..Default::default()
    };
    assert!(storage
        .update_message("TH-a", &message.message_id, &patch)
        .await
        .unwrap());

    let found = storage
        .find_message("TH-a", &message.message_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.content, "after");
    assert_eq!(found.result_kind, ResultKind::Text);

    assert!(!storage
        .update_message("TH-a", &new_message_id(), &patch)
        .await
        .unwrap());
}

#[tokio::test]
async fn bulk_delete_removes_only_the_given_thread() {
    let dir = TempDir::new().unwrap();
    let storage = make_storage(&dir).await;

    for i in 0..3 {
        storage
            .create_message(&message_at("TH-a", &format!("a{i}"), 10 - i))
            .await
            .unwrap();
    }
    storage
        .create_message(&message_at("TH-b", "keep me", 5))
        .await
        .unwrap();

    assert_eq!(storage.delete_messages("TH-a").await.unwrap(), 3);
    assert_eq!(storage.count_messages().await.unwrap(), 1);
    assert_eq!(storage.delete_messages("TH-a").await.unwrap(), 0);
}

#[tokio::test]
async fn stale_running_actions_fail_on_restart() {
    let dir = TempDir::new().unwrap();

    // 1. Create storage with one running and one completed action.
    let storage = make_storage(&dir).await;
    let mut running = Message::text("TH-a", Role::Agent, "in flight");
    running.result_kind = ResultKind::Action;
    running.action_state = Some(ActionState::running("quote", serde_json::json!({})));
    storage.create_message(&running).await.unwrap();

    let mut done = Message::text("TH-a", Role::Agent, "finished");
    done.result_kind = ResultKind::Action;
    let mut done_state = ActionState::running("settle", serde_json::json!({}));
    done_state.status = ActionStatus::Completed;
    done.action_state = Some(done_state);
    storage.create_message(&done).await.unwrap();

    // 2. Simulate a restart: a new Storage instance over the same dir.
    let storage2 = make_storage(&dir).await;
    let recovered = storage2.recover_stale_actions().await.unwrap();
    assert_eq!(recovered, 1, "only the running action should be recovered");

    // 3. The running action is now failed with an error note and an end time.
    let state = storage2
        .find_message("TH-a", &running.message_id)
        .await
        .unwrap()
        .unwrap()
        .action_state
        .unwrap();
    assert_eq!(state.status, ActionStatus::Failed);
    assert!(state.error.is_some());
    assert!(state.end_time.is_some());

    // 4. The completed action is untouched.
    let state = storage2
        .find_message("TH-a", &done.message_id)
        .await
        .unwrap()
        .unwrap()
        .action_state
        .unwrap();
    assert_eq!(state.status, ActionStatus::Completed);
}

#[tokio::test]
async fn pruning_removes_idle_threads_and_their_messages() {
    let dir = TempDir::new().unwrap();
    let storage = make_storage(&dir).await;

    let stale = thread_at("stale", 60 * 24 * 30); // 30 days old
    let fresh = thread_at("fresh", 10);
    storage.create_thread(&stale).await.unwrap();
    storage.create_thread(&fresh).await.unwrap();
    storage
        .create_message(&message_at(&stale.id, "forgotten", 60 * 24 * 30))
        .await
        .unwrap();
    storage
        .create_message(&message_at(&fresh.id, "recent", 10))
        .await
        .unwrap();

    // 0 days = pruning disabled.
    assert_eq!(storage.prune_threads(0).await.unwrap(), 0);
    assert_eq!(storage.count_threads().await.unwrap(), 2);

    assert_eq!(storage.prune_threads(7).await.unwrap(), 1);
    assert_eq!(storage.count_threads().await.unwrap(), 1);
    assert!(storage.find_thread(&fresh.id).await.unwrap().is_some());
    // No orphaned messages survive the cascade.
    let remaining = storage.list_messages(None).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].thread_id, fresh.id);
}
