//! Persistence integration tests.
//!
//! Verifies:
//! - History survives room hibernation and server restart
//! - Additive schema migration on a legacy database
//! - Ephemeral traffic never reaches the store
//! - Corrupt quote columns degrade without losing the message
//! - Replay order is (timestamp, id) regardless of arrival order

use parlor::client::{ChatClient, ChatEvent};
use parlor::protocol::{ChatMessage, Envelope, Role};
use parlor::server::{ChatServer, ServerConfig};
use parlor::storage::MessageStore;
use parlor::RoomManager;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::tempdir;
use tokio::time::{timeout, Duration};

// ─── Helpers ─────────────────────────────────────────────────────────────────

async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a persistent server over `dir`. Returns the port, the room
/// manager, and the accept-loop task (abort it to simulate a crash).
async fn start_server(dir: &Path) -> (u16, Arc<RoomManager>, tokio::task::JoinHandle<()>) {
    let port = free_port().await;
    let server = ChatServer::new(ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        storage_dir: Some(dir.to_path_buf()),
    });
    let rooms = server.rooms().clone();
    let task = tokio::spawn(async move {
        server.run().await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    (port, rooms, task)
}

async fn join(
    user: &str,
    room: &str,
    port: u16,
) -> (ChatClient, tokio::sync::mpsc::Receiver<ChatEvent>) {
    let mut client = ChatClient::new(user, room, format!("ws://127.0.0.1:{port}"));
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    match timeout(Duration::from_secs(2), events.recv()).await.unwrap() {
        Some(ChatEvent::Connected) => {}
        other => panic!("Expected Connected event, got {other:?}"),
    }
    (client, events)
}

async fn next_event(events: &mut tokio::sync::mpsc::Receiver<ChatEvent>) -> ChatEvent {
    timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event stream ended")
}

/// Disconnect and wait until the room has hibernated.
async fn leave_and_hibernate(mut client: ChatClient, rooms: &Arc<RoomManager>) {
    client.disconnect().await;
    for _ in 0..100 {
        if rooms.room_count().await == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("room never hibernated");
}

fn room_db(dir: &Path, room: &str) -> PathBuf {
    dir.join(format!("{room}.db"))
}

// ─── Hibernation & restart ───────────────────────────────────────────────────

#[tokio::test]
async fn test_history_survives_hibernation() {
    let dir = tempdir().unwrap();
    let (port, rooms, _task) = start_server(dir.path()).await;

    let (alice, mut alice_events) = join("alice", "general", port).await;
    let m1 = alice.send_message("first").await.unwrap();
    let m2 = alice.send_message("second").await.unwrap();
    let _ = next_event(&mut alice_events).await;
    let _ = next_event(&mut alice_events).await;

    leave_and_hibernate(alice, &rooms).await;

    // The next join wakes a fresh room instance that reloads from SQLite.
    let (_bob, mut bob_events) = join("bob", "general", port).await;
    match next_event(&mut bob_events).await {
        ChatEvent::History(messages) => {
            assert_eq!(messages.len(), 2);
            assert_eq!(messages[0].id, m1.id);
            assert_eq!(messages[1].id, m2.id);
        }
        other => panic!("Expected History, got {other:?}"),
    }
}

#[tokio::test]
async fn test_history_survives_server_restart() {
    let dir = tempdir().unwrap();

    let (port, rooms, task) = start_server(dir.path()).await;
    let (alice, mut alice_events) = join("alice", "durable", port).await;
    alice.send_message("outlive the process").await.unwrap();
    let _ = next_event(&mut alice_events).await;
    leave_and_hibernate(alice, &rooms).await;

    // Kill the listener, bring up a new server over the same directory.
    task.abort();
    let (port2, _rooms2, _task2) = start_server(dir.path()).await;

    let (_bob, mut bob_events) = join("bob", "durable", port2).await;
    match next_event(&mut bob_events).await {
        ChatEvent::History(messages) => {
            assert_eq!(messages.len(), 1);
            assert_eq!(messages[0].content, "outlive the process");
        }
        other => panic!("Expected History, got {other:?}"),
    }
}

#[tokio::test]
async fn test_edit_survives_hibernation() {
    let dir = tempdir().unwrap();
    let (port, rooms, _task) = start_server(dir.path()).await;

    let (alice, mut alice_events) = join("alice", "edits", port).await;
    let mut msg = alice.send_message("draft").await.unwrap();
    let _ = next_event(&mut alice_events).await;

    msg.content = "final".to_string();
    alice.edit_message(msg.clone()).await.unwrap();
    let _ = next_event(&mut alice_events).await;

    leave_and_hibernate(alice, &rooms).await;

    let (_bob, mut bob_events) = join("bob", "edits", port).await;
    match next_event(&mut bob_events).await {
        ChatEvent::History(messages) => {
            assert_eq!(messages.len(), 1, "edit must overwrite, not duplicate");
            assert_eq!(messages[0].content, "final");
        }
        other => panic!("Expected History, got {other:?}"),
    }
}

#[tokio::test]
async fn test_quote_chain_survives_hibernation() {
    let dir = tempdir().unwrap();
    let (port, rooms, _task) = start_server(dir.path()).await;

    let (alice, mut alice_events) = join("alice", "quotes", port).await;
    let root = alice.send_message("root").await.unwrap();
    let _ = next_event(&mut alice_events).await;
    let reply = alice.send_reply("level one", &root).await.unwrap();
    let _ = next_event(&mut alice_events).await;
    alice.send_reply("level two", &reply).await.unwrap();
    let _ = next_event(&mut alice_events).await;

    leave_and_hibernate(alice, &rooms).await;

    let (_bob, mut bob_events) = join("bob", "quotes", port).await;
    match next_event(&mut bob_events).await {
        ChatEvent::History(messages) => {
            assert_eq!(messages.len(), 3);
            let deepest = messages.iter().find(|m| m.content == "level two").unwrap();
            assert_eq!(deepest.quote_depth(), 2);
            let quoted = deepest.reply_to.as_ref().unwrap();
            assert_eq!(quoted.content, "level one");
            assert_eq!(quoted.reply_to.as_ref().unwrap().id, root.id);
        }
        other => panic!("Expected History, got {other:?}"),
    }
}

// ─── Ephemeral traffic ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_ephemeral_traffic_never_persisted() {
    let dir = tempdir().unwrap();
    let (port, rooms, _task) = start_server(dir.path()).await;

    let (alice, mut alice_events) = join("alice", "busy", port).await;
    alice.send_message("the only durable one").await.unwrap();
    let _ = next_event(&mut alice_events).await;

    for i in 0..10 {
        alice.send_typing(i % 2 == 0).await.unwrap();
    }
    alice.send_read(999).await.unwrap();
    for _ in 0..11 {
        let _ = next_event(&mut alice_events).await;
    }

    leave_and_hibernate(alice, &rooms).await;

    let store = MessageStore::open(room_db(dir.path(), "busy")).unwrap();
    assert_eq!(store.message_count().unwrap(), 1);
}

// ─── Schema tolerance ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_legacy_database_is_migrated_and_served() {
    let dir = tempdir().unwrap();

    // A database written by a deployment that predates quotes and
    // timestamps.
    {
        let conn = rusqlite::Connection::open(room_db(dir.path(), "legacy")).unwrap();
        conn.execute(
            "CREATE TABLE messages (id TEXT PRIMARY KEY, user TEXT, role TEXT, content TEXT)",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO messages (id, user, role, content) VALUES ('old-1', 'bob', 'user', 'from the before times')",
            [],
        )
        .unwrap();
    }

    let (port, _rooms, _task) = start_server(dir.path()).await;
    let (_alice, mut alice_events) = join("alice", "legacy", port).await;

    match next_event(&mut alice_events).await {
        ChatEvent::History(messages) => {
            assert_eq!(messages.len(), 1);
            assert_eq!(messages[0].content, "from the before times");
            assert!(messages[0].reply_to.is_none());
            assert!(messages[0].timestamp > 0, "legacy rows get stamped at load");
        }
        other => panic!("Expected History, got {other:?}"),
    }

    let store = MessageStore::open(room_db(dir.path(), "legacy")).unwrap();
    let columns = store.columns().unwrap();
    assert!(columns.iter().any(|c| c == "replyTo"));
    assert!(columns.iter().any(|c| c == "timestamp"));
}

#[tokio::test]
async fn test_corrupt_quote_does_not_block_history() {
    let dir = tempdir().unwrap();

    {
        // Full schema, then a row whose quote column is garbage.
        let store = MessageStore::open(room_db(dir.path(), "scarred")).unwrap();
        store
            .persist(&ChatMessage {
                id: "fine".to_string(),
                content: "healthy row".to_string(),
                user: "alice".to_string(),
                role: Role::User,
                reply_to: None,
                timestamp: 100,
            })
            .unwrap();
        let conn = rusqlite::Connection::open(room_db(dir.path(), "scarred")).unwrap();
        conn.execute(
            "INSERT INTO messages (id, user, role, content, replyTo, timestamp)
             VALUES ('scarred', 'bob', 'user', 'kept anyway', '{broken json', 200)",
            [],
        )
        .unwrap();
    }

    let (port, _rooms, _task) = start_server(dir.path()).await;
    let (_alice, mut alice_events) = join("alice", "scarred", port).await;

    match next_event(&mut alice_events).await {
        ChatEvent::History(messages) => {
            assert_eq!(messages.len(), 2);
            let scarred = messages.iter().find(|m| m.id == "scarred").unwrap();
            assert_eq!(scarred.content, "kept anyway");
            assert!(scarred.reply_to.is_none(), "bad quote dropped, message kept");
        }
        other => panic!("Expected History, got {other:?}"),
    }
}

// ─── Replay ordering ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_replay_order_follows_timestamps_not_arrival() {
    let dir = tempdir().unwrap();
    let (port, rooms, _task) = start_server(dir.path()).await;

    let (alice, mut alice_events) = join("alice", "ordered", port).await;

    // Arrival order c(300), a(100), b(200) — skewed client clocks.
    for (id, ts) in [("c", 300_i64), ("a", 100), ("b", 200)] {
        let msg = ChatMessage {
            id: id.to_string(),
            content: format!("message {id}"),
            user: "alice".to_string(),
            role: Role::User,
            reply_to: None,
            timestamp: ts,
        };
        alice.send_envelope(&Envelope::add(msg)).await.unwrap();
        let _ = next_event(&mut alice_events).await;
    }

    leave_and_hibernate(alice, &rooms).await;

    let (_bob, mut bob_events) = join("bob", "ordered", port).await;
    match next_event(&mut bob_events).await {
        ChatEvent::History(messages) => {
            let ids: Vec<&str> = messages.iter().map(|m| m.id.as_str()).collect();
            assert_eq!(ids, vec!["a", "b", "c"]);
        }
        other => panic!("Expected History, got {other:?}"),
    }
}
