use super::*;

async fn setup() -> (Storage, UserId, UserId, ChatId) {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let alice = storage.create_user("alice").await.expect("user");
    let bob = storage.create_user("bob").await.expect("user");
    let chat = storage.create_chat("pair", alice).await.expect("chat");
    storage.add_chat_member(chat, bob).await.expect("member");
    (storage, alice, bob, chat)
}

#[tokio::test]
async fn health_check_succeeds_for_live_pool() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage.health_check().await.expect("health check");
}

#[tokio::test]
async fn creates_database_file_when_missing() {
    let temp_root = tempfile::tempdir().expect("temp dir");
    let db_path = temp_root.path().join("nested").join("chat.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    let storage = Storage::new(&database_url).await.expect("db");
    drop(storage);

    assert!(db_path.exists(), "database file should exist: {}", db_path.display());
}

#[tokio::test]
async fn appends_assign_gapless_sequence_numbers() {
    let (storage, alice, _, chat) = setup().await;
    for expected in 1..=5_i64 {
        let (message, deduplicated) = storage
            .append_message(chat, alice, "hello", MessageKind::Text, None, None)
            .await
            .expect("append");
        assert!(!deduplicated);
        assert_eq!(message.sequence_number, expected);
    }
    assert_eq!(storage.message_count(chat).await.expect("count"), 5);
}

#[tokio::test]
async fn concurrent_appends_never_duplicate_or_skip_sequences() {
    let (storage, alice, _, chat) = setup().await;
    let mut handles = Vec::new();
    for i in 0..16 {
        let storage = storage.clone();
        handles.push(tokio::spawn(async move {
            let content = format!("msg-{i}");
            storage
                .append_message(chat, alice, &content, MessageKind::Text, None, None)
                .await
                .expect("append")
                .0
                .sequence_number
        }));
    }
    let mut sequences = Vec::new();
    for handle in handles {
        sequences.push(handle.await.expect("task"));
    }
    sequences.sort_unstable();
    assert_eq!(sequences, (1..=16).collect::<Vec<i64>>());
}

#[tokio::test]
async fn independent_chats_allocate_independent_sequences() {
    let (storage, alice, bob, chat_a) = setup().await;
    let chat_b = storage.create_chat("other", alice).await.expect("chat");
    storage.add_chat_member(chat_b, bob).await.expect("member");

    let (first_a, _) = storage
        .append_message(chat_a, alice, "a1", MessageKind::Text, None, None)
        .await
        .expect("append");
    let (first_b, _) = storage
        .append_message(chat_b, alice, "b1", MessageKind::Text, None, None)
        .await
        .expect("append");
    assert_eq!(first_a.sequence_number, 1);
    assert_eq!(first_b.sequence_number, 1);
}

#[tokio::test]
async fn resubmission_with_same_token_returns_stored_message() {
    let (storage, alice, _, chat) = setup().await;
    let (original, deduplicated) = storage
        .append_message(chat, alice, "hi", MessageKind::Text, None, Some("c1"))
        .await
        .expect("append");
    assert!(!deduplicated);
    assert_eq!(original.sequence_number, 1);

    let (replay, deduplicated) = storage
        .append_message(chat, alice, "hi", MessageKind::Text, None, Some("c1"))
        .await
        .expect("replay");
    assert!(deduplicated);
    assert_eq!(replay.message_id, original.message_id);
    assert_eq!(replay.sequence_number, 1);

    // The rollback on the dedup path must leave no gap behind.
    let (next, _) = storage
        .append_message(chat, alice, "next", MessageKind::Text, None, Some("c2"))
        .await
        .expect("append");
    assert_eq!(next.sequence_number, 2);
    assert_eq!(storage.message_count(chat).await.expect("count"), 2);
}

#[tokio::test]
async fn append_rejects_unknown_chat_and_non_member() {
    let (storage, _, _, _) = setup().await;
    let outsider = storage.create_user("mallory").await.expect("user");
    let chat = storage.create_chat("private", outsider).await.expect("chat");

    let missing = storage
        .append_message(ChatId(9999), outsider, "x", MessageKind::Text, None, None)
        .await;
    assert!(missing.is_err());

    let stranger = storage.create_user("trent").await.expect("user");
    let rejected = storage
        .append_message(chat, stranger, "x", MessageKind::Text, None, None)
        .await;
    assert!(rejected.is_err());
    assert_eq!(storage.message_count(chat).await.expect("count"), 0);
}

#[tokio::test]
async fn paginates_chat_messages_by_id_cursor() {
    let (storage, alice, _, chat) = setup().await;
    let mut ids = Vec::new();
    for i in 0..3 {
        let content = format!("m{i}");
        let (message, _) = storage
            .append_message(chat, alice, &content, MessageKind::Text, None, None)
            .await
            .expect("append");
        ids.push(message.message_id);
    }

    let newest_two = storage.list_chat_messages(chat, 2, None).await.expect("page");
    assert_eq!(newest_two.len(), 2);
    assert_eq!(newest_two[0].message_id, ids[1]);
    assert_eq!(newest_two[1].message_id, ids[2]);

    let older = storage
        .list_chat_messages(chat, 2, Some(ids[1].0))
        .await
        .expect("page");
    assert_eq!(older.len(), 1);
    assert_eq!(older[0].message_id, ids[0]);
}

#[tokio::test]
async fn mark_read_records_at_most_once() {
    let (storage, alice, bob, chat) = setup().await;
    let (message, _) = storage
        .append_message(chat, alice, "hi", MessageKind::Text, None, None)
        .await
        .expect("append");

    assert!(storage.mark_read(message.message_id, bob).await.expect("read"));
    let first_read_at = storage
        .read_at(message.message_id, bob)
        .await
        .expect("lookup")
        .expect("recorded");

    assert!(!storage.mark_read(message.message_id, bob).await.expect("redundant read"));
    let second_read_at = storage
        .read_at(message.message_id, bob)
        .await
        .expect("lookup")
        .expect("recorded");
    assert_eq!(first_read_at, second_read_at);
}

#[tokio::test]
async fn mark_chat_read_skips_own_messages_and_is_idempotent() {
    let (storage, alice, bob, chat) = setup().await;
    storage
        .append_message(chat, alice, "one", MessageKind::Text, None, None)
        .await
        .expect("append");
    storage
        .append_message(chat, alice, "two", MessageKind::Text, None, None)
        .await
        .expect("append");
    storage
        .append_message(chat, bob, "mine", MessageKind::Text, None, None)
        .await
        .expect("append");

    let newly_read = storage.mark_chat_read(chat, bob).await.expect("bulk read");
    assert_eq!(newly_read.len(), 2);
    assert!(newly_read.iter().all(|r| r.sender_id == alice));
    assert_eq!(storage.unread_count(chat, bob).await.expect("unread"), 0);

    let repeat = storage.mark_chat_read(chat, bob).await.expect("bulk read");
    assert!(repeat.is_empty());
}

#[tokio::test]
async fn bulk_read_serializes_against_concurrent_appends() {
    let temp_root = tempfile::tempdir().expect("temp dir");
    let database_url = format!("sqlite://{}", temp_root.path().join("chat.db").display());
    let storage = Storage::new(&database_url).await.expect("db");
    let alice = storage.create_user("alice").await.expect("user");
    let bob = storage.create_user("bob").await.expect("user");
    let chat = storage.create_chat("pair", alice).await.expect("chat");
    storage.add_chat_member(chat, bob).await.expect("member");

    let writer = {
        let storage = storage.clone();
        tokio::spawn(async move {
            for i in 0..200 {
                let content = format!("m{i}");
                storage
                    .append_message(chat, alice, &content, MessageKind::Text, None, None)
                    .await
                    .expect("append");
            }
        })
    };

    let mut total = 0usize;
    while !writer.is_finished() {
        total += storage
            .mark_chat_read(chat, bob)
            .await
            .expect("bulk read under contention")
            .len();
    }
    writer.await.expect("writer task");
    total += storage.mark_chat_read(chat, bob).await.expect("final bulk read").len();

    assert_eq!(total, 200);
    assert_eq!(storage.unread_count(chat, bob).await.expect("unread"), 0);
}

#[tokio::test]
async fn unread_count_tracks_other_senders_only() {
    let (storage, alice, bob, chat) = setup().await;
    storage
        .append_message(chat, alice, "to bob", MessageKind::Text, None, None)
        .await
        .expect("append");
    storage
        .append_message(chat, bob, "from bob", MessageKind::Text, None, None)
        .await
        .expect("append");

    assert_eq!(storage.unread_count(chat, bob).await.expect("unread"), 1);
    assert_eq!(storage.unread_count(chat, alice).await.expect("unread"), 1);
}

#[tokio::test]
async fn stores_file_reference_and_kind() {
    let (storage, alice, _, chat) = setup().await;
    let (message, _) = storage
        .append_message(
            chat,
            alice,
            "photo",
            MessageKind::Image,
            Some("/files/42"),
            None,
        )
        .await
        .expect("append");

    let fetched = storage
        .find_message(message.message_id)
        .await
        .expect("lookup")
        .expect("present");
    assert_eq!(fetched.kind, MessageKind::Image);
    assert_eq!(fetched.file_url.as_deref(), Some("/files/42"));
}
