use super::*;

fn new_message(sender: UserId, room: RoomId, content: &str) -> NewMessage {
    NewMessage {
        sender_id: sender,
        room,
        content: content.to_string(),
        is_file: false,
        status: MessageStatus::Sent,
        client_offset: None,
        created_at: Utc::now(),
    }
}

#[tokio::test]
async fn stores_and_lists_groups() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let alice = storage.create_user("alice", "Alice").await.expect("user");
    let bob = storage.create_user("bob", "").await.expect("user");
    let group = storage
        .create_group("devs", alice, &[bob])
        .await
        .expect("group");

    let groups = storage.list_groups_for_user(bob).await.expect("groups");
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].group_id, group);
    assert_eq!(groups[0].admin_id, alice);

    let ids = storage.group_ids_for_user(alice).await.expect("ids");
    assert!(ids.contains(&group));
    assert_eq!(storage.group_admin(group).await.expect("admin"), Some(alice));
}

#[tokio::test]
async fn health_check_succeeds_for_live_pool() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage.health_check().await.expect("health check");
}

#[tokio::test]
async fn create_user_is_idempotent_per_username() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let first = storage.create_user("carol", "Carol").await.expect("user");
    let second = storage.create_user("carol", "Caroline").await.expect("user");
    assert_eq!(first, second);

    let user = storage.user(first).await.expect("load").expect("exists");
    assert_eq!(user.name, "Caroline");

    let bare = storage.create_user("dave", "  ").await.expect("user");
    let dave = storage.user(bare).await.expect("load").expect("exists");
    assert_eq!(dave.name, "dave");

    assert!(storage.create_user("   ", "x").await.is_err());
}

#[tokio::test]
async fn lists_everyone_but_the_caller() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let alice = storage.create_user("alice", "Alice").await.expect("user");
    storage.create_user("bob", "Bob").await.expect("user");
    storage.create_user("carol", "Carol").await.expect("user");

    let others = storage.list_users_except(alice).await.expect("users");
    let names: Vec<_> = others.iter().map(|u| u.username.as_str()).collect();
    assert_eq!(names, vec!["bob", "carol"]);
}

#[tokio::test]
async fn creates_database_file_when_missing() {
    let temp_root = tempfile::tempdir().expect("tempdir");
    let db_path = temp_root.path().join("nested").join("relay.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    let storage = Storage::new(&database_url).await.expect("db");
    drop(storage);

    assert!(
        db_path.exists(),
        "database file should exist: {}",
        db_path.display()
    );
}

#[tokio::test]
async fn lists_room_messages_in_ascending_order_per_room() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let group_room = RoomId::Group(GroupId(5));
    let direct_room = RoomId::direct(UserId(1), UserId(2));

    let first = storage
        .insert_message(&new_message(UserId(1), group_room, "first"))
        .await
        .expect("first");
    let other = storage
        .insert_message(&new_message(UserId(1), direct_room, "elsewhere"))
        .await
        .expect("other");
    let second = storage
        .insert_message(&new_message(UserId(2), group_room, "second"))
        .await
        .expect("second");
    assert!(first < other && other < second);

    let history = storage
        .list_room_messages(group_room, None)
        .await
        .expect("history");
    let ids: Vec<_> = history.iter().map(|m| m.message_id).collect();
    assert_eq!(ids, vec![first, second]);
    assert_eq!(history[1].content, "second");
    assert_eq!(history[1].room, group_room);

    let newer = storage
        .list_room_messages(group_room, Some(first))
        .await
        .expect("newer");
    assert_eq!(newer.len(), 1);
    assert_eq!(newer[0].message_id, second);

    let direct = storage
        .list_room_messages(direct_room, None)
        .await
        .expect("direct");
    assert_eq!(direct.len(), 1);
    assert_eq!(direct[0].room, direct_room);
}

#[tokio::test]
async fn status_never_moves_backwards() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let id = storage
        .insert_message(&new_message(UserId(1), RoomId::Group(GroupId(1)), "hi"))
        .await
        .expect("insert");

    assert!(storage
        .advance_message_status(id, MessageStatus::Delivered)
        .await
        .expect("advance"));
    assert!(storage
        .advance_message_status(id, MessageStatus::Read)
        .await
        .expect("advance"));
    assert!(!storage
        .advance_message_status(id, MessageStatus::Delivered)
        .await
        .expect("advance"));

    let stored = storage.load_message(id).await.expect("load").expect("exists");
    assert_eq!(stored.status, MessageStatus::Read);
}

#[tokio::test]
async fn deleted_messages_disappear_and_ids_are_not_reused() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let room = RoomId::Group(GroupId(3));
    let first = storage
        .insert_message(&new_message(UserId(1), room, "one"))
        .await
        .expect("insert");

    assert!(storage.delete_message(first).await.expect("delete"));
    assert!(!storage.delete_message(first).await.expect("delete again"));
    assert!(storage.load_message(first).await.expect("load").is_none());

    let next = storage
        .insert_message(&new_message(UserId(1), room, "two"))
        .await
        .expect("insert");
    assert!(next > first);
}

#[tokio::test]
async fn edit_replaces_content_and_stamps_time() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let id = storage
        .insert_message(&new_message(UserId(1), RoomId::Group(GroupId(1)), "draft"))
        .await
        .expect("insert");

    let edited = storage
        .edit_message(id, "final", Utc::now())
        .await
        .expect("edit")
        .expect("exists");
    assert_eq!(edited.content, "final");
    assert!(edited.edited_at.is_some());

    let missing = storage
        .edit_message(MessageId(999), "nope", Utc::now())
        .await
        .expect("edit");
    assert!(missing.is_none());
}
