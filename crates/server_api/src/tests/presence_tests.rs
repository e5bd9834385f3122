use std::sync::atomic::Ordering;

use super::*;
use crate::support::{drain, drain_events, harness};
use shared::{domain::GroupId, error::ErrorCode, protocol::MessageDraft};

#[tokio::test]
async fn authenticate_checks_the_token() {
    let h = harness();
    assert_eq!(
        authenticate(&h.ctx, Some("alice-token")).await,
        Ok(UserId(1))
    );
    assert_eq!(authenticate(&h.ctx, None).await, Err(AuthError::Missing));
    assert_eq!(authenticate(&h.ctx, Some("  ")).await, Err(AuthError::Missing));
    assert!(matches!(
        authenticate(&h.ctx, Some("forged")).await,
        Err(AuthError::Invalid(_))
    ));
}

#[tokio::test]
async fn direct_room_participants_join_and_outsider_is_disconnected() {
    let h = harness();
    let room: RoomId = "1_2".parse().expect("room");
    let (alice, mut alice_rx) = connect(&h.ctx, UserId(1)).await;
    let (bob, mut bob_rx) = connect(&h.ctx, UserId(2)).await;
    let (carol, mut carol_rx) = connect(&h.ctx, UserId(3)).await;

    assert_eq!(join_room(&h.ctx, &alice, room, None).await, Ok(0));
    assert_eq!(join_room(&h.ctx, &bob, room, None).await, Ok(0));
    assert_eq!(
        drain_events(&mut alice_rx),
        vec![ServerEvent::Joined {
            room,
            backfilled: 0
        }]
    );
    drain(&mut bob_rx);

    assert_eq!(
        join_room(&h.ctx, &carol, room, None).await,
        Err(EngineError::AccessDenied(room))
    );
    assert_eq!(
        drain(&mut carol_rx),
        vec![
            Outbound::Event(ServerEvent::UnauthorizedAccess { access: false }),
            Outbound::Close,
        ]
    );
    assert!(h.ctx.sessions.lookup(UserId(3)).await.is_none());
    assert!(!h.ctx.sessions.is_subscribed(&carol, room).await);
    assert_eq!(h.ctx.sessions.subscriber_count(room).await, 2);
}

#[tokio::test]
async fn rejoin_replays_missed_messages_in_order() {
    let h = harness();
    let room = RoomId::Group(GroupId(5));
    h.groups.add_member(GroupId(5), UserId(1));
    let first = h.messages.seed(UserId(2), room, "first");
    let second = h.messages.seed(UserId(2), room, "second");

    let (alice, mut rx) = connect(&h.ctx, UserId(1)).await;
    assert_eq!(join_room(&h.ctx, &alice, room, None).await, Ok(2));

    let events = drain_events(&mut rx);
    let replayed: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            ServerEvent::Message(payload) => Some((payload.id, payload.new_message)),
            _ => None,
        })
        .collect();
    assert_eq!(replayed, vec![(first, false), (second, false)]);
    assert_eq!(
        events.last(),
        Some(&ServerEvent::Joined {
            room,
            backfilled: 2
        })
    );
}

#[tokio::test]
async fn join_with_offset_only_replays_newer_messages() {
    let h = harness();
    let room = RoomId::direct(UserId(1), UserId(2));
    let seen = h.messages.seed(UserId(2), room, "seen");
    h.messages.seed(UserId(2), room, "missed");

    let (alice, _rx) = connect(&h.ctx, UserId(1)).await;
    assert_eq!(join_room(&h.ctx, &alice, room, Some(seen)).await, Ok(1));
}

#[tokio::test]
async fn lookup_failure_denies_and_disconnects() {
    let h = harness();
    h.groups.add_member(GroupId(5), UserId(1));
    h.groups.fail.store(true, Ordering::SeqCst);
    let room = RoomId::Group(GroupId(5));
    let (alice, mut rx) = connect(&h.ctx, UserId(1)).await;

    assert_eq!(
        join_room(&h.ctx, &alice, room, None).await,
        Err(EngineError::AccessDenied(room))
    );
    assert_eq!(drain(&mut rx).last(), Some(&Outbound::Close));
    assert_eq!(h.ctx.sessions.session_count().await, 0);
}

#[tokio::test]
async fn backfill_failure_aborts_join_but_keeps_connection() {
    let h = harness();
    let room = RoomId::direct(UserId(1), UserId(2));
    h.messages.fail_reads.store(true, Ordering::SeqCst);
    let (alice, mut rx) = connect(&h.ctx, UserId(1)).await;

    let err = dispatch(
        &h.ctx,
        &alice,
        ClientEvent::JoinGroup {
            room_id: room,
            client_offset: None,
        },
    )
    .await
    .expect_err("history unavailable");
    assert_eq!(err.code(), ErrorCode::Internal);
    assert!(!h.ctx.sessions.is_subscribed(&alice, room).await);
    assert!(h.ctx.sessions.is_current(&alice).await);

    let outbound = drain(&mut rx);
    assert_eq!(outbound.len(), 1);
    assert!(matches!(
        &outbound[0],
        Outbound::Event(ServerEvent::Error {
            code: ErrorCode::Internal,
            ..
        })
    ));
}

#[tokio::test]
async fn losing_membership_does_not_evict_a_joined_connection() {
    let h = harness();
    let room = RoomId::Group(GroupId(5));
    h.groups.add_member(GroupId(5), UserId(1));
    let (alice, _rx) = connect(&h.ctx, UserId(1)).await;
    join_room(&h.ctx, &alice, room, None).await.expect("join");

    h.groups.remove_member(GroupId(5), UserId(1));
    assert!(h.ctx.sessions.is_subscribed(&alice, room).await);
}

#[tokio::test]
async fn replaced_connection_cannot_join() {
    let h = harness();
    let room = RoomId::direct(UserId(1), UserId(2));
    let (old, _old_rx) = connect(&h.ctx, UserId(1)).await;
    let (_new, _new_rx) = connect(&h.ctx, UserId(1)).await;

    assert_eq!(
        join_room(&h.ctx, &old, room, None).await,
        Err(EngineError::SessionReplaced)
    );
    assert_eq!(h.ctx.sessions.subscriber_count(room).await, 0);
}

#[tokio::test]
async fn typing_reaches_the_room() {
    let h = harness();
    let room = RoomId::direct(UserId(1), UserId(2));
    let (alice, _a) = connect(&h.ctx, UserId(1)).await;
    let (bob, mut bob_rx) = connect(&h.ctx, UserId(2)).await;

    assert_eq!(
        typing(&h.ctx, &alice, room).await,
        Err(EngineError::NotJoined(room))
    );

    join_room(&h.ctx, &alice, room, None).await.expect("join");
    join_room(&h.ctx, &bob, room, None).await.expect("join");
    drain(&mut bob_rx);

    typing(&h.ctx, &alice, room).await.expect("typing");
    assert_eq!(
        drain_events(&mut bob_rx),
        vec![ServerEvent::Typing {
            user_id: UserId(1),
            room
        }]
    );
    assert_eq!(h.messages.len(), 0);
}

#[tokio::test]
async fn leave_stops_delivery() {
    let h = harness();
    let room = RoomId::direct(UserId(1), UserId(2));
    let (alice, _a) = connect(&h.ctx, UserId(1)).await;
    join_room(&h.ctx, &alice, room, None).await.expect("join");

    leave_room(&h.ctx, &alice, room).await.expect("leave");
    assert_eq!(
        leave_room(&h.ctx, &alice, room).await,
        Err(EngineError::NotJoined(room))
    );
    assert_eq!(h.ctx.sessions.subscriber_count(room).await, 0);
}

#[tokio::test]
async fn failed_submit_echoes_client_offset() {
    let h = harness();
    let room = RoomId::Group(GroupId(5));
    let (alice, mut rx) = connect(&h.ctx, UserId(1)).await;

    let draft = MessageDraft {
        room,
        content: "hi".into(),
        is_file: false,
        client_offset: Some("tmp-7".into()),
    };
    dispatch(&h.ctx, &alice, ClientEvent::Message(draft))
        .await
        .expect_err("not joined");

    match drain_events(&mut rx).as_slice() {
        [ServerEvent::Error {
            code,
            client_offset,
            ..
        }] => {
            assert_eq!(*code, ErrorCode::Validation);
            assert_eq!(client_offset.as_deref(), Some("tmp-7"));
        }
        other => panic!("unexpected events {other:?}"),
    }
}

#[tokio::test]
async fn stored_message_is_never_acked_as_a_failure() {
    let h = harness();
    let room = RoomId::Group(GroupId(5));
    h.groups.add_member(GroupId(5), UserId(1));
    let (alice, mut rx) = connect(&h.ctx, UserId(1)).await;
    join_room(&h.ctx, &alice, room, None).await.expect("join");
    drain(&mut rx);
    h.messages.fail_status_updates.store(true, Ordering::SeqCst);

    let draft = MessageDraft {
        room,
        content: "hi".into(),
        is_file: false,
        client_offset: Some("c-1".into()),
    };
    dispatch(&h.ctx, &alice, ClientEvent::Message(draft))
        .await
        .expect("stored");

    let events = drain_events(&mut rx);
    assert_eq!(events.len(), 1, "unexpected events {events:?}");
    assert!(matches!(
        &events[0],
        ServerEvent::Message(payload) if payload.client_offset.as_deref() == Some("c-1")
    ));
}

#[tokio::test]
async fn malformed_frames_get_a_validation_error() {
    let h = harness();
    let (alice, mut rx) = connect(&h.ctx, UserId(1)).await;

    for frame in ["not json", r#"{"event":"bogus","data":{}}"#, r#"{"event":"typing"}"#] {
        let err = handle_text(&h.ctx, &alice, frame)
            .await
            .expect_err("malformed");
        assert_eq!(err.code(), ErrorCode::Validation);
    }
    assert_eq!(drain_events(&mut rx).len(), 3);
    assert!(h.ctx.sessions.is_current(&alice).await);
}

#[tokio::test]
async fn text_frames_drive_the_full_flow() {
    let h = harness();
    let (alice, mut alice_rx) = connect(&h.ctx, UserId(1)).await;
    let (bob, mut bob_rx) = connect(&h.ctx, UserId(2)).await;

    handle_text(&h.ctx, &alice, r#"{"event":"join_group","data":{"room_id":"1_2"}}"#)
        .await
        .expect("alice joins");
    handle_text(&h.ctx, &bob, r#"{"event":"join_group","data":{"room_id":"2_1"}}"#)
        .await
        .expect("bob joins");
    drain(&mut alice_rx);
    drain(&mut bob_rx);

    handle_text(
        &h.ctx,
        &alice,
        r#"{"event":"message","data":{"room":"1_2","content":"hi bob"}}"#,
    )
    .await
    .expect("message");

    let events = drain_events(&mut bob_rx);
    assert_eq!(events.len(), 2);
    assert!(matches!(&events[0], ServerEvent::Message(p) if p.content == "hi bob"));
}
