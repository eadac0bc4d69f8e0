use super::*;

use std::time::Duration;

use chrono::TimeZone;
use shared::protocol::{ChatParticipants, GroupChatParticipants, Message};

use crate::connection::ConnectionStatus;

fn at(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 12, minute, 0)
        .single()
        .expect("timestamp")
}

fn chat(id: &str, counterpart: &str, minute: u32) -> PrivateConversation {
    PrivateConversation {
        id: ConversationId::new(id),
        counterpart_email: EmailAddress::from_trusted(counterpart),
        last_updated_at: at(minute),
        unread_count: 0,
        is_online: false,
    }
}

fn group(id: &str, name: &str, minute: u32) -> GroupConversation {
    GroupConversation {
        id: ConversationId::new(id),
        group_name: name.to_string(),
        last_updated_at: at(minute),
        unread_count: 0,
        members: vec![EmailAddress::from_trusted("a@x.com")],
    }
}

fn ids<E: RosterEntry>(entries: &[E]) -> Vec<String> {
    entries.iter().map(|entry| entry.id().to_string()).collect()
}

fn assert_sorted<E: RosterEntry>(entries: &[E]) {
    assert!(
        entries
            .windows(2)
            .all(|pair| pair[0].last_updated_at() >= pair[1].last_updated_at()),
        "roster must be sorted newest first"
    );
}

async fn wait_for_snapshot<K: RosterKind>(
    view: &RosterView<K>,
    predicate: impl Fn(&RosterSnapshot<K::Entry>) -> bool,
) -> RosterSnapshot<K::Entry> {
    let mut rx = view.subscribe();
    let snapshot = tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| predicate(s)))
        .await
        .expect("roster update timed out")
        .expect("roster task alive")
        .clone();
    snapshot
}

#[test]
fn replacement_sorts_newest_first() {
    let mut roster = Roster::default();
    roster.apply(RosterEvent::Replaced(vec![
        chat("1", "b@x.com", 0),
        chat("2", "c@x.com", 5),
        chat("3", "d@x.com", 3),
    ]));
    assert_eq!(ids(roster.entries()), ["2", "3", "1"]);
}

#[test]
fn new_message_moves_conversation_to_top_and_counts_unread() {
    let mut roster = Roster::from_entries(vec![chat("1", "b@x.com", 0), chat("2", "c@x.com", 1)]);
    assert_eq!(ids(roster.entries()), ["2", "1"]);

    let changed = roster.apply(RosterEvent::MessageArrived {
        conversation_id: ConversationId::new("1"),
        at: at(2),
    });

    assert!(changed);
    assert_eq!(ids(roster.entries()), ["1", "2"]);
    let first = roster.get(&ConversationId::new("1")).expect("entry");
    assert_eq!(first.unread_count, 1);
    assert_eq!(first.last_updated_at, at(2));
}

#[test]
fn message_for_unknown_conversation_is_ignored() {
    let mut roster = Roster::from_entries(vec![chat("1", "b@x.com", 0)]);
    let before = roster.clone();
    assert!(!roster.apply(RosterEvent::MessageArrived {
        conversation_id: ConversationId::new("404"),
        at: at(9),
    }));
    assert_eq!(roster, before);
}

#[test]
fn duplicate_creation_is_idempotent() {
    let mut roster = Roster::from_entries(vec![chat("1", "b@x.com", 0)]);
    assert!(roster.apply(RosterEvent::Created(chat("2", "c@x.com", 4))));
    assert!(!roster.apply(RosterEvent::Created(chat("2", "c@x.com", 4))));
    assert_eq!(ids(roster.entries()), ["2", "1"]);
}

#[test]
fn presence_updates_flag_without_reordering() {
    let mut roster = Roster::from_entries(vec![chat("1", "b@x.com", 0), chat("2", "c@x.com", 1)]);
    let changed = roster.apply(RosterEvent::Presence(PresenceUpdate {
        email: EmailAddress::from_trusted("b@x.com"),
        is_online: true,
    }));
    assert!(changed);
    assert_eq!(ids(roster.entries()), ["2", "1"]);
    assert!(roster.get(&ConversationId::new("1")).expect("entry").is_online);
    assert!(!roster.get(&ConversationId::new("2")).expect("entry").is_online);
}

#[test]
fn group_entries_ignore_presence() {
    let mut roster = Roster::from_entries(vec![group("g1", "Team", 0)]);
    assert!(!roster.apply(RosterEvent::Presence(PresenceUpdate {
        email: EmailAddress::from_trusted("a@x.com"),
        is_online: true,
    })));
}

#[test]
fn ordering_holds_after_every_mutation() {
    let mut roster = Roster::default();
    let events = vec![
        RosterEvent::Replaced(vec![chat("1", "b@x.com", 10), chat("2", "c@x.com", 20)]),
        RosterEvent::Created(chat("3", "d@x.com", 15)),
        RosterEvent::MessageArrived {
            conversation_id: ConversationId::new("1"),
            at: at(30),
        },
        RosterEvent::Created(chat("4", "e@x.com", 5)),
        RosterEvent::MessageArrived {
            conversation_id: ConversationId::new("4"),
            at: at(40),
        },
        RosterEvent::Presence(PresenceUpdate {
            email: EmailAddress::from_trusted("c@x.com"),
            is_online: true,
        }),
    ];
    for event in events {
        roster.apply(event);
        assert_sorted(roster.entries());
    }
    assert_eq!(ids(roster.entries()), ["4", "1", "2", "3"]);
}

#[test]
fn mark_read_resets_only_the_target() {
    let mut roster = Roster::from_entries(vec![chat("1", "b@x.com", 0), chat("2", "c@x.com", 1)]);
    for id in ["1", "2"] {
        roster.apply(RosterEvent::MessageArrived {
            conversation_id: ConversationId::new(id),
            at: at(5),
        });
    }
    assert!(roster.mark_read(&ConversationId::new("1")));
    assert!(!roster.mark_read(&ConversationId::new("1")));
    assert_eq!(roster.get(&ConversationId::new("1")).expect("entry").unread_count, 0);
    assert_eq!(roster.get(&ConversationId::new("2")).expect("entry").unread_count, 1);
}

#[test]
fn open_conversation_moves_up_without_counting_unread() {
    let mut roster = Roster::from_entries(vec![chat("1", "b@x.com", 0), chat("2", "c@x.com", 1)]);
    roster.set_open(Some(ConversationId::new("1")));

    assert!(roster.apply(RosterEvent::MessageArrived {
        conversation_id: ConversationId::new("1"),
        at: at(2),
    }));
    assert!(roster.apply(RosterEvent::MessageArrived {
        conversation_id: ConversationId::new("2"),
        at: at(3),
    }));

    assert_eq!(ids(roster.entries()), ["2", "1"]);
    assert_eq!(roster.get(&ConversationId::new("1")).expect("entry").unread_count, 0);
    assert_eq!(roster.get(&ConversationId::new("1")).expect("entry").last_updated_at, at(2));
    assert_eq!(roster.get(&ConversationId::new("2")).expect("entry").unread_count, 1);

    roster.set_open(None);
    roster.apply(RosterEvent::MessageArrived {
        conversation_id: ConversationId::new("1"),
        at: at(4),
    });
    assert_eq!(roster.get(&ConversationId::new("1")).expect("entry").unread_count, 1);
}

#[test]
fn replacement_keeps_the_open_marker() {
    let mut roster = Roster::from_entries(vec![chat("1", "b@x.com", 0)]);
    roster.set_open(Some(ConversationId::new("1")));
    roster.apply(RosterEvent::Replaced(vec![chat("1", "b@x.com", 0)]));
    assert_eq!(roster.open_conversation(), Some(&ConversationId::new("1")));
}

#[tokio::test]
async fn mounted_private_roster_requests_and_tracks_events() {
    let (connection, mut peer) = ConnectionHandle::loopback();
    let owner = EmailAddress::from_trusted("a@x.com");
    let view = RosterView::<PrivateRoster>::mount(&connection, owner.clone());

    let request = peer.next_request().await.expect("roster request");
    assert_eq!(
        request,
        ClientRequest::GetChatParticipants(RosterRequest { user_email: owner })
    );
    assert!(view.snapshot().loading);

    peer.push(ServerEvent::ChatParticipants(ChatParticipants {
        private_chats: vec![chat("1", "b@x.com", 0), chat("2", "c@x.com", 1)],
    }));
    let snapshot = wait_for_snapshot(&view, |s| !s.loading).await;
    assert_eq!(ids(&snapshot.entries), ["2", "1"]);

    peer.push(ServerEvent::ReceivePrivateMessage(Message::new(
        ConversationId::new("1"),
        EmailAddress::from_trusted("b@x.com"),
        "hey",
        at(2),
    )));
    let snapshot = wait_for_snapshot(&view, |s| s.entries[0].id.as_str() == "1").await;
    assert_eq!(ids(&snapshot.entries), ["1", "2"]);
    assert_eq!(snapshot.entries[0].unread_count, 1);

    view.reset_unread(&ConversationId::new("1"));
    let snapshot = wait_for_snapshot(&view, |s| s.entries[0].unread_count == 0).await;
    assert_eq!(ids(&snapshot.entries), ["1", "2"]);
}

#[tokio::test]
async fn mounted_roster_skips_unread_for_open_conversation() {
    let (connection, mut peer) = ConnectionHandle::loopback();
    let view = RosterView::<PrivateRoster>::mount(&connection, EmailAddress::from_trusted("a@x.com"));
    peer.next_request().await.expect("roster request");
    peer.push(ServerEvent::ChatParticipants(ChatParticipants {
        private_chats: vec![chat("1", "b@x.com", 0), chat("2", "c@x.com", 1)],
    }));
    wait_for_snapshot(&view, |s| !s.loading).await;

    view.set_open(Some(ConversationId::new("1")));
    tokio::time::sleep(Duration::from_millis(20)).await;
    peer.push(ServerEvent::ReceivePrivateMessage(Message::new(
        ConversationId::new("1"),
        EmailAddress::from_trusted("b@x.com"),
        "seen right away",
        at(5),
    )));

    let snapshot = wait_for_snapshot(&view, |s| s.entries[0].id.as_str() == "1").await;
    assert_eq!(snapshot.entries[0].unread_count, 0);
    assert_eq!(snapshot.entries[0].last_updated_at, at(5));
}

#[tokio::test]
async fn group_roster_ignores_private_traffic() {
    let (connection, mut peer) = ConnectionHandle::loopback();
    let view = RosterView::<GroupRoster>::mount(&connection, EmailAddress::from_trusted("a@x.com"));
    assert!(matches!(
        peer.next_request().await,
        Some(ClientRequest::GetGroupChatParticipants(_))
    ));

    peer.push(ServerEvent::GroupChatParticipants(GroupChatParticipants {
        group_chats: vec![group("g1", "Team", 0)],
    }));
    wait_for_snapshot(&view, |s| !s.loading).await;

    peer.push(ServerEvent::ReceivePrivateMessage(Message::new(
        ConversationId::new("g1"),
        EmailAddress::from_trusted("b@x.com"),
        "private",
        at(3),
    )));
    peer.push(ServerEvent::ReceiveGroupMessage(Message::new(
        ConversationId::new("g1"),
        EmailAddress::from_trusted("b@x.com"),
        "group",
        at(4),
    )));
    let snapshot = wait_for_snapshot(&view, |s| s.entries[0].unread_count > 0).await;
    assert_eq!(snapshot.entries[0].unread_count, 1);
    assert_eq!(snapshot.entries[0].last_updated_at, at(4));
}

#[tokio::test]
async fn creation_failures_do_not_touch_the_roster() {
    let (connection, mut peer) = ConnectionHandle::loopback();
    let view = RosterView::<PrivateRoster>::mount(&connection, EmailAddress::from_trusted("a@x.com"));
    peer.next_request().await.expect("roster request");
    peer.push(ServerEvent::ChatParticipants(ChatParticipants {
        private_chats: vec![chat("1", "b@x.com", 0)],
    }));
    wait_for_snapshot(&view, |s| !s.loading).await;

    peer.push(ServerEvent::NewChatCreated(CreationResult::Failed {
        error: "Receiver not found".to_string(),
    }));
    peer.push(ServerEvent::NewChatCreated(CreationResult::Created(chat("2", "c@x.com", 1))));
    peer.push(ServerEvent::NewChatCreated(CreationResult::Created(chat("2", "c@x.com", 1))));

    let snapshot = wait_for_snapshot(&view, |s| s.entries.len() >= 2).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(ids(&view.snapshot().entries), ["2", "1"]);
    assert_eq!(snapshot.entries.len(), 2);
}

#[tokio::test]
async fn remounting_does_not_accumulate_listeners() {
    let (connection, _peer) = ConnectionHandle::loopback();
    let owner = EmailAddress::from_trusted("a@x.com");

    for _ in 0..3 {
        let view = RosterView::<PrivateRoster>::mount(&connection, owner.clone());
        assert_eq!(connection.listener_count(EventClass::ChatParticipants), 1);
        view.unmount().await;
        assert_eq!(connection.listener_count(EventClass::ChatParticipants), 0);
    }

    let _private = RosterView::<PrivateRoster>::mount(&connection, owner.clone());
    let _group = RosterView::<GroupRoster>::mount(&connection, owner);
    assert_eq!(connection.listener_count(EventClass::ChatParticipants), 1);
    assert_eq!(connection.listener_count(EventClass::GroupChatParticipants), 1);
    assert_eq!(connection.listener_count(EventClass::UserStatusUpdate), 1);
}

#[tokio::test]
async fn roster_is_requested_again_after_reconnect() {
    let (connection, mut peer) = ConnectionHandle::loopback();
    peer.set_status(ConnectionStatus::Disconnected);
    let _view = RosterView::<PrivateRoster>::mount(&connection, EmailAddress::from_trusted("a@x.com"));

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(peer.try_next_request().is_none(), "no request while offline");

    peer.set_status(ConnectionStatus::Connected);
    let first = tokio::time::timeout(Duration::from_secs(2), peer.next_request())
        .await
        .expect("request after connect");
    assert!(matches!(first, Some(ClientRequest::GetChatParticipants(_))));

    peer.set_status(ConnectionStatus::Disconnected);
    tokio::time::sleep(Duration::from_millis(20)).await;
    peer.set_status(ConnectionStatus::Connected);
    let second = tokio::time::timeout(Duration::from_secs(2), peer.next_request())
        .await
        .expect("request after reconnect");
    assert!(matches!(second, Some(ClientRequest::GetChatParticipants(_))));
}
