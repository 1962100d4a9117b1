//! End-to-end comment propagation over the in-process signaling hub and
//! memory transport.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{ROOM, memory_node, wait_for_comment, wait_for_comments, wait_for_room_peers};
use seymour_mesh::{
    Comment, CommentDraft, CommentEvent, CommentStore, Keypair, MemoryNetwork, MemoryStore, MergeOutcome,
    SignalHub,
};
use tokio::time::timeout;

#[tokio::test]
async fn posted_comment_reaches_connected_peer_exactly_once() {
    let hub = SignalHub::new();
    let network = MemoryNetwork::new();
    let x = memory_node(&hub, &network).await;
    let y = memory_node(&hub, &network).await;
    let mut y_events = y.events().await.unwrap();

    x.join_room(ROOM).await.unwrap();
    y.join_room(ROOM).await.unwrap();
    wait_for_room_peers(&x, ROOM, &[y.peer_id()]).await;
    wait_for_room_peers(&y, ROOM, &[x.peer_id()]).await;

    let posted = x.post_comment(ROOM, "hello", None, None).await.unwrap();

    let event = timeout(Duration::from_secs(5), y_events.recv()).await.unwrap().unwrap();
    let CommentEvent::Merged { room_id, comments } = event;
    assert_eq!(room_id, ROOM);
    assert_eq!(comments, vec![posted.clone()]);

    // Let a few sync cycles run; they must not duplicate anything.
    tokio::time::sleep(Duration::from_millis(600)).await;
    let stored = y.comments(ROOM).await.unwrap();
    assert_eq!(stored, vec![posted]);

    let stats = y.get_stats().await.unwrap();
    assert_eq!(stats.comments_stored, 1);
    assert_eq!(stats.connected_peers, 1);
    assert_eq!(stats.verification_failures, 0);

    x.shutdown().await;
    y.shutdown().await;
}

#[tokio::test]
async fn comments_posted_apart_converge_after_connecting() {
    let hub = SignalHub::new();
    let network = MemoryNetwork::new();
    let x = memory_node(&hub, &network).await;
    let y = memory_node(&hub, &network).await;

    x.join_room(ROOM).await.unwrap();
    let from_x = x.post_comment(ROOM, "written by x", None, None).await.unwrap();
    let from_y = y.post_comment(ROOM, "written by y", None, None).await.unwrap();
    assert_ne!(from_x.id, from_y.id);

    y.join_room(ROOM).await.unwrap();

    let mut at_x = wait_for_comments(&x, ROOM, 2).await;
    let mut at_y = wait_for_comments(&y, ROOM, 2).await;
    at_x.sort_by_key(|c| c.id);
    at_y.sort_by_key(|c| c.id);
    assert_eq!(at_x, at_y);
    assert!(at_x.contains(&from_x) && at_x.contains(&from_y));

    x.shutdown().await;
    y.shutdown().await;
}

#[tokio::test]
async fn late_joiner_catches_up_through_sync() {
    let hub = SignalHub::new();
    let network = MemoryNetwork::new();
    let x = memory_node(&hub, &network).await;
    x.join_room(ROOM).await.unwrap();
    let first = x.post_comment(ROOM, "first", Some("a quoted line".into()), None).await.unwrap();
    let reply = x.post_comment(ROOM, "reply", None, Some(first.id)).await.unwrap();

    let y = memory_node(&hub, &network).await;
    y.join_room(ROOM).await.unwrap();

    let comments = wait_for_comments(&y, ROOM, 2).await;
    let got_reply = comments.iter().find(|c| c.id == reply.id).unwrap();
    assert_eq!(got_reply.reply_to, Some(first.id));
    let got_first = comments.iter().find(|c| c.id == first.id).unwrap();
    assert_eq!(got_first.selected_quote.as_deref(), Some("a quoted line"));

    x.shutdown().await;
    y.shutdown().await;
}

#[tokio::test]
async fn votes_and_deletions_propagate() {
    let hub = SignalHub::new();
    let network = MemoryNetwork::new();
    let x = memory_node(&hub, &network).await;
    let y = memory_node(&hub, &network).await;
    x.join_room(ROOM).await.unwrap();
    y.join_room(ROOM).await.unwrap();
    wait_for_room_peers(&y, ROOM, &[x.peer_id()]).await;

    let comment = x.post_comment(ROOM, "upvote me", None, None).await.unwrap();
    wait_for_comments(&y, ROOM, 1).await;

    y.vote(&comment.id).await.unwrap();
    x.vote(&comment.id).await.unwrap();
    let at_x = wait_for_comment(&x, ROOM, &comment.id, |c| c.upvotes() == 2).await;
    let at_y = wait_for_comment(&y, ROOM, &comment.id, |c| c.upvotes() == 2).await;
    assert_eq!(at_x, at_y);

    // Only the author can delete.
    assert!(y.delete_comment(&comment.id).await.is_err());
    x.delete_comment(&comment.id).await.unwrap();
    let deleted = wait_for_comment(&y, ROOM, &comment.id, |c| c.is_deleted()).await;
    assert_eq!(deleted.upvotes(), 2);

    x.shutdown().await;
    y.shutdown().await;
}

#[tokio::test]
async fn comment_posted_during_outage_arrives_after_reconnect() {
    let hub = SignalHub::new();
    let network = MemoryNetwork::new();
    let x = memory_node(&hub, &network).await;
    let y = memory_node(&hub, &network).await;
    x.join_room(ROOM).await.unwrap();
    y.join_room(ROOM).await.unwrap();
    wait_for_room_peers(&y, ROOM, &[x.peer_id()]).await;

    assert!(network.break_link(x.peer_id(), y.peer_id()));
    let during = x.post_comment(ROOM, "while apart", None, None).await.unwrap();

    let comments = wait_for_comments(&y, ROOM, 1).await;
    assert_eq!(comments, vec![during]);
    wait_for_room_peers(&y, ROOM, &[x.peer_id()]).await;

    x.shutdown().await;
    y.shutdown().await;
}

#[tokio::test]
async fn leaving_a_room_drops_its_peers() {
    let hub = SignalHub::new();
    let network = MemoryNetwork::new();
    let x = memory_node(&hub, &network).await;
    let y = memory_node(&hub, &network).await;
    x.join_room(ROOM).await.unwrap();
    y.join_room(ROOM).await.unwrap();
    wait_for_room_peers(&x, ROOM, &[y.peer_id()]).await;

    y.leave_room(ROOM).await;
    wait_for_room_peers(&x, ROOM, &[]).await;
    wait_for_room_peers(&y, ROOM, &[]).await;

    x.shutdown().await;
    y.shutdown().await;
}

#[tokio::test]
async fn merging_the_same_comment_twice_changes_nothing() {
    let store = CommentStore::new(Arc::new(MemoryStore::new()));
    let author = Keypair::generate();
    let draft = CommentDraft {
        room_id: ROOM.into(),
        text: "idempotent".into(),
        ..Default::default()
    };
    let comment = Comment::create(&author, draft).unwrap();

    let (_, first) = store.upsert(comment.clone()).await.unwrap();
    let after_once = store.room_comments(ROOM).await.unwrap();
    let (_, second) = store.upsert(comment).await.unwrap();
    let after_twice = store.room_comments(ROOM).await.unwrap();

    assert_eq!(first, MergeOutcome::Inserted);
    assert_eq!(second, MergeOutcome::Unchanged);
    assert_eq!(after_once, after_twice);
    assert_eq!(store.count().await.unwrap(), 1);
}

#[tokio::test]
async fn backlog_larger_than_one_response_arrives_in_full() {
    let hub = SignalHub::new();
    let network = MemoryNetwork::new();
    let mut config = common::fast_config();
    config.sync.max_comments_per_response = 2;
    let x = common::memory_node_with(&hub, &network, config.clone(), Arc::new(MemoryStore::new())).await;
    let y = common::memory_node_with(&hub, &network, config, Arc::new(MemoryStore::new())).await;

    x.join_room(ROOM).await.unwrap();
    let mut posted = Vec::new();
    for i in 0..5 {
        posted.push(x.post_comment(ROOM, &format!("backlog {i}"), None, None).await.unwrap().id);
        tokio::time::sleep(Duration::from_millis(3)).await;
    }

    y.join_room(ROOM).await.unwrap();
    let received = wait_for_comments(&y, ROOM, 5).await;
    let mut ids: Vec<_> = received.into_iter().map(|c| c.id).collect();
    ids.sort();
    posted.sort();
    assert_eq!(ids, posted);

    // Later cycles start from the advanced cursor and bring nothing twice.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(y.comments(ROOM).await.unwrap().len(), 5);

    x.shutdown().await;
    y.shutdown().await;
}

#[tokio::test]
async fn node_rejoins_after_its_signaling_session_drops() {
    let hub = SignalHub::new();
    let network = MemoryNetwork::new();
    let x = memory_node(&hub, &network).await;
    let y = memory_node(&hub, &network).await;
    x.join_room(ROOM).await.unwrap();
    y.join_room(ROOM).await.unwrap();
    wait_for_room_peers(&y, ROOM, &[x.peer_id()]).await;

    hub.disconnect_peer(&y.peer_id()).await;
    let from_y = y.post_comment(ROOM, "posted around the outage", None, None).await.unwrap();

    // A peer arriving after the outage can only find y through the new session.
    let z = memory_node(&hub, &network).await;
    z.join_room(ROOM).await.unwrap();
    wait_for_room_peers(&z, ROOM, &[x.peer_id(), y.peer_id()]).await;
    wait_for_comment(&z, ROOM, &from_y.id, |_| true).await;
    wait_for_room_peers(&y, ROOM, &[x.peer_id(), z.peer_id()]).await;

    x.shutdown().await;
    y.shutdown().await;
    z.shutdown().await;
}
