//! Teardown Tests
//!
//! Graceful close from either side, aborts, and the single destroy
//! notification that removes a channel from the registry.
//!
//! ```bash
//! TEST_LOG=2 cargo test --test teardown -- --nocapture
//! ```

mod common;

use common::*;
use pupstream::prelude::*;

const START: u32 = 1000;

// ============================================================================
// Local Close
// ============================================================================

#[test]
fn local_close_handshake_destroys_once() {
    let (dispatcher, router) = dispatcher();
    let channel = open_channel(&dispatcher, &router, client_port(1), START, PARKED);

    channel.close().unwrap();
    let end = router.sent_of(PupType::End);
    assert_eq!(end.len(), 1);
    assert_eq!(end[0].destination, channel.client_port());
    assert_eq!(channel.state(), ChannelState::ClosingLocal);

    // Peer answers with its own End before the EndReply.
    dispatcher.dispatch(&to_channel(&channel, PupType::End, end[0].id, b""));
    assert_eq!(router.sent_of(PupType::EndReply).len(), 1);
    assert_eq!(channel.state(), ChannelState::ClosingLocal);

    dispatcher.dispatch(&to_channel(&channel, PupType::EndReply, end[0].id, b""));
    assert_eq!(router.sent_of(PupType::EndReply).len(), 2);
    assert_eq!(channel.state(), ChannelState::Destroyed);
    assert_eq!(dispatcher.channel_count(), 0);
    assert_eq!(dispatcher.destroyed_count(), 1);

    // Late packets find nothing and change nothing.
    let late = to_channel(&channel, PupType::EndReply, end[0].id, b"");
    assert!(!dispatcher.channel_exists(&late));
    dispatcher.dispatch(&late);
    dispatcher.on_channel_destroyed(&channel);
    assert_eq!(dispatcher.destroyed_count(), 1);

    dispatcher.shutdown();
}

#[test]
fn close_waits_for_outstanding_data() {
    let (dispatcher, router) = dispatcher();
    let channel = open_channel(&dispatcher, &router, client_port(1), START, PARKED);
    channel.write(b"last words").unwrap();

    let closer = {
        let channel = channel.clone();
        std::thread::spawn(move || channel.close())
    };
    std::thread::sleep(std::time::Duration::from_millis(30));
    assert!(router.sent_of(PupType::End).is_empty());

    dispatcher.dispatch(&ack_to(&channel, START + 10, 532, 5));
    closer.join().unwrap().unwrap();

    let end = router.sent_of(PupType::End);
    assert_eq!(end.len(), 1);
    assert_eq!(end[0].id, START + 10);
    dispatcher.shutdown();
}

#[test]
fn close_is_idempotent_while_closing() {
    let (dispatcher, router) = dispatcher();
    let channel = open_channel(&dispatcher, &router, client_port(1), START, PARKED);

    channel.close().unwrap();
    channel.close().unwrap();

    assert_eq!(router.sent_of(PupType::End).len(), 1);
    dispatcher.shutdown();
}

#[test]
fn writes_after_close_are_rejected() {
    let (dispatcher, router) = dispatcher();
    let channel = open_channel(&dispatcher, &router, client_port(1), START, PARKED);

    channel.close().unwrap();
    assert!(matches!(channel.write(b"late"), Err(Error::ChannelClosing)));
    assert!(matches!(
        channel.send_mark(pupstream::Mark::Sync, false),
        Err(Error::ChannelClosing)
    ));

    channel.destroy();
    assert!(matches!(channel.write(b"later"), Err(Error::ChannelClosed)));
    assert!(router.sent_of(PupType::Data).is_empty());
    assert!(router.sent_of(PupType::AData).is_empty());
    dispatcher.shutdown();
}

// ============================================================================
// Remote Close
// ============================================================================

#[test]
fn remote_close_drains_then_ends_stream() {
    let (dispatcher, router) = dispatcher();
    let channel = open_channel(&dispatcher, &router, client_port(1), START, PARKED);

    dispatcher.dispatch(&to_channel(&channel, PupType::Data, START, b"tail"));
    dispatcher.dispatch(&to_channel(&channel, PupType::End, 77, b""));

    let replies = router.sent_of(PupType::EndReply);
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].id, 77);
    assert_eq!(channel.state(), ChannelState::ClosingRemote);
    assert!(matches!(channel.write(b"no"), Err(Error::ChannelClosing)));

    assert_eq!(read_data(&channel, 4), b"tail");
    let mut buf = [0u8; 8];
    assert!(matches!(channel.read(&mut buf), Err(Error::ChannelClosed)));

    // A repeated End gets another reply.
    dispatcher.dispatch(&to_channel(&channel, PupType::End, 77, b""));
    assert_eq!(router.sent_of(PupType::EndReply).len(), 2);

    dispatcher.dispatch(&to_channel(&channel, PupType::EndReply, 77, b""));
    assert_eq!(channel.state(), ChannelState::Destroyed);
    assert_eq!(dispatcher.channel_count(), 0);
    assert_eq!(dispatcher.destroyed_count(), 1);
    assert_eq!(router.sent_of(PupType::EndReply).len(), 2);
    dispatcher.shutdown();
}

#[test]
fn remote_close_ends_blocked_reader() {
    let (dispatcher, router) = dispatcher();
    let channel = open_channel(&dispatcher, &router, client_port(1), START, DRAIN);

    dispatcher.dispatch(&to_channel(&channel, PupType::End, 1, b""));

    // The worker holds on until the peer's EndReply arrives.
    assert_eq!(channel.state(), ChannelState::ClosingRemote);
    assert_eq!(dispatcher.worker_pool().active_count(), 1);
    dispatcher.dispatch(&to_channel(&channel, PupType::EndReply, 1, b""));

    assert!(wait_until(|| dispatcher.worker_pool().active_count() == 0));
    // The reader saw a clean end of stream, so nothing was aborted.
    assert!(router.sent_of(PupType::Abort).is_empty());
    assert_eq!(channel.state(), ChannelState::Destroyed);
    assert_eq!(dispatcher.channel_count(), 0);
}

#[test]
fn silent_peer_after_remote_close_is_abandoned() {
    let config = BspConfig {
        ack_timeout: std::time::Duration::from_millis(50),
        max_retransmits: 1,
        ..test_config()
    };
    let (dispatcher, router) = dispatcher_with(config);
    let channel = open_channel(&dispatcher, &router, client_port(1), START, DRAIN);

    dispatcher.dispatch(&to_channel(&channel, PupType::End, 1, b""));

    assert!(wait_until(|| dispatcher.worker_pool().active_count() == 0));
    assert_eq!(channel.state(), ChannelState::Destroyed);
    assert_eq!(dispatcher.channel_count(), 0);
    assert_eq!(router.sent_of(PupType::EndReply).len(), 1);
}

#[test]
fn end_reply_without_end_tears_down() {
    let (dispatcher, router) = dispatcher();
    let channel = open_channel(&dispatcher, &router, client_port(1), START, PARKED);

    dispatcher.dispatch(&to_channel(&channel, PupType::EndReply, 0, b""));

    assert_eq!(channel.state(), ChannelState::Destroyed);
    assert_eq!(dispatcher.channel_count(), 0);
    assert!(router.sent().is_empty());
    dispatcher.shutdown();
}

// ============================================================================
// Abort
// ============================================================================

#[test]
fn peer_abort_destroys_immediately() {
    let (dispatcher, router) = dispatcher();
    let channel = open_channel(&dispatcher, &router, client_port(1), START, DRAIN);

    dispatcher.dispatch(&to_channel(&channel, PupType::Abort, 0, b"going away"));

    assert_eq!(channel.state(), ChannelState::Aborted);
    assert_eq!(dispatcher.channel_count(), 0);
    assert_eq!(dispatcher.destroyed_count(), 1);
    match channel.write(b"x") {
        Err(Error::ChannelAborted { message }) => assert_eq!(message, "going away"),
        other => panic!("expected abort, got {other:?}"),
    }

    // Traffic for the old socket is dropped.
    dispatcher.dispatch(&to_channel(&channel, PupType::AData, START, b"ghost"));
    assert!(router.sent_of(PupType::Ack).is_empty());

    assert!(wait_until(|| dispatcher.worker_pool().active_count() == 0));
    assert!(router.sent_of(PupType::Abort).is_empty());
}

#[test]
fn peer_abort_during_local_close() {
    let (dispatcher, router) = dispatcher();
    let channel = open_channel(&dispatcher, &router, client_port(1), START, PARKED);
    channel.close().unwrap();

    dispatcher.dispatch(&to_channel(&channel, PupType::Abort, 0, b""));

    assert_eq!(channel.state(), ChannelState::Aborted);
    assert_eq!(dispatcher.channel_count(), 0);
    assert_eq!(dispatcher.destroyed_count(), 1);
    dispatcher.shutdown();
}

#[test]
fn local_abort_notifies_peer() {
    let (dispatcher, router) = dispatcher();
    let channel = open_channel(&dispatcher, &router, client_port(1), START, PARKED);

    channel.send_abort("maintenance");
    channel.send_abort("again");

    let aborts = router.sent_of(PupType::Abort);
    assert_eq!(aborts.len(), 1);
    assert_eq!(aborts[0].contents, b"maintenance");
    assert_eq!(aborts[0].destination, channel.client_port());
    assert_eq!(dispatcher.channel_count(), 0);
    assert_eq!(dispatcher.destroyed_count(), 1);
    dispatcher.shutdown();
}

#[test]
fn destroy_channel_removes_without_handshake() {
    let (dispatcher, router) = dispatcher();
    let channel = open_channel(&dispatcher, &router, client_port(1), START, PARKED);

    dispatcher.destroy_channel(&channel);
    dispatcher.destroy_channel(&channel);

    assert_eq!(channel.state(), ChannelState::Destroyed);
    assert_eq!(dispatcher.channel_count(), 0);
    assert_eq!(dispatcher.destroyed_count(), 1);
    assert!(router.sent().is_empty());
    dispatcher.shutdown();
}
