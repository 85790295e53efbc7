use std::time::Duration;

use cqrpc::{
    ErrorKind, FinishStatus, Payload, Reactor, ReactorConfig, Server, StreamEndpoint,
    StreamState, Transport,
    mem::{MemCompletionQueue, MemTransport},
};

fn step(server: &Server) {
    server.reactor().run_for(Duration::ZERO);
}

#[test]
fn test_stream_exchange_and_self_heal() {
    let _ = tracing_subscriber::fmt().try_init();

    let queue = MemCompletionQueue::create();
    let transport = MemTransport::create(queue.clone());
    let mut server = Server::create(queue, transport.clone(), &ReactorConfig::default());
    let feed = server.register_stream("Feed/subscribe");

    assert_eq!(feed.state(), StreamState::Inactive);
    server.start();
    step(&server);
    assert_eq!(feed.state(), StreamState::Listening);

    let ticket = transport.open_stream("Feed/subscribe");
    step(&server);
    assert_eq!(feed.state(), StreamState::WaitingForAvailableData);

    // Nothing has been written yet, so nothing comes back.
    assert!(feed.exchange_data(Payload::from(&b"a"[..])).is_none());
    step(&server);
    assert_eq!(feed.state(), StreamState::WaitingForWriteDone);
    step(&server);
    assert_eq!(feed.state(), StreamState::WaitingForAvailableData);

    // Round trip: the returned buffer was handed to the transport before
    // coming back.
    let back = feed.exchange_data(Payload::from(&b"b"[..])).unwrap();
    assert_eq!(back.as_slice(), b"a");
    step(&server);
    step(&server);

    // Last value wins: "c" is replaced before any write happens and is
    // never transmitted, never returned.
    let back = feed.exchange_data(Payload::from(&b"c"[..])).unwrap();
    assert_eq!(back.as_slice(), b"b");
    assert!(feed.exchange_data(Payload::from(&b"d"[..])).is_none());
    step(&server);
    step(&server);

    let received = ticket.received();
    let received: Vec<&[u8]> = received.iter().map(|p| p.as_slice()).collect();
    assert_eq!(received, vec![&b"a"[..], &b"b"[..], &b"d"[..]]);

    // Client cancellation: exactly one Finish(Cancelled), then the endpoint
    // heals back to Listening for the next subscriber.
    ticket.cancel();
    step(&server);
    assert_eq!(feed.state(), StreamState::Cancelled);
    assert_eq!(ticket.finish_status(), Some(Ok(FinishStatus::Cancelled)));
    step(&server);
    assert_eq!(feed.state(), StreamState::Listening);

    let second = transport.open_stream("Feed/subscribe");
    step(&server);
    assert_eq!(feed.state(), StreamState::WaitingForAvailableData);
    feed.exchange_data(Payload::from(&b"e"[..]));
    step(&server);
    step(&server);
    assert_eq!(second.received().len(), 1);

    server.stop().unwrap();
    assert_eq!(feed.state(), StreamState::Inactive);
    assert_eq!(server.reactor().outstanding_tags(), 0);
}

#[test]
fn test_graceful_stop_finishes_stream() {
    let queue = MemCompletionQueue::create();
    let transport = MemTransport::create(queue.clone());
    let mut server = Server::create(queue, transport.clone(), &ReactorConfig::default());
    let feed = server.register_stream("Feed/subscribe");

    server.start();
    step(&server);

    // Stop while only listening is a no-op.
    feed.stop();
    step(&server);
    assert_eq!(feed.state(), StreamState::Listening);

    let ticket = transport.open_stream("Feed/subscribe");
    step(&server);
    assert_eq!(feed.state(), StreamState::WaitingForAvailableData);

    feed.stop();
    step(&server);
    assert_eq!(feed.state(), StreamState::Stopping);
    assert_eq!(ticket.finish_status(), Some(Ok(FinishStatus::Ok)));
    step(&server);
    assert_eq!(feed.state(), StreamState::Inactive);

    server.stop().unwrap();
}

#[test]
fn test_shutdown_while_streaming() {
    let queue = MemCompletionQueue::create();
    let transport = MemTransport::create(queue.clone());
    let mut server = Server::create(queue, transport.clone(), &ReactorConfig::default());
    let feed = server.register_stream("Feed/subscribe");

    server.start();
    step(&server);
    let ticket = transport.open_stream("Feed/subscribe");
    step(&server);
    feed.exchange_data(Payload::from(&b"x"[..]));
    step(&server);

    server.stop().unwrap();
    assert_eq!(feed.state(), StreamState::Inactive);
    assert_eq!(ticket.finish_status(), Some(Ok(FinishStatus::Ok)));
    assert_eq!(server.reactor().outstanding_tags(), 0);
}

#[test]
fn test_shutdown_requires_transport_teardown() {
    let config = ReactorConfig {
        shutdown_poll_ms: 1,
        shutdown_max_polls: 10,
        ..ReactorConfig::default()
    };
    let queue = MemCompletionQueue::create();
    let transport = MemTransport::create(queue.clone());
    let reactor = Reactor::create(queue, &config);
    let feed = StreamEndpoint::create(&reactor, transport.clone(), "Feed/subscribe");

    feed.start();
    reactor.run_for(Duration::ZERO);
    assert_eq!(feed.state(), StreamState::Listening);

    // With the transport still accepting, the outstanding accept never
    // fails and the bounded busy-poll gives up.
    let err = feed.shutdown().unwrap_err();
    assert_eq!(err.kind, ErrorKind::ShutdownTimeout);

    Transport::shutdown(&*transport);
    feed.shutdown().unwrap();
    assert_eq!(feed.state(), StreamState::Inactive);

    reactor.shutdown();
    assert_eq!(reactor.outstanding_tags(), 0);
}

#[test]
fn test_pending_data_survives_cancel() {
    let queue = MemCompletionQueue::create();
    let transport = MemTransport::create(queue.clone());
    let mut server = Server::create(queue, transport.clone(), &ReactorConfig::default());
    let feed = server.register_stream("Feed/subscribe");

    server.start();
    step(&server);
    let ticket = transport.open_stream("Feed/subscribe");
    step(&server);

    // Exchange a value but cancel before the check alarm drains it.
    feed.exchange_data(Payload::from(&b"latest"[..]));
    ticket.cancel();
    step(&server); // teardown and check alarm both fire; the stream is gone
    step(&server); // finish completion heals back to Listening
    assert_eq!(feed.state(), StreamState::Listening);

    // The latest value is still pending and reaches the next subscriber.
    let second = transport.open_stream("Feed/subscribe");
    step(&server); // accept pumps the pending message
    step(&server);
    let received = second.received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].as_slice(), b"latest");

    server.stop().unwrap();
}
