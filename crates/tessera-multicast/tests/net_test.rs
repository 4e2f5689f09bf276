//! Socket transport over the loopback interface.

use bytes::Bytes;
use std::time::{Duration, Instant};

use tessera_common::{ChannelConfig, ConnId};
use tessera_multicast::{
    Message, MessageType, NetTransport, ReliableMulticastChannel, SystemClock, Transport,
    TransportEvent, MAX_PAYLOAD,
};

/// Polls until `want` message events arrived or five seconds passed.
fn collect(net: &mut NetTransport, want: usize) -> (Vec<TransportEvent>, Vec<(ConnId, Bytes)>) {
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut other = Vec::new();
    let mut messages = Vec::new();
    while messages.len() < want && Instant::now() < deadline {
        for event in net.poll(Some(Duration::from_millis(10))).unwrap() {
            match event {
                TransportEvent::Message { conn, bytes } => messages.push((conn, bytes)),
                event => other.push(event),
            }
        }
    }
    (other, messages)
}

// =============================================================================
// TCP framing
// =============================================================================

#[test]
fn test_tcp_stream_is_split_into_messages() {
    let mut server = NetTransport::new().unwrap();
    let listener = server.listen(0).unwrap();
    let port = server.local_port(listener).unwrap();

    let mut client = NetTransport::new().unwrap();
    let conn = client.connect("127.0.0.1", port).unwrap();

    let sent = vec![
        Message::new(MessageType::GapFill, 3, 17).with_count(1),
        Message::application(3, 18, Bytes::from(vec![b'x'; MAX_PAYLOAD])),
        Message::new(MessageType::TransmitOk, 3, 18),
    ];
    // Written back to back so the reader has to find the boundaries.
    let mut batch = Vec::new();
    for msg in &sent {
        batch.extend_from_slice(&msg.encode().unwrap());
    }
    client.send(conn, &batch).unwrap();

    let (other, messages) = collect(&mut server, sent.len());
    let accepted = match other.as_slice() {
        [TransportEvent::Accepted { listener: l, conn }] if *l == listener => *conn,
        events => panic!("unexpected events {:?}", events),
    };
    let decoded: Vec<Message> = messages
        .iter()
        .map(|(from, bytes)| {
            assert_eq!(*from, accepted);
            Message::decode(bytes).unwrap()
        })
        .collect();
    assert_eq!(decoded, sent);

    // And back the other way.
    let reply = Message::application(3, 17, Bytes::from_static(b"recovered"));
    server.send(accepted, &reply.encode().unwrap()).unwrap();
    let (_, messages) = collect(&mut client, 1);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].0, conn);
    assert_eq!(Message::decode(&messages[0].1).unwrap(), reply);
}

#[test]
fn test_peer_close_is_reported() {
    let mut server = NetTransport::new().unwrap();
    let listener = server.listen(0).unwrap();
    let port = server.local_port(listener).unwrap();

    {
        let mut client = NetTransport::new().unwrap();
        client.connect("127.0.0.1", port).unwrap();
        // Dropping the transport closes the socket.
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut events = Vec::new();
    while !events.iter().any(|e| matches!(e, TransportEvent::Closed { .. }))
        && Instant::now() < deadline
    {
        events.extend(server.poll(Some(Duration::from_millis(10))).unwrap());
    }
    assert!(matches!(events[0], TransportEvent::Accepted { .. }));
    assert!(events
        .iter()
        .any(|e| matches!(e, TransportEvent::Closed { .. })));
}

#[test]
fn test_channel_recovery_connection_failure() {
    let mut server = NetTransport::new().unwrap();
    let listener = server.listen(0).unwrap();
    let port = server.local_port(listener).unwrap();
    drop(server);

    let mut channel =
        ReliableMulticastChannel::new(ChannelConfig::default(), NetTransport::new().unwrap(), SystemClock::new())
            .unwrap();
    assert!(channel.add_recovery_to_stream(5, "127.0.0.1", port).is_err());
    assert!(channel.stream_state(5).is_none());
    assert!(channel.setup_multicast("", "10.1.1.1", 30500, 1).is_err());
    assert!(!channel.is_publisher());
}

// =============================================================================
// Multicast
// =============================================================================

#[test]
#[ignore = "needs a multicast-capable loopback interface"]
fn test_multicast_loopback_delivery() {
    let group = "239.255.42.99";
    let mut publisher = ReliableMulticastChannel::new(
        ChannelConfig {
            sender_id: "pub".to_string(),
            ..Default::default()
        },
        NetTransport::new().unwrap(),
        SystemClock::new(),
    )
    .unwrap();
    publisher.setup_multicast("127.0.0.1", group, 30600, 9).unwrap();
    publisher.setup_gap_fill(0).unwrap();
    let gap_fill_port = publisher.gap_fill_port().unwrap();

    let mut subscriber =
        ReliableMulticastChannel::new(ChannelConfig::default(), NetTransport::new().unwrap(), SystemClock::new())
            .unwrap();
    subscriber
        .setup_multicast("127.0.0.1", group, 30600, 0)
        .unwrap();
    subscriber
        .add_recovery_to_stream(9, "127.0.0.1", gap_fill_port)
        .unwrap();

    for i in 0..20 {
        assert!(publisher.publish_msg(format!("n{}", i).as_bytes()));
    }

    let deadline = Instant::now() + Duration::from_secs(10);
    let mut received = Vec::new();
    while received.len() < 20 && Instant::now() < deadline {
        publisher.process();
        subscriber.process();
        while let Some(msg) = subscriber.get_next_msg_by_index(9) {
            received.push(msg.sequence);
        }
    }
    assert_eq!(received, (0..20).collect::<Vec<_>>());
}
