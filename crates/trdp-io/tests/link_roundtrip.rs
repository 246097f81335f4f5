//! TcpLink framing over a real loopback connection: header-first
//! reassembly across partial reads, ordered delivery, and both link
//! directions on one stream.

use std::{
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    thread,
    time::{Duration, Instant},
};

use mio::{Events, Interest, Poll, Token, net::TcpListener};
use trdp_io::{LinkState, TcpLink, connect_nonblocking};
use trdp_wire::{MdHeader, MdMsgType, SessionUuid, Uri};

const CLIENT: Token = Token(1);
const SERVER_LISTEN: Token = Token(2);
const SERVER_LINK: Token = Token(3);

fn frame(com_id: u32, payload: &[u8]) -> Vec<u8> {
    let header = MdHeader {
        seq: 0,
        msg_type: MdMsgType::Notify,
        com_id,
        etb_topo: 0,
        op_topo: 0,
        reply_status: 0,
        session_id: SessionUuid([7; 16]),
        reply_timeout_us: 0,
        num_replies: 0,
        source_uri: Uri::new("devA"),
        dest_uri: Uri::new("devB"),
    };
    let mut out = Vec::new();
    header.encode(payload, &mut out);
    out
}

struct Pair {
    client_poll: Poll,
    server_poll: Poll,
    client: TcpLink,
    server: TcpLink,
}

/// Connect a client link to a freshly accepted server link.
fn connected_pair() -> Pair {
    let client_poll = Poll::new().unwrap();
    let mut server_poll = Poll::new().unwrap();

    let mut listener =
        TcpListener::bind(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))).unwrap();
    let addr = match listener.local_addr().unwrap() {
        SocketAddr::V4(addr) => addr,
        SocketAddr::V6(_) => unreachable!("bound v4"),
    };
    server_poll.registry().register(&mut listener, SERVER_LISTEN, Interest::READABLE).unwrap();

    let stream = connect_nonblocking(addr).unwrap();
    let client = TcpLink::outbound(stream, addr, CLIENT, client_poll.registry()).unwrap();

    let mut events = Events::with_capacity(8);
    let deadline = Instant::now() + Duration::from_secs(2);
    let server = loop {
        assert!(Instant::now() < deadline, "accept timed out");
        server_poll.poll(&mut events, Some(Duration::from_millis(10))).unwrap();
        match listener.accept() {
            Ok((stream, SocketAddr::V4(peer))) => {
                break TcpLink::inbound(stream, peer, SERVER_LINK, server_poll.registry()).unwrap();
            }
            Ok(_) => unreachable!("v4 listener"),
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) => panic!("accept failed: {e}"),
        }
    };

    Pair { client_poll, server_poll, client, server }
}

/// Poll one side until `want` frames arrived or the deadline passes.
fn collect(poll: &mut Poll, link: &mut TcpLink, want: usize, limit: Duration) -> Vec<Vec<u8>> {
    let mut events = Events::with_capacity(8);
    let mut frames: Vec<Vec<u8>> = Vec::new();
    let deadline = Instant::now() + limit;
    while frames.len() < want && Instant::now() < deadline {
        poll.poll(&mut events, Some(Duration::from_millis(10))).unwrap();
        for ev in events.iter() {
            let state = link.poll_with(poll.registry(), ev, &mut |_token, frame| {
                frames.push(frame.to_vec());
            });
            assert_eq!(state, LinkState::Alive);
        }
    }
    frames
}

/// Poll once, draining writable events so queued remainders flush.
fn drain(poll: &mut Poll, link: &mut TcpLink) {
    let mut events = Events::with_capacity(8);
    poll.poll(&mut events, Some(Duration::from_millis(2))).unwrap();
    for ev in events.iter() {
        let _ = link.poll_with(poll.registry(), ev, &mut |_, _| {});
    }
}

#[test]
fn frames_survive_segmented_reads() {
    let mut pair = connected_pair();

    // One small frame, one big enough that the kernel is certain to split
    // it across several reads, then a small trailer frame.
    let big: Vec<u8> = (0..60_000u32).map(|v| (v >> 3) as u8).collect();
    let sent =
        [frame(1, b"first"), frame(2, &big), frame(3, b"last")];
    for f in &sent {
        assert_eq!(pair.client.send_or_enqueue(pair.client_poll.registry(), f), LinkState::Alive);
    }

    let mut got: Vec<Vec<u8>> = Vec::new();
    let mut events = Events::with_capacity(8);
    let deadline = Instant::now() + Duration::from_secs(3);
    while got.len() < 3 && Instant::now() < deadline {
        drain(&mut pair.client_poll, &mut pair.client);
        pair.server_poll.poll(&mut events, Some(Duration::from_millis(10))).unwrap();
        for ev in events.iter() {
            let state = pair.server.poll_with(pair.server_poll.registry(), ev, &mut |_t, f| {
                got.push(f.to_vec());
            });
            assert_eq!(state, LinkState::Alive);
        }
    }
    assert_eq!(got.len(), 3, "frames were merged or lost");
    for (wire, original) in got.iter().zip(&sent) {
        assert_eq!(wire, original);
        // Each delivered frame parses back cleanly.
        let (header, _) = MdHeader::parse(wire, 0, 0).unwrap();
        assert_eq!(header.session_id, SessionUuid([7; 16]));
    }
}

#[test]
fn both_directions_share_the_stream() {
    let mut pair = connected_pair();

    pair.client.send_or_enqueue(pair.client_poll.registry(), &frame(10, b"ping"));
    let mut inbound: Vec<Vec<u8>> = Vec::new();
    let mut events = Events::with_capacity(8);
    let deadline = Instant::now() + Duration::from_secs(2);
    while inbound.is_empty() && Instant::now() < deadline {
        // The client may still be completing its connect; keep flushing.
        drain(&mut pair.client_poll, &mut pair.client);
        pair.server_poll.poll(&mut events, Some(Duration::from_millis(10))).unwrap();
        for ev in events.iter() {
            let _ = pair.server.poll_with(pair.server_poll.registry(), ev, &mut |_t, f| {
                inbound.push(f.to_vec());
            });
        }
    }
    assert_eq!(inbound.len(), 1);

    pair.server.send_or_enqueue(pair.server_poll.registry(), &frame(11, b"pong"));
    let outbound = collect(&mut pair.client_poll, &mut pair.client, 1, Duration::from_secs(2));
    assert_eq!(outbound.len(), 1);
    let (header, payload) = MdHeader::parse(&outbound[0], 0, 0).unwrap();
    assert_eq!(header.com_id, 11);
    assert_eq!(payload, b"pong");
}

#[test]
fn half_close_is_reported_as_closed() {
    let mut pair = connected_pair();
    drop(pair.client);
    thread::sleep(Duration::from_millis(50));

    let mut events = Events::with_capacity(8);
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        assert!(Instant::now() < deadline, "close never surfaced");
        pair.server_poll.poll(&mut events, Some(Duration::from_millis(10))).unwrap();
        let mut closed = false;
        for ev in events.iter() {
            if pair.server.poll_with(pair.server_poll.registry(), ev, &mut |_, _| {}) ==
                LinkState::Closed
            {
                closed = true;
            }
        }
        if closed {
            break;
        }
    }
}
