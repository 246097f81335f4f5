//! MD request/reply over a loopback TCP link: lazy connect, header-first
//! reassembly, connection reuse and connect failure.

use std::{
    net::{Ipv4Addr, SocketAddrV4},
    thread,
    time::{Duration, Instant},
};

use trdp::{
    Event, ListenerSpec, MdResult, MdSendSpec, Micros, RequestOpts, Session, SessionConfig,
    SessionUuid, Transport, TransportMask,
};

const LOCALHOST: Ipv4Addr = Ipv4Addr::LOCALHOST;

fn config(tcp_port: u16, udp_port: u16) -> SessionConfig {
    let mut cfg = SessionConfig::default();
    cfg.md.tcp_port = tcp_port;
    cfg.md.udp_port = udp_port;
    cfg
}

#[derive(Debug)]
enum Seen {
    Indication { session: SessionUuid, payload: Vec<u8> },
    Reply { session: SessionUuid, payload: Vec<u8> },
    Finished { session: SessionUuid, result: MdResult },
}

fn pump(session: &mut Session, seen: &mut Vec<Seen>) {
    session
        .process(|ev| match ev {
            Event::MdIndication { info, payload, .. } => {
                seen.push(Seen::Indication { session: info.session, payload: payload.to_vec() });
            }
            Event::MdReply { info, payload } => {
                seen.push(Seen::Reply { session: info.session, payload: payload.to_vec() });
            }
            Event::MdFinished { session, result } => {
                seen.push(Seen::Finished { session, result });
            }
            _ => {}
        })
        .unwrap();
}

fn finished(seen: &[Seen], uuid: SessionUuid) -> Option<MdResult> {
    seen.iter().find_map(|e| match e {
        Seen::Finished { session, result } if *session == uuid => Some(*result),
        _ => None,
    })
}

fn tcp_listener_spec(com_id: u32) -> ListenerSpec {
    ListenerSpec {
        com_id: Some(com_id),
        transports: TransportMask::TCP,
        ..ListenerSpec::default()
    }
}

fn request_spec(com_id: u32, port: u16, payload: &[u8]) -> MdSendSpec<'_> {
    MdSendSpec {
        com_id,
        dest: SocketAddrV4::new(LOCALHOST, port),
        transport: Transport::Tcp,
        payload,
        source_uri: None,
        dest_uri: None,
    }
}

#[test]
fn stream_request_reply_round_trip() {
    let mut replier = Session::open(config(18401, 18402)).unwrap();
    let mut caller = Session::open(config(18403, 18404)).unwrap();

    replier.add_listener(&tcp_listener_spec(6000)).unwrap();
    // Give the listener socket a moment to be ready before connecting.
    pump(&mut replier, &mut Vec::new());

    // A payload large enough to exercise segmented stream reads.
    let big: Vec<u8> = (0..20_000u32).map(|v| v as u8).collect();
    let uuid = caller
        .request(
            &request_spec(6000, 18401, &big),
            RequestOpts {
                expected_replies: 1,
                reply_timeout: Micros::from_secs(2),
                retries: None,
            },
        )
        .unwrap();

    let mut caller_seen = Vec::new();
    let mut replier_seen = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut replied = false;
    while Instant::now() < deadline {
        pump(&mut caller, &mut caller_seen);
        pump(&mut replier, &mut replier_seen);

        if !replied {
            if let Some(Seen::Indication { session, payload }) = replier_seen.first() {
                assert_eq!(payload.as_slice(), big.as_slice());
                replier.reply(*session, b"stream says hi", 0).unwrap();
                replied = true;
            }
        }
        if finished(&caller_seen, uuid).is_some() && finished(&replier_seen, uuid).is_some() {
            break;
        }
        thread::sleep(Duration::from_millis(2));
    }

    let reply = caller_seen
        .iter()
        .find_map(|e| match e {
            Seen::Reply { payload, .. } => Some(payload.clone()),
            _ => None,
        })
        .expect("caller never saw the stream reply");
    assert_eq!(reply, b"stream says hi");
    assert_eq!(finished(&caller_seen, uuid), Some(MdResult::Ok));
    assert_eq!(finished(&replier_seen, uuid), Some(MdResult::Ok));
}

#[test]
fn two_requests_share_one_connection() {
    let mut replier = Session::open(config(18405, 18406)).unwrap();
    let mut caller = Session::open(config(18407, 18408)).unwrap();

    replier.add_listener(&tcp_listener_spec(6001)).unwrap();
    pump(&mut replier, &mut Vec::new());

    let opts = RequestOpts {
        expected_replies: 1,
        reply_timeout: Micros::from_secs(2),
        retries: None,
    };
    let first = caller.request(&request_spec(6001, 18405, b"one"), opts).unwrap();
    let second = caller.request(&request_spec(6001, 18405, b"two"), opts).unwrap();

    let mut caller_seen = Vec::new();
    let mut replier_seen = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut answered: Vec<SessionUuid> = Vec::new();
    while Instant::now() < deadline {
        pump(&mut caller, &mut caller_seen);
        pump(&mut replier, &mut replier_seen);

        let pending: Vec<SessionUuid> = replier_seen
            .iter()
            .filter_map(|e| match e {
                Seen::Indication { session, .. } if !answered.contains(session) => Some(*session),
                _ => None,
            })
            .collect();
        for session in pending {
            replier.reply(session, b"ack", 0).unwrap();
            answered.push(session);
        }
        if finished(&caller_seen, first).is_some() && finished(&caller_seen, second).is_some() {
            break;
        }
        thread::sleep(Duration::from_millis(2));
    }

    assert_eq!(finished(&caller_seen, first), Some(MdResult::Ok));
    assert_eq!(finished(&caller_seen, second), Some(MdResult::Ok));
}

#[test]
fn connect_failure_surfaces_as_no_connection() {
    let mut cfg = config(18409, 18410);
    cfg.md.connect_timeout = Micros::from_millis(300);
    let mut caller = Session::open(cfg).unwrap();

    // Nothing listens on the destination port; the non-blocking connect is
    // refused and the transaction must end in NOCONN.
    let uuid = caller
        .request(
            &request_spec(6002, 18997, b"void"),
            RequestOpts {
                expected_replies: 1,
                reply_timeout: Micros::from_secs(5),
                retries: None,
            },
        )
        .unwrap();

    let mut seen = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline && finished(&seen, uuid).is_none() {
        pump(&mut caller, &mut seen);
        thread::sleep(Duration::from_millis(5));
    }

    assert_eq!(finished(&seen, uuid), Some(MdResult::NoConn));
}
