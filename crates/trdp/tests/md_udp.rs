//! MD request/reply over loopback UDP: plain replies, reply-query with and
//! without confirm, reply timeouts with retries.

use std::{
    net::{Ipv4Addr, SocketAddrV4},
    thread,
    time::{Duration, Instant},
};

use trdp::{
    Event, ListenerSpec, MdResult, MdSendSpec, Micros, RequestOpts, Session, SessionConfig,
    SessionUuid, Transport,
};

const LOCALHOST: Ipv4Addr = Ipv4Addr::LOCALHOST;

fn config(md_udp_port: u16) -> SessionConfig {
    let mut cfg = SessionConfig::default();
    cfg.md.udp_port = md_udp_port;
    cfg
}

#[derive(Debug)]
enum Seen {
    Indication { session: SessionUuid, payload: Vec<u8> },
    Reply { session: SessionUuid, payload: Vec<u8>, requires_confirm: bool },
    Finished { session: SessionUuid, result: MdResult },
}

fn pump(session: &mut Session, seen: &mut Vec<Seen>) {
    session
        .process(|ev| match ev {
            Event::MdIndication { info, payload, .. } => {
                seen.push(Seen::Indication { session: info.session, payload: payload.to_vec() });
            }
            Event::MdReply { info, payload } => seen.push(Seen::Reply {
                session: info.session,
                payload: payload.to_vec(),
                requires_confirm: info.requires_confirm,
            }),
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

#[test]
fn request_reply_round_trip() {
    let mut caller = Session::open(config(18301)).unwrap();
    let mut replier = Session::open(config(18302)).unwrap();

    replier.add_listener(&ListenerSpec::for_com_id(2000)).unwrap();

    let uuid = caller
        .request(
            &MdSendSpec {
                com_id: 2000,
                dest: SocketAddrV4::new(LOCALHOST, 18302),
                transport: Transport::Udp,
                payload: b"HELLO",
                source_uri: None,
                dest_uri: None,
            },
            RequestOpts {
                expected_replies: 1,
                reply_timeout: Micros::from_secs(1),
                retries: Some(0),
            },
        )
        .unwrap();

    let mut caller_seen = Vec::new();
    let mut replier_seen = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(3);
    let mut replied = false;
    while Instant::now() < deadline {
        pump(&mut caller, &mut caller_seen);
        pump(&mut replier, &mut replier_seen);

        if !replied {
            if let Some(Seen::Indication { session, payload }) = replier_seen.first() {
                assert_eq!(payload.as_slice(), b"HELLO");
                assert_eq!(*session, uuid);
                replier.reply(*session, b"Maleikum Salam", 0).unwrap();
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
            Seen::Reply { payload, requires_confirm, .. } => Some((payload, *requires_confirm)),
            _ => None,
        })
        .expect("caller never saw the reply");
    assert_eq!(reply.0.as_slice(), b"Maleikum Salam");
    assert!(!reply.1, "plain reply must not demand a confirm");

    assert_eq!(finished(&caller_seen, uuid), Some(MdResult::Ok));
    assert_eq!(finished(&replier_seen, uuid), Some(MdResult::Ok));
}

#[test]
fn reply_query_confirmed_in_time() {
    let mut caller = Session::open(config(18303)).unwrap();
    let mut replier = Session::open(config(18304)).unwrap();

    replier.add_listener(&ListenerSpec::for_com_id(3000)).unwrap();

    let uuid = caller
        .request(
            &MdSendSpec {
                com_id: 3000,
                dest: SocketAddrV4::new(LOCALHOST, 18304),
                transport: Transport::Udp,
                payload: b"need ack",
                source_uri: None,
                dest_uri: None,
            },
            RequestOpts {
                expected_replies: 1,
                reply_timeout: Micros::from_secs(1),
                retries: Some(0),
            },
        )
        .unwrap();

    let mut caller_seen = Vec::new();
    let mut replier_seen = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(3);
    let mut replied = false;
    let mut confirmed = false;
    while Instant::now() < deadline {
        pump(&mut caller, &mut caller_seen);
        pump(&mut replier, &mut replier_seen);

        if !replied {
            if let Some(Seen::Indication { session, .. }) = replier_seen.first() {
                replier
                    .reply_query(*session, b"confirm me", 0, Micros::from_millis(500))
                    .unwrap();
                replied = true;
            }
        }
        if !confirmed {
            let query = caller_seen.iter().any(
                |e| matches!(e, Seen::Reply { requires_confirm: true, session, .. } if *session == uuid),
            );
            if query {
                caller.confirm(uuid, 0).unwrap();
                confirmed = true;
            }
        }
        if finished(&replier_seen, uuid).is_some() {
            break;
        }
        thread::sleep(Duration::from_millis(2));
    }

    assert_eq!(finished(&caller_seen, uuid), Some(MdResult::Ok));
    assert_eq!(finished(&replier_seen, uuid), Some(MdResult::Ok));
    assert_eq!(replier.stats().md.confirm_timeouts, 0);
}

#[test]
fn withheld_confirm_times_out_on_replier_only() {
    let mut caller = Session::open(config(18305)).unwrap();
    let mut replier = Session::open(config(18306)).unwrap();

    replier.add_listener(&ListenerSpec::for_com_id(3001)).unwrap();

    let uuid = caller
        .request(
            &MdSendSpec {
                com_id: 3001,
                dest: SocketAddrV4::new(LOCALHOST, 18306),
                transport: Transport::Udp,
                payload: b"no ack coming",
                source_uri: None,
                dest_uri: None,
            },
            RequestOpts {
                expected_replies: 1,
                reply_timeout: Micros::from_secs(1),
                retries: Some(0),
            },
        )
        .unwrap();

    let mut caller_seen = Vec::new();
    let mut replier_seen = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(4);
    let mut replied = false;
    while Instant::now() < deadline {
        pump(&mut caller, &mut caller_seen);
        pump(&mut replier, &mut replier_seen);

        if !replied {
            if let Some(Seen::Indication { session, .. }) = replier_seen.first() {
                replier
                    .reply_query(*session, b"confirm me", 0, Micros::from_millis(300))
                    .unwrap();
                replied = true;
            }
        }
        // The caller deliberately never confirms.
        if finished(&replier_seen, uuid).is_some() {
            break;
        }
        thread::sleep(Duration::from_millis(2));
    }

    // The replier reports the missing confirm; the caller saw its reply and
    // terminates successfully.
    assert_eq!(finished(&replier_seen, uuid), Some(MdResult::ConfirmTimeout));
    assert_eq!(finished(&caller_seen, uuid), Some(MdResult::Ok));

    // The caller's side of the withheld confirm is visible in its stats.
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline && caller.stats().md.req_confirm_timeouts == 0 {
        pump(&mut caller, &mut caller_seen);
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(caller.stats().md.req_confirm_timeouts, 1);
}

#[test]
fn unanswered_request_retries_then_times_out() {
    let mut caller = Session::open(config(18307)).unwrap();

    // Nothing listens on the destination port.
    let uuid = caller
        .request(
            &MdSendSpec {
                com_id: 5000,
                dest: SocketAddrV4::new(LOCALHOST, 18999),
                transport: Transport::Udp,
                payload: b"anyone?",
                source_uri: None,
                dest_uri: None,
            },
            RequestOpts {
                expected_replies: 1,
                reply_timeout: Micros::from_millis(300),
                retries: Some(2),
            },
        )
        .unwrap();

    let mut seen = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline && finished(&seen, uuid).is_none() {
        pump(&mut caller, &mut seen);
        thread::sleep(Duration::from_millis(5));
    }

    assert_eq!(finished(&seen, uuid), Some(MdResult::ReplyTimeout));
    let stats = caller.stats();
    assert_eq!(stats.md.retries, 2, "both retransmissions go out before the deadline");
    assert_eq!(stats.md.reply_timeouts, 1);

    // Terminal events are delivered exactly once.
    for _ in 0..10 {
        pump(&mut caller, &mut seen);
        thread::sleep(Duration::from_millis(2));
    }
    let terminals = seen
        .iter()
        .filter(|e| matches!(e, Seen::Finished { session, .. } if *session == uuid))
        .count();
    assert_eq!(terminals, 1);
}

#[test]
fn aborted_session_reports_terminal_on_next_process() {
    let mut caller = Session::open(config(18308)).unwrap();

    let uuid = caller
        .request(
            &MdSendSpec {
                com_id: 5001,
                dest: SocketAddrV4::new(LOCALHOST, 18998),
                transport: Transport::Udp,
                payload: b"going nowhere",
                source_uri: None,
                dest_uri: None,
            },
            RequestOpts {
                expected_replies: 1,
                reply_timeout: Micros::from_secs(5),
                retries: Some(0),
            },
        )
        .unwrap();

    caller.abort(uuid).unwrap();
    assert_eq!(caller.abort(uuid), Ok(()), "abort before the sweep still finds the session");

    let mut seen = Vec::new();
    pump(&mut caller, &mut seen);
    assert_eq!(finished(&seen, uuid), Some(MdResult::Aborted));
    assert_eq!(caller.abort(uuid), Err(trdp::Error::NoSession));
}
