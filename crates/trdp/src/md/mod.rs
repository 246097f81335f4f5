//! Message-data engine: listener table, transaction state machine, UDP
//! retries and the per-peer TCP connection pool.

mod listener;
mod transaction;
mod uuid;

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use indexmap::IndexMap;
pub use listener::{ListenerSpec, Transport, TransportMask};
pub(crate) use listener::Listener;
use mio::{Interest, Token, event::Event as MioEvent, net::TcpListener};
use tracing::{debug, trace, warn};
pub(crate) use transaction::{Role, Transaction, TxState};
use trdp_io::{LinkState, Proto, SockKey, TcpLink, connect_nonblocking};
use trdp_timing::Micros;
use trdp_wire::{MD_MAX_PAYLOAD, MdHeader, MdMsgType, SessionUuid, Uri, WireError};
use uuid::UuidGen;

use crate::{
    Error, Event, MdInfo, MdResult, Result,
    handle::{ListenerId, Slab},
    session::{Ctx, SockUse},
};

/// Token namespace for TCP data links.
pub(crate) const TCP_LINK_BASE: usize = 0x1000_0000;
/// Token of the MD TCP accept socket.
pub(crate) const TCP_LISTEN: Token = Token(0x2000_0000);

/// Largest MD payload that fits one datagram next to the 120-byte header
/// and the FCS trailer.
pub const MD_MAX_UDP_PAYLOAD: usize = 1356;

/// Parameters shared by `notify` and `request`.
pub struct MdSendSpec<'a> {
    pub com_id: u32,
    pub dest: SocketAddrV4,
    pub transport: Transport,
    pub payload: &'a [u8],
    pub source_uri: Option<Uri>,
    pub dest_uri: Option<Uri>,
}

/// Caller-side knobs for `request`.
#[derive(Copy, Clone, Debug, Default)]
pub struct RequestOpts {
    /// Number of repliers to wait for; 0 = unknown, collect until timeout.
    pub expected_replies: u32,
    /// Zero applies the session default.
    pub reply_timeout: Micros,
    /// UDP retransmissions; `None` applies the session default. Ignored on
    /// TCP.
    pub retries: Option<u32>,
}

struct LinkSlot {
    link: TcpLink,
    opened_at: Micros,
}

pub(crate) struct MdEngine {
    listeners: Slab<Listener>,
    transactions: IndexMap<SessionUuid, Transaction>,
    links: Vec<Option<LinkSlot>>,
    tcp_listener: Option<TcpListener>,
    udp_sock: Option<Token>,
    uuid_gen: UuidGen,
    seq: u32,
}

impl MdEngine {
    pub fn new(node_mac: Option<[u8; 6]>) -> Self {
        Self {
            listeners: Slab::default(),
            transactions: IndexMap::new(),
            links: Vec::new(),
            tcp_listener: None,
            udp_sock: None,
            uuid_gen: UuidGen::new(node_mac),
            seq: 0,
        }
    }

    pub fn udp_token(&self) -> Option<Token> {
        self.udp_sock
    }

    /// Com-id of an open transaction, for marshalling replies.
    pub fn com_id_of(&self, uuid: SessionUuid) -> Result<u32> {
        self.transactions.get(&uuid).map(|txn| txn.com_id).ok_or(Error::NoSession)
    }

    /* ----------------------------- listeners ---------------------------- */

    pub fn add_listener(&mut self, spec: &ListenerSpec, ctx: &mut Ctx<'_>) -> Result<ListenerId> {
        if spec.transports.is_empty() {
            return Err(Error::Param);
        }
        if let Some(group) = spec.dest {
            if !group.is_multicast() {
                return Err(Error::Param);
            }
        }
        if spec.transports.contains(TransportMask::UDP) {
            self.ensure_udp(ctx)?;
        }
        if spec.transports.contains(TransportMask::TCP) {
            self.ensure_tcp_listener(ctx)?;
        }

        let mut join = None;
        if let Some(group) = spec.dest {
            let iface = spec.iface.unwrap_or(ctx.own_ip);
            let udp = self.udp_sock.ok_or(Error::State)?;
            ctx.sockets.join(udp, group, iface)?;
            join = Some((group, iface));
        }

        let src_range = spec.src_range.unwrap_or((Ipv4Addr::UNSPECIFIED, Ipv4Addr::UNSPECIFIED));
        let (idx, generation) = self.listeners.insert(Listener {
            id: ListenerId { idx: 0, generation: 0 },
            com_id: spec.com_id,
            src_lo: src_range.0,
            src_hi: src_range.1,
            dest: spec.dest,
            source_uri: spec.source_uri.unwrap_or_default(),
            dest_uri: spec.dest_uri.unwrap_or_default(),
            transports: spec.transports,
            join,
        });
        let id = ListenerId { idx, generation };
        self.listeners.get_mut(idx, generation).expect("fresh listener").id = id;
        debug!(com_id = ?spec.com_id, transports = ?spec.transports, "listener added");
        Ok(id)
    }

    pub fn del_listener(&mut self, id: ListenerId, ctx: &mut Ctx<'_>) -> Result<()> {
        let listener = self.listeners.remove(id.idx, id.generation).ok_or(Error::NoList)?;
        if let (Some((group, iface)), Some(udp)) = (listener.join, self.udp_sock) {
            ctx.sockets.leave(udp, group, iface);
        }
        Ok(())
    }

    /* ------------------------------ caller ------------------------------- */

    /// Fire-and-forget notification. No session is retained; send
    /// completion terminates the exchange.
    pub fn notify(&mut self, spec: &MdSendSpec<'_>, now: Micros, ctx: &mut Ctx<'_>) -> Result<()> {
        self.check_payload(spec)?;
        let uuid = self.uuid_gen.next(now);
        let header = self.header(MdMsgType::Notify, spec, uuid, 0, 0, ctx.etb_topo, ctx.op_topo);
        header.encode(spec.payload, ctx.frame);
        self.send_encoded(spec.transport, spec.dest, None, now, ctx)?;
        ctx.stats.md.sent += 1;
        Ok(())
    }

    /// Open a caller transaction and send the request.
    pub fn request(
        &mut self,
        spec: &MdSendSpec<'_>,
        opts: RequestOpts,
        now: Micros,
        ctx: &mut Ctx<'_>,
    ) -> Result<SessionUuid> {
        self.check_payload(spec)?;
        if self.transactions.len() >= ctx.cfg.md.max_sessions {
            return Err(Error::QueueFull);
        }

        let reply_timeout =
            if opts.reply_timeout.is_zero() { ctx.cfg.md.reply_timeout } else { opts.reply_timeout };
        let uuid = self.uuid_gen.next(now);
        let header = self.header(
            MdMsgType::Request,
            spec,
            uuid,
            reply_timeout.0.min(u32::MAX as u64) as u32,
            opts.expected_replies,
            ctx.etb_topo,
            ctx.op_topo,
        );
        header.encode(spec.payload, ctx.frame);

        // UDP requests keep the encoded frame for retransmission.
        let (tx_frame, retries, retry_interval) = match spec.transport {
            Transport::Udp => {
                let retries = opts.retries.unwrap_or(ctx.cfg.md.send_param.retries);
                let block = ctx.pool.alloc(ctx.frame.len())?;
                if let Err(err) = ctx.pool.write(block, ctx.frame) {
                    ctx.pool.free(block);
                    return Err(err.into());
                }
                (Some(block), retries, reply_timeout / (retries + 1))
            }
            Transport::Tcp => (None, 0, Micros::ZERO),
        };

        let link = match self.send_encoded(spec.transport, spec.dest, None, now, ctx) {
            Ok(link) => link,
            Err(err) => {
                if let Some(block) = tx_frame {
                    ctx.pool.free(block);
                }
                return Err(err);
            }
        };

        self.transactions.insert(uuid, Transaction {
            uuid,
            role: Role::Caller,
            state: TxState::WaitReply,
            com_id: spec.com_id,
            peer: spec.dest,
            transport: spec.transport,
            peer_uri: spec.dest_uri.unwrap_or_default(),
            own_uri: spec.source_uri.unwrap_or_default(),
            expected: opts.expected_replies,
            received: 0,
            deadline: now + reply_timeout,
            retry_interval,
            next_retry: (retries > 0 && spec.transport == Transport::Udp)
                .then(|| now + retry_interval),
            retries_left: retries,
            tx_frame,
            link,
            confirm_pending: false,
            confirm_deadline: Micros::MAX,
        });
        ctx.stats.md.sent += 1;
        debug!(com_id = spec.com_id, session = ?uuid, "request sent");
        Ok(uuid)
    }

    /// Send the confirm owed after an 'Mq' reply.
    pub fn confirm(
        &mut self,
        uuid: SessionUuid,
        status: i32,
        now: Micros,
        ctx: &mut Ctx<'_>,
    ) -> Result<()> {
        let txn = self.transactions.get_mut(&uuid).ok_or(Error::NoSession)?;
        if txn.role != Role::Caller || !txn.confirm_pending {
            return Err(Error::State);
        }
        let header = MdHeader {
            seq: self.seq,
            msg_type: MdMsgType::Confirm,
            com_id: txn.com_id,
            etb_topo: ctx.etb_topo,
            op_topo: ctx.op_topo,
            reply_status: status,
            session_id: uuid,
            reply_timeout_us: 0,
            num_replies: 0,
            source_uri: txn.own_uri,
            dest_uri: txn.peer_uri,
        };
        self.seq = self.seq.wrapping_add(1);
        header.encode(&[], ctx.frame);

        let (transport, peer, link, done) =
            (txn.transport, txn.peer, txn.link, txn.state == TxState::ConfirmPending);
        self.send_encoded(transport, peer, link, now, ctx)?;
        ctx.stats.md.sent += 1;

        let txn = self.transactions.get_mut(&uuid).ok_or(Error::NoSession)?;
        txn.confirm_pending = false;
        if done {
            // Terminal was already reported when the replies completed.
            self.drop_transaction(uuid, ctx);
        }
        Ok(())
    }

    /// Abort a session; the terminal event fires on the next `process`.
    pub fn abort(&mut self, uuid: SessionUuid) -> Result<()> {
        let txn = self.transactions.get_mut(&uuid).ok_or(Error::NoSession)?;
        txn.state = TxState::Finished(MdResult::Aborted);
        txn.deadline = Micros::ZERO;
        Ok(())
    }

    /* ------------------------------ replier ------------------------------ */

    pub fn reply(
        &mut self,
        uuid: SessionUuid,
        payload: &[u8],
        status: i32,
        now: Micros,
        ctx: &mut Ctx<'_>,
    ) -> Result<()> {
        self.respond(uuid, MdMsgType::Reply, payload, status, Micros::ZERO, now, ctx)
    }

    /// Reply demanding a confirmation within `confirm_timeout`.
    pub fn reply_query(
        &mut self,
        uuid: SessionUuid,
        payload: &[u8],
        status: i32,
        confirm_timeout: Micros,
        now: Micros,
        ctx: &mut Ctx<'_>,
    ) -> Result<()> {
        let timeout =
            if confirm_timeout.is_zero() { ctx.cfg.md.confirm_timeout } else { confirm_timeout };
        self.respond(uuid, MdMsgType::ReplyQuery, payload, status, timeout, now, ctx)
    }

    pub fn reply_err(
        &mut self,
        uuid: SessionUuid,
        status: i32,
        now: Micros,
        ctx: &mut Ctx<'_>,
    ) -> Result<()> {
        self.respond(uuid, MdMsgType::Error, &[], status, Micros::ZERO, now, ctx)
    }

    fn respond(
        &mut self,
        uuid: SessionUuid,
        msg_type: MdMsgType,
        payload: &[u8],
        status: i32,
        confirm_timeout: Micros,
        now: Micros,
        ctx: &mut Ctx<'_>,
    ) -> Result<()> {
        let txn = self.transactions.get_mut(&uuid).ok_or(Error::NoSession)?;
        if txn.role != Role::Replier || txn.state != TxState::AwaitApp {
            return Err(Error::State);
        }
        if txn.transport == Transport::Udp && payload.len() > MD_MAX_UDP_PAYLOAD ||
            payload.len() > MD_MAX_PAYLOAD
        {
            return Err(Error::Param);
        }

        let header = MdHeader {
            seq: self.seq,
            msg_type,
            com_id: txn.com_id,
            etb_topo: ctx.etb_topo,
            op_topo: ctx.op_topo,
            reply_status: status,
            session_id: uuid,
            reply_timeout_us: confirm_timeout.0.min(u32::MAX as u64) as u32,
            num_replies: 0,
            source_uri: txn.own_uri,
            dest_uri: txn.peer_uri,
        };
        self.seq = self.seq.wrapping_add(1);
        header.encode(payload, ctx.frame);

        let (transport, peer, link) = (txn.transport, txn.peer, txn.link);
        self.send_encoded(transport, peer, link, now, ctx)?;
        ctx.stats.md.sent += 1;

        let txn = self.transactions.get_mut(&uuid).ok_or(Error::NoSession)?;
        if msg_type == MdMsgType::ReplyQuery {
            txn.state = TxState::WaitConfirm;
            txn.deadline = now + confirm_timeout;
        } else {
            txn.state = TxState::Finished(MdResult::Ok);
            txn.deadline = Micros::ZERO;
        }
        Ok(())
    }

    /* ----------------------------- scheduler ----------------------------- */

    /// Retransmit due UDP requests. Runs in the send phase, before new
    /// receives are dispatched.
    pub fn tick_retries(&mut self, now: Micros, ctx: &mut Ctx<'_>) {
        let mut due: Vec<SessionUuid> = Vec::new();
        for (uuid, txn) in &self.transactions {
            if txn.state == TxState::WaitReply &&
                txn.retries_left > 0 &&
                txn.next_retry.is_some_and(|at| at <= now)
            {
                due.push(*uuid);
            }
        }
        for uuid in due {
            let Some(txn) = self.transactions.get_mut(&uuid) else { continue };
            let Some(block) = txn.tx_frame else { continue };
            let frame = &mut *ctx.frame;
            if ctx.pool.with(block, |bytes| {
                frame.clear();
                frame.extend_from_slice(bytes);
            }).is_err()
            {
                continue;
            }
            txn.retries_left -= 1;
            txn.next_retry =
                (txn.retries_left > 0).then(|| now + txn.retry_interval);
            let peer = txn.peer;
            if let Some(udp) = self.udp_sock {
                match ctx.sockets.send_to(udp, ctx.frame, peer) {
                    Ok(_) => {
                        ctx.stats.md.retries += 1;
                        trace!(session = ?uuid, "request retransmitted");
                    }
                    Err(err) => trace!(?err, "retransmit failed"),
                }
            }
        }
    }

    /// Expire deadlines and emit deferred terminals. Exactly one terminal
    /// event leaves the engine per transaction.
    pub fn sweep<F: FnMut(Event<'_>)>(&mut self, now: Micros, ctx: &mut Ctx<'_>, handler: &mut F) {
        self.expire_pending_connects(now, ctx);

        enum Action {
            Emit(MdResult),
            Silent,
        }

        let mut due: Vec<(SessionUuid, Action)> = Vec::new();
        for (uuid, txn) in &self.transactions {
            match txn.state {
                TxState::Finished(result) => due.push((*uuid, Action::Emit(result))),
                TxState::WaitReply if txn.deadline <= now => {
                    let result =
                        if txn.received > 0 { MdResult::Ok } else { MdResult::ReplyTimeout };
                    if txn.confirm_pending {
                        ctx.stats.md.req_confirm_timeouts += 1;
                    }
                    due.push((*uuid, Action::Emit(result)));
                }
                TxState::ConfirmPending if txn.deadline <= now => {
                    ctx.stats.md.req_confirm_timeouts += 1;
                    due.push((*uuid, Action::Silent));
                }
                TxState::AwaitApp if txn.deadline <= now => {
                    due.push((*uuid, Action::Emit(MdResult::AppReplyTimeout)));
                }
                TxState::WaitConfirm if txn.deadline <= now => {
                    due.push((*uuid, Action::Emit(MdResult::ConfirmTimeout)));
                }
                _ => {}
            }
        }

        for (uuid, action) in due {
            match action {
                Action::Emit(result) => self.finish(uuid, result, ctx, handler),
                Action::Silent => self.drop_transaction(uuid, ctx),
            }
        }
    }

    /// Delay until the next transaction deadline or retry.
    pub fn next_deadline(&self, now: Micros) -> Micros {
        self.transactions.values().map(|txn| txn.until_deadline(now)).min().unwrap_or(Micros::MAX)
    }

    /* ------------------------------ receive ------------------------------ */

    /// Validate and dispatch one MD datagram.
    #[allow(clippy::too_many_arguments)]
    pub fn rx_datagram<F: FnMut(Event<'_>)>(
        &mut self,
        frame: &[u8],
        src: SocketAddrV4,
        dst: Ipv4Addr,
        now: Micros,
        ctx: &mut Ctx<'_>,
        handler: &mut F,
    ) {
        match MdHeader::parse(frame, ctx.etb_topo, ctx.op_topo) {
            Ok((header, payload)) => {
                ctx.stats.md.received += 1;
                self.handle_frame(&header, payload, src, dst, Transport::Udp, None, now, ctx, handler);
            }
            Err(err) => count_wire_error(err, ctx),
        }
    }

    /// Accept every pending inbound TCP connection.
    pub fn handle_accept(&mut self, ctx: &mut Ctx<'_>) {
        loop {
            let Some(listener) = self.tcp_listener.as_ref() else { return };
            match listener.accept() {
                Ok((stream, SocketAddr::V4(peer))) => {
                    if let Err(err) = self.store_inbound(stream, peer, ctx) {
                        warn!(?err, %peer, "inbound link setup failed");
                    }
                }
                Ok((_, SocketAddr::V6(_))) => continue,
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    warn!(?err, "tcp accept failed");
                    return;
                }
            }
        }
    }

    /// Drive one TCP link's readiness event.
    pub fn handle_link_event<F: FnMut(Event<'_>)>(
        &mut self,
        token: Token,
        ev: &MioEvent,
        now: Micros,
        ctx: &mut Ctx<'_>,
        handler: &mut F,
    ) {
        let Some(slot) = token.0.checked_sub(TCP_LINK_BASE) else { return };
        let mut frames: Vec<Vec<u8>> = Vec::new();
        let (peer, state) = {
            let Some(link_slot) = self.links.get_mut(slot).and_then(|s| s.as_mut()) else {
                return;
            };
            let state = link_slot.link.poll_with(ctx.registry, ev, &mut |_token, frame| {
                frames.push(frame.to_vec());
            });
            (link_slot.link.peer(), state)
        };

        for frame in &frames {
            match MdHeader::parse(frame, ctx.etb_topo, ctx.op_topo) {
                Ok((header, payload)) => {
                    ctx.stats.md.received += 1;
                    self.handle_frame(
                        &header,
                        payload,
                        peer,
                        Ipv4Addr::UNSPECIFIED,
                        Transport::Tcp,
                        Some(token),
                        now,
                        ctx,
                        handler,
                    );
                }
                Err(err) => count_wire_error(err, ctx),
            }
        }

        if state == LinkState::Closed {
            self.close_link(slot, ctx);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_frame<F: FnMut(Event<'_>)>(
        &mut self,
        header: &MdHeader,
        payload: &[u8],
        src: SocketAddrV4,
        dst: Ipv4Addr,
        transport: Transport,
        link: Option<Token>,
        now: Micros,
        ctx: &mut Ctx<'_>,
        handler: &mut F,
    ) {
        match header.msg_type {
            MdMsgType::Notify => {
                let Some(listener_id) = self.match_listener(header, src, dst, transport) else {
                    ctx.stats.md.no_listener += 1;
                    return;
                };
                handler(Event::MdIndication {
                    listener: listener_id,
                    info: md_info(header, src, false),
                    payload,
                });
            }

            MdMsgType::Request => {
                if self.transactions.contains_key(&header.session_id) {
                    // UDP retransmission of a request already in progress.
                    ctx.stats.md.orphans += 1;
                    return;
                }
                let Some(listener_id) = self.match_listener(header, src, dst, transport) else {
                    ctx.stats.md.no_listener += 1;
                    return;
                };
                if self.transactions.len() >= ctx.cfg.md.max_sessions {
                    warn!("session table full, request dropped");
                    ctx.stats.md.orphans += 1;
                    return;
                }
                let reply_deadline = if header.reply_timeout_us != 0 {
                    now + Micros(header.reply_timeout_us as u64)
                } else {
                    now + ctx.cfg.md.reply_timeout
                };
                self.transactions.insert(header.session_id, Transaction {
                    uuid: header.session_id,
                    role: Role::Replier,
                    state: TxState::AwaitApp,
                    com_id: header.com_id,
                    peer: src,
                    transport,
                    peer_uri: header.source_uri,
                    own_uri: header.dest_uri,
                    expected: 0,
                    received: 0,
                    deadline: reply_deadline,
                    retry_interval: Micros::ZERO,
                    next_retry: None,
                    retries_left: 0,
                    tx_frame: None,
                    link,
                    confirm_pending: false,
                    confirm_deadline: Micros::MAX,
                });
                handler(Event::MdIndication {
                    listener: listener_id,
                    info: md_info(header, src, false),
                    payload,
                });
            }

            MdMsgType::Reply | MdMsgType::ReplyQuery | MdMsgType::Error => {
                let Some(txn) = self.transactions.get_mut(&header.session_id) else {
                    // Unknown session-UUIDs are silently ignored.
                    ctx.stats.md.orphans += 1;
                    return;
                };
                if txn.role != Role::Caller || txn.state != TxState::WaitReply {
                    ctx.stats.md.orphans += 1;
                    return;
                }

                txn.received += 1;
                let requires_confirm = header.msg_type == MdMsgType::ReplyQuery;
                if requires_confirm {
                    txn.confirm_pending = true;
                    txn.confirm_deadline = if header.reply_timeout_us != 0 {
                        now + Micros(header.reply_timeout_us as u64)
                    } else {
                        now + ctx.cfg.md.confirm_timeout
                    };
                }
                let complete = txn.expected != 0 && txn.received >= txn.expected;
                let confirm_pending = txn.confirm_pending;
                let confirm_deadline = txn.confirm_deadline;

                handler(Event::MdReply { info: md_info(header, src, requires_confirm), payload });

                if complete {
                    if confirm_pending {
                        // Success is reported now; the transaction lingers
                        // only to carry the outstanding confirm.
                        let txn = self.transactions.get_mut(&header.session_id)
                            .expect("transaction still present");
                        txn.state = TxState::ConfirmPending;
                        txn.deadline = confirm_deadline;
                        handler(Event::MdFinished {
                            session: header.session_id,
                            result: MdResult::Ok,
                        });
                    } else {
                        self.finish(header.session_id, MdResult::Ok, ctx, handler);
                    }
                }
            }

            MdMsgType::Confirm => {
                let Some(txn) = self.transactions.get(&header.session_id) else {
                    ctx.stats.md.orphans += 1;
                    return;
                };
                if txn.role == Role::Replier && txn.state == TxState::WaitConfirm {
                    self.finish(header.session_id, MdResult::Ok, ctx, handler);
                } else {
                    ctx.stats.md.orphans += 1;
                }
            }
        }
    }

    /* ------------------------------ plumbing ----------------------------- */

    fn check_payload(&self, spec: &MdSendSpec<'_>) -> Result<()> {
        let max = match spec.transport {
            Transport::Udp => MD_MAX_UDP_PAYLOAD,
            Transport::Tcp => MD_MAX_PAYLOAD,
        };
        if spec.payload.len() > max { Err(Error::Param) } else { Ok(()) }
    }

    #[allow(clippy::too_many_arguments)]
    fn header(
        &mut self,
        msg_type: MdMsgType,
        spec: &MdSendSpec<'_>,
        uuid: SessionUuid,
        reply_timeout_us: u32,
        num_replies: u32,
        etb_topo: u32,
        op_topo: u32,
    ) -> MdHeader {
        let header = MdHeader {
            seq: self.seq,
            msg_type,
            com_id: spec.com_id,
            etb_topo,
            op_topo,
            reply_status: 0,
            session_id: uuid,
            reply_timeout_us,
            num_replies,
            source_uri: spec.source_uri.unwrap_or_default(),
            dest_uri: spec.dest_uri.unwrap_or_default(),
        };
        self.seq = self.seq.wrapping_add(1);
        header
    }

    /// Ship `ctx.frame`. Returns the TCP link token used, if any.
    fn send_encoded(
        &mut self,
        transport: Transport,
        peer: SocketAddrV4,
        link: Option<Token>,
        now: Micros,
        ctx: &mut Ctx<'_>,
    ) -> Result<Option<Token>> {
        match transport {
            Transport::Udp => {
                let udp = self.ensure_udp(ctx)?;
                ctx.sockets.send_to(udp, ctx.frame, peer)?;
                Ok(None)
            }
            Transport::Tcp => {
                let token = match link {
                    Some(token) => token,
                    None => self.link_for_peer(peer, now, ctx)?,
                };
                let slot = token.0 - TCP_LINK_BASE;
                let Some(link_slot) = self.links.get_mut(slot).and_then(|s| s.as_mut()) else {
                    return Err(Error::NoConn);
                };
                if link_slot.link.send_or_enqueue(ctx.registry, ctx.frame) == LinkState::Closed {
                    self.close_link(slot, ctx);
                    return Err(Error::NoConn);
                }
                Ok(Some(token))
            }
        }
    }

    /// One connection per peer, reused for the lifetime of MD traffic to
    /// that peer; connect is lazy.
    fn link_for_peer(&mut self, peer: SocketAddrV4, now: Micros, ctx: &mut Ctx<'_>) -> Result<Token> {
        if let Some(slot) = self
            .links
            .iter()
            .position(|s| s.as_ref().is_some_and(|l| l.link.peer() == peer))
        {
            return Ok(Token(TCP_LINK_BASE + slot));
        }

        let stream = connect_nonblocking(peer).map_err(|_| Error::NoConn)?;
        let slot = self.links.iter().position(|s| s.is_none()).unwrap_or_else(|| {
            self.links.push(None);
            self.links.len() - 1
        });
        let token = Token(TCP_LINK_BASE + slot);
        let link = TcpLink::outbound(stream, peer, token, ctx.registry).map_err(|_| Error::NoConn)?;
        self.links[slot] = Some(LinkSlot { link, opened_at: now });
        debug!(%peer, "tcp link opening");
        Ok(token)
    }

    fn store_inbound(
        &mut self,
        stream: mio::net::TcpStream,
        peer: SocketAddrV4,
        ctx: &mut Ctx<'_>,
    ) -> Result<()> {
        let slot = self.links.iter().position(|s| s.is_none()).unwrap_or_else(|| {
            self.links.push(None);
            self.links.len() - 1
        });
        let token = Token(TCP_LINK_BASE + slot);
        let link = TcpLink::inbound(stream, peer, token, ctx.registry)?;
        self.links[slot] = Some(LinkSlot { link, opened_at: Micros::now() });
        debug!(%peer, "inbound tcp link");
        Ok(())
    }

    /// Close a link and fail every transaction bound to it. Terminals are
    /// deferred to the sweep so they surface inside `process` regardless of
    /// which path noticed the failure.
    fn close_link(&mut self, slot: usize, ctx: &mut Ctx<'_>) {
        let Some(mut link_slot) = self.links.get_mut(slot).and_then(|s| s.take()) else {
            return;
        };
        let token = Token(TCP_LINK_BASE + slot);
        link_slot.link.close(ctx.registry);

        for txn in self.transactions.values_mut() {
            if txn.link != Some(token) {
                continue;
            }
            match txn.state {
                TxState::Finished(_) => {}
                // Terminal already went out; just let the sweep reap it.
                TxState::ConfirmPending => {
                    txn.state = TxState::Finished(MdResult::Ok);
                    txn.deadline = Micros::ZERO;
                }
                _ => {
                    txn.state = TxState::Finished(MdResult::NoConn);
                    txn.deadline = Micros::ZERO;
                }
            }
            txn.link = None;
        }
    }

    fn expire_pending_connects(&mut self, now: Micros, ctx: &mut Ctx<'_>) {
        let timeout = ctx.cfg.md.connect_timeout;
        let stale: Vec<usize> = self
            .links
            .iter()
            .enumerate()
            .filter_map(|(slot, entry)| {
                entry.as_ref().and_then(|l| {
                    (!l.link.is_connected() && now.saturating_sub(l.opened_at) > timeout)
                        .then_some(slot)
                })
            })
            .collect();
        for slot in stale {
            debug!(slot, "tcp connect timed out");
            self.close_link(slot, ctx);
        }
    }

    fn match_listener(
        &self,
        header: &MdHeader,
        src: SocketAddrV4,
        dst: Ipv4Addr,
        transport: Transport,
    ) -> Option<ListenerId> {
        self.listeners
            .iter()
            .find(|(_, l)| l.matches(header, *src.ip(), dst, transport))
            .map(|(_, l)| l.id)
    }

    /// Remove a transaction, emitting its single terminal event.
    fn finish<F: FnMut(Event<'_>)>(
        &mut self,
        uuid: SessionUuid,
        result: MdResult,
        ctx: &mut Ctx<'_>,
        handler: &mut F,
    ) {
        if let Some(txn) = self.transactions.swap_remove(&uuid) {
            if let Some(block) = txn.tx_frame {
                ctx.pool.free(block);
            }
            match result {
                MdResult::Ok => {}
                MdResult::ReplyTimeout => ctx.stats.md.reply_timeouts += 1,
                MdResult::ConfirmTimeout => ctx.stats.md.confirm_timeouts += 1,
                MdResult::AppReplyTimeout => ctx.stats.md.app_reply_timeouts += 1,
                MdResult::Aborted => ctx.stats.md.aborted += 1,
                MdResult::NoConn => {}
            }
            trace!(session = ?uuid, ?result, "transaction finished");
            handler(Event::MdFinished { session: uuid, result });
        }
    }

    /// Remove a transaction whose terminal was already reported.
    fn drop_transaction(&mut self, uuid: SessionUuid, ctx: &mut Ctx<'_>) {
        if let Some(txn) = self.transactions.swap_remove(&uuid) {
            if let Some(block) = txn.tx_frame {
                ctx.pool.free(block);
            }
        }
    }

    fn ensure_udp(&mut self, ctx: &mut Ctx<'_>) -> Result<Token> {
        if let Some(token) = self.udp_sock {
            return Ok(token);
        }
        let param = ctx.cfg.md.send_param;
        let key = SockKey {
            proto: Proto::Udp,
            bind_ip: Ipv4Addr::UNSPECIFIED,
            port: ctx.cfg.md.udp_port,
            qos: param.qos,
            ttl: param.ttl,
            vlan: param.vlan,
            tsn: param.tsn,
        };
        let token = ctx.sockets.acquire(key, ctx.registry)?;
        ctx.uses.insert(token, SockUse::Md);
        self.udp_sock = Some(token);
        Ok(token)
    }

    fn ensure_tcp_listener(&mut self, ctx: &mut Ctx<'_>) -> Result<()> {
        if self.tcp_listener.is_some() {
            return Ok(());
        }
        let bind = SocketAddrV4::new(ctx.own_ip, ctx.cfg.md.tcp_port);
        let mut listener =
            TcpListener::bind(SocketAddr::V4(bind)).map_err(|_| Error::Sock)?;
        ctx.registry
            .register(&mut listener, TCP_LISTEN, Interest::READABLE)
            .map_err(|_| Error::Sock)?;
        self.tcp_listener = Some(listener);
        debug!(%bind, "md tcp listener up");
        Ok(())
    }

    /// Release everything; run on session close.
    pub fn close_all(&mut self, ctx: &mut Ctx<'_>) {
        for (_, txn) in std::mem::take(&mut self.transactions) {
            if let Some(block) = txn.tx_frame {
                ctx.pool.free(block);
            }
        }
        for entry in &mut self.links {
            if let Some(mut link_slot) = entry.take() {
                link_slot.link.close(ctx.registry);
            }
        }
        if let Some(mut listener) = self.tcp_listener.take() {
            let _ = ctx.registry.deregister(&mut listener);
        }
        if let Some(token) = self.udp_sock.take() {
            ctx.sockets.release(token, ctx.registry);
        }
        self.listeners.drain_all();
    }
}

fn md_info(header: &MdHeader, src: SocketAddrV4, requires_confirm: bool) -> MdInfo {
    MdInfo {
        session: header.session_id,
        com_id: header.com_id,
        msg_type: header.msg_type,
        src,
        source_uri: header.source_uri,
        dest_uri: header.dest_uri,
        reply_status: header.reply_status,
        num_replies: header.num_replies,
        requires_confirm,
    }
}

fn count_wire_error(err: WireError, ctx: &mut Ctx<'_>) {
    match err {
        WireError::HeaderFcs | WireError::PayloadFcs => ctx.stats.md.crc_errors += 1,
        WireError::Topo => ctx.stats.md.topo_errors += 1,
        _ => ctx.stats.md.wire_errors += 1,
    }
    trace!(?err, "md frame rejected");
}
