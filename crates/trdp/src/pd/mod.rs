//! Process-data engine: publisher and subscriber tables, the periodic send
//! scheduler, receive dispatch and the timeout sweep.

mod publisher;
mod subscriber;

use std::net::{Ipv4Addr, SocketAddrV4};

use mio::Token;
pub use publisher::{PreSendHook, PublishSpec, PullSpec};
pub(crate) use publisher::{MIN_INTERVAL, Publisher};
pub use subscriber::{PdSample, SubscribeSpec};
pub(crate) use subscriber::Subscriber;
use tracing::{debug, trace, warn};
use trdp_io::{Proto, SockKey, iface_index_for_ip};
use trdp_mem::BlockPool;
use trdp_timing::{Cycle, Micros};
use trdp_wire::{PD_MAX_PAYLOAD, PdHeader, PdMsgType};

use crate::{
    Error, Event, Result, RxMeta,
    config::TimeoutBehavior,
    handle::{PubId, Slab, SubId},
    session::{Ctx, SockUse},
};

pub(crate) struct PdEngine {
    publishers: Slab<Publisher>,
    subscribers: Slab<Subscriber>,
    pull_seq: u32,
    pull_sock: Option<Token>,
}

impl Default for PdEngine {
    fn default() -> Self {
        Self {
            publishers: Slab::default(),
            subscribers: Slab::default(),
            pull_seq: 0,
            pull_sock: None,
        }
    }
}

impl PdEngine {
    /* ---------------------------- publishers ---------------------------- */

    pub fn publish(&mut self, spec: &PublishSpec<'_>, now: Micros, ctx: &mut Ctx<'_>) -> Result<PubId> {
        if spec.payload.is_empty() || spec.payload.len() > PD_MAX_PAYLOAD {
            return Err(Error::Param);
        }
        if !spec.interval.is_zero() && spec.interval < MIN_INTERVAL {
            return Err(Error::Param);
        }
        if spec.dest.ip().is_unspecified() {
            return Err(Error::Param);
        }

        let payload = ctx.pool.alloc(spec.payload.len())?;
        ctx.pool.write(payload, spec.payload)?;

        // Bound to the PD port so frames originate there and inbound pull
        // requests reach the publisher table.
        let param = spec.send_param.unwrap_or(ctx.cfg.pd.send_param);
        let key = SockKey {
            proto: Proto::Udp,
            bind_ip: ctx.own_ip,
            port: ctx.cfg.pd.port,
            qos: param.qos,
            ttl: param.ttl,
            vlan: param.vlan,
            tsn: param.tsn,
        };
        let sock = match ctx.sockets.acquire(key, ctx.registry) {
            Ok(token) => token,
            Err(err) => {
                ctx.pool.free(payload);
                return Err(err.into());
            }
        };
        ctx.uses.insert(sock, SockUse::Pd);

        // No immediate send: the first frame goes out one interval from now
        // unless an early `put` marks the element dirty.
        let cycle = (!spec.interval.is_zero())
            .then(|| Cycle::starting_at(spec.interval, now + spec.interval));

        let (idx, generation) = self.publishers.insert(Publisher {
            id: PubId { idx: 0, generation: 0 },
            com_id: spec.com_id,
            dest: spec.dest,
            cycle,
            red_id: spec.red_id,
            leader: true,
            seq: 0,
            data_len: spec.payload.len(),
            payload,
            dirty: false,
            sock,
            pre_send: None,
        });
        let id = PubId { idx, generation };
        self.publishers.get_mut(idx, generation).expect("fresh publisher").id = id;
        debug!(com_id = spec.com_id, dest = %spec.dest, "published");
        Ok(id)
    }

    /// Re-target an existing publisher without disturbing its sequence
    /// state.
    pub fn republish(&mut self, id: PubId, dest: SocketAddrV4) -> Result<()> {
        if dest.ip().is_unspecified() {
            return Err(Error::Param);
        }
        let publisher =
            self.publishers.get_mut(id.idx, id.generation).ok_or(Error::NoPub)?;
        publisher.dest = dest;
        Ok(())
    }

    pub fn unpublish(&mut self, id: PubId, ctx: &mut Ctx<'_>) -> Result<()> {
        let publisher = self.publishers.remove(id.idx, id.generation).ok_or(Error::NoPub)?;
        ctx.pool.free(publisher.payload);
        ctx.sockets.release(publisher.sock, ctx.registry);
        Ok(())
    }

    /// Update the pending payload. The size is fixed at publish time; the
    /// frame goes out on the next `process` regardless of cycle phase.
    pub fn put(&mut self, id: PubId, data: &[u8], pool: &BlockPool) -> Result<()> {
        let publisher = self.publishers.get_mut(id.idx, id.generation).ok_or(Error::NoPub)?;
        if data.len() != publisher.data_len {
            return Err(Error::Param);
        }
        pool.write(publisher.payload, data)?;
        publisher.dirty = true;
        Ok(())
    }

    /// Com-id of a live publisher, for marshalling.
    pub fn com_id_of(&self, id: PubId) -> Result<u32> {
        self.publishers.get(id.idx, id.generation).map(|p| p.com_id).ok_or(Error::NoPub)
    }

    pub fn set_pre_send(&mut self, id: PubId, hook: Option<PreSendHook>) -> Result<()> {
        let publisher = self.publishers.get_mut(id.idx, id.generation).ok_or(Error::NoPub)?;
        publisher.pre_send = hook;
        Ok(())
    }

    /// Flip the leader flag of every member of a redundancy group.
    pub fn set_redundant(&mut self, red_id: u32, leader: bool) -> Result<()> {
        if red_id == 0 {
            return Err(Error::Param);
        }
        let mut hits = 0;
        for (_, publisher) in self.publishers.iter_mut() {
            if publisher.red_id == red_id {
                publisher.leader = leader;
                hits += 1;
            }
        }
        if hits == 0 { Err(Error::NoPub) } else { Ok(()) }
    }

    pub fn is_redundant(&self, red_id: u32) -> Result<bool> {
        self.publishers
            .iter()
            .find(|(_, p)| p.red_id == red_id && red_id != 0)
            .map(|(_, p)| !p.leader)
            .ok_or(Error::NoPub)
    }

    /// Send a one-shot 'Pr' pull request.
    pub fn request(&mut self, spec: &PullSpec, ctx: &mut Ctx<'_>) -> Result<()> {
        let sock = match self.pull_sock {
            Some(token) => token,
            None => {
                let param = ctx.cfg.pd.send_param;
                let key = SockKey {
                    proto: Proto::Udp,
                    bind_ip: ctx.own_ip,
                    port: ctx.cfg.pd.port,
                    qos: param.qos,
                    ttl: param.ttl,
                    vlan: param.vlan,
                    tsn: param.tsn,
                };
                let token = ctx.sockets.acquire(key, ctx.registry)?;
                ctx.uses.insert(token, SockUse::Pd);
                self.pull_sock = Some(token);
                token
            }
        };

        let header = PdHeader {
            seq: self.pull_seq,
            msg_type: PdMsgType::PullRequest,
            com_id: spec.com_id,
            etb_topo: ctx.etb_topo,
            op_topo: ctx.op_topo,
            reply_com_id: spec.reply_com_id,
            reply_ip: spec.reply_ip,
        };
        self.pull_seq = self.pull_seq.wrapping_add(1);
        header.encode(&[], ctx.frame);
        ctx.sockets.send_to(sock, ctx.frame, spec.dest)?;
        ctx.stats.pd.sent += 1;
        Ok(())
    }

    /* ---------------------------- subscribers --------------------------- */

    pub fn subscribe(
        &mut self,
        spec: &SubscribeSpec,
        now: Micros,
        ctx: &mut Ctx<'_>,
    ) -> Result<SubId> {
        if let Some(group) = spec.dest {
            if !group.is_multicast() {
                return Err(Error::Param);
            }
        }
        let src_range = spec.src_range.unwrap_or((Ipv4Addr::UNSPECIFIED, Ipv4Addr::UNSPECIFIED));
        let duplicate = self.subscribers.iter().any(|(_, s)| {
            s.com_id == spec.com_id && (s.src_lo, s.src_hi) == src_range && s.dest == spec.dest
        });
        if duplicate {
            return Err(Error::InUse);
        }

        let cache = ctx.pool.alloc(PD_MAX_PAYLOAD)?;
        let key = SockKey {
            proto: Proto::Udp,
            bind_ip: Ipv4Addr::UNSPECIFIED,
            port: ctx.cfg.pd.port,
            qos: 0,
            ttl: 0,
            vlan: 0,
            tsn: false,
        };
        let sock = match ctx.sockets.acquire(key, ctx.registry) {
            Ok(token) => token,
            Err(err) => {
                ctx.pool.free(cache);
                return Err(err.into());
            }
        };
        ctx.uses.insert(sock, SockUse::Pd);

        let mut join = None;
        if let Some(group) = spec.dest {
            let iface = spec.iface.unwrap_or(ctx.own_ip);
            if let Err(err) = ctx.sockets.join(sock, group, iface) {
                ctx.sockets.release(sock, ctx.registry);
                ctx.pool.free(cache);
                return Err(err.into());
            }
            join = Some((group, iface));
        }

        let (idx, generation) = self.subscribers.insert(Subscriber {
            id: SubId { idx: 0, generation: 0 },
            com_id: spec.com_id,
            src_lo: src_range.0,
            src_hi: src_range.1,
            dest: spec.dest,
            iface_index: spec.iface.and_then(iface_index_for_ip),
            join,
            sock,
            timeout: if spec.timeout.is_zero() { ctx.cfg.pd.timeout } else { spec.timeout },
            behavior: spec.behavior.unwrap_or(ctx.cfg.pd.behavior),
            armed_at: now,
            last_rx: None,
            last_seq: None,
            cache,
            meta: None,
            timed_out: false,
            timeout_reported: false,
        });
        let id = SubId { idx, generation };
        self.subscribers.get_mut(idx, generation).expect("fresh subscriber").id = id;
        debug!(com_id = spec.com_id, group = ?spec.dest, "subscribed");
        Ok(id)
    }

    /// Re-target an existing subscriber; receive state (sequence, cache)
    /// is reset because the stream identity changed.
    pub fn resubscribe(&mut self, id: SubId, spec: &SubscribeSpec, ctx: &mut Ctx<'_>) -> Result<()> {
        if let Some(group) = spec.dest {
            if !group.is_multicast() {
                return Err(Error::Param);
            }
        }
        let subscriber = self.subscribers.get_mut(id.idx, id.generation).ok_or(Error::NoSub)?;

        if let Some((group, iface)) = subscriber.join.take() {
            ctx.sockets.leave(subscriber.sock, group, iface);
        }
        if let Some(group) = spec.dest {
            let iface = spec.iface.unwrap_or(ctx.own_ip);
            ctx.sockets.join(subscriber.sock, group, iface)?;
            subscriber.join = Some((group, iface));
        }

        let src_range = spec.src_range.unwrap_or((Ipv4Addr::UNSPECIFIED, Ipv4Addr::UNSPECIFIED));
        subscriber.com_id = spec.com_id;
        subscriber.src_lo = src_range.0;
        subscriber.src_hi = src_range.1;
        subscriber.dest = spec.dest;
        subscriber.iface_index = spec.iface.and_then(iface_index_for_ip);
        subscriber.last_seq = None;
        subscriber.last_rx = None;
        subscriber.meta = None;
        subscriber.timed_out = false;
        subscriber.timeout_reported = false;
        Ok(())
    }

    pub fn unsubscribe(&mut self, id: SubId, ctx: &mut Ctx<'_>) -> Result<()> {
        let subscriber = self.subscribers.remove(id.idx, id.generation).ok_or(Error::NoSub)?;
        if let Some((group, iface)) = subscriber.join {
            ctx.sockets.leave(subscriber.sock, group, iface);
        }
        ctx.sockets.release(subscriber.sock, ctx.registry);
        ctx.pool.free(subscriber.cache);
        Ok(())
    }

    /// Polled access to the subscriber cache.
    pub fn get(&self, id: SubId, pool: &BlockPool) -> Result<PdSample> {
        let subscriber = self.subscribers.get(id.idx, id.generation).ok_or(Error::NoSub)?;
        let meta = subscriber.meta.ok_or(Error::NoData)?;
        let payload = pool.with(subscriber.cache, |data| data[..meta.len].to_vec())?;
        Ok(PdSample { meta, timed_out: subscriber.timed_out, payload })
    }

    /* ----------------------------- scheduler ----------------------------- */

    /// Transmit every due publisher, in table order. One frame per element
    /// per call; an overdue element catches up a single interval step.
    pub fn send_due(&mut self, now: Micros, ctx: &mut Ctx<'_>) {
        let mut budget = ctx.cfg.pd.pacing.unwrap_or(u32::MAX);
        for (_, publisher) in self.publishers.iter_mut() {
            if !publisher.due(now) {
                continue;
            }
            if budget == 0 {
                ctx.stats.pd.deferred_sends += 1;
                continue;
            }

            let standby = publisher.red_id != 0 && !publisher.leader;
            if !standby {
                match transmit(publisher, PdMsgType::Data, None, None, ctx) {
                    Ok(()) => {
                        ctx.stats.pd.sent += 1;
                        budget -= 1;
                    }
                    Err(err) => {
                        // Pool or socket pressure drops this cycle's frame;
                        // the next one proceeds normally.
                        trace!(?err, com_id = publisher.com_id, "send dropped");
                        ctx.stats.pd.deferred_sends += 1;
                    }
                }
            }

            // The counter advances on standby members too so a promoted
            // follower continues the stream without replaying sequence
            // numbers the peer already saw.
            publisher.seq = publisher.seq.wrapping_add(1);
            match &mut publisher.cycle {
                Some(cycle) if publisher.dirty && !cycle.is_due(now) => cycle.rearm(now),
                Some(cycle) if cycle.is_due(now) => cycle.advance(),
                _ => {}
            }
            publisher.dirty = false;
        }
    }

    /// Dispatch one validated inbound frame to the first matching
    /// subscriber, or answer a pull request from the publisher table.
    #[allow(clippy::too_many_arguments)]
    pub fn dispatch<F: FnMut(Event<'_>)>(
        &mut self,
        header: &PdHeader,
        payload: &[u8],
        src: SocketAddrV4,
        dst: Ipv4Addr,
        if_index: u32,
        now: Micros,
        ctx: &mut Ctx<'_>,
        handler: &mut F,
    ) {
        if header.msg_type == PdMsgType::PullRequest {
            self.answer_pull(header, src, ctx);
            return;
        }

        for (_, subscriber) in self.subscribers.iter_mut() {
            if !subscriber.matches(header.com_id, *src.ip(), dst, if_index) {
                continue;
            }

            if let Some(last) = subscriber.last_seq {
                if header.seq <= last {
                    ctx.stats.pd.stale_drops += 1;
                    return;
                }
            }

            if ctx.pool.write(subscriber.cache, payload).is_err() {
                warn!(com_id = header.com_id, "cache write failed, frame dropped");
                return;
            }
            let meta =
                RxMeta { com_id: header.com_id, seq: header.seq, src, len: payload.len(), at: now };
            subscriber.meta = Some(meta);
            subscriber.last_seq = Some(header.seq);
            subscriber.last_rx = Some(now);
            subscriber.timed_out = false;
            subscriber.timeout_reported = false;
            ctx.stats.pd.received += 1;

            handler(Event::PdReceived { sub: subscriber.id, meta, payload });
            return;
        }

        ctx.stats.pd.no_sub += 1;
    }

    /// Fire timeouts that expired since the last sweep. One report per gap;
    /// the element stays timed out until data flows again.
    pub fn sweep<F: FnMut(Event<'_>)>(&mut self, now: Micros, ctx: &mut Ctx<'_>, handler: &mut F) {
        for (_, subscriber) in self.subscribers.iter_mut() {
            let Some(deadline) = subscriber.deadline() else { continue };
            if now < deadline || subscriber.timeout_reported {
                continue;
            }
            subscriber.timed_out = true;
            subscriber.timeout_reported = true;
            ctx.stats.pd.timeouts += 1;
            if subscriber.behavior == TimeoutBehavior::Zero {
                let _ = ctx.pool.with_mut(subscriber.cache, |data| data.fill(0));
            }
            trace!(com_id = subscriber.com_id, "subscriber timeout");
            handler(Event::PdTimeout { sub: subscriber.id });
        }
    }

    /// Delay until the next due send or receive timeout.
    pub fn next_deadline(&self, now: Micros) -> Micros {
        let send = self
            .publishers
            .iter()
            .map(|(_, p)| p.until_due(now))
            .min()
            .unwrap_or(Micros::MAX);
        let timeout = self
            .subscribers
            .iter()
            .filter(|(_, s)| !s.timeout_reported)
            .filter_map(|(_, s)| s.deadline())
            .map(|deadline| deadline.saturating_sub(now))
            .min()
            .unwrap_or(Micros::MAX);
        send.min(timeout)
    }

    /// Release every element; run on session close.
    pub fn close_all(&mut self, ctx: &mut Ctx<'_>) {
        for publisher in self.publishers.drain_all() {
            ctx.pool.free(publisher.payload);
            ctx.sockets.release(publisher.sock, ctx.registry);
        }
        for subscriber in self.subscribers.drain_all() {
            if let Some((group, iface)) = subscriber.join {
                ctx.sockets.leave(subscriber.sock, group, iface);
            }
            ctx.sockets.release(subscriber.sock, ctx.registry);
            ctx.pool.free(subscriber.cache);
        }
        if let Some(token) = self.pull_sock.take() {
            ctx.sockets.release(token, ctx.registry);
        }
    }

    fn answer_pull(&mut self, request: &PdHeader, src: SocketAddrV4, ctx: &mut Ctx<'_>) {
        let Some((_, publisher)) =
            self.publishers.iter_mut().find(|(_, p)| p.com_id == request.com_id)
        else {
            ctx.stats.pd.no_sub += 1;
            return;
        };

        let reply_com_id =
            if request.reply_com_id != 0 { Some(request.reply_com_id) } else { None };
        // The answer goes back to the requesting socket (the requester's
        // own PD port), optionally redirected to another host.
        let reply_to = if request.reply_ip.is_unspecified() { *src.ip() } else { request.reply_ip };
        let dest = SocketAddrV4::new(reply_to, src.port());

        match transmit(publisher, PdMsgType::PullReply, reply_com_id, Some(dest), ctx) {
            Ok(()) => {
                publisher.seq = publisher.seq.wrapping_add(1);
                ctx.stats.pd.sent += 1;
            }
            Err(err) => trace!(?err, "pull answer dropped"),
        }
    }
}

/// Stage the payload, run the pre-send hook on the copy, frame and send.
/// The FCS always covers the staged copy, so in-place mutation by the hook
/// cannot race the checksum.
fn transmit(
    publisher: &mut Publisher,
    msg_type: PdMsgType,
    com_id_override: Option<u32>,
    dest_override: Option<SocketAddrV4>,
    ctx: &mut Ctx<'_>,
) -> Result<()> {
    ctx.stage.clear();
    let stage = &mut *ctx.stage;
    ctx.pool.with(publisher.payload, |data| stage.extend_from_slice(data))?;
    if let Some(hook) = publisher.pre_send.as_mut() {
        hook(publisher.id, ctx.stage);
    }

    let header = PdHeader {
        seq: publisher.seq,
        msg_type,
        com_id: com_id_override.unwrap_or(publisher.com_id),
        etb_topo: ctx.etb_topo,
        op_topo: ctx.op_topo,
        reply_com_id: 0,
        reply_ip: Ipv4Addr::UNSPECIFIED,
    };
    header.encode(ctx.stage, ctx.frame);
    ctx.sockets.send_to(publisher.sock, ctx.frame, dest_override.unwrap_or(publisher.dest))?;
    Ok(())
}
