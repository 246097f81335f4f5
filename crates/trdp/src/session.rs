use std::{
    collections::HashMap,
    net::{Ipv4Addr, SocketAddrV4},
    sync::Arc,
    time::Duration,
};

use mio::{Events, Poll, Registry, Token, event::Event as MioEvent};
use tracing::{debug, warn};
use trdp_io::{DgramMeta, SocketTable};
use trdp_mem::{BlockPool, MemStats};
use trdp_timing::Micros;
use trdp_wire::{PdHeader, PdMsgType, SessionUuid, WireError};

use crate::{
    Error, Event, Result,
    config::SessionConfig,
    handle::{ListenerId, PubId, SubId},
    marshall::Marshaller,
    md::{ListenerSpec, MdEngine, MdSendSpec, RequestOpts, TCP_LINK_BASE, TCP_LISTEN},
    pd::{PdEngine, PdSample, PreSendHook, PublishSpec, PullSpec, SubscribeSpec},
    stats::SessionStats,
};

/// Traffic class carried by a shared UDP socket.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum SockUse {
    Pd,
    Md,
}

/// Borrowed view of the session internals handed to the engines. Built
/// field-by-field at each call site so the engine borrow and the context
/// borrows stay disjoint.
pub(crate) struct Ctx<'a> {
    pub registry: &'a Registry,
    pub sockets: &'a mut SocketTable,
    pub uses: &'a mut HashMap<Token, SockUse>,
    pub pool: &'a BlockPool,
    pub cfg: &'a SessionConfig,
    pub stats: &'a mut crate::stats::SessionStats,
    pub etb_topo: u32,
    pub op_topo: u32,
    pub own_ip: Ipv4Addr,
    pub stage: &'a mut Vec<u8>,
    pub frame: &'a mut Vec<u8>,
}

macro_rules! ctx {
    ($core:expr) => {
        Ctx {
            registry: $core.poll.registry(),
            sockets: &mut $core.sockets,
            uses: &mut $core.uses,
            pool: &$core.pool,
            cfg: &$core.cfg,
            stats: &mut $core.stats,
            etb_topo: $core.etb_topo,
            op_topo: $core.op_topo,
            own_ip: $core.cfg.host_ip,
            stage: &mut $core.stage,
            frame: &mut $core.frame,
        }
    };
}

/// Marshal an outbound payload through the configured marshaller, if any.
/// Expands inline so the borrow of `mar_buf` stays a plain field borrow.
macro_rules! marshal_out {
    ($core:expr, $com_id:expr, $data:expr) => {{
        let data: &[u8] = if $core.marshaller.is_some() {
            $core.mar_buf.clear();
            $core
                .marshaller
                .as_deref_mut()
                .expect("checked above")
                .marshall($com_id, $data, &mut $core.mar_buf)?;
            &$core.mar_buf
        } else {
            $data
        };
        data
    }};
}

struct Core {
    cfg: SessionConfig,
    poll: Poll,
    sockets: SocketTable,
    uses: HashMap<Token, SockUse>,
    pd: PdEngine,
    md: MdEngine,
    pool: Arc<BlockPool>,
    stats: SessionStats,
    marshaller: Option<Box<dyn Marshaller>>,
    etb_topo: u32,
    op_topo: u32,
    rx_scratch: Vec<u8>,
    stage: Vec<u8>,
    frame: Vec<u8>,
    mar_buf: Vec<u8>,
    unmar_buf: Vec<u8>,
}

/// One protocol session. Owns the element tables, the socket table and the
/// readiness poll; makes progress only inside [`process`](Session::process),
/// driven by the host loop `next_interval → wait → process`.
pub struct Session {
    events: Events,
    core: Core,
}

impl Session {
    /// Open a session with its own memory pool per the config.
    pub fn open(cfg: SessionConfig) -> Result<Self> {
        let pool = Arc::new(BlockPool::new(cfg.arena_bytes, &cfg.prealloc));
        Self::open_with_pool(cfg, pool)
    }

    /// Open a session backed by a shared pool (the pool carries its own
    /// lock, independent of the session).
    pub fn open_with_pool(cfg: SessionConfig, pool: Arc<BlockPool>) -> Result<Self> {
        let poll = Poll::new().map_err(|_| Error::Init)?;
        debug!(host = %cfg.host_ip, "session open");
        Ok(Self {
            events: Events::with_capacity(128),
            core: Core {
                md: MdEngine::new(cfg.node_mac),
                cfg,
                poll,
                sockets: SocketTable::new(0),
                uses: HashMap::new(),
                pd: PdEngine::default(),
                pool,
                stats: SessionStats::default(),
                marshaller: None,
                etb_topo: 0,
                op_topo: 0,
                rx_scratch: vec![0; 65536],
                stage: Vec::with_capacity(1536),
                frame: Vec::with_capacity(1536),
                mar_buf: Vec::new(),
                unmar_buf: Vec::new(),
            },
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.core.cfg
    }

    pub fn stats(&self) -> SessionStats {
        self.core.stats
    }

    pub fn mem_stats(&self) -> MemStats {
        self.core.pool.stats()
    }

    /// Bump the topology counters; stale traffic with the old counts is
    /// rejected from now on.
    pub fn set_topo_counts(&mut self, etb: u32, op: u32) {
        self.core.etb_topo = etb;
        self.core.op_topo = op;
    }

    pub fn topo_counts(&self) -> (u32, u32) {
        (self.core.etb_topo, self.core.op_topo)
    }

    pub fn set_marshaller(&mut self, marshaller: Option<Box<dyn Marshaller>>) {
        self.core.marshaller = marshaller;
    }

    /* ------------------------------- PD -------------------------------- */

    /// Create a cyclic publisher. The payload size is fixed for the
    /// element's lifetime; the first frame goes out one interval from now.
    pub fn publish(&mut self, spec: &PublishSpec<'_>) -> Result<PubId> {
        let now = Micros::now();
        let core = &mut self.core;
        let payload = marshal_out!(core, spec.com_id, spec.payload);
        let spec = PublishSpec { payload, ..*spec };
        core.pd.publish(&spec, now, &mut ctx!(core))
    }

    /// Re-target a publisher without disturbing its sequence counter.
    pub fn republish(&mut self, id: PubId, dest: SocketAddrV4) -> Result<()> {
        self.core.pd.republish(id, dest)
    }

    pub fn unpublish(&mut self, id: PubId) -> Result<()> {
        let core = &mut self.core;
        core.pd.unpublish(id, &mut ctx!(core))?;
        core.sync_uses();
        Ok(())
    }

    /// Update the pending payload; `data` must match the published size
    /// exactly. The frame is sent on the next `process` regardless of
    /// cycle phase.
    pub fn put(&mut self, id: PubId, data: &[u8]) -> Result<()> {
        let core = &mut self.core;
        let com_id = core.pd.com_id_of(id)?;
        let data = marshal_out!(core, com_id, data);
        core.pd.put(id, data, &core.pool)
    }

    /// Install or clear the hook run on the staged payload copy right
    /// before the FCS is computed.
    pub fn set_pre_send(&mut self, id: PubId, hook: Option<PreSendHook>) -> Result<()> {
        self.core.pd.set_pre_send(id, hook)
    }

    /// Send a one-shot 'Pr' pull request.
    pub fn pull_request(&mut self, spec: &PullSpec) -> Result<()> {
        let core = &mut self.core;
        core.pd.request(spec, &mut ctx!(core))
    }

    pub fn subscribe(&mut self, spec: &SubscribeSpec) -> Result<SubId> {
        let now = Micros::now();
        let core = &mut self.core;
        core.pd.subscribe(spec, now, &mut ctx!(core))
    }

    pub fn resubscribe(&mut self, id: SubId, spec: &SubscribeSpec) -> Result<()> {
        let core = &mut self.core;
        core.pd.resubscribe(id, spec, &mut ctx!(core))
    }

    pub fn unsubscribe(&mut self, id: SubId) -> Result<()> {
        let core = &mut self.core;
        core.pd.unsubscribe(id, &mut ctx!(core))?;
        core.sync_uses();
        Ok(())
    }

    /// Polled access to a subscriber's cached payload and state.
    pub fn get(&self, id: SubId) -> Result<PdSample> {
        self.core.pd.get(id, &self.core.pool)
    }

    /// Promote or demote every publisher of a redundancy group.
    pub fn set_redundant(&mut self, red_id: u32, leader: bool) -> Result<()> {
        self.core.pd.set_redundant(red_id, leader)
    }

    pub fn is_redundant_follower(&self, red_id: u32) -> Result<bool> {
        self.core.pd.is_redundant(red_id)
    }

    /* ------------------------------- MD -------------------------------- */

    pub fn add_listener(&mut self, spec: &ListenerSpec) -> Result<ListenerId> {
        let core = &mut self.core;
        let id = core.md.add_listener(spec, &mut ctx!(core))?;
        Ok(id)
    }

    pub fn del_listener(&mut self, id: ListenerId) -> Result<()> {
        let core = &mut self.core;
        core.md.del_listener(id, &mut ctx!(core))
    }

    /// Fire-and-forget notification; terminates on send completion.
    pub fn notify(&mut self, spec: &MdSendSpec<'_>) -> Result<()> {
        let now = Micros::now();
        let core = &mut self.core;
        let payload = marshal_out!(core, spec.com_id, spec.payload);
        let spec = MdSendSpec { payload, ..*spec };
        core.md.notify(&spec, now, &mut ctx!(core))?;
        Ok(())
    }

    /// Open a request transaction; replies, the terminal event and any
    /// timeout are reported through `process`.
    pub fn request(&mut self, spec: &MdSendSpec<'_>, opts: RequestOpts) -> Result<SessionUuid> {
        let now = Micros::now();
        let core = &mut self.core;
        let payload = marshal_out!(core, spec.com_id, spec.payload);
        let spec = MdSendSpec { payload, ..*spec };
        let uuid = core.md.request(&spec, opts, now, &mut ctx!(core))?;
        Ok(uuid)
    }

    /// Answer a received request with a plain reply.
    pub fn reply(&mut self, session: SessionUuid, payload: &[u8], status: i32) -> Result<()> {
        let now = Micros::now();
        let core = &mut self.core;
        let com_id = core.md.com_id_of(session)?;
        let payload = marshal_out!(core, com_id, payload);
        core.md.reply(session, payload, status, now, &mut ctx!(core))
    }

    /// Answer a received request demanding a confirmation.
    pub fn reply_query(
        &mut self,
        session: SessionUuid,
        payload: &[u8],
        status: i32,
        confirm_timeout: Micros,
    ) -> Result<()> {
        let now = Micros::now();
        let core = &mut self.core;
        let com_id = core.md.com_id_of(session)?;
        let payload = marshal_out!(core, com_id, payload);
        core.md.reply_query(session, payload, status, confirm_timeout, now, &mut ctx!(core))
    }

    /// Answer a received request with an error status.
    pub fn reply_err(&mut self, session: SessionUuid, status: i32) -> Result<()> {
        let now = Micros::now();
        let core = &mut self.core;
        core.md.reply_err(session, status, now, &mut ctx!(core))
    }

    /// Send the confirm owed after a reply-query.
    pub fn confirm(&mut self, session: SessionUuid, status: i32) -> Result<()> {
        let now = Micros::now();
        let core = &mut self.core;
        core.md.confirm(session, status, now, &mut ctx!(core))
    }

    /// Abort a transaction; `process` reports the terminal and releases
    /// its resources.
    pub fn abort(&mut self, session: SessionUuid) -> Result<()> {
        self.core.md.abort(session)
    }

    /* ---------------------------- event loop ---------------------------- */

    /// Delay until the engine next needs a `process` call, capped at one
    /// second of idle time.
    pub fn next_interval(&self) -> Micros {
        let now = Micros::now();
        Micros::from_secs(1)
            .min(self.core.pd.next_deadline(now))
            .min(self.core.md.next_deadline(now))
    }

    /// Block on the session's readiness poll for at most
    /// `min(next_interval, max)`. Collected events are consumed by the
    /// next `process`.
    pub fn wait(&mut self, max: Micros) -> Result<()> {
        let timeout: Duration = self.next_interval().min(max).into();
        match self.core.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => Ok(()),
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// One engine step: due PD sends first (in publisher order), then MD
    /// retries, then all ready receives, then the timeout sweep. Never
    /// sleeps; events fire on the calling thread.
    pub fn process<F: FnMut(Event<'_>)>(&mut self, mut handler: F) -> Result<()> {
        let now = Micros::now();
        let core = &mut self.core;
        core.pd.send_due(now, &mut ctx!(core));
        core.md.tick_retries(now, &mut ctx!(core));

        for ev in self.events.iter() {
            self.core.handle_io(ev, now, &mut handler);
        }
        match self.core.poll.poll(&mut self.events, Some(Duration::ZERO)) {
            Ok(()) => {}
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
        for ev in self.events.iter() {
            self.core.handle_io(ev, now, &mut handler);
        }
        self.events.clear();

        let core = &mut self.core;
        core.pd.sweep(now, &mut ctx!(core), &mut handler);
        core.md.sweep(now, &mut ctx!(core), &mut handler);
        Ok(())
    }
}

impl Session {
    /// Tear the session down explicitly. Equivalent to dropping it.
    pub fn close(self) {}
}

/// The poll behind [`Session::wait`], for hosts that multiplex several
/// sessions (or other sources) in their own event loop.
#[cfg(unix)]
impl std::os::fd::AsRawFd for Session {
    fn as_raw_fd(&self) -> std::os::fd::RawFd {
        std::os::fd::AsRawFd::as_raw_fd(&self.core.poll)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let core = &mut self.core;
        core.pd.close_all(&mut ctx!(core));
        core.md.close_all(&mut ctx!(core));
        debug!("session closed");
    }
}

impl Core {
    /// Drop traffic-class entries whose socket has closed so a reused slot
    /// cannot inherit a stale class.
    fn sync_uses(&mut self) {
        let sockets = &self.sockets;
        self.uses.retain(|token, _| sockets.contains(*token));
    }

    fn handle_io<F: FnMut(Event<'_>)>(&mut self, ev: &MioEvent, now: Micros, handler: &mut F) {
        let token = ev.token();
        if token == TCP_LISTEN {
            self.md.handle_accept(&mut ctx!(self));
            return;
        }
        if token.0 >= TCP_LINK_BASE {
            self.md.handle_link_event(token, ev, now, &mut ctx!(self), handler);
            return;
        }
        match self.uses.get(&token).copied() {
            Some(SockUse::Pd) => self.drain_udp(token, SockUse::Pd, now, handler),
            Some(SockUse::Md) => self.drain_udp(token, SockUse::Md, now, handler),
            None => {}
        }
    }

    fn drain_udp<F: FnMut(Event<'_>)>(
        &mut self,
        token: Token,
        class: SockUse,
        now: Micros,
        handler: &mut F,
    ) {
        let mut scratch = std::mem::take(&mut self.rx_scratch);
        loop {
            let meta = {
                let Some(endpoint) = self.sockets.endpoint(token) else { break };
                match endpoint.recv_with_dst(&mut scratch) {
                    Ok(Some(meta)) => meta,
                    Ok(None) => break,
                    Err(err) => {
                        warn!(?err, "udp receive failed");
                        break;
                    }
                }
            };
            match class {
                SockUse::Pd => self.pd_frame(&scratch[..meta.len], meta, now, handler),
                SockUse::Md => {
                    let frame = &scratch[..meta.len];
                    self.md.rx_datagram(frame, meta.src, meta.dst, now, &mut ctx!(self), handler);
                }
            }
        }
        self.rx_scratch = scratch;
    }

    fn pd_frame<F: FnMut(Event<'_>)>(
        &mut self,
        frame: &[u8],
        meta: DgramMeta,
        now: Micros,
        handler: &mut F,
    ) {
        let (header, payload) = match PdHeader::parse(frame, self.etb_topo, self.op_topo) {
            Ok(parsed) => parsed,
            Err(WireError::HeaderFcs | WireError::PayloadFcs) => {
                self.stats.pd.crc_errors += 1;
                return;
            }
            Err(WireError::Topo) => {
                self.stats.pd.topo_errors += 1;
                return;
            }
            Err(_) => {
                self.stats.pd.wire_errors += 1;
                return;
            }
        };

        let payload: &[u8] = if self.marshaller.is_some() &&
            header.msg_type != PdMsgType::PullRequest &&
            !payload.is_empty()
        {
            self.unmar_buf.clear();
            let marshaller = self.marshaller.as_deref_mut().expect("checked above");
            if marshaller.unmarshall(header.com_id, payload, &mut self.unmar_buf).is_err() {
                self.stats.pd.wire_errors += 1;
                return;
            }
            &self.unmar_buf
        } else {
            payload
        };

        self.pd.dispatch(
            &header,
            payload,
            meta.src,
            meta.dst,
            meta.if_index,
            now,
            &mut ctx!(self),
            handler,
        );
    }
}
