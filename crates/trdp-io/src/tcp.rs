use std::{
    collections::VecDeque,
    io::{self, Read, Write},
    net::{SocketAddr, SocketAddrV4},
};

use mio::{Interest, Registry, Token, event::Event, net::TcpStream};
use tracing::{debug, warn};
use trdp_wire::{MD_HEADER_SIZE, md_frame_len};

/// Response type for all link calls. `Closed` means the peer is gone (clean
/// half-close included) and every session bound to the link must abort.
#[derive(Debug, PartialEq, Eq)]
pub enum LinkState {
    Alive,
    Closed,
}

enum ReadOutcome {
    FrameDone,
    WouldBlock,
    Closed,
}

#[derive(Clone, Copy)]
enum RxState {
    /// Collecting the fixed header; frames carry no length prefix, the
    /// header itself declares the payload size.
    Header { have: usize },
    /// Collecting the remainder of a `total`-byte frame.
    Body { total: usize, have: usize },
}

/// Single mio-backed MD stream link.
///
/// Inbound: reads the fixed header first, then the declared remainder;
/// partial reads are retained across `process` invocations. Outbound: writes
/// non-blocking, queues the unwritten remainder, and drains the backlog on
/// writable readiness.
pub struct TcpLink {
    stream: TcpStream,
    peer: SocketAddrV4,
    token: Token,
    /// Outbound connects complete on the first writable event.
    connected: bool,
    rx_state: RxState,
    rx_buf: Vec<u8>,
    send_backlog: VecDeque<Vec<u8>>,
    /// Invariant: armed iff the backlog is non-empty or the connect is still
    /// pending.
    writable_armed: bool,
}

/// Start a non-blocking connect; completion is observed via writable
/// readiness on the returned stream.
pub fn connect_nonblocking(peer: SocketAddrV4) -> io::Result<TcpStream> {
    TcpStream::connect(SocketAddr::V4(peer))
}

impl TcpLink {
    /// Wrap an outbound stream still completing its connect.
    pub fn outbound(
        mut stream: TcpStream,
        peer: SocketAddrV4,
        token: Token,
        registry: &Registry,
    ) -> io::Result<Self> {
        registry.register(&mut stream, token, Interest::READABLE | Interest::WRITABLE)?;
        Ok(Self::new(stream, peer, token, false, true))
    }

    /// Wrap a stream accepted from a listener.
    pub fn inbound(
        mut stream: TcpStream,
        peer: SocketAddrV4,
        token: Token,
        registry: &Registry,
    ) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        registry.register(&mut stream, token, Interest::READABLE)?;
        Ok(Self::new(stream, peer, token, true, false))
    }

    fn new(stream: TcpStream, peer: SocketAddrV4, token: Token, connected: bool, armed: bool) -> Self {
        Self {
            stream,
            peer,
            token,
            connected,
            rx_state: RxState::Header { have: 0 },
            rx_buf: vec![0; MD_HEADER_SIZE],
            send_backlog: VecDeque::new(),
            writable_armed: armed,
        }
    }

    pub fn peer(&self) -> SocketAddrV4 {
        self.peer
    }

    /// False while an outbound connect is still in flight.
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn token(&self) -> Token {
        self.token
    }

    /// Handle one readiness event. Calls `on_frame` for every completely
    /// reassembled frame; frame bytes are only valid during the callback.
    pub fn poll_with<F>(&mut self, registry: &Registry, ev: &Event, on_frame: &mut F) -> LinkState
    where
        F: FnMut(Token, &[u8]),
    {
        if ev.is_writable() {
            if !self.connected {
                match self.stream.take_error() {
                    Ok(None) => {
                        self.connected = true;
                        if let Err(err) = self.stream.set_nodelay(true) {
                            debug!(?err, "nodelay after connect");
                        }
                        debug!(peer = %self.peer, "tcp link connected");
                    }
                    Ok(Some(err)) | Err(err) => {
                        debug!(?err, peer = %self.peer, "tcp connect failed");
                        return LinkState::Closed;
                    }
                }
            }
            if self.drain_backlog(registry) == LinkState::Closed {
                return LinkState::Closed;
            }
        }

        if ev.is_readable() {
            loop {
                match self.read_frame() {
                    ReadOutcome::FrameDone => {
                        let total = match self.rx_state {
                            RxState::Body { total, .. } => total,
                            RxState::Header { .. } => MD_HEADER_SIZE,
                        };
                        // Reset before the callback so a reentrant close
                        // cannot observe a half-consumed state.
                        let frame = std::mem::replace(&mut self.rx_buf, vec![0; MD_HEADER_SIZE]);
                        self.rx_state = RxState::Header { have: 0 };
                        on_frame(ev.token(), &frame[..total]);
                    }
                    ReadOutcome::WouldBlock => break,
                    ReadOutcome::Closed => return LinkState::Closed,
                }
            }
        }

        LinkState::Alive
    }

    /// Write a frame now or queue it for the next writable event. Frames
    /// queue in order; a link that has not finished connecting queues
    /// everything.
    pub fn send_or_enqueue(&mut self, registry: &Registry, frame: &[u8]) -> LinkState {
        if !self.connected || !self.send_backlog.is_empty() {
            return self.enqueue(registry, frame.to_vec());
        }

        match self.stream.write(frame) {
            Ok(0) => {
                warn!(peer = %self.peer, "tcp link wrote nothing, closing");
                LinkState::Closed
            }
            Ok(n) if n == frame.len() => LinkState::Alive,
            Ok(n) => self.enqueue(registry, frame[n..].to_vec()),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.enqueue(registry, frame.to_vec())
            }
            Err(err) => {
                warn!(?err, peer = %self.peer, "tcp link write failed");
                LinkState::Closed
            }
        }
    }

    pub fn close(&mut self, registry: &Registry) -> SocketAddrV4 {
        debug!(peer = %self.peer, "closing tcp link");
        let _ = registry.deregister(&mut self.stream);
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
        self.peer
    }

    /// Flush queued frames until the kernel blocks or the queue empties.
    fn drain_backlog(&mut self, registry: &Registry) -> LinkState {
        while let Some(front) = self.send_backlog.front_mut() {
            match self.stream.write(front) {
                Ok(0) => return LinkState::Closed,
                Ok(n) => {
                    if n == front.len() {
                        self.send_backlog.pop_front();
                    } else {
                        front.drain(..n);
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    debug!(?err, "tcp backlog write");
                    return LinkState::Closed;
                }
            }
        }

        if self.send_backlog.is_empty() && self.writable_armed {
            if let Err(err) =
                registry.reregister(&mut self.stream, self.token, Interest::READABLE)
            {
                debug!(?err, "reregister drop writable");
                return LinkState::Closed;
            }
            self.writable_armed = false;
        }

        LinkState::Alive
    }

    fn enqueue(&mut self, registry: &Registry, data: Vec<u8>) -> LinkState {
        self.send_backlog.push_back(data);
        if !self.writable_armed {
            if let Err(err) = registry.reregister(
                &mut self.stream,
                self.token,
                Interest::READABLE | Interest::WRITABLE,
            ) {
                debug!(?err, "reregister arm writable");
                return LinkState::Closed;
            }
            self.writable_armed = true;
        }
        LinkState::Alive
    }

    /// Advance reassembly by at most one frame.
    fn read_frame(&mut self) -> ReadOutcome {
        loop {
            match self.rx_state {
                RxState::Header { mut have } => {
                    while have < MD_HEADER_SIZE {
                        match self.stream.read(&mut self.rx_buf[have..MD_HEADER_SIZE]) {
                            Ok(0) => return ReadOutcome::Closed,
                            Ok(n) => have += n,
                            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                                self.rx_state = RxState::Header { have };
                                return ReadOutcome::WouldBlock;
                            }
                            Err(err) => {
                                debug!(?err, "tcp read header");
                                return ReadOutcome::Closed;
                            }
                        }
                    }
                    let Ok(total) = md_frame_len(&self.rx_buf) else {
                        // Impossible to resync a byte stream after a mangled
                        // length field.
                        warn!(peer = %self.peer, "undecodable frame length, closing link");
                        return ReadOutcome::Closed;
                    };
                    if total == MD_HEADER_SIZE {
                        self.rx_state = RxState::Header { have };
                        return ReadOutcome::FrameDone;
                    }
                    self.rx_buf.resize(total, 0);
                    self.rx_state = RxState::Body { total, have };
                }
                RxState::Body { total, mut have } => {
                    while have < total {
                        match self.stream.read(&mut self.rx_buf[have..total]) {
                            Ok(0) => return ReadOutcome::Closed,
                            Ok(n) => have += n,
                            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                                self.rx_state = RxState::Body { total, have };
                                return ReadOutcome::WouldBlock;
                            }
                            Err(err) => {
                                debug!(?err, "tcp read body");
                                return ReadOutcome::Closed;
                            }
                        }
                    }
                    self.rx_state = RxState::Body { total, have };
                    return ReadOutcome::FrameDone;
                }
            }
        }
    }
}
