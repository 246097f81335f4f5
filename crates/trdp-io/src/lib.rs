//! In-session socket layer: a reference-counted table of UDP endpoints keyed
//! by their discriminating options, multicast membership tracking, and
//! mio-driven TCP links with partial-read/partial-write retention.

mod table;
mod tcp;
mod udp;

use std::io;

pub use table::{Proto, SockKey, SocketTable};
pub use tcp::{LinkState, TcpLink, connect_nonblocking};
use thiserror::Error;
pub use udp::{DgramMeta, UdpEndpoint, iface_index_for_ip};

#[derive(Error, Debug)]
pub enum IoError {
    #[error("socket setup failed")]
    Sock(#[source] io::Error),
    #[error("no connection to peer")]
    NoConn,
    #[error("i/o failure")]
    Io(#[from] io::Error),
}
