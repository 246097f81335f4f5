use thiserror::Error;
use trdp_io::IoError;
use trdp_mem::MemError;
use trdp_wire::WireError;

/// Error kinds surfaced to the host. Configuration errors return
/// synchronously from the API call; wire-level errors are counted in
/// statistics and, when fatal to a session, reported through that session's
/// terminal event — never via global state.
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    // Configuration.
    #[error("invalid parameter")]
    Param,
    #[error("not initialized")]
    Init,
    #[error("invalid handle")]
    NoInit,
    #[error("unknown com-id for marshalling")]
    ComId,
    #[error("topology counter mismatch")]
    Topo,

    // Resources.
    #[error("memory pool exhausted")]
    Mem,
    #[error("queue error")]
    Queue,
    #[error("queue full")]
    QueueFull,
    #[error("mutex error")]
    Mutex,
    #[error("semaphore error")]
    Sema,
    #[error("thread error")]
    Thread,
    #[error("resource in use")]
    InUse,

    // I/O.
    #[error("socket setup failed")]
    Sock,
    #[error("i/o failure")]
    Io,
    #[error("no connection to peer")]
    NoConn,
    #[error("operation would block")]
    Block,
    #[error("no data received yet")]
    NoData,

    // Protocol.
    #[error("frame check sequence mismatch")]
    Crc,
    #[error("malformed frame")]
    Wire,
    #[error("incomplete packet")]
    Packet,
    #[error("invalid state for operation")]
    State,

    // MD lifecycle.
    #[error("unknown session")]
    NoSession,
    #[error("session aborted")]
    SessionAbort,
    #[error("no such subscriber")]
    NoSub,
    #[error("no such publisher")]
    NoPub,
    #[error("no such listener")]
    NoList,
    #[error("receive timeout")]
    Timeout,
    #[error("reply timeout")]
    ReplyTo,
    #[error("confirmation timeout")]
    ConfirmTo,
    #[error("requested confirmation timed out")]
    ReqConfirmTo,
    #[error("application timeout")]
    AppTimeout,
    #[error("application failed to reply in time")]
    AppReplyTo,
    #[error("application failed to confirm in time")]
    AppConfirmTo,

    // Generic.
    #[error("unknown error")]
    Unknown,
    #[error("unresolved address")]
    Unresolved,
}

impl From<MemError> for Error {
    fn from(err: MemError) -> Self {
        match err {
            MemError::Exhausted => Error::Mem,
            MemError::Param => Error::Param,
            MemError::Stale => Error::NoInit,
        }
    }
}

impl From<WireError> for Error {
    fn from(err: WireError) -> Self {
        match err {
            WireError::HeaderFcs | WireError::PayloadFcs => Error::Crc,
            WireError::TooShort => Error::Packet,
            WireError::Topo => Error::Topo,
            WireError::Version(_) | WireError::Length | WireError::MsgType(_) => Error::Wire,
        }
    }
}

impl From<IoError> for Error {
    fn from(err: IoError) -> Self {
        match err {
            IoError::Sock(_) => Error::Sock,
            IoError::NoConn => Error::NoConn,
            IoError::Io(e) if e.kind() == std::io::ErrorKind::WouldBlock => Error::Block,
            IoError::Io(_) => Error::Io,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::WouldBlock { Error::Block } else { Error::Io }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
