use std::net::SocketAddrV4;

use trdp_timing::Micros;
use trdp_wire::{MdMsgType, SessionUuid, Uri};

use crate::{
    Error,
    handle::{ListenerId, SubId},
};

/// Metadata recorded with every accepted PD frame.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RxMeta {
    pub com_id: u32,
    pub seq: u32,
    pub src: SocketAddrV4,
    pub len: usize,
    pub at: Micros,
}

/// Descriptor of one inbound MD frame.
#[derive(Clone, Debug)]
pub struct MdInfo {
    pub session: SessionUuid,
    pub com_id: u32,
    pub msg_type: MdMsgType,
    pub src: SocketAddrV4,
    pub source_uri: Uri,
    pub dest_uri: Uri,
    pub reply_status: i32,
    pub num_replies: u32,
    /// True for a 'Mq' reply: the caller owes a `confirm` before the
    /// replier's confirm timeout.
    pub requires_confirm: bool,
}

/// How an MD transaction ended. Exactly one terminal is reported per
/// session.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MdResult {
    Ok,
    ReplyTimeout,
    ConfirmTimeout,
    AppReplyTimeout,
    NoConn,
    Aborted,
}

impl MdResult {
    pub fn as_error(self) -> Option<Error> {
        match self {
            MdResult::Ok => None,
            MdResult::ReplyTimeout => Some(Error::ReplyTo),
            MdResult::ConfirmTimeout => Some(Error::ConfirmTo),
            MdResult::AppReplyTimeout => Some(Error::AppReplyTo),
            MdResult::NoConn => Some(Error::NoConn),
            MdResult::Aborted => Some(Error::SessionAbort),
        }
    }
}

/// Everything the engine reports to the host, delivered synchronously on
/// the thread driving [`Session::process`](crate::Session::process).
#[derive(Debug)]
pub enum Event<'a> {
    /// A fresh PD frame passed all filters and was cached.
    PdReceived { sub: SubId, meta: RxMeta, payload: &'a [u8] },
    /// A subscriber's receive timeout fired. Reported once; the element
    /// stays timed out until new data arrives.
    PdTimeout { sub: SubId },
    /// An inbound Notify or Request matched a listener. For a Request the
    /// host must answer via `reply`, `reply_query` or `reply_err` before
    /// the announced reply timeout.
    MdIndication { listener: ListenerId, info: MdInfo, payload: &'a [u8] },
    /// A reply arrived for a caller session.
    MdReply { info: MdInfo, payload: &'a [u8] },
    /// Terminal state of an MD transaction.
    MdFinished { session: SessionUuid, result: MdResult },
}
