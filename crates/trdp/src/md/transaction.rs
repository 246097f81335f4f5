use std::net::SocketAddrV4;

use mio::Token;
use trdp_mem::BlockRef;
use trdp_timing::Micros;
use trdp_wire::{SessionUuid, Uri};

use crate::{event::MdResult, md::listener::Transport};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Role {
    Caller,
    Replier,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum TxState {
    /// Caller: request sent, reply timeout armed.
    WaitReply,
    /// Caller: replies complete and reported, a confirm send is still owed.
    ConfirmPending,
    /// Replier: waiting for the application's reply call.
    AwaitApp,
    /// Replier: 'Mq' sent, waiting for the confirm frame.
    WaitConfirm,
    /// Terminal reached; the event fires and resources release on the next
    /// `process`.
    Finished(MdResult),
}

/// One in-flight MD transaction, caller or replier side.
pub(crate) struct Transaction {
    pub uuid: SessionUuid,
    pub role: Role,
    pub state: TxState,
    pub com_id: u32,
    pub peer: SocketAddrV4,
    pub transport: Transport,
    /// Peer's functional group (source URI of the frame that opened the
    /// transaction).
    pub peer_uri: Uri,
    /// Our functional group for this exchange.
    pub own_uri: Uri,
    pub expected: u32,
    pub received: u32,
    /// Meaning depends on state: reply deadline, application-reply
    /// deadline, or confirm deadline.
    pub deadline: Micros,
    pub retry_interval: Micros,
    pub next_retry: Option<Micros>,
    pub retries_left: u32,
    /// Buffered request frame for UDP retransmission.
    pub tx_frame: Option<BlockRef>,
    /// TCP link carrying this transaction, if stream transport.
    pub link: Option<Token>,
    /// Caller received an 'Mq' and owes a confirm.
    pub confirm_pending: bool,
    pub confirm_deadline: Micros,
}

impl Transaction {
    /// Delay until this transaction needs attention from the scheduler.
    pub fn until_deadline(&self, now: Micros) -> Micros {
        let mut next = match self.state {
            TxState::Finished(_) => return Micros::ZERO,
            _ => self.deadline,
        };
        if let Some(retry) = self.next_retry {
            next = next.min(retry);
        }
        next.saturating_sub(now)
    }
}
