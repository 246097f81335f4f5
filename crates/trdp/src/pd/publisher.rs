use std::net::{Ipv4Addr, SocketAddrV4};

use mio::Token;
use trdp_mem::BlockRef;
use trdp_timing::{Cycle, Micros};

use crate::{config::SendParam, handle::PubId};

/// Smallest allowed cyclic interval.
pub(crate) const MIN_INTERVAL: Micros = Micros(10_000);

/// Host-visible hook run on the staged copy of the payload just before the
/// FCS is computed. Mutations affect only the frame being sent.
pub type PreSendHook = Box<dyn FnMut(PubId, &mut [u8]) + Send>;

/// Parameters for [`Session::publish`](crate::Session::publish).
pub struct PublishSpec<'a> {
    pub com_id: u32,
    pub dest: SocketAddrV4,
    /// Cyclic interval, ≥ 10 ms. Zero declares a pull-only publisher that
    /// transmits solely in answer to 'Pr' requests.
    pub interval: Micros,
    /// Redundancy group; 0 = non-redundant.
    pub red_id: u32,
    /// Socket options; session defaults apply when absent.
    pub send_param: Option<SendParam>,
    /// Initial payload. Its length is fixed for the publisher's lifetime.
    pub payload: &'a [u8],
}

pub(crate) struct Publisher {
    pub id: PubId,
    pub com_id: u32,
    pub dest: SocketAddrV4,
    pub cycle: Option<Cycle>,
    pub red_id: u32,
    pub leader: bool,
    pub seq: u32,
    pub data_len: usize,
    pub payload: BlockRef,
    pub dirty: bool,
    pub sock: Token,
    pub pre_send: Option<PreSendHook>,
}

impl Publisher {
    /// Pull-only publishers (no cycle) transmit solely in answer to 'Pr'
    /// requests, dirty or not.
    pub fn due(&self, now: Micros) -> bool {
        match self.cycle {
            Some(cycle) => self.dirty || cycle.is_due(now),
            None => false,
        }
    }

    /// Delay until this publisher needs attention.
    pub fn until_due(&self, now: Micros) -> Micros {
        match self.cycle {
            Some(_) if self.dirty => Micros::ZERO,
            Some(cycle) => cycle.until_due(now),
            None => Micros::MAX,
        }
    }
}

/// Parameters for a one-shot PD pull ('Pr') request.
pub struct PullSpec {
    /// Com-id the remote publisher serves.
    pub com_id: u32,
    /// Com-id the answer should carry; 0 keeps the original.
    pub reply_com_id: u32,
    pub dest: SocketAddrV4,
    /// Address the answer should go to; unspecified lets the replier use
    /// the request's source.
    pub reply_ip: Ipv4Addr,
}
