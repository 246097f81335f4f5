use std::net::Ipv4Addr;

use mio::Token;
use trdp_mem::BlockRef;
use trdp_timing::Micros;

use crate::{config::TimeoutBehavior, event::RxMeta, handle::SubId};

/// Parameters for [`Session::subscribe`](crate::Session::subscribe).
///
/// Several subscribers may have overlapping filters; an inbound frame goes
/// to the first match in subscription order, so operators should keep
/// filters disjoint.
#[derive(Clone, Debug)]
pub struct SubscribeSpec {
    pub com_id: u32,
    /// Accepted source range; `None` or zero bounds accept any source.
    pub src_range: Option<(Ipv4Addr, Ipv4Addr)>,
    /// Multicast group to join and filter on; `None` for unicast traffic.
    pub dest: Option<Ipv4Addr>,
    /// Interface to join (and demultiplex) on; meaningful on multi-homed
    /// hosts where the same group is joined per interface.
    pub iface: Option<Ipv4Addr>,
    /// Receive timeout; zero applies the session default.
    pub timeout: Micros,
    pub behavior: Option<TimeoutBehavior>,
}

impl SubscribeSpec {
    pub fn new(com_id: u32) -> Self {
        Self { com_id, src_range: None, dest: None, iface: None, timeout: Micros::ZERO, behavior: None }
    }
}

pub(crate) struct Subscriber {
    pub id: SubId,
    pub com_id: u32,
    pub src_lo: Ipv4Addr,
    pub src_hi: Ipv4Addr,
    pub dest: Option<Ipv4Addr>,
    pub iface_index: Option<u32>,
    pub join: Option<(Ipv4Addr, Ipv4Addr)>,
    pub sock: Token,
    pub timeout: Micros,
    pub behavior: TimeoutBehavior,
    /// Subscribe time; the first timeout counts from here.
    pub armed_at: Micros,
    pub last_rx: Option<Micros>,
    pub last_seq: Option<u32>,
    pub cache: BlockRef,
    pub meta: Option<RxMeta>,
    pub timed_out: bool,
    /// The timeout callback fires once per gap; cleared on fresh data.
    pub timeout_reported: bool,
}

impl Subscriber {
    pub fn matches(&self, com_id: u32, src: Ipv4Addr, dst: Ipv4Addr, if_index: u32) -> bool {
        if com_id != self.com_id {
            return false;
        }
        if !self.src_lo.is_unspecified() && src < self.src_lo {
            return false;
        }
        if !self.src_hi.is_unspecified() && src > self.src_hi {
            return false;
        }
        if let Some(group) = self.dest {
            if dst != group {
                return false;
            }
        }
        if let Some(want) = self.iface_index {
            // Zero means the receive path could not recover the interface;
            // accept rather than starve the element.
            if if_index != 0 && if_index != want {
                return false;
            }
        }
        true
    }

    /// The instant the receive timeout expires, if monitoring is on.
    pub fn deadline(&self) -> Option<Micros> {
        if self.timeout.is_zero() {
            return None;
        }
        Some(self.last_rx.unwrap_or(self.armed_at) + self.timeout)
    }
}

/// Snapshot returned by [`Session::get`](crate::Session::get).
#[derive(Clone, Debug)]
pub struct PdSample {
    pub meta: RxMeta,
    /// True while the element is in the timed-out state; the payload then
    /// reflects the configured timeout behavior.
    pub timed_out: bool,
    pub payload: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use mio::Token;
    use trdp_mem::BlockPool;

    use super::*;

    fn element(com_id: u32) -> Subscriber {
        let pool = BlockPool::unbounded();
        Subscriber {
            id: SubId { idx: 0, generation: 0 },
            com_id,
            src_lo: Ipv4Addr::UNSPECIFIED,
            src_hi: Ipv4Addr::UNSPECIFIED,
            dest: None,
            iface_index: None,
            join: None,
            sock: Token(0),
            timeout: Micros::from_secs(1),
            behavior: TimeoutBehavior::Keep,
            armed_at: Micros::ZERO,
            last_rx: None,
            last_seq: None,
            cache: pool.alloc(16).unwrap(),
            meta: None,
            timed_out: false,
            timeout_reported: false,
        }
    }

    #[test]
    fn source_range_filter() {
        let mut sub = element(1001);
        sub.src_lo = Ipv4Addr::new(10, 0, 0, 100);
        sub.src_hi = Ipv4Addr::new(10, 0, 0, 200);

        let any_dst = Ipv4Addr::UNSPECIFIED;
        assert!(sub.matches(1001, Ipv4Addr::new(10, 0, 0, 150), any_dst, 0));
        assert!(!sub.matches(1001, Ipv4Addr::new(10, 0, 0, 99), any_dst, 0));
        assert!(!sub.matches(1001, Ipv4Addr::new(10, 0, 0, 201), any_dst, 0));
        assert!(!sub.matches(1002, Ipv4Addr::new(10, 0, 0, 150), any_dst, 0));
    }

    #[test]
    fn multicast_group_must_match_destination() {
        let mut sub = element(1001);
        sub.dest = Some(Ipv4Addr::new(239, 0, 0, 1));

        let src = Ipv4Addr::new(10, 0, 1, 5);
        assert!(sub.matches(1001, src, Ipv4Addr::new(239, 0, 0, 1), 0));
        // A unicast frame, or another group, does not reach this element.
        assert!(!sub.matches(1001, src, Ipv4Addr::new(10, 0, 1, 1), 0));
        assert!(!sub.matches(1001, src, Ipv4Addr::new(239, 0, 0, 2), 0));
    }

    #[test]
    fn same_group_demultiplexes_by_arrival_interface() {
        // Two elements joined to 239.0.0.1, one per interface, as on a
        // multi-homed host.
        let group = Ipv4Addr::new(239, 0, 0, 1);
        let mut on_if2 = element(1001);
        on_if2.dest = Some(group);
        on_if2.iface_index = Some(2);
        let mut on_if3 = element(1002);
        on_if3.dest = Some(group);
        on_if3.iface_index = Some(3);

        let src = Ipv4Addr::new(10, 0, 1, 1);
        assert!(on_if2.matches(1001, src, group, 2));
        assert!(!on_if2.matches(1001, src, group, 3));
        assert!(on_if3.matches(1002, src, group, 3));
        assert!(!on_if3.matches(1002, src, group, 2));

        // Receive paths that cannot recover the interface fall back to
        // accepting.
        assert!(on_if2.matches(1001, src, group, 0));
    }

    #[test]
    fn deadline_counts_from_subscribe_until_first_frame() {
        let mut sub = element(7);
        sub.armed_at = Micros::from_millis(100);
        sub.timeout = Micros::from_millis(250);
        assert_eq!(sub.deadline(), Some(Micros::from_millis(350)));

        sub.last_rx = Some(Micros::from_millis(400));
        assert_eq!(sub.deadline(), Some(Micros::from_millis(650)));

        sub.timeout = Micros::ZERO;
        assert_eq!(sub.deadline(), None);
    }
}
