use std::net::Ipv4Addr;

use bitflags::bitflags;
use trdp_wire::{MdHeader, Uri};

use crate::handle::ListenerId;

bitflags! {
    /// Transports a listener accepts frames on.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct TransportMask: u8 {
        const UDP = 0b01;
        const TCP = 0b10;
    }
}

impl Default for TransportMask {
    fn default() -> Self {
        TransportMask::UDP
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Transport {
    Udp,
    Tcp,
}

/// Parameters for [`Session::add_listener`](crate::Session::add_listener).
///
/// Every filter field is optional; an absent field matches anything. When
/// several listeners match the same frame, the first in table order owns
/// the resulting session.
#[derive(Clone, Debug, Default)]
pub struct ListenerSpec {
    pub com_id: Option<u32>,
    pub src_range: Option<(Ipv4Addr, Ipv4Addr)>,
    /// Multicast group to join and accept requests on.
    pub dest: Option<Ipv4Addr>,
    /// Join interface for `dest` on multi-homed hosts.
    pub iface: Option<Ipv4Addr>,
    /// Filter on the sender's functional group.
    pub source_uri: Option<Uri>,
    /// Filter on the addressed functional group.
    pub dest_uri: Option<Uri>,
    pub transports: TransportMask,
}

impl ListenerSpec {
    pub fn for_com_id(com_id: u32) -> Self {
        Self { com_id: Some(com_id), ..Self::default() }
    }
}

pub(crate) struct Listener {
    pub id: ListenerId,
    pub com_id: Option<u32>,
    pub src_lo: Ipv4Addr,
    pub src_hi: Ipv4Addr,
    pub dest: Option<Ipv4Addr>,
    pub source_uri: Uri,
    pub dest_uri: Uri,
    pub transports: TransportMask,
    pub join: Option<(Ipv4Addr, Ipv4Addr)>,
}

impl Listener {
    pub fn matches(
        &self,
        header: &MdHeader,
        src: Ipv4Addr,
        dst: Ipv4Addr,
        transport: Transport,
    ) -> bool {
        let wanted = match transport {
            Transport::Udp => TransportMask::UDP,
            Transport::Tcp => TransportMask::TCP,
        };
        if !self.transports.contains(wanted) {
            return false;
        }
        if let Some(com_id) = self.com_id {
            if com_id != header.com_id {
                return false;
            }
        }
        if !self.src_lo.is_unspecified() && src < self.src_lo {
            return false;
        }
        if !self.src_hi.is_unspecified() && src > self.src_hi {
            return false;
        }
        if let Some(group) = self.dest {
            if transport == Transport::Udp && dst != group {
                return false;
            }
        }
        self.source_uri.matches(&header.source_uri) && self.dest_uri.matches(&header.dest_uri)
    }
}

#[cfg(test)]
mod tests {
    use trdp_wire::{MdMsgType, SessionUuid};

    use super::*;

    fn request_header(com_id: u32) -> MdHeader {
        MdHeader {
            seq: 0,
            msg_type: MdMsgType::Request,
            com_id,
            etb_topo: 0,
            op_topo: 0,
            reply_status: 0,
            session_id: SessionUuid::default(),
            reply_timeout_us: 0,
            num_replies: 0,
            source_uri: Uri::new("devCaller"),
            dest_uri: Uri::new("grpDoors"),
        }
    }

    fn rule() -> Listener {
        Listener {
            id: ListenerId { idx: 0, generation: 0 },
            com_id: None,
            src_lo: Ipv4Addr::UNSPECIFIED,
            src_hi: Ipv4Addr::UNSPECIFIED,
            dest: None,
            source_uri: Uri::EMPTY,
            dest_uri: Uri::EMPTY,
            transports: TransportMask::UDP,
            join: None,
        }
    }

    #[test]
    fn wildcard_listener_accepts_any_com_id() {
        let listener = rule();
        let src = Ipv4Addr::new(10, 0, 0, 1);
        assert!(listener.matches(&request_header(1), src, Ipv4Addr::UNSPECIFIED, Transport::Udp));
        assert!(listener.matches(&request_header(99), src, Ipv4Addr::UNSPECIFIED, Transport::Udp));
        // Wrong transport never matches.
        assert!(!listener.matches(&request_header(1), src, Ipv4Addr::UNSPECIFIED, Transport::Tcp));
    }

    #[test]
    fn uri_filters_are_functional_group_matches() {
        let mut listener = rule();
        listener.dest_uri = Uri::new("grpDoors");
        let src = Ipv4Addr::new(10, 0, 0, 1);
        assert!(listener.matches(&request_header(5), src, Ipv4Addr::UNSPECIFIED, Transport::Udp));

        listener.dest_uri = Uri::new("grpBrakes");
        assert!(!listener.matches(&request_header(5), src, Ipv4Addr::UNSPECIFIED, Transport::Udp));
    }

    #[test]
    fn group_filter_applies_to_datagrams_only() {
        let mut listener = rule();
        listener.transports = TransportMask::UDP | TransportMask::TCP;
        listener.dest = Some(Ipv4Addr::new(239, 1, 1, 1));
        let src = Ipv4Addr::new(10, 0, 0, 1);

        assert!(listener.matches(
            &request_header(5),
            src,
            Ipv4Addr::new(239, 1, 1, 1),
            Transport::Udp
        ));
        assert!(!listener.matches(&request_header(5), src, Ipv4Addr::UNSPECIFIED, Transport::Udp));
        // Streams have no datagram destination to filter on.
        assert!(listener.matches(&request_header(5), src, Ipv4Addr::UNSPECIFIED, Transport::Tcp));
    }
}
