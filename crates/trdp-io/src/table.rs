use std::net::{Ipv4Addr, SocketAddrV4};

use indexmap::IndexMap;
use mio::{Interest, Registry, Token};
use tracing::{debug, warn};

use crate::{IoError, udp::UdpEndpoint};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Proto {
    Udp,
    Tcp,
}

/// Discriminating socket options. A send or receive request may reuse an
/// existing socket only when every field matches; anything else opens a new
/// one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SockKey {
    pub proto: Proto,
    pub bind_ip: Ipv4Addr,
    pub port: u16,
    pub qos: u8,
    pub ttl: u8,
    pub vlan: u16,
    pub tsn: bool,
}

struct Entry {
    key: SockKey,
    endpoint: UdpEndpoint,
    refs: u32,
    /// Reference-counted multicast memberships per (group, interface).
    joins: IndexMap<(Ipv4Addr, Ipv4Addr), u32>,
}

/// Table of shared UDP endpoints. Tokens are `base + slot`; slots are stable
/// for the lifetime of an entry so tokens stay valid until the last user
/// releases.
pub struct SocketTable {
    base: usize,
    slots: Vec<Option<Entry>>,
}

impl SocketTable {
    pub fn new(token_base: usize) -> Self {
        Self { base: token_base, slots: Vec::new() }
    }

    /// Look up an entry with an identical key or open a new endpoint.
    pub fn acquire(&mut self, key: SockKey, registry: &Registry) -> Result<Token, IoError> {
        debug_assert!(key.proto == Proto::Udp, "tcp links live in the connection pool");

        if let Some(slot) = self.slot_of_key(&key) {
            let entry = self.slots[slot].as_mut().expect("occupied slot");
            entry.refs += 1;
            return Ok(Token(self.base + slot));
        }

        let mut endpoint = UdpEndpoint::open(&key).map_err(IoError::Sock)?;
        let slot = self.slots.iter().position(|s| s.is_none()).unwrap_or_else(|| {
            self.slots.push(None);
            self.slots.len() - 1
        });
        let token = Token(self.base + slot);
        registry.register(endpoint.mio(), token, Interest::READABLE)?;
        self.slots[slot] = Some(Entry { key, endpoint, refs: 1, joins: IndexMap::new() });
        Ok(token)
    }

    /// Drop one reference; the last release deregisters and closes.
    pub fn release(&mut self, token: Token, registry: &Registry) {
        let Some(slot) = self.slot_of_token(token) else {
            warn!(?token, "release of unknown socket");
            return;
        };
        let entry = self.slots[slot].as_mut().expect("occupied slot");
        entry.refs -= 1;
        if entry.refs == 0 {
            if let Err(err) = registry.deregister(entry.endpoint.mio()) {
                debug!(?err, "deregister on close");
            }
            debug!(key = ?entry.key, "udp endpoint closed");
            self.slots[slot] = None;
        }
    }

    /// Reference-counted membership: the first join per (group, interface)
    /// hits the kernel, further joins only count.
    pub fn join(&mut self, token: Token, group: Ipv4Addr, iface: Ipv4Addr) -> Result<(), IoError> {
        let entry = self.entry_mut(token).ok_or(IoError::NoConn)?;
        let count = entry.joins.entry((group, iface)).or_insert(0);
        if *count == 0 {
            entry.endpoint.join(group, iface)?;
            debug!(%group, %iface, "multicast join");
        }
        *count += 1;
        Ok(())
    }

    /// Counterpart of [`join`]; the last leave per (group, interface) hits
    /// the kernel.
    pub fn leave(&mut self, token: Token, group: Ipv4Addr, iface: Ipv4Addr) {
        let Some(entry) = self.entry_mut(token) else { return };
        let Some(count) = entry.joins.get_mut(&(group, iface)) else {
            warn!(%group, %iface, "leave without join");
            return;
        };
        *count -= 1;
        if *count == 0 {
            entry.joins.swap_remove(&(group, iface));
            if let Err(err) = entry.endpoint.leave(group, iface) {
                debug!(?err, %group, "multicast leave");
            } else {
                debug!(%group, %iface, "multicast left");
            }
        }
    }

    pub fn send_to(&self, token: Token, frame: &[u8], dst: SocketAddrV4) -> Result<usize, IoError> {
        let entry = self.entry(token).ok_or(IoError::NoConn)?;
        Ok(entry.endpoint.send_to(frame, dst)?)
    }

    pub fn endpoint(&self, token: Token) -> Option<&UdpEndpoint> {
        self.entry(token).map(|e| &e.endpoint)
    }

    pub fn contains(&self, token: Token) -> bool {
        self.entry(token).is_some()
    }

    #[cfg(test)]
    fn join_count(&self, token: Token, group: Ipv4Addr, iface: Ipv4Addr) -> u32 {
        self.entry(token).and_then(|e| e.joins.get(&(group, iface)).copied()).unwrap_or(0)
    }

    fn slot_of_key(&self, key: &SockKey) -> Option<usize> {
        self.slots.iter().position(|s| s.as_ref().is_some_and(|e| e.key == *key))
    }

    fn slot_of_token(&self, token: Token) -> Option<usize> {
        let slot = token.0.checked_sub(self.base)?;
        (slot < self.slots.len() && self.slots[slot].is_some()).then_some(slot)
    }

    fn entry(&self, token: Token) -> Option<&Entry> {
        self.slot_of_token(token).and_then(|slot| self.slots[slot].as_ref())
    }

    fn entry_mut(&mut self, token: Token) -> Option<&mut Entry> {
        self.slot_of_token(token).and_then(|slot| self.slots[slot].as_mut())
    }
}
