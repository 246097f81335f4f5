use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use trdp_mem::NUM_CLASSES;
use trdp_timing::Micros;
use trdp_wire::{MD_PORT, PD_UDP_PORT};

/// What a subscriber's cache does when its receive timeout fires.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeoutBehavior {
    /// Keep the last received payload.
    #[default]
    Keep,
    /// Zero the cached payload.
    Zero,
}

/// Per-send socket options. All fields discriminate socket reuse; two
/// publishers with different send parameters never share a socket.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SendParam {
    pub qos: u8,
    pub ttl: u8,
    /// UDP request retransmissions (MD only).
    pub retries: u32,
    pub vlan: u16,
    pub tsn: bool,
}

impl Default for SendParam {
    fn default() -> Self {
        Self { qos: 5, ttl: 64, retries: 2, vlan: 0, tsn: false }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PdConfig {
    pub port: u16,
    /// Default subscriber timeout when `subscribe` passes zero.
    pub timeout: Micros,
    pub behavior: TimeoutBehavior,
    pub send_param: SendParam,
    /// Max datagrams sent per `process` cycle; `None` disables pacing.
    pub pacing: Option<u32>,
}

impl Default for PdConfig {
    fn default() -> Self {
        Self {
            port: PD_UDP_PORT,
            timeout: Micros::from_secs(10),
            behavior: TimeoutBehavior::Keep,
            send_param: SendParam::default(),
            pacing: None,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MdConfig {
    pub udp_port: u16,
    pub tcp_port: u16,
    /// Default caller reply timeout when `request` passes zero.
    pub reply_timeout: Micros,
    pub confirm_timeout: Micros,
    pub connect_timeout: Micros,
    pub send_param: SendParam,
    /// Bound on concurrently open transactions.
    pub max_sessions: usize,
}

impl Default for MdConfig {
    fn default() -> Self {
        Self {
            udp_port: MD_PORT,
            tcp_port: MD_PORT,
            reply_timeout: Micros::from_secs(5),
            confirm_timeout: Micros::from_secs(1),
            connect_timeout: Micros::from_secs(2),
            send_param: SendParam { qos: 3, ..SendParam::default() },
            max_sessions: 1000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Own address; `0.0.0.0` lets the stack pick per send.
    pub host_ip: Ipv4Addr,
    /// Interface MAC used as the session-UUID node id; a random node id
    /// with the local bit set is generated when absent.
    pub node_mac: Option<[u8; 6]>,
    /// Memory pool arena in bytes; 0 delegates to the heap.
    pub arena_bytes: usize,
    /// Pre-fragmentation request, blocks per size class.
    pub prealloc: [u32; NUM_CLASSES],
    pub pd: PdConfig,
    pub md: MdConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host_ip: Ipv4Addr::UNSPECIFIED,
            node_mac: None,
            arena_bytes: 0,
            prealloc: [0; NUM_CLASSES],
            pd: PdConfig::default(),
            md: MdConfig::default(),
        }
    }
}
