//! TRDP wire codec: header layouts, frame check sequences, byte-order
//! helpers. All multi-byte fields are big-endian on the wire.

mod bytes;
mod fcs;
mod md;
mod pd;
mod uri;

pub use bytes::{get_u16, get_u32, get_u64, put_u16, put_u32, put_u64};
pub use fcs::fcs;
pub use md::{MD_HEADER_SIZE, MD_MAX_PAYLOAD, MdHeader, MdMsgType, SessionUuid, md_frame_len};
pub use pd::{PD_HEADER_SIZE, PD_MAX_PAYLOAD, PdHeader, PdMsgType};
use thiserror::Error;
pub use uri::Uri;

/// Protocol version carried in every header. Only the major (high) byte is
/// compared on receive.
pub const PROTOCOL_VERSION: u16 = 0x0107;

/// Payload FCS trailer appended after a non-empty payload.
pub const FCS_SIZE: usize = 4;

/// Default UDP port for process data.
pub const PD_UDP_PORT: u16 = 17224;
/// Default UDP/TCP port for message data.
pub const MD_PORT: u16 = 17225;

/// Frame validation failures, one kind per stage so upper layers can count
/// them separately.
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("frame shorter than fixed header")]
    TooShort,
    #[error("unsupported protocol version {0:#06x}")]
    Version(u16),
    #[error("header FCS mismatch")]
    HeaderFcs,
    #[error("declared payload length inconsistent with frame")]
    Length,
    #[error("payload FCS mismatch")]
    PayloadFcs,
    #[error("topology counter mismatch")]
    Topo,
    #[error("unknown message type {0:#06x}")]
    MsgType(u16),
}

/// Topology check shared by PD and MD parsing. A zero on either side means
/// "accept any".
#[inline]
pub(crate) fn check_topo(frame: u32, local: u32) -> Result<(), WireError> {
    if frame != 0 && local != 0 && frame != local {
        return Err(WireError::Topo);
    }
    Ok(())
}
