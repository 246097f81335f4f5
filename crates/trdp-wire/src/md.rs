use std::fmt;

use crate::{
    FCS_SIZE, PROTOCOL_VERSION, WireError,
    bytes::{get_u16, get_u32, put_u16, put_u32},
    check_topo,
    fcs::fcs,
    uri::Uri,
};

/// Full fixed MD header length. The first 44 bytes (through the session
/// identifier) form the core; reply timeout, expected-reply count, the two
/// URIs and the header FCS follow.
pub const MD_HEADER_SIZE: usize = 120;

/// Largest MD payload (TCP transport; UDP is bounded by the datagram size).
pub const MD_MAX_PAYLOAD: usize = 65388;

const HEADER_FCS_OFF: usize = 116;

/// 128-bit correlator tying Request, Reply and Confirm of one transaction
/// together. Opaque at this layer; generation lives with the MD engine.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct SessionUuid(pub [u8; 16]);

impl fmt::Debug for SessionUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, b) in self.0.iter().enumerate() {
            if matches!(i, 4 | 6 | 8 | 10) {
                write!(f, "-")?;
            }
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum MdMsgType {
    /// 'Mn' — notification, no reply expected.
    Notify = 0x4D6E,
    /// 'Mr' — request.
    Request = 0x4D72,
    /// 'Mp' — reply without confirmation.
    Reply = 0x4D70,
    /// 'Mq' — reply demanding confirmation.
    ReplyQuery = 0x4D71,
    /// 'Mc' — confirmation.
    Confirm = 0x4D63,
    /// 'Me' — error reply.
    Error = 0x4D65,
}

impl MdMsgType {
    fn from_wire(raw: u16) -> Result<Self, WireError> {
        match raw {
            0x4D6E => Ok(MdMsgType::Notify),
            0x4D72 => Ok(MdMsgType::Request),
            0x4D70 => Ok(MdMsgType::Reply),
            0x4D71 => Ok(MdMsgType::ReplyQuery),
            0x4D63 => Ok(MdMsgType::Confirm),
            0x4D65 => Ok(MdMsgType::Error),
            other => Err(WireError::MsgType(other)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MdHeader {
    pub seq: u32,
    pub msg_type: MdMsgType,
    pub com_id: u32,
    pub etb_topo: u32,
    pub op_topo: u32,
    pub reply_status: i32,
    pub session_id: SessionUuid,
    /// Reply timeout in µs as announced to the replier.
    pub reply_timeout_us: u32,
    /// 0 = unknown number of repliers.
    pub num_replies: u32,
    pub source_uri: Uri,
    pub dest_uri: Uri,
}

impl MdHeader {
    /// Assemble a full frame (header, payload, payload FCS) into `out`.
    pub fn encode(&self, payload: &[u8], out: &mut Vec<u8>) {
        out.clear();
        out.resize(MD_HEADER_SIZE, 0);

        put_u32(out, 0, self.seq);
        put_u16(out, 4, PROTOCOL_VERSION);
        put_u16(out, 6, self.msg_type as u16);
        put_u32(out, 8, self.com_id);
        put_u32(out, 12, self.etb_topo);
        put_u32(out, 16, self.op_topo);
        put_u32(out, 20, payload.len() as u32);
        put_u32(out, 24, self.reply_status as u32);
        out[28..44].copy_from_slice(&self.session_id.0);
        put_u32(out, 44, self.reply_timeout_us);
        put_u32(out, 48, self.num_replies);
        out[52..84].copy_from_slice(self.source_uri.as_bytes());
        out[84..116].copy_from_slice(self.dest_uri.as_bytes());
        let header_fcs = fcs(&out[..HEADER_FCS_OFF]);
        put_u32(out, HEADER_FCS_OFF, header_fcs);

        if !payload.is_empty() {
            out.extend_from_slice(payload);
            out.extend_from_slice(&fcs(payload).to_be_bytes());
        }
    }

    /// Validate and split an inbound frame; same staged checks as PD.
    pub fn parse(frame: &[u8], etb_topo: u32, op_topo: u32) -> Result<(Self, &[u8]), WireError> {
        if frame.len() < MD_HEADER_SIZE {
            return Err(WireError::TooShort);
        }

        let version = get_u16(frame, 4);
        if version >> 8 != PROTOCOL_VERSION >> 8 {
            return Err(WireError::Version(version));
        }

        if fcs(&frame[..HEADER_FCS_OFF]) != get_u32(frame, HEADER_FCS_OFF) {
            return Err(WireError::HeaderFcs);
        }

        let payload_len = get_u32(frame, 20) as usize;
        if payload_len > MD_MAX_PAYLOAD {
            return Err(WireError::Length);
        }
        let expected = if payload_len == 0 {
            MD_HEADER_SIZE
        } else {
            MD_HEADER_SIZE + payload_len + FCS_SIZE
        };
        if frame.len() != expected {
            return Err(WireError::Length);
        }

        let payload = &frame[MD_HEADER_SIZE..MD_HEADER_SIZE + payload_len];
        if payload_len > 0 {
            let trailer = get_u32(frame, MD_HEADER_SIZE + payload_len);
            if fcs(payload) != trailer {
                return Err(WireError::PayloadFcs);
            }
        }

        check_topo(get_u32(frame, 12), etb_topo)?;
        check_topo(get_u32(frame, 16), op_topo)?;

        let mut session_id = SessionUuid::default();
        session_id.0.copy_from_slice(&frame[28..44]);

        let header = MdHeader {
            seq: get_u32(frame, 0),
            msg_type: MdMsgType::from_wire(get_u16(frame, 6))?,
            com_id: get_u32(frame, 8),
            etb_topo: get_u32(frame, 12),
            op_topo: get_u32(frame, 16),
            reply_status: get_u32(frame, 24) as i32,
            session_id,
            reply_timeout_us: get_u32(frame, 44),
            num_replies: get_u32(frame, 48),
            source_uri: Uri::from_wire(&frame[52..84]),
            dest_uri: Uri::from_wire(&frame[84..116]),
        };
        Ok((header, payload))
    }
}

/// Total frame length implied by a complete fixed header; used by the TCP
/// reassembler to size the remainder of the read.
pub fn md_frame_len(header: &[u8]) -> Result<usize, WireError> {
    if header.len() < MD_HEADER_SIZE {
        return Err(WireError::TooShort);
    }
    let payload_len = get_u32(header, 20) as usize;
    if payload_len > MD_MAX_PAYLOAD {
        return Err(WireError::Length);
    }
    Ok(if payload_len == 0 { MD_HEADER_SIZE } else { MD_HEADER_SIZE + payload_len + FCS_SIZE })
}
