use std::net::Ipv4Addr;

use crate::{
    FCS_SIZE, PROTOCOL_VERSION, WireError,
    bytes::{get_u16, get_u32, put_u16, put_u32},
    check_topo,
    fcs::fcs,
};

/// Fixed PD header length; a 4-byte payload FCS trailer follows non-empty
/// payloads.
pub const PD_HEADER_SIZE: usize = 40;

/// Largest PD payload that still fits one Ethernet frame with the TRDP and
/// UDP/IP overhead.
pub const PD_MAX_PAYLOAD: usize = 1436;

const HEADER_FCS_OFF: usize = 36;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum PdMsgType {
    /// 'Pd' — cyclic process data.
    Data = 0x5064,
    /// 'Pp' — reply to a pull request.
    PullReply = 0x5070,
    /// 'Pr' — pull request carrying the reply com-id and reply address.
    PullRequest = 0x5072,
}

impl PdMsgType {
    fn from_wire(raw: u16) -> Result<Self, WireError> {
        match raw {
            0x5064 => Ok(PdMsgType::Data),
            0x5070 => Ok(PdMsgType::PullReply),
            0x5072 => Ok(PdMsgType::PullRequest),
            other => Err(WireError::MsgType(other)),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PdHeader {
    pub seq: u32,
    pub msg_type: PdMsgType,
    pub com_id: u32,
    pub etb_topo: u32,
    pub op_topo: u32,
    /// Only meaningful for 'Pr' frames.
    pub reply_com_id: u32,
    pub reply_ip: Ipv4Addr,
}

impl PdHeader {
    pub fn data(seq: u32, com_id: u32, etb_topo: u32, op_topo: u32) -> Self {
        Self {
            seq,
            msg_type: PdMsgType::Data,
            com_id,
            etb_topo,
            op_topo,
            reply_com_id: 0,
            reply_ip: Ipv4Addr::UNSPECIFIED,
        }
    }

    /// Assemble a full frame (header, payload, payload FCS) into `out`.
    pub fn encode(&self, payload: &[u8], out: &mut Vec<u8>) {
        out.clear();
        out.resize(PD_HEADER_SIZE, 0);

        put_u32(out, 0, self.seq);
        put_u16(out, 4, PROTOCOL_VERSION);
        put_u16(out, 6, self.msg_type as u16);
        put_u32(out, 8, self.com_id);
        put_u32(out, 12, self.etb_topo);
        put_u32(out, 16, self.op_topo);
        put_u32(out, 20, payload.len() as u32);
        put_u32(out, 24, 0);
        put_u32(out, 28, self.reply_com_id);
        put_u32(out, 32, self.reply_ip.to_bits());
        let header_fcs = fcs(&out[..HEADER_FCS_OFF]);
        put_u32(out, HEADER_FCS_OFF, header_fcs);

        if !payload.is_empty() {
            out.extend_from_slice(payload);
            out.extend_from_slice(&fcs(payload).to_be_bytes());
        }
    }

    /// Validate and split an inbound frame. Checks run in a fixed order so
    /// each failure mode maps to one distinct error kind: length, version,
    /// header FCS, declared length, payload FCS, topology counters.
    pub fn parse(frame: &[u8], etb_topo: u32, op_topo: u32) -> Result<(Self, &[u8]), WireError> {
        if frame.len() < PD_HEADER_SIZE {
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
        if payload_len > PD_MAX_PAYLOAD {
            return Err(WireError::Length);
        }
        let expected = if payload_len == 0 {
            PD_HEADER_SIZE
        } else {
            PD_HEADER_SIZE + payload_len + FCS_SIZE
        };
        if frame.len() != expected {
            return Err(WireError::Length);
        }

        let payload = &frame[PD_HEADER_SIZE..PD_HEADER_SIZE + payload_len];
        if payload_len > 0 {
            let trailer = get_u32(frame, PD_HEADER_SIZE + payload_len);
            if fcs(payload) != trailer {
                return Err(WireError::PayloadFcs);
            }
        }

        check_topo(get_u32(frame, 12), etb_topo)?;
        check_topo(get_u32(frame, 16), op_topo)?;

        let header = PdHeader {
            seq: get_u32(frame, 0),
            msg_type: PdMsgType::from_wire(get_u16(frame, 6))?,
            com_id: get_u32(frame, 8),
            etb_topo: get_u32(frame, 12),
            op_topo: get_u32(frame, 16),
            reply_com_id: get_u32(frame, 28),
            reply_ip: Ipv4Addr::from_bits(get_u32(frame, 32)),
        };
        Ok((header, payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_frame() -> Vec<u8> {
        let mut out = Vec::new();
        PdHeader::data(7, 2001, 0, 0).encode(&[1, 2, 3, 4], &mut out);
        out
    }

    #[test]
    fn encode_parse_round_trip() {
        let frame = sample_frame();
        assert_eq!(frame.len(), PD_HEADER_SIZE + 4 + FCS_SIZE);

        let (header, payload) = PdHeader::parse(&frame, 0, 0).unwrap();
        assert_eq!(header.seq, 7);
        assert_eq!(header.com_id, 2001);
        assert_eq!(header.msg_type, PdMsgType::Data);
        assert_eq!(payload, &[1, 2, 3, 4]);
    }

    #[test]
    fn empty_payload_has_no_trailer() {
        let mut out = Vec::new();
        PdHeader::data(0, 1, 0, 0).encode(&[], &mut out);
        assert_eq!(out.len(), PD_HEADER_SIZE);
        let (_, payload) = PdHeader::parse(&out, 0, 0).unwrap();
        assert!(payload.is_empty());
    }

    #[test]
    fn header_bit_flip_fails_header_fcs() {
        let mut frame = sample_frame();
        frame[9] ^= 0x01;
        assert_eq!(PdHeader::parse(&frame, 0, 0), Err(WireError::HeaderFcs));
    }

    #[test]
    fn payload_bit_flip_fails_payload_fcs() {
        let mut frame = sample_frame();
        frame[PD_HEADER_SIZE + 1] ^= 0x80;
        assert_eq!(PdHeader::parse(&frame, 0, 0), Err(WireError::PayloadFcs));
    }

    #[test]
    fn truncated_frame_rejected() {
        let frame = sample_frame();
        assert_eq!(PdHeader::parse(&frame[..frame.len() - 1], 0, 0), Err(WireError::Length));
        assert_eq!(PdHeader::parse(&frame[..10], 0, 0), Err(WireError::TooShort));
    }

    #[test]
    fn version_minor_mismatch_passes_major_mismatch_fails() {
        let mut frame = sample_frame();
        // Bump the minor version; the header FCS must be recomputed to get
        // past the FCS stage.
        frame[5] = 0x08;
        let new_fcs = fcs(&frame[..HEADER_FCS_OFF]);
        frame[HEADER_FCS_OFF..HEADER_FCS_OFF + 4].copy_from_slice(&new_fcs.to_be_bytes());
        assert!(PdHeader::parse(&frame, 0, 0).is_ok());

        frame[4] = 0x02;
        assert_eq!(PdHeader::parse(&frame, 0, 0), Err(WireError::Version(0x0208)));
    }

    #[test]
    fn topology_zero_matches_anything() {
        let mut out = Vec::new();
        PdHeader::data(1, 5, 23, 42).encode(&[9], &mut out);

        assert!(PdHeader::parse(&out, 23, 42).is_ok());
        assert!(PdHeader::parse(&out, 0, 0).is_ok());
        assert_eq!(PdHeader::parse(&out, 24, 42), Err(WireError::Topo));
        assert_eq!(PdHeader::parse(&out, 23, 43), Err(WireError::Topo));

        let mut zeroed = Vec::new();
        PdHeader::data(1, 5, 0, 0).encode(&[9], &mut zeroed);
        assert!(PdHeader::parse(&zeroed, 99, 99).is_ok());
    }
}
