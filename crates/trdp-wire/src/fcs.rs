use crc::{CRC_32_ISO_HDLC, Crc};

/// CRC-32 (poly 0x04C11DB7 reflected, init/xorout 0xFFFFFFFF) as used for
/// both the header FCS and the payload trailer.
const FCS_ALG: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

#[inline]
pub fn fcs(bytes: &[u8]) -> u32 {
    FCS_ALG.checksum(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_reference_vector() {
        // The classic "123456789" check value for CRC-32/ISO-HDLC.
        assert_eq!(fcs(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn any_single_bit_flip_changes_fcs() {
        let data = *b"process data payload";
        let reference = fcs(&data);
        for byte in 0..data.len() {
            for bit in 0..8 {
                let mut flipped = data;
                flipped[byte] ^= 1 << bit;
                assert_ne!(fcs(&flipped), reference, "flip at {byte}:{bit} went unnoticed");
            }
        }
    }
}
