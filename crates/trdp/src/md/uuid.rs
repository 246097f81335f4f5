use trdp_timing::Micros;
use trdp_wire::{SessionUuid, put_u64};

/// Session-UUID source. Layout: wall-clock µs since the Unix epoch in bytes
/// 0..8, a version nibble plus 12-bit rolling counter in bytes 8..10, and
/// the 6-byte node id in bytes 10..16. The Unix epoch is kept deliberately
/// for wire compatibility with deployed stacks even though RFC 4122 counts
/// from 1582.
pub(crate) struct UuidGen {
    counter: u16,
    node: [u8; 6],
}

impl UuidGen {
    pub fn new(node_mac: Option<[u8; 6]>) -> Self {
        let node = node_mac.unwrap_or_else(|| {
            let mut node: [u8; 6] = rand::random();
            // Mark a generated node id as local so it can never collide
            // with a real burned-in MAC.
            node[0] |= 0x01;
            node
        });
        Self { counter: rand::random(), node }
    }

    pub fn next(&mut self, now: Micros) -> SessionUuid {
        let mut bytes = [0u8; 16];
        put_u64(&mut bytes, 0, now.0);
        bytes[8] = 0x10 | ((self.counter >> 8) as u8 & 0x0F);
        bytes[9] = self.counter as u8;
        bytes[10..16].copy_from_slice(&self.node);
        self.counter = self.counter.wrapping_add(1);
        SessionUuid(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consecutive_uuids_differ() {
        let mut generator = UuidGen::new(None);
        let now = Micros::from_secs(1_700_000_000);
        let a = generator.next(now);
        let b = generator.next(now);
        assert_ne!(a, b);
    }

    #[test]
    fn timestamp_and_node_are_embedded() {
        let mac = [0x02, 0x42, 0xac, 0x11, 0x00, 0x07];
        let mut generator = UuidGen::new(Some(mac));
        let now = Micros(0x0102_0304_0506_0708);
        let uuid = generator.next(now);
        assert_eq!(&uuid.0[..8], &now.0.to_be_bytes());
        assert_eq!(&uuid.0[10..], &mac);
        assert_eq!(uuid.0[8] & 0xF0, 0x10);
    }

    #[test]
    fn generated_node_id_has_local_bit() {
        let generator = UuidGen::new(None);
        assert_eq!(generator.node[0] & 0x01, 0x01);
    }
}
