use crate::error::Result;

/// Optional dataset (un)marshalling seam. The engine treats payloads as
/// opaque bytes; a host that needs endian conversion of structured datasets
/// installs an implementation and the engine calls it at the payload
/// boundary — outbound before the FCS is computed, inbound before the
/// payload is cached or indicated.
pub trait Marshaller: Send {
    /// Convert a host-side dataset to its wire form. Unknown `com_id`s
    /// should fail with [`Error::ComId`](crate::Error::ComId).
    fn marshall(&mut self, com_id: u32, src: &[u8], dst: &mut Vec<u8>) -> Result<()>;

    /// Convert a wire payload to its host form.
    fn unmarshall(&mut self, com_id: u32, src: &[u8], dst: &mut Vec<u8>) -> Result<()>;
}
