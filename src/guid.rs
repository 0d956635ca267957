//! Guid wire layouts.
//!
//! Guids appear on the wire in two layouts: the **GEP layout** (fully
//! big-endian, identical to RFC 4122 byte order) and the **.NET layout**
//! (first three fields little-endian, last eight bytes unchanged). Conversion
//! between the two is the byte permutation `{3,2,1,0,5,4,7,6,8..15}`, which is
//! its own inverse. In-memory code always holds a [`uuid::Uuid`]; layout
//! choices exist only at the wire boundary.

use uuid::Uuid;

/// Reorders Guid bytes between the .NET and GEP layouts.
///
/// Applying the swap twice yields the original bytes.
pub fn swap_guid_endianness(bytes: &[u8; 16]) -> [u8; 16] {
    [
        bytes[3], bytes[2], bytes[1], bytes[0], bytes[5], bytes[4], bytes[7], bytes[6], bytes[8],
        bytes[9], bytes[10], bytes[11], bytes[12], bytes[13], bytes[14], bytes[15],
    ]
}

/// Guid bytes in the GEP (big-endian) wire layout.
pub fn to_gep_bytes(id: &Uuid) -> [u8; 16] {
    *id.as_bytes()
}

/// Parses a Guid from GEP (big-endian) wire bytes.
pub fn from_gep_bytes(bytes: &[u8; 16]) -> Uuid {
    Uuid::from_bytes(*bytes)
}

/// Guid bytes in the .NET (mixed-endian) wire layout.
pub fn to_net_bytes(id: &Uuid) -> [u8; 16] {
    swap_guid_endianness(id.as_bytes())
}

/// Parses a Guid from .NET (mixed-endian) wire bytes.
pub fn from_net_bytes(bytes: &[u8; 16]) -> Uuid {
    Uuid::from_bytes(swap_guid_endianness(bytes))
}
