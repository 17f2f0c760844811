//! Fixed, versioned, little-endian wire types for exchange and gather/scatter rounds.

use bytemuck::{Pod, Zeroable};
use static_assertions::assert_eq_size;

pub fn cast_slice<T: Pod>(v: &[T]) -> &[u8] {
    bytemuck::cast_slice(v)
}

pub fn cast_slice_mut<T: Pod>(v: &mut [T]) -> &mut [u8] {
    bytemuck::cast_slice_mut(v)
}

/// Bump when the layout or semantics change in incompatible ways.
pub const WIRE_VERSION: u16 = 1;

// All multi-byte integers in these structs are **little-endian** on the wire.
// They are stored pre-LE with `.to_le()` and decoded with `.from_le()`.

/// Byte or record count of a following message.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireCount {
    pub n_le: u64,
}

impl WireCount {
    pub fn new(n: usize) -> Self {
        Self {
            n_le: (n as u64).to_le(),
        }
    }

    pub fn get(&self) -> usize {
        u64::from_le(self.n_le) as usize
    }
}

/// Header of one gather/scatter message to one peer.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireRoundHdr {
    pub version_le: u16,
    pub reserved_le: u16, // keep zero
    pub payload_size_le: u32,
    pub count_le: u32,
    pub _pad: u32,
}

impl WireRoundHdr {
    pub fn new(payload_size: usize, count: usize) -> Self {
        Self {
            version_le: WIRE_VERSION.to_le(),
            reserved_le: 0,
            payload_size_le: (payload_size as u32).to_le(),
            count_le: (count as u32).to_le(),
            _pad: 0,
        }
    }

    pub fn version(&self) -> u16 {
        u16::from_le(self.version_le)
    }

    pub fn payload_size(&self) -> usize {
        u32::from_le(self.payload_size_le) as usize
    }

    pub fn count(&self) -> usize {
        u32::from_le(self.count_le) as usize
    }
}

/// A GID carried on the wire; 0 is the "none" sentinel.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireGid {
    pub gid_le: u64,
}

impl WireGid {
    pub fn of(raw: u64) -> Self {
        Self { gid_le: raw.to_le() }
    }

    pub fn get(&self) -> u64 {
        u64::from_le(self.gid_le)
    }
}

assert_eq_size!(WireCount, u64);
assert_eq_size!(WireRoundHdr, [u8; 16]);
assert_eq_size!(WireGid, u64);

/// Encode `values` as consecutive little-endian u64s.
pub fn put_u64s(out: &mut Vec<u8>, values: &[u64]) {
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
}

/// Decode consecutive little-endian u64s; a trailing partial word is ignored.
pub fn get_u64s(data: &[u8]) -> Vec<u64> {
    data.chunks_exact(8)
        .map(|c| {
            let mut word = [0u8; 8];
            word.copy_from_slice(c);
            u64::from_le_bytes(word)
        })
        .collect()
}
