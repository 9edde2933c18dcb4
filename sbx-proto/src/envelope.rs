//! Envelope framing for streaming calls.
//!
//! Each envelope is: `[u8 flags][u32 big-endian length][payload]`.
//!
//! ```text
//! +0  flags:   u8   - bit 0 = compressed, bit 1 = end of stream
//! +1  length:  u32  - payload length in bytes (big-endian)
//! +5  payload: [u8; length]
//! ```

use std::fmt;

use crate::error::{Code, RpcError};

/// Size of the envelope header in bytes.
pub const HEADER_LEN: usize = 5;

/// Envelope flag bits.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Flags(u8);

impl Flags {
    /// No flags set: an uncompressed data envelope.
    pub const NONE: Self = Self(0);
    /// Payload is compressed with the negotiated compressor.
    pub const COMPRESSED: Self = Self(0b01);
    /// Envelope carries the end-of-stream trailer.
    pub const END_STREAM: Self = Self(0b10);

    /// Every bit this protocol assigns a meaning to.
    const KNOWN: u8 = Self::COMPRESSED.0 | Self::END_STREAM.0;

    /// Builds flags from a raw byte, rejecting unknown bits.
    pub fn from_bits(bits: u8) -> Result<Self, RpcError> {
        if bits & !Self::KNOWN != 0 {
            return Err(RpcError::new(
                Code::Internal,
                format!("malformed envelope: unknown flag bits {bits:#04x}"),
            ));
        }
        Ok(Self(bits))
    }

    /// Returns the raw flag byte.
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Returns `true` if every bit in `other` is also set in `self`.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns `true` if the payload is compressed.
    pub const fn is_compressed(self) -> bool {
        self.contains(Self::COMPRESSED)
    }

    /// Returns `true` if this is the end-of-stream envelope.
    pub const fn is_end_stream(self) -> bool {
        self.contains(Self::END_STREAM)
    }
}

impl std::ops::BitOr for Flags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flags")
            .field("compressed", &self.is_compressed())
            .field("end_stream", &self.is_end_stream())
            .finish()
    }
}

/// Decoded envelope header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Flag bits.
    pub flags: Flags,
    /// Payload length in bytes.
    pub len: u32,
}

impl Header {
    /// Creates a header.
    pub const fn new(flags: Flags, len: u32) -> Self {
        Self { flags, len }
    }

    /// Parses a header from exactly [`HEADER_LEN`] bytes.
    pub fn from_bytes(bytes: &[u8; HEADER_LEN]) -> Result<Self, RpcError> {
        let flags = Flags::from_bits(bytes[0])?;
        let len = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
        Ok(Self { flags, len })
    }

    /// Serializes the header.
    pub fn to_bytes(self) -> [u8; HEADER_LEN] {
        let len = self.len.to_be_bytes();
        [self.flags.bits(), len[0], len[1], len[2], len[3]]
    }
}

/// Frames `payload` behind a header carrying `flags`.
pub fn encode(flags: Flags, payload: &[u8]) -> Result<Vec<u8>, RpcError> {
    let len = u32::try_from(payload.len()).map_err(|_| {
        RpcError::new(
            Code::ResourceExhausted,
            format!("message of {} bytes exceeds u32::MAX", payload.len()),
        )
    })?;
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&Header::new(flags, len).to_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip_all_flags_and_lengths() {
        let flag_sets = [
            Flags::NONE,
            Flags::COMPRESSED,
            Flags::END_STREAM,
            Flags::COMPRESSED | Flags::END_STREAM,
        ];
        for flags in flag_sets {
            for len in [0, 1, 65_535, 1 << 20] {
                let header = Header::new(flags, len);
                let decoded = Header::from_bytes(&header.to_bytes()).unwrap();
                assert_eq!(decoded, header);
            }
        }
    }

    #[test]
    fn length_is_big_endian() {
        let bytes = Header::new(Flags::END_STREAM, 0x0102_0304).to_bytes();
        assert_eq!(bytes, [0x02, 0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn rejects_unknown_flag_bits() {
        let err = Header::from_bytes(&[0x80, 0, 0, 0, 0]).unwrap_err();
        assert_eq!(err.code, Code::Internal);
    }

    #[test]
    fn encode_prefixes_payload() {
        let framed = encode(Flags::COMPRESSED, b"abc").unwrap();
        assert_eq!(framed, [0x01, 0, 0, 0, 3, b'a', b'b', b'c']);
    }
}
