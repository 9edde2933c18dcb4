//! Payload compression strategies.

use std::fmt;
use std::io::{self, Read, Write};

/// Wire name used when no compressor is configured.
pub const IDENTITY: &str = "identity";

/// A named payload compression strategy.
///
/// Chosen once at client construction; its [`name`](Compressor::name) is
/// advertised through the `content-encoding` family of headers.
pub trait Compressor: Send + Sync + fmt::Debug {
    /// Encoding name (e.g. `gzip`).
    fn name(&self) -> &str;

    /// Compresses a serialized message.
    fn compress(&self, data: &[u8]) -> io::Result<Vec<u8>>;

    /// Decompresses a received payload, producing at most `limit + 1`
    /// bytes. A result longer than `limit` means the payload inflates past
    /// the limit.
    fn decompress(&self, data: &[u8], limit: usize) -> io::Result<Vec<u8>>;
}

/// Gzip compression backed by [`flate2`].
#[derive(Debug, Clone, Copy)]
pub struct Gzip {
    /// Compression level, 0–9.
    level: u32,
}

impl Gzip {
    /// Creates a gzip compressor with the given level (clamped to 0–9).
    pub fn new(level: u32) -> Self {
        Self {
            level: level.min(9),
        }
    }
}

impl Default for Gzip {
    fn default() -> Self {
        Self::new(6)
    }
}

impl Compressor for Gzip {
    fn name(&self) -> &str {
        "gzip"
    }

    fn compress(&self, data: &[u8]) -> io::Result<Vec<u8>> {
        let mut enc =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::new(self.level));
        enc.write_all(data)?;
        enc.finish()
    }

    fn decompress(&self, data: &[u8], limit: usize) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        flate2::read::GzDecoder::new(data)
            .take((limit as u64).saturating_add(1))
            .read_to_end(&mut out)?;
        Ok(out)
    }
}
