//! Incremental, sans-IO envelope reassembly.
//!
//! Bytes are [`push`](Reassembler::push)ed in whatever chunks the transport
//! produced; [`next_frame`](Reassembler::next_frame) yields complete frames
//! once enough bytes are buffered. The split of the input into chunks never
//! affects the output.
//!
//! ```ignore
//! let mut r = Reassembler::new(None);
//! loop {
//!     match r.next_message::<Event>(Codec::Json)? {
//!         Some(Frame::Message(ev)) => handle(ev),
//!         Some(Frame::End(_)) => break,
//!         None => r.push(&read_more()?),
//!     }
//! }
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::codec::Codec;
use crate::compress::Compressor;
use crate::envelope::{HEADER_LEN, Header};
use crate::error::{Code, RpcError, Trailer};

/// Default maximum message size (16 MiB).
pub const DEFAULT_MAX_MESSAGE_LEN: u32 = 16 * 1024 * 1024;

/// Consumed bytes are compacted away once they exceed this many.
const COMPACT_THRESHOLD: usize = 64 * 1024;

/// Trailing metadata from a successful end-of-stream envelope.
pub type Metadata = HashMap<String, Vec<String>>;

/// One reassembled unit of a stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame<T = Vec<u8>> {
    /// A data message (decompressed payload, or decoded message).
    Message(T),
    /// The stream ended successfully.
    End(Metadata),
}

/// Reassembles envelopes from an arbitrary chunking of the wire bytes.
#[derive(Debug)]
pub struct Reassembler {
    /// Received bytes; everything before `offset` is consumed.
    buf: Vec<u8>,
    /// Read position in `buf`.
    offset: usize,
    /// Header of the envelope whose payload is still incomplete.
    pending: Option<Header>,
    /// Decompressor for payloads with the compressed flag.
    compressor: Option<Arc<dyn Compressor>>,
    /// Largest accepted payload, before and after decompression.
    max_len: u32,
    /// Set once the trailer or a protocol error was produced.
    finished: bool,
}

impl Reassembler {
    /// Creates an empty reassembler.
    pub fn new(compressor: Option<Arc<dyn Compressor>>) -> Self {
        Self {
            buf: Vec::new(),
            offset: 0,
            pending: None,
            compressor,
            max_len: DEFAULT_MAX_MESSAGE_LEN,
            finished: false,
        }
    }

    /// Sets the maximum accepted message length.
    #[must_use]
    pub const fn with_max_len(mut self, max_len: u32) -> Self {
        self.max_len = max_len;
        self
    }

    /// Appends a received chunk. Ignored once the stream has finished.
    pub fn push(&mut self, chunk: &[u8]) {
        if self.finished {
            return;
        }
        self.compact();
        self.buf.extend_from_slice(chunk);
    }

    /// Returns `true` once the trailer or an error has been produced.
    pub const fn is_finished(&self) -> bool {
        self.finished
    }

    /// Returns `true` if no partial envelope is buffered.
    pub fn is_idle(&self) -> bool {
        self.pending.is_none() && self.offset == self.buf.len()
    }

    /// Returns the next complete frame, or `None` if more bytes are needed
    /// (or the stream already finished).
    ///
    /// A trailer carrying an error is returned as `Err`; after it, or after
    /// any protocol error, no further frames are produced.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, RpcError> {
        if self.finished {
            return Ok(None);
        }
        let result = self.advance();
        if result.is_err() {
            self.finished = true;
        }
        result
    }

    /// Like [`next_frame`](Self::next_frame), decoding data payloads with `codec`.
    pub fn next_message<T: DeserializeOwned>(
        &mut self,
        codec: Codec,
    ) -> Result<Option<Frame<T>>, RpcError> {
        match self.next_frame()? {
            Some(Frame::Message(payload)) => match codec.decode(&payload) {
                Ok(msg) => Ok(Some(Frame::Message(msg))),
                Err(e) => {
                    self.finished = true;
                    Err(e)
                }
            },
            Some(Frame::End(md)) => Ok(Some(Frame::End(md))),
            None => Ok(None),
        }
    }

    /// One step of the header/payload state machine.
    fn advance(&mut self) -> Result<Option<Frame>, RpcError> {
        let header = match self.pending {
            Some(h) => h,
            None => {
                let unread = &self.buf[self.offset..];
                let Some(raw) = unread.first_chunk::<HEADER_LEN>() else {
                    return Ok(None);
                };
                let h = Header::from_bytes(raw)?;
                if h.len > self.max_len {
                    return Err(too_large(u64::from(h.len), self.max_len));
                }
                self.offset += HEADER_LEN;
                self.pending = Some(h);
                h
            }
        };

        let len = header.len as usize;
        if self.buf.len() - self.offset < len {
            return Ok(None);
        }
        let payload = self.buf[self.offset..self.offset + len].to_vec();
        self.offset += len;
        // The next envelope's header must be read fresh.
        self.pending = None;

        let payload = if header.flags.is_compressed() {
            self.decompress(&payload)?
        } else {
            payload
        };

        if header.flags.is_end_stream() {
            self.finished = true;
            let trailer: Trailer = if payload.is_empty() {
                Trailer::default()
            } else {
                serde_json::from_slice(&payload).map_err(|e| {
                    RpcError::new(Code::Internal, format!("undecodable end-of-stream trailer: {e}"))
                })?
            };
            return trailer.into_result().map(|md| Some(Frame::End(md)));
        }
        Ok(Some(Frame::Message(payload)))
    }

    /// Decompresses a payload flagged as compressed.
    fn decompress(&self, payload: &[u8]) -> Result<Vec<u8>, RpcError> {
        let Some(compressor) = &self.compressor else {
            return Err(RpcError::new(
                Code::Internal,
                "received compressed envelope but no compressor is configured",
            ));
        };
        let out = compressor.decompress(payload, self.max_len as usize).map_err(|e| {
            RpcError::new(
                Code::Internal,
                format!("failed to decompress {} payload: {e}", compressor.name()),
            )
        })?;
        if out.len() > self.max_len as usize {
            return Err(too_large(out.len() as u64, self.max_len));
        }
        Ok(out)
    }

    /// Drops consumed bytes from the front of the buffer.
    fn compact(&mut self) {
        if self.offset == self.buf.len() {
            self.buf.clear();
            self.offset = 0;
        } else if self.offset >= COMPACT_THRESHOLD {
            self.buf.drain(..self.offset);
            self.offset = 0;
        }
    }
}

fn too_large(len: u64, max: u32) -> RpcError {
    RpcError::new(
        Code::ResourceExhausted,
        format!("message of {len} bytes exceeds limit of {max} bytes"),
    )
}
