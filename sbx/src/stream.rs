//! Blocking server stream over an HTTP response body.

use std::fmt;
use std::io::Read;
use std::marker::PhantomData;

use sbx_proto::{Code, Codec, Frame, Metadata, Reassembler, RpcError};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{Error, Result};
use crate::socket::AbortHandle;
use crate::transport::map_io_error;

/// Bytes requested from the body per read.
const READ_CHUNK: usize = 16 * 1024;

/// Messages of a server-streaming call.
///
/// Iterating blocks on the response body. The iterator yields each message
/// in order and ends after the trailer. A trailer error, a truncated or
/// malformed envelope, or a transport failure is yielded once as `Err`;
/// nothing follows it.
pub struct ServerStream<T> {
    /// Response body.
    body: Box<dyn Read + Send>,
    /// Shuts the body's connection down.
    abort: AbortHandle,
    /// Envelope reassembly state.
    reassembler: Reassembler,
    /// Payload codec.
    codec: Codec,
    /// Read buffer.
    chunk: Vec<u8>,
    /// Set after the trailer or an error.
    done: bool,
    /// Trailing metadata of a cleanly finished stream.
    trailer: Option<Metadata>,
    /// Message type.
    _msg: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> ServerStream<T> {
    /// Wraps a response body.
    pub(crate) fn new(
        body: Box<dyn Read + Send>,
        abort: AbortHandle,
        codec: Codec,
        reassembler: Reassembler,
    ) -> Self {
        Self {
            body,
            abort,
            reassembler,
            codec,
            chunk: vec![0; READ_CHUNK],
            done: false,
            trailer: None,
            _msg: PhantomData,
        }
    }

    /// Wraps an arbitrary reader of enveloped bytes.
    pub fn from_reader(reader: impl Read + Send + 'static, codec: Codec) -> Self {
        Self::new(
            Box::new(reader),
            AbortHandle::default(),
            codec,
            Reassembler::new(None),
        )
    }

    /// Handle that shuts the underlying connection down from another thread.
    /// A read blocked in [`next`](Iterator::next) then fails with
    /// [`Code::Canceled`].
    pub(crate) fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Trailing metadata, once the stream ended cleanly.
    pub const fn trailer(&self) -> Option<&Metadata> {
        self.trailer.as_ref()
    }

    /// Returns `true` once the stream has ended, cleanly or not.
    pub const fn is_done(&self) -> bool {
        self.done
    }

    /// Blocks until the next message, the end of the stream, or an error.
    fn pump(&mut self) -> Result<Option<T>> {
        loop {
            match self.reassembler.next_message(self.codec)? {
                Some(Frame::Message(msg)) => return Ok(Some(msg)),
                Some(Frame::End(md)) => {
                    debug!("stream finished");
                    self.trailer = Some(md);
                    return Ok(None);
                }
                None => {}
            }
            let read = self.body.read(&mut self.chunk);
            if self.abort.is_aborted() {
                return Err(Error::Rpc(RpcError::new(Code::Canceled, "stream aborted")));
            }
            let n = read.map_err(|e| map_io_error(&e))?;
            if n == 0 {
                let message = if self.reassembler.is_idle() {
                    "stream ended without end-of-stream message"
                } else {
                    "truncated envelope"
                };
                return Err(Error::Rpc(RpcError::new(Code::Internal, message)));
            }
            self.reassembler.push(&self.chunk[..n]);
        }
    }
}

impl<T: DeserializeOwned> Iterator for ServerStream<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.pump() {
            Ok(Some(msg)) => Some(Ok(msg)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

impl<T> fmt::Debug for ServerStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerStream")
            .field("codec", &self.codec)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}
