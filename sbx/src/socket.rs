//! Abortable TCP connections for streaming calls.
//!
//! Streaming calls run on an agent whose connector keeps a clone of each
//! socket it opens. Shutting that clone down unblocks a read parked on the
//! response body from any thread, so a stopped watch or a disconnected
//! process handle releases its connection at once instead of at the next
//! message.

use std::cell::RefCell;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tracing::debug;
use ureq::unversioned::transport::{
    Buffers, ConnectionDetails, Connector, LazyBuffers, NextTimeout, Transport,
};

thread_local! {
    /// Handle the next connection opened on this thread is attached to.
    static ARMED: RefCell<Option<AbortHandle>> = const { RefCell::new(None) };
}

/// Shuts down the connection of one streaming call.
///
/// Cheap to clone. Aborting before the connection exists shuts it down as
/// soon as it is opened.
#[derive(Clone, Default)]
pub(crate) struct AbortHandle {
    /// Shared state.
    inner: Arc<AbortState>,
}

/// State behind an [`AbortHandle`].
#[derive(Default)]
struct AbortState {
    /// Set by `abort`.
    aborted: AtomicBool,
    /// Clone of the call's socket, once connected.
    socket: Mutex<Option<TcpStream>>,
}

impl AbortHandle {
    /// Shuts the connection down. Blocked reads on it return immediately.
    pub(crate) fn abort(&self) {
        self.inner.aborted.store(true, Ordering::Release);
        let socket = self
            .inner
            .socket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(socket) = socket {
            debug!(peer = ?socket.peer_addr().ok(), "aborting stream connection");
            let _ = socket.shutdown(Shutdown::Both);
        }
    }

    /// Returns `true` once [`abort`](Self::abort) was called.
    pub(crate) fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::Acquire)
    }

    /// Attaches the connection's socket.
    fn attach(&self, socket: TcpStream) {
        let mut slot = self
            .inner
            .socket
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.is_aborted() {
            let _ = socket.shutdown(Shutdown::Both);
        } else {
            *slot = Some(socket);
        }
    }
}

impl fmt::Debug for AbortHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortHandle")
            .field("aborted", &self.is_aborted())
            .finish_non_exhaustive()
    }
}

/// Runs `f` with `handle` armed: a connection `f` opens on this thread
/// through an [`AbortableConnector`] is attached to it.
pub(crate) fn with_armed<R>(handle: &AbortHandle, f: impl FnOnce() -> R) -> R {
    ARMED.with(|slot| *slot.borrow_mut() = Some(handle.clone()));
    let out = f();
    ARMED.with(|slot| slot.borrow_mut().take());
    out
}

/// Plain TCP connector that hands a socket clone to the armed handle.
#[derive(Debug, Default)]
pub(crate) struct AbortableConnector;

impl Connector for AbortableConnector {
    type Out = SocketTransport;

    fn connect(
        &self,
        details: &ConnectionDetails<'_>,
        _chained: Option<()>,
    ) -> Result<Option<Self::Out>, ureq::Error> {
        let timeout = details.timeout.not_zero().map(|t| *t);
        let stream = connect_any(&details.addrs, timeout)?;
        if details.config.no_delay() {
            stream.set_nodelay(true)?;
        }
        if let Some(handle) = ARMED.with(|slot| slot.borrow_mut().take()) {
            handle.attach(stream.try_clone()?);
        }
        let buffers = LazyBuffers::new(
            details.config.input_buffer_size(),
            details.config.output_buffer_size(),
        );
        Ok(Some(SocketTransport {
            stream,
            buffers,
            read_timeout: None,
            write_timeout: None,
        }))
    }
}

/// Connects to the first reachable address.
fn connect_any(addrs: &[SocketAddr], timeout: Option<Duration>) -> io::Result<TcpStream> {
    let mut last = None;
    for addr in addrs {
        let attempt = match timeout {
            Some(t) => TcpStream::connect_timeout(addr, t),
            None => TcpStream::connect(addr),
        };
        match attempt {
            Ok(stream) => return Ok(stream),
            Err(e) => last = Some(e),
        }
    }
    Err(last.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::AddrNotAvailable, "host resolved to no addresses")
    }))
}

/// HTTP/1.1 transport over a plain [`TcpStream`].
pub(crate) struct SocketTransport {
    /// The connection.
    stream: TcpStream,
    /// ureq's read/write buffers.
    buffers: LazyBuffers,
    /// Read timeout currently set on the socket.
    read_timeout: Option<Duration>,
    /// Write timeout currently set on the socket.
    write_timeout: Option<Duration>,
}

impl Transport for SocketTransport {
    fn buffers(&mut self) -> &mut dyn Buffers {
        &mut self.buffers
    }

    fn transmit_output(&mut self, amount: usize, timeout: NextTimeout) -> Result<(), ureq::Error> {
        let wanted = timeout.not_zero().map(|t| *t);
        if wanted != self.write_timeout {
            self.stream.set_write_timeout(wanted)?;
            self.write_timeout = wanted;
        }
        let output = &self.buffers.output()[..amount];
        self.stream
            .write_all(output)
            .map_err(|e| timed_out(e, timeout))
    }

    fn await_input(&mut self, timeout: NextTimeout) -> Result<bool, ureq::Error> {
        let wanted = timeout.not_zero().map(|t| *t);
        if wanted != self.read_timeout {
            self.stream.set_read_timeout(wanted)?;
            self.read_timeout = wanted;
        }
        let input = self.buffers.input_append_buf();
        let n = self
            .stream
            .read(input)
            .map_err(|e| timed_out(e, timeout))?;
        self.buffers.input_appended(n);
        Ok(n > 0)
    }

    fn is_open(&mut self) -> bool {
        // Idle stream connections are never pooled.
        false
    }
}

impl fmt::Debug for SocketTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketTransport")
            .field("peer", &self.stream.peer_addr().ok())
            .finish_non_exhaustive()
    }
}

/// Maps socket timeouts to ureq's timeout error.
fn timed_out(err: io::Error, timeout: NextTimeout) -> ureq::Error {
    match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => ureq::Error::Timeout(timeout.reason),
        _ => ureq::Error::Io(err),
    }
}
