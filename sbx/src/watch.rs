//! Directory watches.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};

use sbx_proto::Code;
use sbx_proto::filesystem::{
    self, EventType, FilesystemEvent, WatchDirRequest, WatchDirResponse, method,
};
use tracing::{debug, warn};

use crate::client::{CallOptions, Client};
use crate::error::{Error, Result};
use crate::socket::AbortHandle;
use crate::stream::ServerStream;

/// A change under a watched directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum WatchEvent {
    /// Entry created.
    Create {
        /// Changed path.
        path: String,
    },
    /// Entry written.
    Write {
        /// Changed path.
        path: String,
    },
    /// Entry removed.
    Remove {
        /// Changed path.
        path: String,
    },
    /// Entry renamed.
    Rename {
        /// Changed path.
        path: String,
    },
    /// Entry permissions changed.
    Chmod {
        /// Changed path.
        path: String,
    },
}

impl WatchEvent {
    /// Path of the changed entry.
    pub fn path(&self) -> &str {
        match self {
            Self::Create { path }
            | Self::Write { path }
            | Self::Remove { path }
            | Self::Rename { path }
            | Self::Chmod { path } => path,
        }
    }

    /// Converts a wire event; `None` for unknown kinds.
    fn from_wire(ev: FilesystemEvent) -> Option<Self> {
        let path = ev.name;
        Some(match ev.kind {
            EventType::Create => Self::Create { path },
            EventType::Write => Self::Write { path },
            EventType::Remove => Self::Remove { path },
            EventType::Rename => Self::Rename { path },
            EventType::Chmod => Self::Chmod { path },
            _ => return None,
        })
    }
}

/// Receives watch events on the watch's background thread.
///
/// Implemented for `FnMut(WatchEvent)` closures (errors are logged),
/// [`std::sync::mpsc::Sender<Result<WatchEvent>>`], and
/// [`tokio::sync::mpsc::UnboundedSender<Result<WatchEvent>>`].
pub trait WatchHandler: Send {
    /// Handles one event.
    fn on_event(&mut self, event: WatchEvent);

    /// Called once if the stream ends while the watch is not stopped.
    fn on_error(&mut self, error: Error) {
        warn!(%error, "directory watch ended");
    }
}

impl<F: FnMut(WatchEvent) + Send> WatchHandler for F {
    fn on_event(&mut self, event: WatchEvent) {
        self(event);
    }
}

impl WatchHandler for std::sync::mpsc::Sender<Result<WatchEvent>> {
    fn on_event(&mut self, event: WatchEvent) {
        let _ = self.send(Ok(event));
    }

    fn on_error(&mut self, error: Error) {
        let _ = self.send(Err(error));
    }
}

impl WatchHandler for tokio::sync::mpsc::UnboundedSender<Result<WatchEvent>> {
    fn on_event(&mut self, event: WatchEvent) {
        let _ = self.send(Ok(event));
    }

    fn on_error(&mut self, error: Error) {
        let _ = self.send(Err(error));
    }
}

/// Filesystem operations of a [`Client`].
#[derive(Debug, Clone)]
pub struct Filesystem {
    /// Underlying client.
    client: Client,
}

impl Filesystem {
    /// Wraps a client.
    pub(crate) const fn new(client: Client) -> Self {
        Self { client }
    }

    /// Watches `path` and delivers changes to `handler` on a background
    /// thread until the handle is stopped or dropped.
    ///
    /// Returns once the service acknowledged the watch.
    pub fn watch_dir(
        &self,
        path: impl Into<String>,
        recursive: bool,
        handler: impl WatchHandler + 'static,
    ) -> Result<WatchHandle> {
        let path = path.into();
        let req = WatchDirRequest {
            path: path.clone(),
            recursive,
        };
        let mut events = self.client.call_server_stream::<_, WatchDirResponse>(
            filesystem::SERVICE,
            method::WATCH_DIR,
            &req,
            &CallOptions::new(),
        )?;
        match events.next() {
            Some(Ok(WatchDirResponse::Start(_))) => {}
            Some(Ok(other)) => {
                return Err(Error::rpc(
                    Code::Internal,
                    format!("expected watch start event, got {other:?}"),
                ));
            }
            Some(Err(e)) => return Err(e),
            None => {
                return Err(Error::rpc(
                    Code::Internal,
                    "watch stream ended before start event",
                ));
            }
        }
        debug!(%path, recursive, "watch started");

        let shared = Arc::new(Shared::default());
        let abort = events.abort_handle();
        let pump = Pump {
            events,
            handler: Box::new(handler),
            shared: Arc::clone(&shared),
        };
        let thread = thread::Builder::new()
            .name("sbx-watch".into())
            .spawn(move || pump.run())
            .map_err(|e| Error::rpc(Code::Internal, format!("spawn watch thread: {e}")))?;
        Ok(WatchHandle {
            path,
            pump_thread: thread.thread().id(),
            thread,
            shared,
            abort,
        })
    }
}

/// State shared between a handle and its pump thread.
#[derive(Debug, Default)]
struct Shared {
    /// Set by `stop`.
    stopped: AtomicBool,
    /// Held while a callback runs.
    gate: Mutex<()>,
}

/// Background event pump.
struct Pump {
    /// Watch stream, past the start event.
    events: ServerStream<WatchDirResponse>,
    /// Event sink.
    handler: Box<dyn WatchHandler>,
    /// Stop flag and delivery gate.
    shared: Arc<Shared>,
}

impl Pump {
    /// Delivers events until the stream ends or the watch is stopped.
    fn run(mut self) {
        let error = loop {
            match self.events.next() {
                Some(Ok(WatchDirResponse::Filesystem(ev))) => {
                    let Some(event) = WatchEvent::from_wire(ev.clone()) else {
                        warn!(name = %ev.name, kind = ?ev.kind, "skipping unknown watch event");
                        continue;
                    };
                    if !self.deliver(|h| h.on_event(event)) {
                        return;
                    }
                }
                Some(Ok(WatchDirResponse::Start(_) | WatchDirResponse::Keepalive(_))) => {}
                Some(Err(e)) => break e,
                None => break Error::rpc(Code::Unavailable, "watch stream closed"),
            }
        };
        debug!(%error, "watch stream ended");
        self.deliver(|h| h.on_error(error));
    }

    /// Runs `f` on the handler unless stopped; returns `false` if stopped.
    fn deliver(&mut self, f: impl FnOnce(&mut dyn WatchHandler)) -> bool {
        let _gate = self.shared.gate.lock().unwrap_or_else(PoisonError::into_inner);
        if self.shared.stopped.load(Ordering::Acquire) {
            return false;
        }
        f(self.handler.as_mut());
        true
    }
}

/// A running directory watch.
///
/// Dropping the handle stops the watch.
pub struct WatchHandle {
    /// Watched directory.
    path: String,
    /// Id of the pump thread.
    pump_thread: ThreadId,
    /// Pump thread.
    thread: JoinHandle<()>,
    /// Stop flag and delivery gate.
    shared: Arc<Shared>,
    /// Shuts the watch stream's connection down.
    abort: AbortHandle,
}

impl WatchHandle {
    /// Watched directory.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Stops delivery and closes the stream's connection. No handler call
    /// starts after this returns.
    pub fn stop(&self) {
        self.shared.stopped.store(true, Ordering::Release);
        self.abort.abort();
        // From inside a callback the gate is already held by this thread.
        if thread::current().id() != self.pump_thread {
            drop(self.shared.gate.lock().unwrap_or_else(PoisonError::into_inner));
        }
        debug!(path = %self.path, "watch stopped");
    }

    /// Returns `true` once [`stop`](Self::stop) was called.
    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }

    /// Returns `true` once the pump thread has exited.
    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        if !self.is_stopped() {
            self.stop();
        }
    }
}

impl fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchHandle")
            .field("path", &self.path)
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}
