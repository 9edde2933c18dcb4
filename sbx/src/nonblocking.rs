//! Async adapters over the blocking core.
//!
//! Each blocking step (reading the next stream message, a unary call) runs
//! on tokio's blocking pool; decoding and state handling are the same code
//! the blocking API uses. Requires a tokio runtime.
//!
//! Dropping a pending future of an [`AsyncServerStream`] or
//! [`AsyncCommandHandle`] abandons the wrapped value: later calls on the
//! same adapter fail with `canceled`.

use std::fmt;

use sbx_proto::Code;
use sbx_proto::process::{ProcessConfig, ProcessInfo, ProcessSelector, PtySize, Signal};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::client::{CallOptions, Client};
use crate::command::{
    CommandHandle, Commands, ConnectOptions, Output, ProcessControl, StartOptions,
};
use crate::error::{CommandResult, Error, Result};
use crate::stream::ServerStream;
use crate::watch::{Filesystem, WatchHandle, WatchHandler};

/// Runs `f` on the blocking pool.
async fn blocking<R, F>(f: F) -> Result<R>
where
    F: FnOnce() -> Result<R> + Send + 'static,
    R: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(join_error)?
}

/// Maps a failed blocking task.
fn join_error(err: tokio::task::JoinError) -> Error {
    let code = if err.is_cancelled() {
        Code::Canceled
    } else {
        Code::Internal
    };
    Error::rpc(code, format!("blocking task failed: {err}"))
}

/// A blocking value moved to the blocking pool for one step at a time.
struct Offload<T> {
    /// The value; `None` while a step runs or after one was abandoned.
    inner: Option<T>,
}

impl<T: Send + 'static> Offload<T> {
    /// Wraps `value`.
    const fn new(value: T) -> Self {
        Self { inner: Some(value) }
    }

    /// Runs `f` on the value in the blocking pool and takes the value back.
    async fn run<R, F>(&mut self, f: F) -> Result<R>
    where
        F: FnOnce(&mut T) -> R + Send + 'static,
        R: Send + 'static,
    {
        let Some(mut value) = self.inner.take() else {
            return Err(Error::rpc(
                Code::Canceled,
                "a previous call was abandoned before it completed",
            ));
        };
        let (value, out) = tokio::task::spawn_blocking(move || {
            let out = f(&mut value);
            (value, out)
        })
        .await
        .map_err(join_error)?;
        self.inner = Some(value);
        Ok(out)
    }

    /// The value, unless a step was abandoned.
    const fn get(&self) -> Option<&T> {
        self.inner.as_ref()
    }

    /// Takes the value out.
    const fn take(&mut self) -> Option<T> {
        self.inner.take()
    }
}

/// Async view of a [`ServerStream`].
pub struct AsyncServerStream<T> {
    /// Blocking stream.
    inner: Offload<ServerStream<T>>,
}

impl<T: DeserializeOwned + Send + 'static> AsyncServerStream<T> {
    /// Opens a server stream without blocking the runtime.
    pub async fn open<Req>(
        client: &Client,
        service: &str,
        method: &str,
        req: Req,
        opts: CallOptions,
    ) -> Result<Self>
    where
        Req: Serialize + Send + 'static,
    {
        let client = client.clone();
        let (service, method) = (service.to_owned(), method.to_owned());
        let stream = blocking(move || {
            client.call_server_stream::<Req, T>(&service, &method, &req, &opts)
        })
        .await?;
        Ok(Self::new(stream))
    }

    /// Wraps a blocking stream.
    pub const fn new(stream: ServerStream<T>) -> Self {
        Self {
            inner: Offload::new(stream),
        }
    }

    /// Next message; `None` after the trailer or an error.
    pub async fn next(&mut self) -> Option<Result<T>> {
        match self.inner.run(Iterator::next).await {
            Ok(item) => item,
            Err(e) => Some(Err(e)),
        }
    }
}

impl<T> fmt::Debug for AsyncServerStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncServerStream").finish_non_exhaustive()
    }
}

/// Async process operations.
#[derive(Debug, Clone)]
pub struct AsyncCommands {
    /// Blocking operations.
    commands: Commands,
}

impl AsyncCommands {
    /// Process operations of `client`.
    pub fn new(client: &Client) -> Self {
        Self {
            commands: client.commands(),
        }
    }

    /// See [`Commands::start`].
    pub async fn start(
        &self,
        config: ProcessConfig,
        opts: StartOptions,
    ) -> Result<AsyncCommandHandle> {
        let commands = self.commands.clone();
        let handle = blocking(move || commands.start(config, opts)).await?;
        Ok(AsyncCommandHandle::new(handle))
    }

    /// See [`Commands::connect`].
    pub async fn connect(
        &self,
        selector: ProcessSelector,
        opts: ConnectOptions,
    ) -> Result<AsyncCommandHandle> {
        let commands = self.commands.clone();
        let handle = blocking(move || commands.connect(selector, opts)).await?;
        Ok(AsyncCommandHandle::new(handle))
    }

    /// See [`Commands::run`].
    pub async fn run(&self, script: impl Into<String>, opts: StartOptions) -> Result<CommandResult> {
        let commands = self.commands.clone();
        let script = script.into();
        blocking(move || commands.run(script, opts)).await
    }

    /// See [`Commands::kill`].
    pub async fn kill(&self, selector: ProcessSelector) -> Result<bool> {
        let commands = self.commands.clone();
        blocking(move || commands.kill(&selector)).await
    }

    /// See [`Commands::signal`].
    pub async fn signal(&self, selector: ProcessSelector, signal: Signal) -> Result<()> {
        let commands = self.commands.clone();
        blocking(move || commands.signal(&selector, signal)).await
    }

    /// See [`Commands::list`].
    pub async fn list(&self) -> Result<Vec<ProcessInfo>> {
        let commands = self.commands.clone();
        blocking(move || commands.list()).await
    }
}

/// Async view of a [`CommandHandle`].
pub struct AsyncCommandHandle {
    /// Side channel, usable while the handle is being pumped.
    control: ProcessControl,
    /// Blocking handle.
    inner: Offload<CommandHandle>,
}

impl AsyncCommandHandle {
    /// Wraps a blocking handle.
    pub fn new(handle: CommandHandle) -> Self {
        Self {
            control: handle.control(),
            inner: Offload::new(handle),
        }
    }

    /// Remote process id.
    pub const fn pid(&self) -> u32 {
        self.control.pid()
    }

    /// A cloneable side channel.
    pub fn control(&self) -> ProcessControl {
        self.control.clone()
    }

    /// The blocking handle, for reading buffered output and state.
    ///
    /// `None` if a previous call was abandoned.
    pub const fn get_ref(&self) -> Option<&CommandHandle> {
        self.inner.get()
    }

    /// See [`CommandHandle::next_output`].
    ///
    /// Also `None` once a previous call was abandoned; [`wait`](Self::wait)
    /// then fails with `canceled`.
    pub async fn next_output(&mut self) -> Option<Output> {
        match self.inner.run(CommandHandle::next_output).await {
            Ok(out) => out,
            Err(error) => {
                debug!(pid = self.control.pid(), %error, "process output unavailable");
                None
            }
        }
    }

    /// See [`CommandHandle::wait`].
    pub async fn wait(&mut self) -> Result<CommandResult> {
        self.inner.run(CommandHandle::wait).await?
    }

    /// See [`ProcessControl::kill`].
    pub async fn kill(&self) -> Result<bool> {
        let control = self.control.clone();
        blocking(move || control.kill()).await
    }

    /// See [`ProcessControl::send_stdin`].
    pub async fn send_stdin(&self, data: impl Into<Vec<u8>>) -> Result<()> {
        let control = self.control.clone();
        let data = data.into();
        blocking(move || control.send_stdin(&data)).await
    }

    /// See [`ProcessControl::close_stdin`].
    pub async fn close_stdin(&self) -> Result<()> {
        let control = self.control.clone();
        blocking(move || control.close_stdin()).await
    }

    /// See [`ProcessControl::resize_pty`].
    pub async fn resize_pty(&self, size: PtySize) -> Result<()> {
        let control = self.control.clone();
        blocking(move || control.resize_pty(size)).await
    }

    /// See [`CommandHandle::disconnect`].
    pub fn disconnect(mut self) {
        self.control.disconnect();
        if let Some(handle) = self.inner.take() {
            handle.disconnect();
        }
    }
}

impl fmt::Debug for AsyncCommandHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncCommandHandle")
            .field("pid", &self.pid())
            .field("handle", &self.get_ref())
            .finish()
    }
}

/// Async filesystem operations.
#[derive(Debug, Clone)]
pub struct AsyncFilesystem {
    /// Blocking operations.
    fs: Filesystem,
}

impl AsyncFilesystem {
    /// Filesystem operations of `client`.
    pub fn new(client: &Client) -> Self {
        Self {
            fs: client.filesystem(),
        }
    }

    /// See [`Filesystem::watch_dir`]. Pair with a
    /// [`tokio::sync::mpsc::UnboundedSender`] handler to consume events
    /// from async code.
    pub async fn watch_dir(
        &self,
        path: impl Into<String>,
        recursive: bool,
        handler: impl WatchHandler + 'static,
    ) -> Result<WatchHandle> {
        let fs = self.fs.clone();
        let path = path.into();
        blocking(move || fs.watch_dir(path, recursive, handler)).await
    }
}
