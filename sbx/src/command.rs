//! Remote processes: start, attach, stream output, signal, wait.

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use sbx_proto::Code;
use sbx_proto::process::{
    self, CloseStdinRequest, ConnectRequest, DataEvent, Empty, EndEvent, ListRequest,
    ListResponse, ProcessConfig, ProcessEvent, ProcessEventResponse, ProcessInfo, ProcessInput,
    ProcessSelector, Pty, PtySize, SendInputRequest, SendSignalRequest, Signal, StartRequest,
    UpdateRequest, method,
};
use tracing::{debug, warn};

use crate::client::{CallOptions, Client};
use crate::error::{CommandExit, CommandResult, Error, Result};
use crate::socket::AbortHandle;
use crate::stream::ServerStream;

/// A chunk of process output.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Output {
    /// Standard output.
    Stdout(Vec<u8>),
    /// Standard error.
    Stderr(Vec<u8>),
    /// Terminal output of a PTY process.
    Pty(Vec<u8>),
}

impl Output {
    /// Raw bytes of the chunk.
    pub fn bytes(&self) -> &[u8] {
        match self {
            Self::Stdout(b) | Self::Stderr(b) | Self::Pty(b) => b,
        }
    }
}

/// Receives output chunks as they arrive.
///
/// Called synchronously on the thread that pumps the handle, in arrival
/// order. Implemented for closures, [`std::sync::mpsc::Sender`], and
/// [`tokio::sync::mpsc::UnboundedSender`].
pub trait OutputHandler: Send {
    /// Handles one chunk.
    fn on_output(&mut self, output: &Output);
}

impl<F: FnMut(&Output) + Send> OutputHandler for F {
    fn on_output(&mut self, output: &Output) {
        self(output);
    }
}

impl OutputHandler for std::sync::mpsc::Sender<Output> {
    fn on_output(&mut self, output: &Output) {
        // The receiver may be gone; output is still buffered on the handle.
        let _ = self.send(output.clone());
    }
}

impl OutputHandler for tokio::sync::mpsc::UnboundedSender<Output> {
    fn on_output(&mut self, output: &Output) {
        let _ = self.send(output.clone());
    }
}

/// Options for [`Commands::start`].
#[derive(Default)]
#[non_exhaustive]
pub struct StartOptions {
    /// Allocate a PTY of this size.
    pub pty: Option<PtySize>,
    /// Tag for selecting the process later.
    pub tag: Option<String>,
    /// Keep stdin open for [`ProcessControl::send_stdin`].
    pub stdin: bool,
    /// Deadline for the whole process stream.
    pub timeout: Option<Duration>,
    /// Output callback.
    pub handler: Option<Box<dyn OutputHandler>>,
}

impl StartOptions {
    /// Default options: no PTY, no stdin, no deadline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a PTY.
    #[must_use]
    pub const fn pty(mut self, size: PtySize) -> Self {
        self.pty = Some(size);
        self
    }

    /// Tags the process.
    #[must_use]
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// Keeps stdin open.
    #[must_use]
    pub const fn stdin(mut self, stdin: bool) -> Self {
        self.stdin = stdin;
        self
    }

    /// Bounds the process stream.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Delivers output to `handler` as it arrives.
    #[must_use]
    pub fn on_output(mut self, handler: impl OutputHandler + 'static) -> Self {
        self.handler = Some(Box::new(handler));
        self
    }
}

impl fmt::Debug for StartOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StartOptions")
            .field("pty", &self.pty)
            .field("tag", &self.tag)
            .field("stdin", &self.stdin)
            .field("timeout", &self.timeout)
            .field("handler", &self.handler.is_some())
            .finish()
    }
}

/// Options for [`Commands::connect`].
#[derive(Default)]
#[non_exhaustive]
pub struct ConnectOptions {
    /// Deadline for the attached stream.
    pub timeout: Option<Duration>,
    /// Output callback.
    pub handler: Option<Box<dyn OutputHandler>>,
}

impl ConnectOptions {
    /// Default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bounds the attached stream.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Delivers output to `handler` as it arrives.
    #[must_use]
    pub fn on_output(mut self, handler: impl OutputHandler + 'static) -> Self {
        self.handler = Some(Box::new(handler));
        self
    }
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("timeout", &self.timeout)
            .field("handler", &self.handler.is_some())
            .finish()
    }
}

/// Lifecycle of a [`CommandHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ProcessState {
    /// Waiting for the start event.
    Starting,
    /// Started; output may arrive.
    Running,
    /// Exited with code 0.
    Succeeded,
    /// Exited nonzero, or the stream failed.
    Failed,
    /// Ended after a kill through this handle.
    Killed,
    /// Detached locally; the remote process may still run.
    Disconnected,
}

impl ProcessState {
    /// Returns `true` for states no event can leave.
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Starting | Self::Running)
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Killed => "killed",
            Self::Disconnected => "disconnected",
        })
    }
}

/// Process operations of a [`Client`].
#[derive(Debug, Clone)]
pub struct Commands {
    /// Underlying client.
    client: Client,
}

impl Commands {
    /// Wraps a client.
    pub(crate) const fn new(client: Client) -> Self {
        Self { client }
    }

    /// Starts a process and waits for its start event.
    pub fn start(&self, config: ProcessConfig, opts: StartOptions) -> Result<CommandHandle> {
        let req = StartRequest {
            process: config,
            pty: opts.pty.map(|size| Pty { size }),
            tag: opts.tag,
            stdin: Some(opts.stdin),
        };
        let call = stream_opts(opts.timeout);
        let events = self.client.call_server_stream::<_, ProcessEventResponse>(
            process::SERVICE,
            method::START,
            &req,
            &call,
        )?;
        CommandHandle::handshake(self.client.clone(), events, opts.pty.is_some(), opts.handler)
    }

    /// Attaches to a running process.
    ///
    /// The new handle only sees output produced from now on.
    pub fn connect(
        &self,
        selector: ProcessSelector,
        opts: ConnectOptions,
    ) -> Result<CommandHandle> {
        let req = ConnectRequest { process: selector };
        let call = stream_opts(opts.timeout);
        let events = self.client.call_server_stream::<_, ProcessEventResponse>(
            process::SERVICE,
            method::CONNECT,
            &req,
            &call,
        )?;
        CommandHandle::handshake(self.client.clone(), events, false, opts.handler)
    }

    /// Runs `script` with `bash -l -c` and waits for it.
    pub fn run(&self, script: impl Into<String>, opts: StartOptions) -> Result<CommandResult> {
        self.start(ProcessConfig::shell(script), opts)?.wait()
    }

    /// Kills a process with `SIGKILL`.
    ///
    /// Returns `false` if no such process exists.
    pub fn kill(&self, selector: &ProcessSelector) -> Result<bool> {
        match self.signal(selector, Signal::Sigkill) {
            Ok(()) => Ok(true),
            Err(e) if e.code() == Some(Code::NotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Delivers a signal.
    pub fn signal(&self, selector: &ProcessSelector, signal: Signal) -> Result<()> {
        let req = SendSignalRequest {
            process: selector.clone(),
            signal,
        };
        self.unary(method::SEND_SIGNAL, &req)
    }

    /// Writes to a process's stdin.
    pub fn send_stdin(&self, selector: &ProcessSelector, data: &[u8]) -> Result<()> {
        self.send_input(selector, ProcessInput::Stdin(data.to_vec()))
    }

    /// Writes to a process's PTY.
    pub fn send_pty_input(&self, selector: &ProcessSelector, data: &[u8]) -> Result<()> {
        self.send_input(selector, ProcessInput::Pty(data.to_vec()))
    }

    /// Closes a process's stdin.
    pub fn close_stdin(&self, selector: &ProcessSelector) -> Result<()> {
        let req = CloseStdinRequest {
            process: selector.clone(),
        };
        self.unary(method::CLOSE_STDIN, &req)
    }

    /// Resizes a process's PTY.
    pub fn resize_pty(&self, selector: &ProcessSelector, size: PtySize) -> Result<()> {
        let req = UpdateRequest {
            process: selector.clone(),
            pty: Some(Pty { size }),
        };
        self.unary(method::UPDATE, &req)
    }

    /// Lists running processes.
    pub fn list(&self) -> Result<Vec<ProcessInfo>> {
        let resp: ListResponse = self.client.call_unary(
            process::SERVICE,
            method::LIST,
            &ListRequest {},
            &CallOptions::new(),
        )?;
        Ok(resp.processes)
    }

    /// Sends `SendInput`.
    fn send_input(&self, selector: &ProcessSelector, input: ProcessInput) -> Result<()> {
        let req = SendInputRequest {
            process: selector.clone(),
            input,
        };
        self.unary(method::SEND_INPUT, &req)
    }

    /// Calls a unary method answering with an empty message.
    fn unary<Req: serde::Serialize>(&self, method: &str, req: &Req) -> Result<()> {
        let _: Empty = self
            .client
            .call_unary(process::SERVICE, method, req, &CallOptions::new())?;
        Ok(())
    }
}

/// Call options for a process stream.
fn stream_opts(timeout: Option<Duration>) -> CallOptions {
    let mut call = CallOptions::new();
    call.timeout = timeout;
    call
}

/// Flags shared between a handle and its [`ProcessControl`] clones.
#[derive(Debug, Default)]
struct Shared {
    /// The handle is in [`ProcessState::Running`].
    running: AtomicBool,
    /// A kill through a control was acknowledged.
    killed: AtomicBool,
    /// The handle detaches instead of reading further events.
    disconnect: AtomicBool,
}

/// Side channel to a running process, usable from any thread while the
/// owning [`CommandHandle`] is pumped elsewhere.
#[derive(Debug, Clone)]
pub struct ProcessControl {
    /// Process operations.
    commands: Commands,
    /// Remote process id.
    pid: u32,
    /// The process was started with a PTY.
    pty: bool,
    /// State shared with the handle.
    shared: Arc<Shared>,
    /// Shuts the event stream's connection down.
    abort: AbortHandle,
}

impl ProcessControl {
    /// Remote process id.
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    /// Selector addressing this process.
    pub const fn selector(&self) -> ProcessSelector {
        ProcessSelector::Pid(self.pid)
    }

    /// Writes to the process's stdin (its PTY, for PTY processes).
    ///
    /// Fails with `failed_precondition` unless the handle is running.
    pub fn send_stdin(&self, data: &[u8]) -> Result<()> {
        if !self.shared.running.load(Ordering::Acquire) {
            return Err(Error::rpc(
                Code::FailedPrecondition,
                format!("process {} is not running", self.pid),
            ));
        }
        if self.pty {
            self.commands.send_pty_input(&self.selector(), data)
        } else {
            self.commands.send_stdin(&self.selector(), data)
        }
    }

    /// Closes the process's stdin.
    pub fn close_stdin(&self) -> Result<()> {
        self.commands.close_stdin(&self.selector())
    }

    /// Resizes the process's PTY.
    pub fn resize_pty(&self, size: PtySize) -> Result<()> {
        self.commands.resize_pty(&self.selector(), size)
    }

    /// Kills the process with `SIGKILL`.
    ///
    /// Returns `false` if the process no longer exists.
    pub fn kill(&self) -> Result<bool> {
        self.shared.killed.store(true, Ordering::Release);
        let result = self.commands.kill(&self.selector());
        if !matches!(result, Ok(true)) {
            self.shared.killed.store(false, Ordering::Release);
        }
        result
    }

    /// Detaches the handle and closes its event stream. A read blocked on
    /// the stream returns at once.
    ///
    /// Purely local: the remote process keeps running.
    pub fn disconnect(&self) {
        self.shared.disconnect.store(true, Ordering::Release);
        self.abort.abort();
    }
}

/// A started or attached remote process.
///
/// Output is pulled from the event stream by [`wait`](Self::wait), by
/// iterating the handle, or by [`next_output`](Self::next_output). Every
/// chunk is buffered on the handle and passed to the output handler, if
/// any.
pub struct CommandHandle {
    /// Side channel sharing flags with this handle.
    control: ProcessControl,
    /// Event stream; `None` once the handle is terminal.
    events: Option<ServerStream<ProcessEventResponse>>,
    /// Current state.
    state: ProcessState,
    /// Accumulated stdout.
    stdout: Vec<u8>,
    /// Accumulated stderr.
    stderr: Vec<u8>,
    /// Accumulated PTY output.
    pty: Vec<u8>,
    /// End event, once received.
    end: Option<EndEvent>,
    /// Stream failure, re-raised by `wait`.
    error: Option<Error>,
    /// Output callback.
    handler: Option<Box<dyn OutputHandler>>,
}

impl CommandHandle {
    /// Reads the start event and returns a running handle.
    fn handshake(
        client: Client,
        mut events: ServerStream<ProcessEventResponse>,
        pty: bool,
        handler: Option<Box<dyn OutputHandler>>,
    ) -> Result<Self> {
        let pid = match events.next() {
            Some(Ok(ProcessEventResponse {
                event: ProcessEvent::Start(start),
            })) => start.pid,
            Some(Ok(other)) => {
                return Err(Error::rpc(
                    Code::Internal,
                    format!("expected start event, got {:?}", other.event),
                ));
            }
            Some(Err(e)) => return Err(e),
            None => {
                return Err(Error::rpc(
                    Code::Internal,
                    "process stream ended before start event",
                ));
            }
        };
        debug!(pid, "process started");

        let shared = Arc::new(Shared::default());
        shared.running.store(true, Ordering::Release);
        Ok(Self {
            control: ProcessControl {
                commands: Commands::new(client),
                pid,
                pty,
                shared,
                abort: events.abort_handle(),
            },
            events: Some(events),
            state: ProcessState::Running,
            stdout: Vec::new(),
            stderr: Vec::new(),
            pty: Vec::new(),
            end: None,
            error: None,
            handler,
        })
    }

    /// Remote process id.
    pub const fn pid(&self) -> u32 {
        self.control.pid
    }

    /// Current state.
    pub const fn state(&self) -> ProcessState {
        self.state
    }

    /// A cloneable side channel for stdin, kill, and disconnect.
    pub fn control(&self) -> ProcessControl {
        self.control.clone()
    }

    /// Stdout received so far.
    pub fn stdout(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stdout)
    }

    /// Stderr received so far.
    pub fn stderr(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stderr)
    }

    /// PTY output received so far.
    pub fn pty_output(&self) -> &[u8] {
        &self.pty
    }

    /// Exit code, once the process ended.
    pub fn exit_code(&self) -> Option<i32> {
        self.end.as_ref().map(|e| e.exit_code)
    }

    /// Stream failure that ended this handle, if any.
    pub const fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    /// See [`ProcessControl::send_stdin`].
    pub fn send_stdin(&self, data: &[u8]) -> Result<()> {
        self.control.send_stdin(data)
    }

    /// See [`ProcessControl::close_stdin`].
    pub fn close_stdin(&self) -> Result<()> {
        self.control.close_stdin()
    }

    /// See [`ProcessControl::resize_pty`].
    pub fn resize_pty(&self, size: PtySize) -> Result<()> {
        self.control.resize_pty(size)
    }

    /// See [`ProcessControl::kill`].
    pub fn kill(&self) -> Result<bool> {
        self.control.kill()
    }

    /// Detaches from the process now. The remote process keeps running and
    /// can be reattached with [`Commands::connect`].
    pub fn disconnect(mut self) {
        self.control.disconnect();
        self.detach();
    }

    /// Blocks until the next output chunk; `None` once the handle is
    /// terminal.
    pub fn next_output(&mut self) -> Option<Output> {
        loop {
            if self.state.is_terminal() {
                return None;
            }
            if self.control.shared.disconnect.load(Ordering::Acquire) {
                self.detach();
                return None;
            }
            let Some(events) = self.events.as_mut() else {
                self.fail(Error::rpc(Code::Internal, "process stream is gone"));
                return None;
            };
            let item = events.next();
            if self.control.shared.disconnect.load(Ordering::Acquire) {
                self.detach();
                return None;
            }
            match item {
                None => {
                    self.fail(Error::rpc(
                        Code::Internal,
                        "process stream ended without end event",
                    ));
                    return None;
                }
                Some(Err(e)) => {
                    self.fail(e);
                    return None;
                }
                Some(Ok(resp)) => match resp.event {
                    ProcessEvent::Start(s) => {
                        warn!(pid = self.pid(), got = s.pid, "ignoring repeated start event");
                    }
                    ProcessEvent::Keepalive(_) => {}
                    ProcessEvent::Data(data) => return Some(self.record(data)),
                    ProcessEvent::End(end) => {
                        self.finish(end);
                        return None;
                    }
                },
            }
        }
    }

    /// Pumps events until the process ends and returns its result.
    ///
    /// A stream failure captured while pumping is returned here; the
    /// buffered output stays readable on the handle. A nonzero exit is
    /// returned as [`Error::CommandExit`] carrying the full result.
    pub fn wait(&mut self) -> Result<CommandResult> {
        while self.next_output().is_some() {}

        if let Some(e) = &self.error {
            return Err(e.clone());
        }
        if self.state == ProcessState::Disconnected {
            return Err(Error::rpc(
                Code::Canceled,
                format!("handle for process {} was disconnected", self.pid()),
            ));
        }
        let Some(end) = &self.end else {
            return Err(Error::rpc(Code::Internal, "process ended without end event"));
        };
        let result = CommandResult {
            stdout: self.stdout().into_owned(),
            stderr: self.stderr().into_owned(),
            exit_code: end.exit_code,
            error: end.error.clone().filter(|e| !e.is_empty()),
        };
        if result.exit_code != 0 {
            return Err(CommandExit(result).into());
        }
        Ok(result)
    }

    /// Buffers a data event and hands it to the output handler.
    fn record(&mut self, data: DataEvent) -> Output {
        let out = match data {
            DataEvent::Stdout(b) => {
                self.stdout.extend_from_slice(&b);
                Output::Stdout(b)
            }
            DataEvent::Stderr(b) => {
                self.stderr.extend_from_slice(&b);
                Output::Stderr(b)
            }
            DataEvent::Pty(b) => {
                self.pty.extend_from_slice(&b);
                Output::Pty(b)
            }
        };
        if let Some(handler) = self.handler.as_mut() {
            handler.on_output(&out);
        }
        out
    }

    /// Applies the end event.
    fn finish(&mut self, end: EndEvent) {
        self.state = if end.exit_code == 0 {
            ProcessState::Succeeded
        } else if self.control.shared.killed.load(Ordering::Acquire) {
            ProcessState::Killed
        } else {
            ProcessState::Failed
        };
        debug!(pid = self.pid(), exit_code = end.exit_code, state = %self.state, "process ended");
        self.end = Some(end);
        self.close();
    }

    /// Records a stream failure.
    fn fail(&mut self, err: Error) {
        debug!(pid = self.pid(), error = %err, "process stream failed");
        self.state = ProcessState::Failed;
        self.error = Some(err);
        self.close();
    }

    /// Drops the stream without touching the remote process.
    fn detach(&mut self) {
        debug!(pid = self.pid(), "process handle disconnected");
        self.state = ProcessState::Disconnected;
        self.close();
    }

    /// Releases the stream and clears the running flag.
    fn close(&mut self) {
        self.events = None;
        self.control.shared.running.store(false, Ordering::Release);
    }
}

impl Iterator for CommandHandle {
    type Item = Output;

    fn next(&mut self) -> Option<Output> {
        self.next_output()
    }
}

impl fmt::Debug for CommandHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandHandle")
            .field("pid", &self.pid())
            .field("state", &self.state)
            .field("stdout", &self.stdout.len())
            .field("stderr", &self.stderr.len())
            .field("pty", &self.pty.len())
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::io::Cursor;

    use sbx_proto::envelope::encode;
    use sbx_proto::{Codec, Flags};

    use super::*;

    fn client() -> Client {
        Client::builder("http://127.0.0.1:1").build().unwrap()
    }

    fn events(msgs: &[&str], trailer: Option<&str>) -> ServerStream<ProcessEventResponse> {
        let mut wire = Vec::new();
        for m in msgs {
            wire.extend(encode(Flags::NONE, m.as_bytes()).unwrap());
        }
        if let Some(t) = trailer {
            wire.extend(encode(Flags::END_STREAM, t.as_bytes()).unwrap());
        }
        ServerStream::from_reader(Cursor::new(wire), Codec::Json)
    }

    fn handle(msgs: &[&str], trailer: Option<&str>) -> Result<CommandHandle> {
        CommandHandle::handshake(client(), events(msgs, trailer), false, None)
    }

    const START: &str = r#"{"event":{"start":{"pid":7}}}"#;

    #[test]
    fn collects_output_in_order() {
        let mut seen = Vec::new();
        let (tx, rx) = std::sync::mpsc::channel::<Output>();
        let mut h = CommandHandle::handshake(
            client(),
            events(
                &[
                    START,
                    r#"{"event":{"data":{"stdout":"aGk="}}}"#,
                    r#"{"event":{"keepalive":{}}}"#,
                    r#"{"event":{"data":{"stderr":"ZXJy"}}}"#,
                    r#"{"event":{"data":{"stdout":"IQ=="}}}"#,
                    r#"{"event":{"end":{"exitCode":0,"exited":true}}}"#,
                ],
                Some("{}"),
            ),
            false,
            Some(Box::new(tx)),
        )
        .unwrap();
        assert_eq!(h.pid(), 7);
        assert_eq!(h.state(), ProcessState::Running);
        let result = h.wait().unwrap();
        assert_eq!(result.stdout, "hi!");
        assert_eq!(result.stderr, "err");
        assert_eq!(result.exit_code, 0);
        assert_eq!(h.state(), ProcessState::Succeeded);
        seen.extend(rx.try_iter());
        assert_eq!(
            seen,
            [
                Output::Stdout(b"hi".to_vec()),
                Output::Stderr(b"err".to_vec()),
                Output::Stdout(b"!".to_vec()),
            ]
        );
    }

    #[test]
    fn first_event_must_be_start() {
        let err = handle(&[r#"{"event":{"data":{"stdout":"aGk="}}}"#], Some("{}")).unwrap_err();
        assert_eq!(err.code(), Some(Code::Internal));
    }

    #[test]
    fn nonzero_exit_carries_result() {
        let mut h = handle(
            &[
                START,
                r#"{"event":{"data":{"stderr":"bm9wZQ=="}}}"#,
                r#"{"event":{"end":{"exitCode":3,"exited":true,"error":"boom"}}}"#,
            ],
            Some("{}"),
        )
        .unwrap();
        let Err(Error::CommandExit(exit)) = h.wait() else {
            panic!("expected command exit");
        };
        assert_eq!(exit.exit_code, 3);
        assert_eq!(exit.stderr, "nope");
        assert_eq!(exit.error.as_deref(), Some("boom"));
        assert_eq!(h.state(), ProcessState::Failed);
    }

    #[test]
    fn stream_error_is_deferred_and_output_kept() {
        let mut h = handle(
            &[START, r#"{"event":{"data":{"stdout":"cGFydGlhbA=="}}}"#],
            Some(r#"{"error":{"code":"unavailable","message":"sandbox gone"}}"#),
        )
        .unwrap();
        assert_eq!(h.next_output(), Some(Output::Stdout(b"partial".to_vec())));
        assert_eq!(h.next_output(), None);
        assert_eq!(h.state(), ProcessState::Failed);
        let err = h.wait().unwrap_err();
        assert_eq!(err.code(), Some(Code::Unavailable));
        assert_eq!(h.stdout(), "partial");
        // Waiting again reports the same failure.
        assert_eq!(h.wait().unwrap_err().code(), Some(Code::Unavailable));
    }

    #[test]
    fn control_disconnect_detaches_before_next_event() {
        let mut h = handle(
            &[
                START,
                r#"{"event":{"data":{"stdout":"b25l"}}}"#,
                r#"{"event":{"data":{"stdout":"dHdv"}}}"#,
            ],
            None,
        )
        .unwrap();
        assert_eq!(h.next_output(), Some(Output::Stdout(b"one".to_vec())));
        h.control().disconnect();
        assert_eq!(h.next_output(), None);
        assert_eq!(h.state(), ProcessState::Disconnected);
        assert_eq!(h.wait().unwrap_err().code(), Some(Code::Canceled));
        assert_eq!(h.stdout(), "one");
    }

    #[test]
    fn stdin_requires_running() {
        let mut h = handle(
            &[START, r#"{"event":{"end":{"exitCode":0}}}"#],
            Some("{}"),
        )
        .unwrap();
        h.wait().unwrap();
        let err = h.send_stdin(b"late").unwrap_err();
        assert_eq!(err.code(), Some(Code::FailedPrecondition));
    }

    #[test]
    fn closure_handler() {
        let mut total = 0;
        {
            let mut handler = |out: &Output| total += out.bytes().len();
            handler.on_output(&Output::Pty(vec![1, 2, 3]));
        }
        assert_eq!(total, 3);
    }
}
