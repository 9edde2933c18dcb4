//! Messages of the `process.Process` service.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::codec::bytes;

/// Fully-qualified service name.
pub const SERVICE: &str = "process.Process";

/// Method names of [`SERVICE`].
pub mod method {
    /// Server stream: start a process and follow its events.
    pub const START: &str = "Start";
    /// Server stream: attach to a running process.
    pub const CONNECT: &str = "Connect";
    /// Unary: list running processes.
    pub const LIST: &str = "List";
    /// Unary: write to a process's stdin or PTY.
    pub const SEND_INPUT: &str = "SendInput";
    /// Unary: deliver a signal.
    pub const SEND_SIGNAL: &str = "SendSignal";
    /// Unary: close a process's stdin.
    pub const CLOSE_STDIN: &str = "CloseStdin";
    /// Unary: resize a process's PTY.
    pub const UPDATE: &str = "Update";
}

/// What to run.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ProcessConfig {
    /// Executable path or name.
    pub cmd: String,
    /// Arguments, excluding argv\[0\].
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment variables.
    #[serde(default)]
    pub envs: BTreeMap<String, String>,
    /// Working directory.
    #[serde(default)]
    pub cwd: Option<String>,
}

impl ProcessConfig {
    /// Runs `cmd` with no arguments.
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            ..Self::default()
        }
    }

    /// Runs `script` through a login bash shell.
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new("/bin/bash").args(["-l".to_owned(), "-c".to_owned(), script.into()])
    }

    /// Sets the argument list.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Adds one environment variable.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.insert(key.into(), value.into());
        self
    }

    /// Sets the working directory.
    #[must_use]
    pub fn cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

/// Terminal dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PtySize {
    /// Columns.
    pub cols: u32,
    /// Rows.
    pub rows: u32,
}

/// Pseudo-terminal request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pty {
    /// Initial terminal size.
    pub size: PtySize,
}

/// Addresses a running process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessSelector {
    /// By process id.
    Pid(u32),
    /// By caller-assigned tag.
    Tag(String),
}

impl std::fmt::Display for ProcessSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pid(pid) => write!(f, "pid {pid}"),
            Self::Tag(tag) => write!(f, "tag {tag:?}"),
        }
    }
}

/// `Start` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    /// Process to start.
    pub process: ProcessConfig,
    /// Allocate a PTY of this size.
    #[serde(default)]
    pub pty: Option<Pty>,
    /// Tag for later selection.
    #[serde(default)]
    pub tag: Option<String>,
    /// Keep stdin open for [`SendInputRequest`].
    #[serde(default)]
    pub stdin: Option<bool>,
}

/// `Connect` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectRequest {
    /// Process to attach to.
    pub process: ProcessSelector,
}

/// One message of the `Start` and `Connect` streams.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessEventResponse {
    /// The event.
    pub event: ProcessEvent,
}

/// Event in a process's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessEvent {
    /// The process is running; always the first event.
    Start(StartEvent),
    /// Output chunk.
    Data(DataEvent),
    /// The process ended; always the last event.
    End(EndEvent),
    /// Periodic no-op keeping idle streams open.
    Keepalive(KeepAlive),
}

/// Start acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartEvent {
    /// Remote process id.
    #[serde(default)]
    pub pid: u32,
}

/// Output chunk from one of the process's output channels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataEvent {
    /// Standard output.
    Stdout(#[serde(with = "bytes")] Vec<u8>),
    /// Standard error.
    Stderr(#[serde(with = "bytes")] Vec<u8>),
    /// Terminal output (PTY processes only).
    Pty(#[serde(with = "bytes")] Vec<u8>),
}

/// Process termination.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndEvent {
    /// Exit code (`-1` when killed by a signal).
    #[serde(default)]
    pub exit_code: i32,
    /// Whether the process exited normally.
    #[serde(default)]
    pub exited: bool,
    /// Human-readable status, e.g. `exit status 1` or `signal: killed`.
    #[serde(default)]
    pub status: String,
    /// Error message, if the process could not run to completion.
    #[serde(default)]
    pub error: Option<String>,
}

/// Empty keepalive payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct KeepAlive {}

/// `SendInput` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendInputRequest {
    /// Target process.
    pub process: ProcessSelector,
    /// Bytes to write.
    pub input: ProcessInput,
}

/// Input destined for a process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessInput {
    /// Write to stdin.
    Stdin(#[serde(with = "bytes")] Vec<u8>),
    /// Write to the PTY.
    Pty(#[serde(with = "bytes")] Vec<u8>),
}

/// Signals the service can deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum Signal {
    /// Not set.
    #[serde(rename = "SIGNAL_UNSPECIFIED")]
    Unspecified,
    /// `SIGTERM`.
    #[serde(rename = "SIGNAL_SIGTERM")]
    Sigterm,
    /// `SIGKILL`.
    #[serde(rename = "SIGNAL_SIGKILL")]
    Sigkill,
}

impl std::str::FromStr for Signal {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().trim_start_matches("SIG") {
            "TERM" | "15" => Ok(Self::Sigterm),
            "KILL" | "9" => Ok(Self::Sigkill),
            _ => Err(format!("unsupported signal: {s}")),
        }
    }
}

/// `SendSignal` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendSignalRequest {
    /// Target process.
    pub process: ProcessSelector,
    /// Signal to deliver.
    pub signal: Signal,
}

/// `CloseStdin` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseStdinRequest {
    /// Target process.
    pub process: ProcessSelector,
}

/// `Update` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRequest {
    /// Target process.
    pub process: ProcessSelector,
    /// New PTY size.
    #[serde(default)]
    pub pty: Option<Pty>,
}

/// `List` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ListRequest {}

/// `List` response.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ListResponse {
    /// Running processes.
    #[serde(default)]
    pub processes: Vec<ProcessInfo>,
}

/// A running process as reported by `List`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    /// How it was started.
    pub config: ProcessConfig,
    /// Process id.
    #[serde(default)]
    pub pid: u32,
    /// Tag, if one was assigned.
    #[serde(default)]
    pub tag: Option<String>,
}

/// Empty unary response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Empty {}
