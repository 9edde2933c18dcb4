//! Error types for sbx operations.

use sbx_proto::{Code, RpcError};

/// Alias for `Result<T, sbx::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by sbx calls and handles.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The call failed: HTTP error, trailer error, protocol violation,
    /// timeout, or connection failure.
    #[error(transparent)]
    Rpc(#[from] RpcError),

    /// The remote process finished with a nonzero exit code.
    #[error(transparent)]
    CommandExit(#[from] CommandExit),
}

impl Error {
    /// Creates an [`Error::Rpc`].
    pub fn rpc(code: Code, message: impl Into<String>) -> Self {
        Self::Rpc(RpcError::new(code, message))
    }

    /// Semantic code of an RPC failure; `None` for command exits.
    pub const fn code(&self) -> Option<Code> {
        match self {
            Self::Rpc(e) => Some(e.code),
            Self::CommandExit(_) => None,
        }
    }
}

/// Captured outcome of a finished remote process.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[non_exhaustive]
pub struct CommandResult {
    /// Everything the process wrote to stdout.
    pub stdout: String,
    /// Everything the process wrote to stderr.
    pub stderr: String,
    /// Exit code (`-1` if killed by a signal).
    pub exit_code: i32,
    /// Error reported alongside the exit, if any.
    pub error: Option<String>,
}

/// A remote process exited with a nonzero code.
///
/// Carries the same captured output a successful wait returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandExit(pub CommandResult);

impl std::fmt::Display for CommandExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "command exited with code {}", self.0.exit_code)?;
        if let Some(err) = &self.0.error {
            write!(f, ": {err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for CommandExit {}

impl std::ops::Deref for CommandExit {
    type Target = CommandResult;

    fn deref(&self) -> &CommandResult {
        &self.0
    }
}
