//! Semantic error codes and the HTTP error mapper.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Semantic RPC error code, independent of the HTTP status that carried it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum Code {
    /// The call was canceled, typically by the caller.
    Canceled,
    /// Unknown error, or an unrecognised code from the server.
    Unknown,
    /// The request was malformed.
    InvalidArgument,
    /// A deadline or timeout elapsed before the call completed.
    DeadlineExceeded,
    /// The addressed entity (process, path, sandbox) does not exist.
    NotFound,
    /// The entity being created already exists.
    AlreadyExists,
    /// The caller lacks permission.
    PermissionDenied,
    /// A quota, rate limit, or size limit was hit.
    ResourceExhausted,
    /// The system is not in the state required for the operation.
    FailedPrecondition,
    /// The operation was aborted.
    Aborted,
    /// The operation went past a valid range.
    OutOfRange,
    /// The operation is not implemented or not supported.
    Unimplemented,
    /// Internal error, including protocol violations.
    Internal,
    /// The service is unreachable or the connection failed.
    Unavailable,
    /// Unrecoverable data loss.
    DataLoss,
    /// The request lacks valid credentials.
    Unauthenticated,
}

impl Code {
    /// Wire name of the code (e.g. `not_found`).
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Canceled => "canceled",
            Self::Unknown => "unknown",
            Self::InvalidArgument => "invalid_argument",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::NotFound => "not_found",
            Self::AlreadyExists => "already_exists",
            Self::PermissionDenied => "permission_denied",
            Self::ResourceExhausted => "resource_exhausted",
            Self::FailedPrecondition => "failed_precondition",
            Self::Aborted => "aborted",
            Self::OutOfRange => "out_of_range",
            Self::Unimplemented => "unimplemented",
            Self::Internal => "internal",
            Self::Unavailable => "unavailable",
            Self::DataLoss => "data_loss",
            Self::Unauthenticated => "unauthenticated",
        }
    }

    /// Maps an HTTP status to a code when no error body names one.
    pub const fn from_http_status(status: u16) -> Self {
        match status {
            400 => Self::InvalidArgument,
            401 => Self::Unauthenticated,
            403 => Self::PermissionDenied,
            404 => Self::NotFound,
            409 => Self::AlreadyExists,
            413 | 429 => Self::ResourceExhausted,
            499 => Self::Canceled,
            500 => Self::Internal,
            501 | 505 => Self::Unimplemented,
            502 | 503 => Self::Unavailable,
            504 => Self::DeadlineExceeded,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Code {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "canceled" | "cancelled" => Self::Canceled,
            "unknown" => Self::Unknown,
            "invalid_argument" => Self::InvalidArgument,
            "deadline_exceeded" => Self::DeadlineExceeded,
            "not_found" => Self::NotFound,
            "already_exists" => Self::AlreadyExists,
            "permission_denied" => Self::PermissionDenied,
            "resource_exhausted" => Self::ResourceExhausted,
            "failed_precondition" => Self::FailedPrecondition,
            "aborted" => Self::Aborted,
            "out_of_range" => Self::OutOfRange,
            "unimplemented" => Self::Unimplemented,
            "internal" => Self::Internal,
            "unavailable" => Self::Unavailable,
            "data_loss" => Self::DataLoss,
            "unauthenticated" => Self::Unauthenticated,
            _ => return Err(format!("unknown error code: {s}")),
        })
    }
}

/// A semantic RPC failure: code plus human-readable message.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("[{code}] {message}")]
#[non_exhaustive]
pub struct RpcError {
    /// Semantic error code.
    pub code: Code,
    /// Human-readable message.
    pub message: String,
    /// Structured details as sent by the server, uninterpreted.
    pub details: Vec<serde_json::Value>,
}

impl RpcError {
    /// Creates an error without details.
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: Vec::new(),
        }
    }

    /// Maps an HTTP error response to a semantic error.
    ///
    /// A JSON body naming a `code` wins over the status; an unrecognised
    /// code string maps to [`Code::Unknown`]. This never fails.
    pub fn from_http(status: u16, body: &[u8]) -> Self {
        let wire = serde_json::from_slice::<WireError>(body).ok();
        let code = match wire.as_ref().and_then(|w| w.code.as_deref()) {
            Some(name) => name.parse().unwrap_or(Code::Unknown),
            None => Code::from_http_status(status),
        };
        if let Some(wire) = wire
            && (wire.code.is_some() || wire.message.is_some())
        {
            let mut err = wire.into_error(code);
            if err.message.is_empty() {
                err.message = format!("HTTP {status} {}", status_phrase(status));
            }
            return err;
        }

        let text = String::from_utf8_lossy(body);
        let text = text.trim();
        let message = if text.is_empty() {
            format!("HTTP {status} {}", status_phrase(status))
        } else {
            text.to_owned()
        };
        Self::new(code, message)
    }
}

/// Structured error body: `{"code": ..., "message": ..., "details": [...]}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WireError {
    /// Error code name.
    #[serde(default)]
    pub code: Option<String>,
    /// Human-readable message.
    #[serde(default)]
    pub message: Option<String>,
    /// Opaque details.
    #[serde(default)]
    pub details: Vec<serde_json::Value>,
}

impl WireError {
    /// Converts into an [`RpcError`] with the already-resolved `code`.
    fn into_error(self, code: Code) -> RpcError {
        RpcError {
            code,
            message: self.message.unwrap_or_default(),
            details: self.details,
        }
    }
}

impl From<&RpcError> for WireError {
    fn from(err: &RpcError) -> Self {
        Self {
            code: Some(err.code.as_str().to_owned()),
            message: Some(err.message.clone()),
            details: err.details.clone(),
        }
    }
}

/// Payload of the end-of-stream envelope.
///
/// Always JSON, whatever message codec the call uses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Trailer {
    /// Present iff the stream failed.
    #[serde(default)]
    pub error: Option<WireError>,
    /// Trailing metadata.
    #[serde(default)]
    pub metadata: HashMap<String, Vec<String>>,
}

impl Trailer {
    /// Returns the stream failure carried by this trailer, if any.
    pub fn into_result(self) -> Result<HashMap<String, Vec<String>>, RpcError> {
        match self.error {
            Some(wire) => {
                let code = wire
                    .code
                    .as_deref()
                    .map_or(Code::Unknown, |c| c.parse().unwrap_or(Code::Unknown));
                Err(wire.into_error(code))
            }
            None => Ok(self.metadata),
        }
    }
}

/// Canonical reason phrase for the statuses in the mapping table.
const fn status_phrase(status: u16) -> &'static str {
    match status {
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        409 => "Conflict",
        413 => "Payload Too Large",
        429 => "Too Many Requests",
        499 => "Client Closed Request",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        _ => "",
    }
}
