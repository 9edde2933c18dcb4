//! HTTP transport: pooled connections and unary connection-reset retry.
//!
//! The pool is a [`ureq::Agent`]; it keeps idle keep-alive connections per
//! host. A connection reset during a unary call drops the whole pool and
//! re-sends the request on a fresh connection. Streaming calls go through
//! [`Transport::open_stream`] and are never retried. They use a second agent
//! whose connections are never pooled and can be shut down through an
//! [`AbortHandle`].

use std::cell::Cell;
use std::io::{self, Read};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use sbx_proto::{Code, RpcError};
use tracing::{debug, warn};
use ureq::Agent;
use ureq::http::Response;
use ureq::unversioned::resolver::DefaultResolver;
use ureq::unversioned::transport::{Connector, RustlsConnector};

use crate::config::ClientConfig;
use crate::socket::{self, AbortHandle, AbortableConnector};

/// A prepared HTTP POST.
#[derive(Debug)]
pub(crate) struct Request<'a> {
    /// Absolute URL.
    pub url: &'a str,
    /// Header name/value pairs.
    pub headers: &'a [(String, String)],
    /// Request body.
    pub body: &'a [u8],
    /// End-to-end deadline for this call.
    pub timeout: Option<Duration>,
}

/// Fully-read unary response.
#[derive(Debug)]
pub(crate) struct UnaryResponse {
    /// HTTP status.
    pub status: u16,
    /// `content-encoding` header, if any.
    pub encoding: Option<String>,
    /// Response body.
    pub body: Vec<u8>,
}

/// Streaming response whose body has not been read yet.
pub(crate) struct StreamResponse {
    /// HTTP status.
    pub status: u16,
    /// `content-type` header, if any.
    pub content_type: Option<String>,
    /// `connect-content-encoding` header, if any.
    pub encoding: Option<String>,
    /// Response body.
    pub body: Box<dyn Read + Send>,
    /// Shuts the call's connection down.
    pub abort: AbortHandle,
}

impl std::fmt::Debug for StreamResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamResponse")
            .field("status", &self.status)
            .field("content_type", &self.content_type)
            .field("encoding", &self.encoding)
            .finish_non_exhaustive()
    }
}

/// Connection pool owned by one [`Client`](crate::Client).
#[derive(Debug)]
pub(crate) struct Transport {
    /// Settings the agent is (re)built from.
    config: ClientConfig,
    /// Pool generation and the agent of that generation.
    agent: RwLock<(u64, Agent)>,
    /// Agent for streaming calls.
    streams: Agent,
}

impl Transport {
    /// Builds the pool for `config`.
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            agent: RwLock::new((0, build_agent(config))),
            streams: build_stream_agent(config),
            config: config.clone(),
        }
    }

    /// Sends a unary request and reads the whole response body.
    ///
    /// Retried on connection reset up to the configured attempt count.
    pub fn send_unary(&self, req: &Request<'_>) -> Result<UnaryResponse, RpcError> {
        let max_len = u64::from(self.config.max_message_len);
        let generation = Cell::new(0);
        send_with_retry(
            self.config.max_attempts,
            |_| {
                let (g, agent) = self.snapshot();
                generation.set(g);
                let resp = self.post(&agent, req, true)?;
                let status = resp.status().as_u16();
                let encoding = header(&resp, "content-encoding");
                let mut body = Vec::new();
                resp.into_body()
                    .into_reader()
                    .take(max_len + 1)
                    .read_to_end(&mut body)
                    .map_err(|e| ureq::Error::Io(after_headers(e)))?;
                Ok(UnaryResponse {
                    status,
                    encoding,
                    body,
                })
            },
            || self.reset(generation.get()),
        )
        .and_then(|resp| {
            if resp.body.len() as u64 > max_len {
                return Err(RpcError::new(
                    Code::ResourceExhausted,
                    format!("response body exceeds {max_len} bytes"),
                ));
            }
            Ok(resp)
        })
    }

    /// Sends a streaming request and returns once response headers arrive.
    pub fn open_stream(&self, req: &Request<'_>) -> Result<StreamResponse, RpcError> {
        let abort = AbortHandle::default();
        let resp = socket::with_armed(&abort, || self.post(&self.streams, req, false))
            .map_err(map_error)?;
        Ok(StreamResponse {
            status: resp.status().as_u16(),
            content_type: header(&resp, "content-type"),
            encoding: header(&resp, "connect-content-encoding"),
            body: Box::new(resp.into_body().into_reader()),
            abort,
        })
    }

    /// Issues one POST on `agent`.
    fn post(
        &self,
        agent: &Agent,
        req: &Request<'_>,
        unary: bool,
    ) -> Result<Response<ureq::Body>, ureq::Error> {
        let recv_body = if unary { self.config.timeouts.read } else { None };
        let mut builder = agent
            .post(req.url)
            .config()
            .timeout_global(req.timeout)
            .timeout_recv_body(recv_body)
            .build();
        for (name, value) in req.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        debug!(url = req.url, len = req.body.len(), "rpc request");
        builder.send(req.body)
    }

    /// Current pool generation and agent.
    fn snapshot(&self) -> (u64, Agent) {
        let guard = self.agent.read().unwrap_or_else(PoisonError::into_inner);
        (guard.0, guard.1.clone())
    }

    /// Replaces the agent unless another caller already did since `seen`.
    fn reset(&self, seen: u64) {
        let mut guard = self.agent.write().unwrap_or_else(PoisonError::into_inner);
        if guard.0 == seen {
            guard.1 = build_agent(&self.config);
            guard.0 += 1;
            debug!(generation = guard.0, "connection pool rebuilt");
        }
    }

    /// Current pool generation.
    #[cfg(test)]
    fn generation(&self) -> u64 {
        self.snapshot().0
    }
}

/// Builds an agent with the configured timeouts and pool bounds.
fn build_agent(config: &ClientConfig) -> Agent {
    Agent::new_with_config(agent_config(config))
}

/// Builds the streaming agent. Its connections register with the
/// [`AbortHandle`] armed on the calling thread.
fn build_stream_agent(config: &ClientConfig) -> Agent {
    let connector = AbortableConnector.chain(RustlsConnector::default());
    Agent::with_parts(agent_config(config), connector, DefaultResolver::default())
}

/// Agent settings shared by both agents.
fn agent_config(config: &ClientConfig) -> ureq::config::Config {
    let t = config.timeouts;
    Agent::config_builder()
        .http_status_as_error(false)
        .timeout_connect(t.connect)
        .timeout_recv_response(t.read)
        .timeout_send_request(t.write)
        .timeout_send_body(t.write)
        .max_idle_age(t.idle)
        .max_idle_connections_per_host(config.pool_size)
        .user_agent(config.user_agent.as_str())
        .build()
}

/// Hides reset kinds of a failure that happened after the response head,
/// so it is not retried.
fn after_headers(err: io::Error) -> io::Error {
    if is_reset_kind(err.kind()) {
        io::Error::other(err)
    } else {
        err
    }
}

/// Value of response header `name` as a string.
fn header(resp: &Response<ureq::Body>, name: &str) -> Option<String> {
    resp.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

/// Runs `attempt` up to `max_attempts` times while it fails with a
/// connection reset, calling `on_reset` before each retry.
///
/// Any other failure, or a reset on the last attempt, is mapped and
/// returned as is.
pub(crate) fn send_with_retry<T>(
    max_attempts: u32,
    mut attempt: impl FnMut(u32) -> Result<T, ureq::Error>,
    mut on_reset: impl FnMut(),
) -> Result<T, RpcError> {
    let max_attempts = max_attempts.max(1);
    let mut n = 1;
    loop {
        match attempt(n) {
            Ok(v) => return Ok(v),
            Err(e) if n < max_attempts && is_connection_reset(&e) => {
                warn!(attempt = n, max_attempts, error = %e, "connection reset, retrying");
                on_reset();
                n += 1;
            }
            Err(e) => return Err(map_error(e)),
        }
    }
}

/// Whether `err` is a connection reset by the peer.
pub(crate) fn is_connection_reset(err: &ureq::Error) -> bool {
    matches!(err, ureq::Error::Io(e) if is_reset_kind(e.kind()))
}

/// I/O error kinds that mean the peer dropped the connection.
const fn is_reset_kind(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}

/// Maps a transport failure to a semantic error.
pub(crate) fn map_error(err: ureq::Error) -> RpcError {
    let code = match &err {
        ureq::Error::Timeout(_) => Code::DeadlineExceeded,
        ureq::Error::Io(e) => return map_io_error(e),
        ureq::Error::BodyExceedsLimit(_) => Code::ResourceExhausted,
        ureq::Error::BadUri(_) | ureq::Error::Http(_) => Code::InvalidArgument,
        _ => Code::Unavailable,
    };
    RpcError::new(code, err.to_string())
}

/// Maps a read failure on a response body to a semantic error.
pub(crate) fn map_io_error(err: &io::Error) -> RpcError {
    let code = match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Code::DeadlineExceeded,
        _ => Code::Unavailable,
    };
    RpcError::new(code, err.to_string())
}
