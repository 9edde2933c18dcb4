//! Client configuration and builder.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use sbx_proto::{Code, Codec, Compressor, DEFAULT_MAX_MESSAGE_LEN};

use crate::client::Client;
use crate::error::{Error, Result};

/// Default number of attempts for a unary call hit by a connection reset.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Per-phase transport timeouts.
///
/// `None` disables the corresponding limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct Timeouts {
    /// Establishing a TCP/TLS connection.
    pub connect: Option<Duration>,
    /// Waiting for the response head (and, for unary calls, the body).
    pub read: Option<Duration>,
    /// Sending the request head and body.
    pub write: Option<Duration>,
    /// How long an idle pooled connection may be reused.
    pub idle: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Some(Duration::from_secs(10)),
            read: Some(Duration::from_secs(60)),
            write: Some(Duration::from_secs(60)),
            idle: Duration::from_secs(30),
        }
    }
}

/// Resolved configuration of a [`Client`].
#[derive(Clone)]
pub struct ClientConfig {
    /// Service origin, without trailing slash.
    pub(crate) base_url: String,
    /// Payload serialization.
    pub(crate) codec: Codec,
    /// Payload compression; `None` means `identity`.
    pub(crate) compressor: Option<Arc<dyn Compressor>>,
    /// Per-phase transport timeouts.
    pub(crate) timeouts: Timeouts,
    /// Default end-to-end timeout for unary calls.
    pub(crate) request_timeout: Option<Duration>,
    /// Attempts for unary calls hit by a connection reset.
    pub(crate) max_attempts: u32,
    /// Largest accepted message.
    pub(crate) max_message_len: u32,
    /// Idle pooled connections kept per host.
    pub(crate) pool_size: usize,
    /// Server keepalive ping interval requested for streams.
    pub(crate) keepalive_interval: Option<Duration>,
    /// Headers added to every call.
    pub(crate) headers: Vec<(String, String)>,
    /// `user-agent` header.
    pub(crate) user_agent: String,
}

impl ClientConfig {
    /// Service origin.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Payload codec.
    pub const fn codec(&self) -> Codec {
        self.codec
    }

    /// Name of the configured compressor, or `identity`.
    pub fn encoding(&self) -> &str {
        self.compressor
            .as_deref()
            .map_or(sbx_proto::IDENTITY, |c| c.name())
    }

    /// Per-phase transport timeouts.
    pub const fn timeouts(&self) -> Timeouts {
        self.timeouts
    }

    /// URL of `service/method`.
    pub(crate) fn url(&self, service: &str, method: &str) -> String {
        format!("{}/{service}/{method}", self.base_url)
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("base_url", &self.base_url)
            .field("codec", &self.codec)
            .field("encoding", &self.encoding())
            .field("timeouts", &self.timeouts)
            .field("request_timeout", &self.request_timeout)
            .field("max_attempts", &self.max_attempts)
            .field("max_message_len", &self.max_message_len)
            .field("pool_size", &self.pool_size)
            .field("keepalive_interval", &self.keepalive_interval)
            .field("headers", &self.headers.len())
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

/// Builder for a [`Client`].
///
/// Defaults: JSON codec, no compression, 10 s connect / 60 s read and write
/// timeouts, 60 s unary request timeout, 3 attempts on connection reset.
///
/// # Example
///
/// ```no_run
/// use sbx::{Client, Gzip};
///
/// let client = Client::builder("https://49983-sandbox.example.dev")
///     .compressor(Gzip::default())
///     .header("x-sandbox-id", "abc123")
///     .build()
///     .expect("invalid client config");
/// ```
#[derive(Debug)]
#[must_use = "a ClientBuilder does nothing until .build() is called"]
pub struct ClientBuilder {
    /// Configuration being assembled.
    config: ClientConfig,
}

impl ClientBuilder {
    /// Starts a builder for the service at `base_url`.
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_owned();
        Self {
            config: ClientConfig {
                base_url,
                codec: Codec::default(),
                compressor: None,
                timeouts: Timeouts::default(),
                request_timeout: Some(Duration::from_secs(60)),
                max_attempts: DEFAULT_MAX_ATTEMPTS,
                max_message_len: DEFAULT_MAX_MESSAGE_LEN,
                pool_size: 8,
                keepalive_interval: Some(Duration::from_secs(50)),
                headers: Vec::new(),
                user_agent: concat!("sbx/", env!("CARGO_PKG_VERSION")).to_owned(),
            },
        }
    }

    /// Sets the payload codec.
    pub const fn codec(mut self, codec: Codec) -> Self {
        self.config.codec = codec;
        self
    }

    /// Compresses payloads with `compressor`.
    pub fn compressor(mut self, compressor: impl Compressor + 'static) -> Self {
        self.config.compressor = Some(Arc::new(compressor));
        self
    }

    /// Compresses payloads with a shared compressor, or disables compression.
    pub fn shared_compressor(mut self, compressor: Option<Arc<dyn Compressor>>) -> Self {
        self.config.compressor = compressor;
        self
    }

    /// Sets all per-phase timeouts at once.
    pub const fn timeouts(mut self, timeouts: Timeouts) -> Self {
        self.config.timeouts = timeouts;
        self
    }

    /// Sets the connect timeout.
    pub const fn connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.timeouts.connect = timeout;
        self
    }

    /// Sets the read timeout.
    pub const fn read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.timeouts.read = timeout;
        self
    }

    /// Sets the write timeout.
    pub const fn write_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.timeouts.write = timeout;
        self
    }

    /// Sets how long idle pooled connections are kept.
    pub const fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeouts.idle = timeout;
        self
    }

    /// Sets the default end-to-end timeout for unary calls.
    pub const fn request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Sets the number of attempts for unary calls hit by a connection reset.
    pub const fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    /// Sets the largest accepted message.
    pub const fn max_message_len(mut self, len: u32) -> Self {
        self.config.max_message_len = len;
        self
    }

    /// Sets how many idle connections are pooled per host.
    pub const fn pool_size(mut self, size: usize) -> Self {
        self.config.pool_size = size;
        self
    }

    /// Sets the keepalive ping interval requested for streams.
    pub const fn keepalive_interval(mut self, interval: Option<Duration>) -> Self {
        self.config.keepalive_interval = interval;
        self
    }

    /// Adds a header sent with every call.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.headers.push((name.into(), value.into()));
        self
    }

    /// Overrides the `user-agent` header.
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    /// Validates the configuration and builds the client.
    pub fn build(self) -> Result<Client> {
        let c = &self.config;
        let scheme_ok = c.base_url.starts_with("http://") || c.base_url.starts_with("https://");
        if !scheme_ok {
            return Err(Error::rpc(
                Code::InvalidArgument,
                format!("base URL must be http(s): {}", c.base_url),
            ));
        }
        if c.max_attempts == 0 {
            return Err(Error::rpc(
                Code::InvalidArgument,
                "max_attempts must be at least 1",
            ));
        }
        Ok(Client::from_config(self.config))
    }
}
