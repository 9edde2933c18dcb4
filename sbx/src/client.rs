//! RPC client: unary and server-streaming calls.

use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use sbx_proto::{Code, Flags, IDENTITY, PROTOCOL_VERSION, Reassembler, RpcError};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::command::Commands;
use crate::config::{ClientBuilder, ClientConfig};
use crate::error::{Error, Result};
use crate::stream::ServerStream;
use crate::transport::{Request, Transport};
use crate::watch::Filesystem;

/// Per-call options.
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct CallOptions {
    /// Extra headers for this call only.
    pub headers: Vec<(String, String)>,
    /// End-to-end deadline. Unary calls fall back to the client default;
    /// streams are unbounded without it.
    pub timeout: Option<Duration>,
}

impl CallOptions {
    /// Options with no extra headers and the default timeout.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the end-to-end deadline.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Adds a header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Client for one sandbox service origin.
///
/// Cheap to clone; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct Client {
    /// Shared state.
    inner: Arc<Inner>,
}

/// State shared between clones of a [`Client`].
#[derive(Debug)]
struct Inner {
    /// Resolved configuration.
    config: ClientConfig,
    /// Connection pool.
    transport: Transport,
}

impl Client {
    /// Starts a [`ClientBuilder`] for the service at `base_url`.
    pub fn builder(base_url: impl Into<String>) -> ClientBuilder {
        ClientBuilder::new(base_url)
    }

    /// Builds a client from validated configuration.
    pub(crate) fn from_config(config: ClientConfig) -> Self {
        let transport = Transport::new(&config);
        Self {
            inner: Arc::new(Inner { config, transport }),
        }
    }

    /// Resolved configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Process operations.
    pub fn commands(&self) -> Commands {
        Commands::new(self.clone())
    }

    /// Filesystem watch operations.
    pub fn filesystem(&self) -> Filesystem {
        Filesystem::new(self.clone())
    }

    /// Calls a unary method.
    ///
    /// Retried transparently if the connection is reset before a response
    /// arrives.
    pub fn call_unary<Req, Res>(
        &self,
        service: &str,
        method: &str,
        req: &Req,
        opts: &CallOptions,
    ) -> Result<Res>
    where
        Req: Serialize,
        Res: DeserializeOwned,
    {
        let config = &self.inner.config;
        let codec = config.codec;
        let timeout = opts.timeout.or(config.request_timeout);
        let body = self.compress(codec.encode(req)?)?;

        let mut headers = vec![
            header("connect-protocol-version", PROTOCOL_VERSION),
            header("content-type", codec.unary_content_type()),
            header("content-encoding", config.encoding()),
            header("accept-encoding", config.encoding()),
        ];
        self.push_common_headers(&mut headers, timeout, opts);

        let url = config.url(service, method);
        debug!(%url, "unary call");
        let resp = self.inner.transport.send_unary(&Request {
            url: &url,
            headers: &headers,
            body: &body,
            timeout,
        })?;

        if resp.status != 200 {
            // The status alone still maps to a code if the body is unreadable.
            let body = self
                .decompress_unary(resp.encoding.as_deref(), resp.body)
                .unwrap_or_default();
            return Err(RpcError::from_http(resp.status, &body).into());
        }
        let body = self.decompress_unary(resp.encoding.as_deref(), resp.body)?;
        Ok(codec.decode(&body)?)
    }

    /// Calls a server-streaming method.
    ///
    /// Returns once the response headers arrived; messages are read as the
    /// stream is iterated. Never retried.
    pub fn call_server_stream<Req, Res>(
        &self,
        service: &str,
        method: &str,
        req: &Req,
        opts: &CallOptions,
    ) -> Result<ServerStream<Res>>
    where
        Req: Serialize,
        Res: DeserializeOwned,
    {
        let config = &self.inner.config;
        let codec = config.codec;
        let payload = codec.encode(req)?;
        let (flags, payload) = match &config.compressor {
            Some(_) => (Flags::COMPRESSED, self.compress(payload)?),
            None => (Flags::NONE, payload),
        };
        let body = sbx_proto::envelope::encode(flags, &payload)?;

        let mut headers = vec![
            header("connect-protocol-version", PROTOCOL_VERSION),
            header("content-type", codec.stream_content_type()),
            header("connect-content-encoding", config.encoding()),
            header("connect-accept-encoding", config.encoding()),
        ];
        if let Some(interval) = config.keepalive_interval {
            headers.push(header(
                "keepalive-ping-interval",
                &interval.as_secs().max(1).to_string(),
            ));
        }
        self.push_common_headers(&mut headers, opts.timeout, opts);

        let url = config.url(service, method);
        debug!(%url, "server stream call");
        let mut resp = self.inner.transport.open_stream(&Request {
            url: &url,
            headers: &headers,
            body: &body,
            timeout: opts.timeout,
        })?;

        if resp.status != 200 {
            let mut body = Vec::new();
            let limit = u64::from(config.max_message_len);
            // Best effort: the status alone still maps to a code.
            let _ = (&mut resp.body).take(limit).read_to_end(&mut body);
            return Err(RpcError::from_http(resp.status, &body).into());
        }
        let content_type = resp.content_type.as_deref().unwrap_or_default();
        if !content_type.starts_with("application/connect+") {
            return Err(Error::rpc(
                Code::Internal,
                format!("unexpected stream content type {content_type:?}"),
            ));
        }
        if let Some(encoding) = resp.encoding.as_deref()
            && encoding != IDENTITY
            && encoding != config.encoding()
        {
            return Err(Error::rpc(
                Code::Internal,
                format!("unsupported stream encoding {encoding:?}"),
            ));
        }

        let reassembler =
            Reassembler::new(config.compressor.clone()).with_max_len(config.max_message_len);
        Ok(ServerStream::new(resp.body, resp.abort, codec, reassembler))
    }

    /// Client streaming is not supported; fails without network activity.
    pub fn call_client_stream<Req, Res>(
        &self,
        service: &str,
        method: &str,
        _requests: impl IntoIterator<Item = Req>,
        _opts: &CallOptions,
    ) -> Result<Res> {
        Err(unsupported("client streaming", service, method))
    }

    /// Bidirectional streaming is not supported; fails without network
    /// activity.
    pub fn call_bidi_stream<Req, Res>(
        &self,
        service: &str,
        method: &str,
        _requests: impl IntoIterator<Item = Req>,
        _opts: &CallOptions,
    ) -> Result<ServerStream<Res>> {
        Err(unsupported("bidirectional streaming", service, method))
    }

    /// Appends timeout, client-wide and per-call headers.
    fn push_common_headers(
        &self,
        headers: &mut Vec<(String, String)>,
        timeout: Option<Duration>,
        opts: &CallOptions,
    ) {
        if let Some(t) = timeout {
            headers.push(header("connect-timeout-ms", &t.as_millis().to_string()));
        }
        headers.extend(self.inner.config.headers.iter().cloned());
        headers.extend(opts.headers.iter().cloned());
    }

    /// Compresses an outgoing payload with the configured compressor.
    fn compress(&self, payload: Vec<u8>) -> Result<Vec<u8>> {
        match &self.inner.config.compressor {
            Some(c) => c
                .compress(&payload)
                .map_err(|e| Error::rpc(Code::Internal, format!("compress request: {e}"))),
            None => Ok(payload),
        }
    }

    /// Decompresses a unary response body according to its encoding.
    fn decompress_unary(&self, encoding: Option<&str>, body: Vec<u8>) -> Result<Vec<u8>> {
        let encoding = match encoding {
            None | Some(IDENTITY | "") => return Ok(body),
            Some(e) => e,
        };
        let max_len = self.inner.config.max_message_len;
        match &self.inner.config.compressor {
            Some(c) if c.name() == encoding => {
                let out = c
                    .decompress(&body, max_len as usize)
                    .map_err(|e| Error::rpc(Code::Internal, format!("decompress response: {e}")))?;
                if out.len() > max_len as usize {
                    return Err(Error::rpc(
                        Code::ResourceExhausted,
                        format!("response inflates past {max_len} bytes"),
                    ));
                }
                Ok(out)
            }
            _ => Err(Error::rpc(
                Code::Internal,
                format!("unsupported response encoding {encoding:?}"),
            )),
        }
    }
}

/// Owned header pair.
fn header(name: &str, value: &str) -> (String, String) {
    (name.to_owned(), value.to_owned())
}

/// Error for call shapes this client does not implement.
fn unsupported(kind: &str, service: &str, method: &str) -> Error {
    Error::rpc(
        Code::Unimplemented,
        format!("{kind} is not supported: {service}/{method}"),
    )
}
