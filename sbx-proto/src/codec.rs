//! Message serialization codecs.
//!
//! The codec is fixed per client and advertised through the content type:
//! `application/<name>` for unary calls, `application/connect+<name>` for
//! streaming calls.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{Code, RpcError};

/// Payload serialization strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[non_exhaustive]
pub enum Codec {
    /// JSON text: camelCase fields, base64 byte fields.
    #[default]
    Json,
    /// Compact binary via [`postcard`].
    Postcard,
}

impl Codec {
    /// Codec name as it appears in content types.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Postcard => "postcard",
        }
    }

    /// Content type for unary calls.
    pub const fn unary_content_type(self) -> &'static str {
        match self {
            Self::Json => "application/json",
            Self::Postcard => "application/postcard",
        }
    }

    /// Content type for streaming calls.
    pub const fn stream_content_type(self) -> &'static str {
        match self {
            Self::Json => "application/connect+json",
            Self::Postcard => "application/connect+postcard",
        }
    }

    /// Serializes `msg`.
    pub fn encode<T: Serialize>(self, msg: &T) -> Result<Vec<u8>, RpcError> {
        match self {
            Self::Json => serde_json::to_vec(msg).map_err(|e| encode_error(self, &e)),
            Self::Postcard => postcard::to_allocvec(msg).map_err(|e| encode_error(self, &e)),
        }
    }

    /// Deserializes a message from `bytes`.
    pub fn decode<T: DeserializeOwned>(self, bytes: &[u8]) -> Result<T, RpcError> {
        match self {
            Self::Json => serde_json::from_slice(bytes).map_err(|e| decode_error(self, &e)),
            Self::Postcard => postcard::from_bytes(bytes).map_err(|e| decode_error(self, &e)),
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Codec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "postcard" => Ok(Self::Postcard),
            _ => Err(format!("unknown codec: {s}")),
        }
    }
}

fn encode_error(codec: Codec, e: &dyn fmt::Display) -> RpcError {
    RpcError::new(Code::Internal, format!("failed to encode {codec} message: {e}"))
}

fn decode_error(codec: Codec, e: &dyn fmt::Display) -> RpcError {
    RpcError::new(Code::Internal, format!("failed to decode {codec} message: {e}"))
}

/// Serde adapter for byte fields: base64 in human-readable formats,
/// raw bytes otherwise.
pub(crate) mod bytes {
    use std::fmt;

    use base64::Engine;
    use base64::engine::general_purpose::{STANDARD, URL_SAFE};
    use serde::de::{self, SeqAccess, Visitor};
    use serde::{Deserializer, Serializer};

    pub(crate) fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        if s.is_human_readable() {
            s.serialize_str(&STANDARD.encode(bytes))
        } else {
            s.serialize_bytes(bytes)
        }
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        if d.is_human_readable() {
            d.deserialize_str(Base64Visitor)
        } else {
            d.deserialize_byte_buf(RawVisitor)
        }
    }

    struct Base64Visitor;

    impl Visitor<'_> for Base64Visitor {
        type Value = Vec<u8>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a base64 string")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Vec<u8>, E> {
            // Both alphabets are valid on the wire; padding is optional.
            let trimmed = v.trim_end_matches('=');
            let padded = match trimmed.len() % 4 {
                2 => format!("{trimmed}=="),
                3 => format!("{trimmed}="),
                _ => trimmed.to_owned(),
            };
            STANDARD
                .decode(&padded)
                .or_else(|_| URL_SAFE.decode(&padded))
                .map_err(E::custom)
        }
    }

    struct RawVisitor;

    impl<'de> Visitor<'de> for RawVisitor {
        type Value = Vec<u8>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a byte array")
        }

        fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Vec<u8>, E> {
            Ok(v.to_vec())
        }

        fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<Vec<u8>, E> {
            Ok(v)
        }

        fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Vec<u8>, A::Error> {
            let mut out = Vec::with_capacity(seq.size_hint().unwrap_or(0));
            while let Some(b) = seq.next_element()? {
                out.push(b);
            }
            Ok(out)
        }
    }
}
