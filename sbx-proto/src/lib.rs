//! Wire protocol for the sbx sandbox RPC service.
//!
//! Everything here is pure and I/O-free: envelope framing, payload codecs,
//! compression, incremental stream reassembly, HTTP error mapping, and the
//! typed messages of the `process.Process` and `filesystem.Filesystem`
//! services. Blocking and async transports drive the same code.

mod codec;
pub mod compress;
pub mod envelope;
mod error;
pub mod filesystem;
pub mod process;
mod reassembler;

pub use codec::Codec;
pub use compress::{Compressor, Gzip, IDENTITY};
pub use envelope::{Flags, HEADER_LEN, Header};
pub use error::{Code, RpcError, Trailer, WireError};
pub use reassembler::{DEFAULT_MAX_MESSAGE_LEN, Frame, Metadata, Reassembler};

/// Value of the `connect-protocol-version` header.
pub const PROTOCOL_VERSION: &str = "1";
