//! Client core for remote sandboxes.
//!
//! `sbx` talks to a sandbox's process and filesystem services over a
//! Connect-style RPC protocol on HTTP/1.1: unary calls, server streams,
//! process handles with live output, and directory watches. Everything is
//! blocking; [`nonblocking`] offers the same operations to async code.
//!
//! # Quick start
//!
//! ```no_run
//! use sbx::{Client, StartOptions};
//!
//! let client = Client::builder("http://localhost:49983")
//!     .build()
//!     .expect("invalid client config");
//!
//! let out = client
//!     .commands()
//!     .run("echo hello", StartOptions::new())
//!     .expect("command failed");
//! assert_eq!(out.stdout, "hello\n");
//! ```
//!
//! # Streaming output
//!
//! ```no_run
//! use sbx::{Client, Output, ProcessConfig, StartOptions};
//!
//! let client = Client::builder("http://localhost:49983").build().unwrap();
//! let mut handle = client
//!     .commands()
//!     .start(ProcessConfig::new("ls").args(["-la"]), StartOptions::new())
//!     .unwrap();
//! for chunk in handle.by_ref() {
//!     if let Output::Stdout(bytes) = chunk {
//!         print!("{}", String::from_utf8_lossy(&bytes));
//!     }
//! }
//! let result = handle.wait();
//! ```

mod client;
mod command;
mod config;
mod error;
pub mod nonblocking;
mod socket;
mod stream;
mod transport;
mod watch;

pub use client::{CallOptions, Client};
pub use command::{
    CommandHandle, Commands, ConnectOptions, Output, OutputHandler, ProcessControl, ProcessState,
    StartOptions,
};
pub use config::{ClientBuilder, ClientConfig, DEFAULT_MAX_ATTEMPTS, Timeouts};
pub use error::{CommandExit, CommandResult, Error, Result};
pub use sbx_proto::process::{ProcessConfig, ProcessInfo, ProcessSelector, PtySize, Signal};
pub use sbx_proto::{Code, Codec, Compressor, Gzip, RpcError};
pub use stream::ServerStream;
pub use watch::{Filesystem, WatchEvent, WatchHandle, WatchHandler};
