//! Messages of the `filesystem.Filesystem` watch stream.

use serde::{Deserialize, Serialize};

use crate::process::KeepAlive;

/// Fully-qualified service name.
pub const SERVICE: &str = "filesystem.Filesystem";

/// Method names of [`SERVICE`].
pub mod method {
    /// Server stream: directory change notifications.
    pub const WATCH_DIR: &str = "WatchDir";
}

/// `WatchDir` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchDirRequest {
    /// Directory to watch.
    pub path: String,
    /// Include subdirectories.
    #[serde(default)]
    pub recursive: bool,
}

/// One message of the `WatchDir` stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchDirResponse {
    /// The watch is established; always the first message.
    Start(WatchStartEvent),
    /// A change under the watched directory.
    Filesystem(FilesystemEvent),
    /// Periodic no-op keeping idle streams open.
    Keepalive(KeepAlive),
}

/// Watch acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WatchStartEvent {}

/// A single filesystem change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesystemEvent {
    /// Path of the changed entry, relative to the watched directory.
    pub name: String,
    /// Kind of change.
    #[serde(rename = "type", default)]
    pub kind: EventType,
}

/// Kind of filesystem change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[non_exhaustive]
pub enum EventType {
    /// Not set.
    #[default]
    #[serde(rename = "EVENT_TYPE_UNSPECIFIED")]
    Unspecified,
    /// Entry created.
    #[serde(rename = "EVENT_TYPE_CREATE")]
    Create,
    /// Entry written.
    #[serde(rename = "EVENT_TYPE_WRITE")]
    Write,
    /// Entry removed.
    #[serde(rename = "EVENT_TYPE_REMOVE")]
    Remove,
    /// Entry renamed.
    #[serde(rename = "EVENT_TYPE_RENAME")]
    Rename,
    /// Entry permissions changed.
    #[serde(rename = "EVENT_TYPE_CHMOD")]
    Chmod,
}
