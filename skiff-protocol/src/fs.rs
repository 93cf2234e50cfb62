//! Filesystem channel wire schema
//!
//! Requests travel as JSON text frames of the form
//! `{ "action": ..., "req_id": N, ...action fields }`. Everything the
//! server sends back is an [`FsEvent`]: a correlated `ok`/`error`
//! response, or an unsolicited broadcast about a path some other client
//! touched.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Wire value of the `error` field a server uses to reject a write whose
/// `prev_rev` does not match its current revision for the path.
pub const CONFLICT_ERROR: &str = "conflict";

/// A correlated request on the filesystem channel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FsRequest {
    /// Monotonic request id, unique per connection lifetime
    pub req_id: u64,
    #[serde(flatten)]
    pub op: FsOp,
}

/// Filesystem operations, tagged by the `action` field
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum FsOp {
    /// List the entries of a directory
    ListDir { path: String },

    /// Read a file's content (response carries its current revision)
    ReadFile { path: String },

    /// Write a file, guarded by the last revision this client observed
    WriteFile {
        path: String,
        prev_rev: u64,
        content: String,
    },

    /// Create a directory
    CreateDir { path: String },

    /// Delete a file or directory
    DeletePath { path: String },

    /// Move or rename a file or directory
    MovePath { src: String, dst: String },
}

impl FsOp {
    /// Wire name of this operation's `action` field
    pub fn action(&self) -> &'static str {
        match self {
            Self::ListDir { .. } => "list_dir",
            Self::ReadFile { .. } => "read_file",
            Self::WriteFile { .. } => "write_file",
            Self::CreateDir { .. } => "create_dir",
            Self::DeletePath { .. } => "delete_path",
            Self::MovePath { .. } => "move_path",
        }
    }

    /// The path this operation primarily affects (the source for moves)
    pub fn primary_path(&self) -> &str {
        match self {
            Self::ListDir { path }
            | Self::ReadFile { path }
            | Self::WriteFile { path, .. }
            | Self::CreateDir { path }
            | Self::DeletePath { path } => path,
            Self::MovePath { src, .. } => src,
        }
    }
}

/// Everything the server pushes on the filesystem channel, tagged by the
/// `event` field
///
/// `Ok`/`Error` answer a pending request; the rest are broadcasts not
/// tied to any request. `Connected` is announced after every (re)connect
/// handshake and means "any number of broadcasts may have been missed,
/// refresh everything".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FsEvent {
    Ok {
        req_id: u64,
        #[serde(default)]
        data: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rev: Option<u64>,
    },

    Error { req_id: u64, error: String },

    FileChanged { path: String, rev: u64 },

    PathCreated { path: String, rev: u64 },

    PathDeleted { path: String },

    PathMoved { path: String, dst: String, rev: u64 },

    Connected,
}

/// One entry of a directory listing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DirEntry {
    pub name: String,
    pub kind: EntryKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// Entry kind for directory listings
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Dir,
}

/// Payload of a successful `read_file` (the revision rides on the
/// response envelope, not in the payload)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileBody {
    pub content: String,
}

/// Serialize a request for transmission as a text frame
pub fn encode_request(req: &FsRequest) -> serde_json::Result<String> {
    serde_json::to_string(req)
}

/// Parse an inbound text frame into an [`FsEvent`]
pub fn decode_event(frame: &str) -> serde_json::Result<FsEvent> {
    serde_json::from_str(frame)
}
