//! skiff-protocol: Shared wire definitions for client-server communication
//!
//! This crate defines the message types exchanged over a workspace's two
//! WebSocket channels: the filesystem RPC/broadcast channel (JSON text
//! frames) and the terminal session channel (raw byte frames plus a
//! reserved control-line sentinel).

pub mod fs;
pub mod term;

// Re-export main types at crate root
pub use fs::{
    decode_event, encode_request, DirEntry, EntryKind, FileBody, FsEvent, FsOp, FsRequest,
    CONFLICT_ERROR,
};
pub use term::{
    ControlParseError, TermControl, TermGeometry, TermNotice, CONTROL_PREFIX,
};

/// Current protocol version
pub const PROTOCOL_VERSION: u32 = 1;
