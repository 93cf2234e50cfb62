//! skiff-client: workspace protocol client
//!
//! Everything a front-end needs to drive one remote workspace: a
//! reconnecting WebSocket [`transport`], request [`rpc`] correlation,
//! the revision-tracked [`fs`] sync service, the terminal session
//! [`term`] multiplexer, and the client [`commands`] interceptor.

pub mod commands;
pub mod config;
pub mod fs;
pub mod rpc;
pub mod term;
pub mod transport;

pub use commands::{CommandHandler, CommandInterceptor, DEFAULT_PREFIX};
pub use config::{Arrangement, ClientConfig};
pub use fs::{FileContent, FsChange, FsClient, RevisionTable};
pub use rpc::{Correlator, DEFAULT_RPC_TIMEOUT};
pub use term::{
    normalize_crlf, ChannelPolicy, SessionInfo, SessionState, TermConfig, TermEvent, TerminalMux,
};
pub use transport::{Frame, FrameSender, Transport, TransportConfig, TransportEvent};
