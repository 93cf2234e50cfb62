//! Client configuration
//!
//! TOML file at `~/.config/skiff/config.toml`. Every field has a
//! default, so a missing or partial file works; a file that fails to
//! parse is logged and replaced by defaults rather than aborting.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use skiff_utils::paths;

use crate::term::{ChannelPolicy, TermConfig, DEFAULT_RESIZE_RESEND_DELAY};
use crate::transport::{TransportConfig, DEFAULT_BASE_DELAY, DEFAULT_MAX_BACKOFF};

/// Top-level client configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub connection: ConnectionConfig,
    pub terminal: TerminalConfig,
    /// Workspace endpoint aliases, e.g. `staging = "ws://stage:9000"`
    pub remotes: HashMap<String, String>,
}

/// Connection and RPC tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Filesystem channel URL template; `{workspace}` is substituted
    pub fs_url: String,
    /// Terminal channel URL template; `{workspace}` is substituted
    pub term_url: String,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub rpc_timeout_secs: u64,
    pub reconnect: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            fs_url: "ws://localhost:9000/ws/fs/{workspace}".into(),
            term_url: "ws://localhost:9000/ws/term/{workspace}".into(),
            backoff_base_ms: DEFAULT_BASE_DELAY.as_millis() as u64,
            backoff_max_ms: DEFAULT_MAX_BACKOFF.as_millis() as u64,
            rpc_timeout_secs: 20,
            reconnect: true,
        }
    }
}

/// Terminal multiplexer tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalConfig {
    pub arrangement: Arrangement,
    pub resize_resend_ms: u64,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            arrangement: Arrangement::Shared,
            resize_resend_ms: DEFAULT_RESIZE_RESEND_DELAY.as_millis() as u64,
        }
    }
}

/// How terminal sessions map onto connections
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arrangement {
    #[default]
    Shared,
    Dedicated,
}

impl ClientConfig {
    /// Load from the default path, falling back to defaults when the
    /// file is absent or malformed.
    pub fn load() -> Self {
        Self::load_from(&paths::config_file())
    }

    pub fn load_from(path: &Path) -> Self {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Self::default(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to read config, using defaults");
                return Self::default();
            }
        };

        match toml::from_str(&raw) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to parse config, using defaults");
                Self::default()
            }
        }
    }

    /// Filesystem channel URL for a workspace. `workspace` may be a
    /// remote alias, a workspace id, or a full URL.
    pub fn fs_endpoint(&self, workspace: &str) -> String {
        self.endpoint(&self.connection.fs_url, workspace)
    }

    /// Terminal channel URL for a workspace
    pub fn term_endpoint(&self, workspace: &str) -> String {
        self.endpoint(&self.connection.term_url, workspace)
    }

    fn endpoint(&self, template: &str, workspace: &str) -> String {
        if let Some(url) = self.remotes.get(workspace) {
            return url.clone();
        }
        if workspace.starts_with("ws://") || workspace.starts_with("wss://") {
            return workspace.to_string();
        }
        template.replace("{workspace}", workspace)
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            base_delay: Duration::from_millis(self.connection.backoff_base_ms),
            max_backoff: Duration::from_millis(self.connection.backoff_max_ms),
            reconnect: self.connection.reconnect,
        }
    }

    pub fn term_config(&self) -> TermConfig {
        TermConfig {
            policy: match self.terminal.arrangement {
                Arrangement::Shared => ChannelPolicy::Shared,
                Arrangement::Dedicated => ChannelPolicy::Dedicated,
            },
            resize_resend_delay: Duration::from_millis(self.terminal.resize_resend_ms),
            transport: self.transport_config(),
        }
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.connection.rpc_timeout_secs)
    }
}
