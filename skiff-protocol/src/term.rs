//! Terminal channel wire schema
//!
//! The terminal channel is mostly raw bytes: outbound frames are
//! keystrokes forwarded verbatim, inbound frames are shell output. The
//! only structure layered on top is a reserved control-line sentinel for
//! session management (prefixed with SOH, which cannot be typed
//! accidentally) and an optional JSON "notice" shape for out-of-band
//! session lifecycle messages.

use serde::{Deserialize, Serialize};

/// Reserved prefix byte for control lines on the terminal channel
pub const CONTROL_PREFIX: char = '\u{1}';

/// Lifecycle notice messages used in [`TermNotice::Info`] by servers
/// that announce session state changes.
pub mod notice {
    pub const OPENED: &str = "opened";
    pub const CLOSED: &str = "closed";
    pub const FOCUSED: &str = "focused";
}

/// Terminal geometry in character cells
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TermGeometry {
    pub cols: u16,
    pub rows: u16,
}

impl Default for TermGeometry {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

/// Control-line parse failure
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ControlParseError {
    #[error("not a control line")]
    NotControl,

    #[error("unknown control verb: {0}")]
    UnknownVerb(String),

    #[error("malformed control payload: {0}")]
    BadPayload(String),
}

/// Client-to-server control lines, sent as text frames
///
/// Encoding: `SOH verb[:args]`. The session id comes last in `resize`
/// so ids containing `:` survive the split.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TermControl {
    /// Create or re-attach the sub-channel for a session
    Open { sid: String },
    /// Tear down a session's sub-channel
    Close { sid: String },
    /// Route subsequent raw input to this session
    Focus { sid: String },
    /// Propagate new PTY geometry for a session
    Resize { sid: String, geometry: TermGeometry },
}

impl TermControl {
    /// Encode as a sentinel text line
    pub fn encode(&self) -> String {
        match self {
            Self::Open { sid } => format!("{}open:{}", CONTROL_PREFIX, sid),
            Self::Close { sid } => format!("{}close:{}", CONTROL_PREFIX, sid),
            Self::Focus { sid } => format!("{}focus:{}", CONTROL_PREFIX, sid),
            Self::Resize { sid, geometry } => format!(
                "{}resize:{}:{}:{}",
                CONTROL_PREFIX, geometry.cols, geometry.rows, sid
            ),
        }
    }

    /// Whether a text frame is a control line
    pub fn is_control(line: &str) -> bool {
        line.starts_with(CONTROL_PREFIX)
    }

    /// Parse a sentinel text line
    pub fn parse(line: &str) -> Result<Self, ControlParseError> {
        let rest = line
            .strip_prefix(CONTROL_PREFIX)
            .ok_or(ControlParseError::NotControl)?;

        let (verb, args) = rest.split_once(':').unwrap_or((rest, ""));
        match verb {
            "open" | "close" | "focus" => {
                if args.is_empty() {
                    return Err(ControlParseError::BadPayload(
                        "missing session id".into(),
                    ));
                }
                let sid = args.to_string();
                Ok(match verb {
                    "open" => Self::Open { sid },
                    "close" => Self::Close { sid },
                    _ => Self::Focus { sid },
                })
            }
            "resize" => {
                let mut parts = args.splitn(3, ':');
                let cols = parts.next().and_then(|s| s.parse::<u16>().ok());
                let rows = parts.next().and_then(|s| s.parse::<u16>().ok());
                let sid = parts.next().filter(|s| !s.is_empty());
                match (cols, rows, sid) {
                    (Some(cols), Some(rows), Some(sid)) => Ok(Self::Resize {
                        sid: sid.to_string(),
                        geometry: TermGeometry { cols, rows },
                    }),
                    _ => Err(ControlParseError::BadPayload(args.to_string())),
                }
            }
            other => Err(ControlParseError::UnknownVerb(other.to_string())),
        }
    }
}

/// Out-of-band session lifecycle notice, tagged by the `type` field
///
/// Servers that announce sessions (rather than leaving lifecycle purely
/// client-driven) push these as JSON text frames.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TermNotice {
    Info {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sid: Option<String>,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sid: Option<String>,
    },
}

impl TermNotice {
    pub fn message(&self) -> &str {
        match self {
            Self::Info { message, .. } | Self::Error { message, .. } => message,
        }
    }

    pub fn sid(&self) -> Option<&str> {
        match self {
            Self::Info { sid, .. } | Self::Error { sid, .. } => sid.as_deref(),
        }
    }

    /// Try to parse a text frame as a notice
    ///
    /// Shell output that happens to start with `{` but is not a notice
    /// falls through to `None` and is rendered verbatim.
    pub fn parse(frame: &str) -> Option<Self> {
        if !frame.trim_start().starts_with('{') {
            return None;
        }
        serde_json::from_str(frame).ok()
    }
}
