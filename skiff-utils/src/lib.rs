//! skiff-utils: Common utilities shared across skiff crates
//!
//! This crate provides:
//! - Unified error types ([`SkiffError`], [`Result`])
//! - Logging infrastructure ([`init_logging`], [`LogConfig`])
//! - XDG-compliant path utilities ([`paths`] module)

pub mod error;
pub mod logging;
pub mod paths;

// Re-export main types at crate root for convenience
pub use error::{Result, SkiffError};
pub use logging::{init_logging, init_logging_with_config, LogConfig, LogOutput};

// Re-export commonly used path functions
pub use paths::{cache_dir, config_dir, config_file, ensure_dir, log_dir, state_dir};
