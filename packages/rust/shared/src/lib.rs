//! Shared types, error model, and configuration for eventstream-router.
//!
//! This crate is the foundation depended on by all other router crates.
//! It provides:
//! - [`RouterError`]: the unified error type
//! - Event types ([`ChangeEvent`], [`ChangeType`], [`CategoryChange`])
//! - Configuration ([`AppConfig`], config loading)
//! - Named append-only log sinks ([`LogStream`])

pub mod config;
pub mod error;
pub mod logstream;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AlertsConfig, AppConfig, CheckpointConfig, RoutesConfig, StreamConfig, SupervisorConfig,
    config_dir, config_file_path, load_config, load_config_from,
};
pub use error::{Result, RouterError, panic_message};
pub use logstream::LogStream;
pub use types::{CategoryChange, ChangeEvent, ChangeType};
