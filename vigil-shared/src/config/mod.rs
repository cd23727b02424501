//! # Configuration
//!
//! Client configuration: defaults, then a YAML/JSON file, then `VIGIL_*`
//! environment variables, then command-line overrides.

pub mod client;

pub use client::{
    AuthConfig, ChannelConfig, Config, IdentityConfig, LogFormat, LoggingConfig,
    ReconcilerConfig, ServerConfig,
};
