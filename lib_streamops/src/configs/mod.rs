//! # Configuration Modules
//!
//! This module aggregates the configuration providers of the sync client.

/// Layered client configuration: defaults, JSON file, environment and CLI flags.
pub mod client_config;

pub use client_config::{load_config, load_dotenv, ClientConfig, ClientSettings, ConfigError};
