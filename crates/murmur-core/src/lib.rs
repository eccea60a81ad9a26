//! `murmur` Core Library
//!
//! Shared functionality for `murmur` components:
//! - Conversation policy, fragmentation and logging configuration
//! - Configuration resolution and hierarchy
//! - Common error types

pub mod config;
pub mod error;
pub mod tracing_init;

pub use config::{Config, FragmentConfig, LoggingConfig, Policy, load_config};
pub use error::{Error, Result};
