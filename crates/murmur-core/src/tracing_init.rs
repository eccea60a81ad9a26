//! Logging setup shared by the `murmur` binary and embedding applications.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingConfig;

/// Crates whose events follow `logging.level` unless `RUST_LOG` says otherwise.
const MURMUR_TARGETS: &[&str] = &["murmur", "murmur_cli", "murmur_otr", "murmur_crypto"];

/// Filter directive applying `level` to every murmur crate.
pub fn default_filter(level: &str) -> String {
    MURMUR_TARGETS
        .iter()
        .map(|target| format!("{target}={level}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `logging.level`. Output goes to stderr so that a
/// binary's stdout carries only its results. A subscriber that is already
/// installed is kept.
pub fn init_tracing(logging: &LoggingConfig) {
    let filter = std::env::var("RUST_LOG")
        .ok()
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(default_filter(&logging.level)));

    let registry = tracing_subscriber::registry().with(filter);
    let _ = if logging.json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };
}
