//! Configuration resolution for murmur.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/murmur/settings.json)
//! 3. Explicit config file (e.g. passed on the command line)
//! 4. Environment variables (highest priority)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Complete murmur configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub policy: Policy,
    #[serde(default)]
    pub fragments: FragmentConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Per-conversation protocol policy.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Policy {
    /// Accept and offer protocol version 2.
    pub allow_v2: bool,
    /// Accept and offer protocol version 3 (instance tags).
    pub allow_v3: bool,
    /// Never send user messages in the clear; queue them and start the AKE.
    pub require_encryption: bool,
    /// Append the whitespace capability tag to outgoing plaintext.
    pub send_whitespace_tag: bool,
    /// Start the AKE when a whitespace tag is received.
    pub whitespace_start_ake: bool,
    /// Send a query when the peer reports an error.
    pub error_start_ake: bool,
    /// Tell the peer about fatal handshake and decryption failures.
    pub report_errors_to_peer: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            allow_v2: true,
            allow_v3: true,
            require_encryption: false,
            send_whitespace_tag: false,
            whitespace_start_ake: true,
            error_start_ake: true,
            report_errors_to_peer: true,
        }
    }
}

/// Outgoing fragmentation and pacing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FragmentConfig {
    /// Maximum length of one transport message. `None` disables fragmentation.
    pub max_fragment_size: Option<usize>,
    /// Delay between paced outgoing pieces (milliseconds). 0 = send at once.
    pub send_interval_ms: u64,
}

impl Default for FragmentConfig {
    fn default() -> Self {
        Self {
            max_fragment_size: None,
            send_interval_ms: 0,
        }
    }
}

impl FragmentConfig {
    /// Pacing interval as a `Duration`.
    pub const fn send_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.send_interval_ms)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Config {
    /// Reject settings no conversation could work with.
    pub fn validate(&self) -> Result<()> {
        if !self.policy.allow_v2 && !self.policy.allow_v3 {
            return Err(Error::Policy(
                "at least one of allow_v2 and allow_v3 must be set".into(),
            ));
        }
        if self.fragments.max_fragment_size == Some(0) {
            return Err(Error::Config("max_fragment_size must be positive".into()));
        }
        Ok(())
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        config = load_config_file(&global_path)?;
    }

    if let Some(path) = explicit {
        if !path.exists() {
            return Err(Error::Config(format!(
                "Config file {} does not exist",
                path.display()
            )));
        }
        merge_config(&mut config, load_config_file(path)?);
    }

    apply_env_overrides(&mut config);
    config.validate()?;

    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .ok()
            .map(|h| PathBuf::from(h).join(".murmur").join("settings.json"))
    }
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/murmur/settings.json"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
            .map(|p| p.join("murmur").join("settings.json"))
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn merge_config(base: &mut Config, overlay: Config) {
    base.policy = overlay.policy;

    if overlay.fragments.max_fragment_size.is_some() {
        base.fragments.max_fragment_size = overlay.fragments.max_fragment_size;
    }
    base.fragments.send_interval_ms = overlay.fragments.send_interval_ms;

    base.logging = overlay.logging;
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(val) = std::env::var("MURMUR_FRAGMENT_SIZE")
        && let Ok(n) = val.parse()
    {
        config.fragments.max_fragment_size = Some(n);
    }
    if let Ok(val) = std::env::var("MURMUR_SEND_INTERVAL_MS")
        && let Ok(n) = val.parse()
    {
        config.fragments.send_interval_ms = n;
    }
    if let Ok(val) = std::env::var("MURMUR_LOG_LEVEL") {
        config.logging.level = val;
    }
    if let Ok(val) = std::env::var("MURMUR_REQUIRE_ENCRYPTION")
        && let Ok(flag) = val.parse()
    {
        config.policy.require_encryption = flag;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_allows_both_versions() {
        let config = Config::default();
        assert!(config.policy.allow_v2);
        assert!(config.policy.allow_v3);
        assert!(!config.policy.require_encryption);
    }

    #[test]
    fn default_config_does_not_fragment() {
        let config = Config::default();
        assert!(config.fragments.max_fragment_size.is_none());
        assert_eq!(config.fragments.send_interval(), std::time::Duration::ZERO);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{ "policy": { "require_encryption": true }, "fragments": { "max_fragment_size": 400 } }"#,
        )
        .unwrap();

        let config = load_config_file(&path).unwrap();
        assert!(config.policy.require_encryption);
        assert!(config.policy.allow_v3);
        assert_eq!(config.fragments.max_fragment_size, Some(400));
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn merge_keeps_base_fragment_size_when_overlay_has_none() {
        let mut base = Config::default();
        base.fragments.max_fragment_size = Some(140);
        let mut overlay = Config::default();
        overlay.fragments.send_interval_ms = 250;

        merge_config(&mut base, overlay);
        assert_eq!(base.fragments.max_fragment_size, Some(140));
        assert_eq!(base.fragments.send_interval_ms, 250);
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let result = load_config(Some(Path::new("/nonexistent/murmur.json")));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn policy_without_versions_is_rejected() {
        let mut config = Config::default();
        config.policy.allow_v2 = false;
        assert!(config.validate().is_ok());
        config.policy.allow_v3 = false;
        assert!(matches!(config.validate(), Err(Error::Policy(_))));
    }

    #[test]
    fn zero_fragment_size_is_rejected() {
        let mut config = Config::default();
        config.fragments.max_fragment_size = Some(0);
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(load_config_file(&path), Err(Error::Config(_))));
    }
}
