//! Configuration loading from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use crate::bundle::Compression;
use crate::channel::BuildMode;

pub const DEFAULT_TEMPLATE_TTL_SECS: u64 = 3600;
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_BUNDLE_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_MAX_BUNDLE_BYTES: u64 = 64 * 1024 * 1024;

/// Compiler configuration
#[derive(Debug, Clone)]
pub struct CompilerConfig {
    /// Root of the local Nexon template directory
    pub nexon_dir: Option<PathBuf>,
    /// Base URL of the remote Nexon registry
    pub nexon_remote_url: Option<String>,
    /// Bearer token for the remote registry
    pub nexon_remote_token: Option<String>,
    pub template_ttl: Duration,
    pub fetch_timeout: Duration,
    pub bundle_timeout: Duration,
    /// Directory of per-organization policy files
    pub policy_dir: Option<PathBuf>,
    pub build_mode: BuildMode,
    pub compression: Compression,
    pub include_metadata: bool,
    /// Largest unpacked archive `verify` will read
    pub max_bundle_bytes: u64,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            nexon_dir: None,
            nexon_remote_url: None,
            nexon_remote_token: None,
            template_ttl: Duration::from_secs(DEFAULT_TEMPLATE_TTL_SECS),
            fetch_timeout: Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS),
            bundle_timeout: Duration::from_secs(DEFAULT_BUNDLE_TIMEOUT_SECS),
            policy_dir: None,
            build_mode: BuildMode::Production,
            compression: Compression::Gzip,
            include_metadata: true,
            max_bundle_bytes: DEFAULT_MAX_BUNDLE_BYTES,
        }
    }
}

impl CompilerConfig {
    /// Load configuration from environment variables.
    ///
    /// All optional (with defaults):
    /// - `GJ_NEXON_DIR`: local Nexon template directory
    /// - `GJ_NEXON_REMOTE_URL`, `GJ_NEXON_REMOTE_TOKEN`: remote registry
    /// - `GJ_TEMPLATE_TTL_SECS` (default: 3600)
    /// - `GJ_FETCH_TIMEOUT_SECS` (default: 10)
    /// - `GJ_BUNDLE_TIMEOUT_SECS` (default: 60)
    /// - `GJ_POLICY_DIR`: per-organization policy files
    /// - `GJ_BUILD_MODE`: `production` or `development` (default: production)
    /// - `GJ_COMPRESSION`: `gzip` or `none` (default: gzip)
    /// - `GJ_INCLUDE_METADATA`: `true` or `false` (default: true)
    /// - `GJ_MAX_BUNDLE_BYTES`: unpacked size limit when reading bundles (default: 64 MiB)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; `from_env` uses the process env.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let secs = |key: &'static str, default: u64| -> Result<Duration, ConfigError> {
            match non_empty(key) {
                None => Ok(Duration::from_secs(default)),
                Some(v) => v
                    .trim()
                    .parse::<u64>()
                    .map(Duration::from_secs)
                    .map_err(|_| ConfigError::Invalid(key, "must be a non-negative integer")),
            }
        };

        let build_mode = match non_empty("GJ_BUILD_MODE").as_deref().map(str::trim) {
            None | Some("production") => BuildMode::Production,
            Some("development") => BuildMode::Development,
            Some(_) => {
                return Err(ConfigError::Invalid(
                    "GJ_BUILD_MODE",
                    "must be 'production' or 'development'",
                ))
            }
        };

        let compression = match non_empty("GJ_COMPRESSION").as_deref().map(str::trim) {
            None | Some("gzip") => Compression::Gzip,
            Some("none") => Compression::None,
            Some(_) => return Err(ConfigError::Invalid("GJ_COMPRESSION", "must be 'gzip' or 'none'")),
        };

        let include_metadata = match non_empty("GJ_INCLUDE_METADATA").as_deref().map(str::trim) {
            None | Some("true") | Some("1") => true,
            Some("false") | Some("0") => false,
            Some(_) => {
                return Err(ConfigError::Invalid(
                    "GJ_INCLUDE_METADATA",
                    "must be 'true' or 'false'",
                ))
            }
        };

        let max_bundle_bytes = match non_empty("GJ_MAX_BUNDLE_BYTES") {
            None => DEFAULT_MAX_BUNDLE_BYTES,
            Some(v) => match v.trim().parse::<u64>() {
                Ok(n) if n > 0 => n,
                _ => return Err(ConfigError::Invalid("GJ_MAX_BUNDLE_BYTES", "must be a positive integer")),
            },
        };

        Ok(Self {
            nexon_dir: non_empty("GJ_NEXON_DIR").map(PathBuf::from),
            nexon_remote_url: non_empty("GJ_NEXON_REMOTE_URL"),
            nexon_remote_token: non_empty("GJ_NEXON_REMOTE_TOKEN"),
            template_ttl: secs("GJ_TEMPLATE_TTL_SECS", DEFAULT_TEMPLATE_TTL_SECS)?,
            fetch_timeout: secs("GJ_FETCH_TIMEOUT_SECS", DEFAULT_FETCH_TIMEOUT_SECS)?,
            bundle_timeout: secs("GJ_BUNDLE_TIMEOUT_SECS", DEFAULT_BUNDLE_TIMEOUT_SECS)?,
            policy_dir: non_empty("GJ_POLICY_DIR").map(PathBuf::from),
            build_mode,
            compression,
            include_metadata,
            max_bundle_bytes,
        })
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = CompilerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.template_ttl, Duration::from_secs(3600));
        assert_eq!(config.fetch_timeout, Duration::from_secs(10));
        assert_eq!(config.build_mode, BuildMode::Production);
        assert_eq!(config.compression, Compression::Gzip);
        assert!(config.include_metadata);
        assert!(config.nexon_dir.is_none());
        assert_eq!(config.max_bundle_bytes, DEFAULT_MAX_BUNDLE_BYTES);
    }

    #[test]
    fn test_overrides() {
        let config = CompilerConfig::from_lookup(lookup(&[
            ("GJ_NEXON_DIR", "/opt/nexons"),
            ("GJ_TEMPLATE_TTL_SECS", "60"),
            ("GJ_BUILD_MODE", "development"),
            ("GJ_COMPRESSION", "none"),
            ("GJ_INCLUDE_METADATA", "false"),
            ("GJ_NEXON_REMOTE_URL", ""),
            ("GJ_MAX_BUNDLE_BYTES", "1048576"),
        ]))
        .unwrap();
        assert_eq!(config.nexon_dir, Some(PathBuf::from("/opt/nexons")));
        assert_eq!(config.template_ttl, Duration::from_secs(60));
        assert_eq!(config.build_mode, BuildMode::Development);
        assert_eq!(config.compression, Compression::None);
        assert!(!config.include_metadata);
        assert!(config.nexon_remote_url.is_none());
        assert_eq!(config.max_bundle_bytes, 1_048_576);
    }

    #[test]
    fn test_invalid_values() {
        let err = CompilerConfig::from_lookup(lookup(&[("GJ_FETCH_TIMEOUT_SECS", "soon")]))
            .unwrap_err();
        assert!(err.to_string().contains("GJ_FETCH_TIMEOUT_SECS"));

        assert!(CompilerConfig::from_lookup(lookup(&[("GJ_BUILD_MODE", "staging")])).is_err());
        assert!(CompilerConfig::from_lookup(lookup(&[("GJ_MAX_BUNDLE_BYTES", "0")])).is_err());
    }
}
