//! Transfer configuration.
//!
//! Every field has a default, so a TOML file only needs the keys it
//! overrides:
//!
//! ```toml
//! part_size = 8388608
//! max_concurrency = 6
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::TransferError;
use crate::retry::RetryPolicy;

/// Default part size: 4 MiB.
pub const DEFAULT_PART_SIZE: u64 = 4 * 1024 * 1024;

/// Objects at or below this size transfer as a single part: 50 MiB.
pub const DEFAULT_CHUNK_THRESHOLD: u64 = 50 * 1024 * 1024;

/// Tunables for one transfer session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Bytes per part.
    pub part_size: u64,

    /// Upper bound on parts in flight at once.
    pub max_concurrency: usize,

    /// Attempts per part before the session fails.
    pub max_retries_per_part: u32,

    /// Backoff base; attempt `n` waits `base * 2^(n-1)` plus jitter.
    pub retry_base_delay_ms: u64,

    /// Cap on the random jitter added to each backoff.
    pub max_jitter_ms: u64,

    /// Objects at or below this size are transferred as one part.
    pub chunk_threshold: u64,

    /// Cached credentials are refreshed this long before they expire.
    pub credential_expiry_margin_secs: u64,

    /// Whole-session re-dispatches after a credential expiry (upload).
    pub reupload_attempts: u32,

    /// Root for per-session part directories. Defaults to the
    /// destination file's directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_dir: Option<PathBuf>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            part_size: DEFAULT_PART_SIZE,
            max_concurrency: 4,
            max_retries_per_part: 3,
            retry_base_delay_ms: 500,
            max_jitter_ms: 1000,
            chunk_threshold: DEFAULT_CHUNK_THRESHOLD,
            credential_expiry_margin_secs: 600,
            reupload_attempts: 3,
            temp_dir: None,
        }
    }
}

impl TransferConfig {
    /// Parses a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, TransferError> {
        let config: TransferConfig = toml::from_str(content)
            .map_err(|e| TransferError::InvalidConfiguration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a TOML file, or defaults if it does not exist.
    pub fn load(path: &Path) -> Result<Self, TransferError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no transfer config, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Rejects settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), TransferError> {
        if self.part_size == 0 {
            return Err(TransferError::InvalidConfiguration(
                "part_size must be greater than zero".into(),
            ));
        }
        if self.max_concurrency == 0 {
            return Err(TransferError::InvalidConfiguration(
                "max_concurrency must be at least 1".into(),
            ));
        }
        if self.max_retries_per_part == 0 {
            return Err(TransferError::InvalidConfiguration(
                "max_retries_per_part must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Builds the per-part retry policy described by this config.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries_per_part,
            Duration::from_millis(self.retry_base_delay_ms),
        )
        .with_max_jitter(Duration::from_millis(self.max_jitter_ms))
    }

    pub fn credential_margin(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.credential_expiry_margin_secs as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = TransferConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.part_size, 4 * 1024 * 1024);
        assert_eq!(config.max_retries_per_part, 3);
        assert_eq!(config.chunk_threshold, 50 * 1024 * 1024);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = TransferConfig::from_toml_str(
            r#"
            part_size = 1048576
            max_concurrency = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.part_size, 1_048_576);
        assert_eq!(config.max_concurrency, 2);
        assert_eq!(config.retry_base_delay_ms, 500);
        assert!(config.temp_dir.is_none());
    }

    #[test]
    fn zero_part_size_rejected() {
        let err = TransferConfig::from_toml_str("part_size = 0").unwrap_err();
        assert!(matches!(err, TransferError::InvalidConfiguration(_)));
    }

    #[test]
    fn zero_concurrency_rejected() {
        let config = TransferConfig {
            max_concurrency: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn malformed_toml_rejected() {
        let err = TransferConfig::from_toml_str("part_size = \"big\"").unwrap_err();
        assert!(matches!(err, TransferError::InvalidConfiguration(_)));
    }

    #[test]
    fn load_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = TransferConfig::load(&dir.path().join("transfer.toml")).unwrap();
        assert_eq!(config, TransferConfig::default());
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transfer.toml");
        std::fs::write(&path, "max_retries_per_part = 7\ntemp_dir = \"/var/tmp/parts\"\n").unwrap();

        let config = TransferConfig::load(&path).unwrap();
        assert_eq!(config.max_retries_per_part, 7);
        assert_eq!(config.temp_dir, Some(PathBuf::from("/var/tmp/parts")));
    }

    #[test]
    fn retry_policy_reflects_config() {
        let config = TransferConfig {
            max_retries_per_part: 5,
            retry_base_delay_ms: 100,
            ..Default::default()
        };
        let policy = config.retry_policy();
        assert_eq!(policy.max_attempts(), 5);
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
    }
}
