//! Configuration types for fdrlog

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::storage::ENTRY_HEADER_SIZE;
use crate::{FdrError, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding `log.bin` and rotated logs
    pub output_dir: PathBuf,
    /// Encrypt compressed blocks
    #[serde(default)]
    pub encrypted: bool,
    /// RSA public key (PEM) sealing the session keys
    #[serde(default = "default_public_key")]
    pub public_key: PathBuf,
    /// Compute an MD5 of each log and store it in its header
    #[serde(default)]
    pub md5: bool,
    /// Disk usage limits
    #[serde(default)]
    pub limits: LimitsConfig,
    /// Staging buffer sizes
    #[serde(default)]
    pub buffer: BufferConfig,
    /// Polling periods
    #[serde(default)]
    pub polling: PollingConfig,
    /// Additional header fields
    #[serde(default)]
    pub extra_properties: Vec<ExtraProperty>,
    /// System properties reported in the header
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    /// Built-in plugins to load, with their optional settings string
    #[serde(default)]
    pub plugins: BTreeMap<String, String>,
}

fn default_public_key() -> PathBuf {
    PathBuf::from("/etc/loggerd.pub.pem")
}

/// Disk usage limits, 0 disables a limit
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of log files
    #[serde(default)]
    pub max_log_count: u32,
    /// Free space to keep on the filesystem
    #[serde(default)]
    pub min_free_space: u64,
    /// Maximum space used by all logs
    #[serde(default)]
    pub max_used_space: u64,
    /// Maximum size of one log
    #[serde(default)]
    pub max_log_size: u64,
    /// Space reserved for a new log when removing old ones
    #[serde(default)]
    pub min_log_size: u64,
}

/// Staging buffer sizes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Buffered bytes triggering a compressed block
    pub flush_threshold: usize,
    /// Extra room past the threshold, also the largest chunk read from a
    /// source at once
    pub min_space: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            flush_threshold: 2 * 1024 * 1024, // 2 MiB
            min_space: 512 * 1024,            // 512 KiB
        }
    }
}

/// Polling periods
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Longest polling period, sources may ask for shorter ones
    pub period_ms: u32,
    /// Period of the forced buffer flush
    pub flush_period_ms: u32,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            period_ms: 200,
            flush_period_ms: 1000,
        }
    }
}

/// Extra header field
///
/// With an empty `value` the field is reserved as `size` `F` characters and
/// can be rewritten once per log. Otherwise it is read-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtraProperty {
    /// Header key
    pub key: String,
    /// Reserved value size
    pub size: usize,
    /// Fixed value
    #[serde(default)]
    pub value: String,
}

impl ExtraProperty {
    /// True when the value was fixed by configuration
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        !self.value.is_empty()
    }

    /// Value as written in the first header: padded with `F` or truncated
    /// to `size`
    #[must_use]
    pub fn initial_value(&self) -> String {
        let mut value: String = self.value.chars().take(self.size).collect();
        let pad = self.size.saturating_sub(value.len());
        value.extend(std::iter::repeat('F').take(pad));
        value
    }
}

impl Config {
    /// Configuration writing to `output_dir` with every other option at its
    /// default
    #[must_use]
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            encrypted: false,
            public_key: default_public_key(),
            md5: false,
            limits: LimitsConfig::default(),
            buffer: BufferConfig::default(),
            polling: PollingConfig::default(),
            extra_properties: Vec::new(),
            properties: BTreeMap::new(),
            plugins: BTreeMap::new(),
        }
    }

    /// Load configuration from TOML file
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read or parsed
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| FdrError::ConfigError(format!("Failed to read config file: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| FdrError::ConfigError(format!("Failed to parse config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns error if configuration is invalid
    pub fn validate(&self) -> Result<()> {
        if self.output_dir.as_os_str().is_empty() {
            return Err(FdrError::ConfigError(
                "output_dir cannot be empty".to_string(),
            ));
        }

        if self.buffer.flush_threshold == 0 {
            return Err(FdrError::ConfigError(
                "buffer.flush_threshold must be > 0".to_string(),
            ));
        }

        if self.buffer.min_space <= ENTRY_HEADER_SIZE {
            return Err(FdrError::ConfigError(format!(
                "buffer.min_space must be > {ENTRY_HEADER_SIZE}"
            )));
        }

        if self.polling.period_ms == 0 || self.polling.flush_period_ms == 0 {
            return Err(FdrError::ConfigError(
                "polling periods must be > 0".to_string(),
            ));
        }

        if self.encrypted && self.public_key.as_os_str().is_empty() {
            return Err(FdrError::ConfigError(
                "encryption requires a public_key".to_string(),
            ));
        }

        for (i, property) in self.extra_properties.iter().enumerate() {
            if property.key.is_empty() {
                return Err(FdrError::ConfigError(format!(
                    "extra_properties {i}: key cannot be empty"
                )));
            }
        }

        Ok(())
    }
}
