//! Bus configuration file handling
//!
//! Loads and manages ~/.config/meshbus/bus.yaml.

use crate::bus::RetryPolicy;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// What a consumer with no saved offset does with the existing log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartPosition {
    /// Replay every message already addressed to the consumer
    #[default]
    Beginning,
    /// Skip the backlog and only deliver messages written from now on
    Latest,
}

/// Bounded delivery retry settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRetryConfig {
    /// Retries after the first failed attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    #[serde(default = "default_true")]
    pub jitter: bool,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    250
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

impl Default for DeliveryRetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
            jitter: true,
        }
    }
}

impl From<&DeliveryRetryConfig> for RetryPolicy {
    fn from(config: &DeliveryRetryConfig) -> Self {
        RetryPolicy {
            max_retries: config.max_retries,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            multiplier: config.multiplier,
            jitter: config.jitter,
        }
    }
}

/// Meshbus configuration
///
/// Every field has a default, so an empty file is a valid configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Bus root; the other directories default to children of it
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// Shared message log (default `<root>/messages`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages_dir: Option<PathBuf>,

    /// Consumer offset records (default `<root>/offsets`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offsets_dir: Option<PathBuf>,

    /// Undeliverable messages (default `<root>/dead-letter`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dead_letter_dir: Option<PathBuf>,

    /// Also copy every written message into `legacy_dir`
    #[serde(default)]
    pub dual_write: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub legacy_dir: Option<PathBuf>,

    /// Initial state of the supervisor switch
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub start_position: StartPosition,

    /// Wait after a change notification before reading new files
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,

    /// Poll tick when no watcher is available
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Full rescan period even while watching
    #[serde(default = "default_rescan_interval_ms")]
    pub rescan_interval_ms: u64,

    /// How long `stop` waits for the consumer task before aborting it
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,

    #[serde(default)]
    pub delivery_retry: DeliveryRetryConfig,
}

fn default_root() -> PathBuf {
    // Always use ~/.config for consistency across platforms (macOS, Linux)
    let mut path = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push(".config");
    path.push("meshbus");
    path
}

fn default_settle_delay_ms() -> u64 {
    100
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_rescan_interval_ms() -> u64 {
    5_000
}

fn default_stop_grace_ms() -> u64 {
    5_000
}

impl BusConfig {
    /// Default configuration rooted at ~/.config/meshbus
    pub fn new() -> Self {
        Self::with_root(default_root())
    }

    /// Default configuration rooted at `root`
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            messages_dir: None,
            offsets_dir: None,
            dead_letter_dir: None,
            dual_write: false,
            legacy_dir: None,
            enabled: true,
            start_position: StartPosition::default(),
            settle_delay_ms: default_settle_delay_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            rescan_interval_ms: default_rescan_interval_ms(),
            stop_grace_ms: default_stop_grace_ms(),
            delivery_retry: DeliveryRetryConfig::default(),
        }
    }

    /// Load configuration from the default path (~/.config/meshbus/bus.yaml)
    pub fn load_default() -> Result<Self> {
        let path = Self::default_path();
        Self::load(&path)
    }

    /// Load configuration from a specific path
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(crate::MeshBusError::Config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }

        tracing::info!(path = %path.display(), "Loading bus configuration");

        let content = fs::read_to_string(path)?;
        let config: Self = if content.trim().is_empty() {
            Self::new()
        } else {
            serde_yaml::from_str(&content)?
        };

        tracing::debug!(
            root = %config.root.display(),
            enabled = config.enabled,
            dual_write = config.dual_write,
            "Configuration loaded successfully"
        );

        Ok(config)
    }

    /// Save configuration to a specific path
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        tracing::info!(path = %path.display(), "Saving bus configuration");

        let yaml = serde_yaml::to_string(self)?;
        fs::write(path, yaml)?;

        Ok(())
    }

    /// Get the default config path (~/.config/meshbus/bus.yaml)
    pub fn default_path() -> PathBuf {
        default_root().join("bus.yaml")
    }

    pub fn messages_dir(&self) -> PathBuf {
        self.messages_dir
            .clone()
            .unwrap_or_else(|| self.root.join("messages"))
    }

    pub fn offsets_dir(&self) -> PathBuf {
        self.offsets_dir
            .clone()
            .unwrap_or_else(|| self.root.join("offsets"))
    }

    pub fn dead_letter_dir(&self) -> PathBuf {
        self.dead_letter_dir
            .clone()
            .unwrap_or_else(|| self.root.join("dead-letter"))
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn rescan_interval(&self) -> Duration {
        Duration::from_millis(self.rescan_interval_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from(&self.delivery_retry)
    }

    pub fn with_messages_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.messages_dir = Some(dir.into());
        self
    }

    pub fn with_offsets_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.offsets_dir = Some(dir.into());
        self
    }

    pub fn with_dead_letter_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dead_letter_dir = Some(dir.into());
        self
    }

    /// Enable dual-write into `legacy_dir`
    pub fn with_dual_write(mut self, legacy_dir: impl Into<PathBuf>) -> Self {
        self.dual_write = true;
        self.legacy_dir = Some(legacy_dir.into());
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_start_position(mut self, position: StartPosition) -> Self {
        self.start_position = position;
        self
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_rescan_interval(mut self, interval: Duration) -> Self {
        self.rescan_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace_ms = grace.as_millis() as u64;
        self
    }

    pub fn with_delivery_retry(mut self, retry: DeliveryRetryConfig) -> Self {
        self.delivery_retry = retry;
        self
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self::new()
    }
}
