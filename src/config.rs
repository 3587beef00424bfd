//! Configuration for custody-node.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Node configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Root directory for node data (key files).
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,

    /// Address to listen on for session connections.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: IpAddr,

    /// Listening port (0 for auto-select).
    #[serde(default)]
    pub port: u16,

    /// Ledger connection settings.
    #[serde(default)]
    pub ledger: LedgerConfig,

    /// Passport validation settings.
    #[serde(default)]
    pub passport: PassportConfig,

    /// Proof scheduling settings.
    #[serde(default)]
    pub proof: ProofConfig,

    /// Read session settings.
    #[serde(default)]
    pub session: SessionConfig,

    /// Log level.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Ledger connection configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Address of the storage contract every transaction is addressed to.
    #[serde(default = "default_contract")]
    pub contract: String,

    /// How long to wait for a submitted transaction to be included.
    #[serde(default = "default_confirm_timeout")]
    pub confirm_timeout_secs: u64,

    /// Interval between inclusion polls.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Expected time between blocks; proof intervals are converted to wall-clock with it.
    #[serde(default = "default_block_period")]
    pub block_period_ms: u64,
}

/// Passport validation configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassportConfig {
    /// Blocks a passport stays valid after its issuing height.
    #[serde(default = "default_tolerance_window")]
    pub tolerance_window: u64,

    /// Blocks a passport may be ahead of the verifier's view.
    #[serde(default = "default_clock_skew")]
    pub clock_skew: u64,
}

/// Proof scheduling configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofConfig {
    /// Maximum possession records cached locally.
    #[serde(default = "default_shadow_capacity")]
    pub shadow_capacity: usize,
}

/// Read session configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Seconds without an inbound frame before a session is aborted.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Maximum length of one frame in bytes.
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            listen_addr: default_listen_addr(),
            port: 0,
            ledger: LedgerConfig::default(),
            passport: PassportConfig::default(),
            proof: ProofConfig::default(),
            session: SessionConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            contract: default_contract(),
            confirm_timeout_secs: default_confirm_timeout(),
            poll_interval_ms: default_poll_interval(),
            block_period_ms: default_block_period(),
        }
    }
}

impl Default for PassportConfig {
    fn default() -> Self {
        Self {
            tolerance_window: default_tolerance_window(),
            clock_skew: default_clock_skew(),
        }
    }
}

impl Default for ProofConfig {
    fn default() -> Self {
        Self {
            shadow_capacity: default_shadow_capacity(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout(),
            max_frame_len: default_max_frame_len(),
        }
    }
}

fn default_root_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "custody-node")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".custody-node"))
}

const fn default_listen_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_contract() -> String {
    "custody-dev".to_string()
}

const fn default_confirm_timeout() -> u64 {
    15
}

const fn default_poll_interval() -> u64 {
    1000
}

const fn default_block_period() -> u64 {
    1000
}

const fn default_tolerance_window() -> u64 {
    5
}

const fn default_clock_skew() -> u64 {
    1
}

const fn default_shadow_capacity() -> usize {
    10_000
}

const fn default_idle_timeout() -> u64 {
    30
}

const fn default_max_frame_len() -> usize {
    4 * 1024 * 1024
}

impl NodeConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::Error::Config(e.to_string()))
    }

    /// Save configuration to a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn to_file(&self, path: &std::path::Path) -> crate::Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| crate::Error::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Socket address the node listens on.
    #[must_use]
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_addr, self.port)
    }

    /// Check values that would make the node unusable.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Config`] naming the offending field.
    pub fn validate(&self) -> crate::Result<()> {
        if self.ledger.contract.trim().is_empty() {
            return Err(crate::Error::Config("ledger.contract must be set".to_string()));
        }
        if self.ledger.poll_interval_ms == 0 {
            return Err(crate::Error::Config(
                "ledger.poll_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.session.max_frame_len == 0 {
            return Err(crate::Error::Config(
                "session.max_frame_len must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

impl LedgerConfig {
    /// Confirmation wait budget.
    #[must_use]
    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_secs(self.confirm_timeout_secs)
    }

    /// Interval between inclusion polls.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Wall-clock duration of `blocks` blocks.
    #[must_use]
    pub fn blocks_to_duration(&self, blocks: u64) -> Duration {
        Duration::from_millis(self.block_period_ms.saturating_mul(blocks))
    }
}

impl SessionConfig {
    /// Idle timeout as a [`Duration`].
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}
