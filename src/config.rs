//! Configuration for traversal, keep-alive, handover and pool housekeeping
//!
//! Every field has a default, so an empty TOML file is a valid configuration.
//! Durations are stored in milliseconds.

use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Hole-punching parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PuncherConfig {
    /// Ports probed on each side of the peer-reported port
    pub port_spread: u16,
    /// Packets sent to every candidate per burst
    pub packets_per_burst: u32,
    pub burst_interval_ms: u64,
    /// Upper bound of random delay added to each burst interval
    pub burst_jitter_ms: u64,
    pub punch_timeout_ms: u64,
    /// Local address the punch socket binds to
    pub bind_ip: IpAddr,
}

impl Default for PuncherConfig {
    fn default() -> Self {
        Self {
            port_spread: 10,
            packets_per_burst: 5,
            burst_interval_ms: 25,
            burst_jitter_ms: 5,
            punch_timeout_ms: 10_000,
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        }
    }
}

impl PuncherConfig {
    pub fn burst_interval(&self) -> Duration {
        Duration::from_millis(self.burst_interval_ms)
    }

    pub fn burst_jitter(&self) -> Duration {
        Duration::from_millis(self.burst_jitter_ms)
    }

    pub fn punch_timeout(&self) -> Duration {
        Duration::from_millis(self.punch_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TraversalConfig {
    /// Bound on every signal read during traversal
    pub signal_timeout_ms: u64,
    /// Accept loopback addresses as the advertised public IP
    pub allow_loopback: bool,
}

impl Default for TraversalConfig {
    fn default() -> Self {
        Self {
            signal_timeout_ms: 15_000,
            allow_loopback: false,
        }
    }
}

impl TraversalConfig {
    pub fn signal_timeout(&self) -> Duration {
        Duration::from_millis(self.signal_timeout_ms)
    }
}

/// Keep-alive and locking parameters of a pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PairConfig {
    pub ping_interval_ms: u64,
    /// Silence after which an idle pair expires
    pub no_ping_timeout_ms: u64,
    /// In-flight pings older than this are forgotten
    pub ping_lifespan_ms: u64,
    pub lock_timeout_ms: u64,
    /// Consecutive ping send failures before expiry
    pub max_ping_fails: u32,
}

impl Default for PairConfig {
    fn default() -> Self {
        Self {
            ping_interval_ms: 1_000,
            no_ping_timeout_ms: 3_000,
            ping_lifespan_ms: 6_000,
            lock_timeout_ms: 10_000,
            max_ping_fails: 10,
        }
    }
}

impl PairConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn no_ping_timeout(&self) -> Duration {
        Duration::from_millis(self.no_ping_timeout_ms)
    }

    pub fn ping_lifespan(&self) -> Duration {
        Duration::from_millis(self.ping_lifespan_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandoverConfig {
    /// Bound on each read and write of the take exchange
    pub take_timeout_ms: u64,
}

impl Default for HandoverConfig {
    fn default() -> Self {
        Self {
            take_timeout_ms: 5_000,
        }
    }
}

impl HandoverConfig {
    pub fn take_timeout(&self) -> Duration {
        Duration::from_millis(self.take_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub cleanup_interval_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_ms: 30_000,
        }
    }
}

impl PoolConfig {
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NatConfig {
    pub puncher: PuncherConfig,
    pub traversal: TraversalConfig,
    pub pair: PairConfig,
    pub handover: HandoverConfig,
    pub pool: PoolConfig,
}

impl NatConfig {
    /// Load and validate configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: NatConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validate the configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_zero = [
            ("puncher.burst_interval_ms", self.puncher.burst_interval_ms),
            ("puncher.punch_timeout_ms", self.puncher.punch_timeout_ms),
            ("traversal.signal_timeout_ms", self.traversal.signal_timeout_ms),
            ("pair.ping_interval_ms", self.pair.ping_interval_ms),
            ("pair.no_ping_timeout_ms", self.pair.no_ping_timeout_ms),
            ("pair.ping_lifespan_ms", self.pair.ping_lifespan_ms),
            ("pair.lock_timeout_ms", self.pair.lock_timeout_ms),
            ("handover.take_timeout_ms", self.handover.take_timeout_ms),
            ("pool.cleanup_interval_ms", self.pool.cleanup_interval_ms),
        ];
        for (name, value) in non_zero {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be positive", name)));
            }
        }

        if self.puncher.packets_per_burst == 0 {
            return Err(ConfigError::Invalid(
                "puncher.packets_per_burst must be positive".to_string(),
            ));
        }

        if self.pair.max_ping_fails == 0 {
            return Err(ConfigError::Invalid(
                "pair.max_ping_fails must be positive".to_string(),
            ));
        }

        if self.pair.no_ping_timeout_ms <= self.pair.ping_interval_ms {
            return Err(ConfigError::Invalid(format!(
                "pair.no_ping_timeout_ms ({}) must exceed pair.ping_interval_ms ({})",
                self.pair.no_ping_timeout_ms, self.pair.ping_interval_ms
            )));
        }

        Ok(())
    }
}
