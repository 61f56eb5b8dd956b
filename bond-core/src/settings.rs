//! Bond configuration: balancing modes, LACP status, and the settings set
//! accepted by `Bond::create` and `Bond::reconfigure`.
//!
//! `BondConfig` is the serialisable form read from TOML. It is turned into a
//! validated `BondSettings` by a separate parse step, so a malformed config
//! never reaches a live bond.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::packet::{MacAddr, MacParseError};

fn default_mode() -> String {
    BondMode::ActiveBackup.as_str().to_string()
}

fn default_rebalance_interval() -> Duration {
    Duration::from_secs(10)
}

/// How flows are balanced among a bond's slaves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BondMode {
    /// Transport-layer load balancing (hash over the L4 5-tuple)
    BalanceTcp,
    /// Source load balancing (hash over source MAC and VLAN)
    BalanceSlb,
    /// Exactly one slave carries traffic, the rest stand by
    ActiveBackup,
}

impl BondMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BondMode::BalanceTcp => "balance-tcp",
            BondMode::BalanceSlb => "balance-slb",
            BondMode::ActiveBackup => "active-backup",
        }
    }

    /// Whether traffic is spread over hash buckets in this mode
    pub fn is_hashed(&self) -> bool {
        !matches!(self, BondMode::ActiveBackup)
    }
}

impl fmt::Display for BondMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BondMode {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "balance-tcp" => Ok(BondMode::BalanceTcp),
            "balance-slb" => Ok(BondMode::BalanceSlb),
            "active-backup" => Ok(BondMode::ActiveBackup),
            other => Err(SettingsError::UnknownMode(other.to_string())),
        }
    }
}

/// Outcome of LACP negotiation, as reported by the LACP engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LacpStatus {
    /// LACP is in use and negotiated successfully
    Negotiated,
    /// LACP is configured but negotiation has not succeeded
    Configured,
    /// LACP is not in use on this bond
    #[default]
    Disabled,
}

impl LacpStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LacpStatus::Negotiated => "negotiated",
            LacpStatus::Configured => "configured",
            LacpStatus::Disabled => "disabled",
        }
    }
}

impl fmt::Display for LacpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LacpStatus {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "negotiated" => Ok(LacpStatus::Negotiated),
            "configured" => Ok(LacpStatus::Configured),
            "disabled" => Ok(LacpStatus::Disabled),
            other => Err(SettingsError::UnknownLacpStatus(other.to_string())),
        }
    }
}

/// Settings parse errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SettingsError {
    #[error("Unknown bond mode: '{0}' (expected balance-tcp, balance-slb or active-backup)")]
    UnknownMode(String),

    #[error("Unknown LACP status: '{0}' (expected negotiated, configured or disabled)")]
    UnknownLacpStatus(String),

    #[error("Bond name must not be empty")]
    EmptyName,

    #[error("Invalid active_slave_mac: {0}")]
    InvalidMac(#[from] MacParseError),
}

/// On-disk configuration for one bond
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BondConfig {
    /// Bond name, used in log messages and to look the bond up
    pub name: String,

    /// Flow hashing basis
    #[serde(default)]
    pub basis: u32,

    /// Balancing mode: "balance-tcp", "balance-slb" or "active-backup"
    #[serde(default = "default_mode")]
    pub mode: String,

    /// Time between rebalancing passes. Zero disables rebalancing.
    #[serde(default = "default_rebalance_interval", with = "humantime_serde")]
    pub rebalance_interval: Duration,

    /// How long a slave must stay up before it is enabled
    #[serde(default, with = "humantime_serde")]
    pub up_delay: Duration,

    /// How long a slave must stay down before it is disabled
    #[serde(default, with = "humantime_serde")]
    pub down_delay: Duration,

    /// Fall back to active-backup when LACP is configured but not negotiated
    #[serde(default)]
    pub lacp_fallback_ab: bool,

    /// Fall back to the lowest-numbered slave when LACP is configured but
    /// not negotiated
    #[serde(default)]
    pub lacp_fallback_id: bool,

    /// MAC address of the slave that was active during the previous run
    #[serde(default)]
    pub active_slave_mac: Option<String>,
}

impl Default for BondConfig {
    fn default() -> Self {
        Self {
            name: "bond0".to_string(),
            basis: 0,
            mode: default_mode(),
            rebalance_interval: default_rebalance_interval(),
            up_delay: Duration::ZERO,
            down_delay: Duration::ZERO,
            lacp_fallback_ab: false,
            lacp_fallback_id: false,
            active_slave_mac: None,
        }
    }
}

/// Validated configuration for a bond as a whole
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BondSettings {
    pub name: String,
    pub basis: u32,
    pub mode: BondMode,
    pub rebalance_interval: Duration,
    pub up_delay: Duration,
    pub down_delay: Duration,
    pub lacp_fallback_ab: bool,
    pub lacp_fallback_id: bool,
    pub active_slave_mac: MacAddr,
}

impl BondSettings {
    /// Settings with defaults for everything but the name and mode
    pub fn new(name: impl Into<String>, mode: BondMode) -> Self {
        Self {
            name: name.into(),
            basis: 0,
            mode,
            rebalance_interval: default_rebalance_interval(),
            up_delay: Duration::ZERO,
            down_delay: Duration::ZERO,
            lacp_fallback_ab: false,
            lacp_fallback_id: false,
            active_slave_mac: MacAddr::ZERO,
        }
    }

    /// Whether periodic rebalancing applies to these settings
    pub fn is_balanced(&self) -> bool {
        self.mode.is_hashed() && !self.rebalance_interval.is_zero()
    }
}

impl TryFrom<&BondConfig> for BondSettings {
    type Error = SettingsError;

    fn try_from(cfg: &BondConfig) -> Result<Self, Self::Error> {
        if cfg.name.trim().is_empty() {
            return Err(SettingsError::EmptyName);
        }
        let mode = cfg.mode.parse()?;
        let active_slave_mac = match cfg.active_slave_mac.as_deref() {
            Some(s) if !s.trim().is_empty() => s.parse()?,
            _ => MacAddr::ZERO,
        };

        Ok(Self {
            name: cfg.name.clone(),
            basis: cfg.basis,
            mode,
            rebalance_interval: cfg.rebalance_interval,
            up_delay: cfg.up_delay,
            down_delay: cfg.down_delay,
            lacp_fallback_ab: cfg.lacp_fallback_ab,
            lacp_fallback_id: cfg.lacp_fallback_id,
            active_slave_mac,
        })
    }
}

impl From<&BondSettings> for BondConfig {
    fn from(s: &BondSettings) -> Self {
        Self {
            name: s.name.clone(),
            basis: s.basis,
            mode: s.mode.to_string(),
            rebalance_interval: s.rebalance_interval,
            up_delay: s.up_delay,
            down_delay: s.down_delay,
            lacp_fallback_ab: s.lacp_fallback_ab,
            lacp_fallback_id: s.lacp_fallback_id,
            active_slave_mac: (!s.active_slave_mac.is_zero()).then(|| s.active_slave_mac.to_string()),
        }
    }
}
