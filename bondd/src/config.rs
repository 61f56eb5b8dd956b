//! Daemon configuration: which bonds exist, their slaves, and how often the
//! control loop ticks.

use anyhow::{Context, Result};
use bond_core::{BondConfig, BondMode, BondSettings, LacpStatus, MacAddr};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILE_NAME: &str = "bondd.toml";

/// Top-level daemon configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Interval between control-loop passes
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,

    /// Where the active slave of each bond is remembered across restarts
    pub state_path: Option<PathBuf>,

    /// Whether the datapath offers recirculation to balance-tcp bonds
    pub recirculation: bool,

    /// Simulated bytes sent by each configured host per tick
    pub host_bytes_per_tick: u64,

    pub bonds: Vec<BondEntry>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(100),
            state_path: None,
            recirculation: true,
            host_bytes_per_tick: 1_500,
            bonds: vec![BondEntry::default()],
        }
    }
}

/// One bond and its slaves
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BondEntry {
    #[serde(flatten)]
    pub bond: BondConfig,

    /// LACP status reported for this bond: "negotiated", "configured" or "disabled"
    #[serde(default = "default_lacp")]
    pub lacp: String,

    #[serde(default)]
    pub slaves: Vec<SlaveEntry>,

    /// MAC addresses of hosts reached through this bond
    #[serde(default)]
    pub hosts: Vec<String>,
}

impl Default for BondEntry {
    fn default() -> Self {
        Self {
            bond: BondConfig {
                mode: BondMode::ActiveBackup.to_string(),
                ..Default::default()
            },
            lacp: default_lacp(),
            slaves: vec![SlaveEntry::new("eth0", 1, "02:00:00:00:00:01"), SlaveEntry::new("eth1", 2, "02:00:00:00:00:02")],
            hosts: vec!["02:00:00:00:01:01".to_string()],
        }
    }
}

/// One slave of a bond
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlaveEntry {
    pub name: String,
    pub ofport: u32,
    pub mac: String,

    /// Initial carrier state
    #[serde(default = "default_carrier")]
    pub carrier: bool,

    #[serde(default = "default_speed")]
    pub speed_mbps: u32,
}

impl SlaveEntry {
    pub fn new(name: &str, ofport: u32, mac: &str) -> Self {
        Self {
            name: name.to_string(),
            ofport,
            mac: mac.to_string(),
            carrier: default_carrier(),
            speed_mbps: default_speed(),
        }
    }
}

fn default_lacp() -> String {
    LacpStatus::Disabled.to_string()
}

fn default_carrier() -> bool {
    true
}

fn default_speed() -> u32 {
    10_000
}

pub fn default_config_path() -> Result<PathBuf> {
    let proj = ProjectDirs::from("org", "bondd", "bondd")
        .context("could not determine platform config directory")?;
    let dir = proj.config_dir();
    Ok(dir.join(CONFIG_FILE_NAME))
}

pub fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;
    }
    Ok(())
}

pub fn load(path: &Path) -> Result<DaemonConfig> {
    if !path.exists() {
        return Ok(DaemonConfig::default());
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config: {}", path.display()))?;
    let cfg: DaemonConfig = toml::from_str(&raw)
        .with_context(|| format!("failed to parse TOML: {}", path.display()))?;
    validate(&cfg).with_context(|| format!("invalid config: {}", path.display()))?;
    Ok(cfg)
}

pub fn save(path: &Path, cfg: &DaemonConfig, overwrite: bool) -> Result<()> {
    if path.exists() && !overwrite {
        anyhow::bail!(
            "config already exists at {} (use --force to overwrite)",
            path.display()
        );
    }
    ensure_parent_dir(path)?;
    let raw = toml::to_string_pretty(cfg).context("failed to serialize config to TOML")?;
    fs::write(path, raw).with_context(|| format!("failed to write config: {}", path.display()))?;
    Ok(())
}

/// Check everything the runtime will parse, so a bad file fails at load time
pub fn validate(cfg: &DaemonConfig) -> Result<()> {
    if cfg.tick_interval.is_zero() {
        anyhow::bail!("tick_interval must be greater than zero");
    }

    let mut bond_names = HashSet::new();
    let mut slave_names = HashSet::new();
    let mut ofports = HashSet::new();
    for entry in &cfg.bonds {
        let name = &entry.bond.name;
        BondSettings::try_from(&entry.bond).with_context(|| format!("bond {name}"))?;
        entry
            .lacp
            .parse::<LacpStatus>()
            .with_context(|| format!("bond {name}"))?;
        if !bond_names.insert(name.clone()) {
            anyhow::bail!("duplicate bond name: {name}");
        }

        for slave in &entry.slaves {
            slave
                .mac
                .parse::<MacAddr>()
                .with_context(|| format!("bond {name}, slave {}", slave.name))?;
            if !slave_names.insert(slave.name.clone()) {
                anyhow::bail!("duplicate slave name: {}", slave.name);
            }
            if !ofports.insert(slave.ofport) {
                anyhow::bail!("duplicate ofport {} (slave {})", slave.ofport, slave.name);
            }
        }
        for host in &entry.hosts {
            host.parse::<MacAddr>()
                .with_context(|| format!("bond {name}, host {host}"))?;
        }
    }
    Ok(())
}
