//! Persisted active-slave MACs, so a restarted daemon prefers the slaves
//! that were active before.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::config::ensure_parent_dir;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    /// Bond name to the MAC of its active slave
    #[serde(default)]
    pub active_slaves: BTreeMap<String, String>,
}

pub fn load(path: &Path) -> Result<PersistedState> {
    if !path.exists() {
        return Ok(PersistedState::default());
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read state: {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("failed to parse state: {}", path.display()))
}

pub fn save(path: &Path, state: &PersistedState) -> Result<()> {
    ensure_parent_dir(path)?;
    let raw = toml::to_string_pretty(state).context("failed to serialize state to TOML")?;
    fs::write(path, raw).with_context(|| format!("failed to write state: {}", path.display()))?;
    Ok(())
}
