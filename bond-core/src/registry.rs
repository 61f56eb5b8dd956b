//! Name-indexed set of bonds and the administrative commands that act on
//! them by name.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use crate::bond::{Bond, BondStatus};
use crate::error::BondError;
use crate::hash::mac_bucket;
use crate::packet::MacAddr;
use crate::settings::BondSettings;
use crate::slave::SlaveHandle;

/// All bonds of one switch
pub struct BondRegistry<K: SlaveHandle> {
    bonds: RwLock<BTreeMap<String, Arc<Bond<K>>>>,
}

impl<K: SlaveHandle> Default for BondRegistry<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: SlaveHandle> BondRegistry<K> {
    pub fn new() -> Self {
        Self {
            bonds: RwLock::new(BTreeMap::new()),
        }
    }

    /// Add a bond under its current name
    pub fn insert(&self, bond: Arc<Bond<K>>) -> Result<(), BondError> {
        let name = bond.name();
        let mut bonds = self.bonds.write();
        if bonds.contains_key(&name) {
            return Err(BondError::DuplicateBond(name));
        }
        info!(bond = %name, "bond registered");
        bonds.insert(name, bond);
        Ok(())
    }

    /// Drop the registry's reference to a bond
    pub fn remove(&self, name: &str) -> Option<Arc<Bond<K>>> {
        self.bonds.write().remove(name)
    }

    pub fn get(&self, name: &str) -> Result<Arc<Bond<K>>, BondError> {
        self.bonds
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| BondError::BondNotFound(name.to_string()))
    }

    /// Names of all bonds, sorted
    pub fn list(&self) -> Vec<String> {
        self.bonds.read().keys().cloned().collect()
    }

    pub fn bonds(&self) -> Vec<Arc<Bond<K>>> {
        self.bonds.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.bonds.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bonds.read().is_empty()
    }

    /// Apply `settings` to bond `name`, moving it to its new name if it
    /// changed. Returns whether flows must be revalidated.
    pub fn reconfigure(&self, name: &str, settings: &BondSettings) -> Result<bool, BondError> {
        let mut bonds = self.bonds.write();
        let bond = bonds
            .get(name)
            .cloned()
            .ok_or_else(|| BondError::BondNotFound(name.to_string()))?;
        let renamed = settings.name != name;
        if renamed && bonds.contains_key(&settings.name) {
            return Err(BondError::DuplicateBond(settings.name.clone()));
        }

        let revalidate = bond.reconfigure(settings);
        if renamed {
            bonds.remove(name);
            bonds.insert(settings.name.clone(), bond);
        }
        Ok(revalidate)
    }

    pub fn show(&self, name: &str) -> Result<BondStatus<K>, BondError> {
        Ok(self.get(name)?.status())
    }

    /// Move `bucket` of bond `name` to the slave whose device is `slave`
    pub fn migrate(&self, name: &str, bucket: usize, slave: &str) -> Result<(), BondError> {
        let bond = self.get(name)?;
        let handle = bond
            .find_slave(slave)
            .ok_or_else(|| BondError::SlaveNotFound(slave.to_string()))?;
        bond.migrate(bucket, &handle)
    }

    pub fn set_active_slave(&self, name: &str, slave: &str) -> Result<(), BondError> {
        let bond = self.get(name)?;
        let handle = bond
            .find_slave(slave)
            .ok_or_else(|| BondError::SlaveNotFound(slave.to_string()))?;
        bond.set_active_slave(&handle)
    }

    /// MAC of bond `name`'s active slave if it changed since last asked
    pub fn get_changed_active_slave(&self, name: &str, force: bool) -> Result<Option<MacAddr>, BondError> {
        Ok(self.get(name)?.take_changed_active_slave(force))
    }
}

/// Hash bucket `mac` on `vlan` lands in for a given basis
pub fn hash(mac: MacAddr, vlan: u16, basis: u32) -> usize {
    mac_bucket(mac, vlan, basis)
}
