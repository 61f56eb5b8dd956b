//! Learning packets for source-load-balanced and active-backup bonds.
//!
//! After a failover or a rebalancing pass moves hosts to a different slave,
//! upstream switches keep forwarding to the old link until they see traffic
//! from the new one. A gratuitous RARP per affected host, sent on the slave
//! the bond now uses for it, corrects their tables right away.

use crate::hash::{mac_bucket, BOND_BUCKETS};
use crate::packet::MacAddr;
use crate::settings::BondMode;

/// A learning frame and the slave it must leave on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LearningPacket<K> {
    pub slave: K,
    pub eth_src: MacAddr,
    pub vlan: u16,
    pub frame: Vec<u8>,
}

/// Buckets whose slave changed since learning packets were last sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigratedBuckets {
    moved: Vec<bool>,
}

impl Default for MigratedBuckets {
    fn default() -> Self {
        Self {
            moved: vec![false; BOND_BUCKETS],
        }
    }
}

impl MigratedBuckets {
    pub fn mark(&mut self, bucket: usize) {
        if let Some(m) = self.moved.get_mut(bucket) {
            *m = true;
        }
    }

    pub fn contains(&self, bucket: usize) -> bool {
        self.moved.get(bucket).copied().unwrap_or(false)
    }

    #[cfg(test)]
    fn count(&self) -> usize {
        self.moved.iter().filter(|&&m| m).count()
    }

    /// Hand back the current set and start a new empty one
    pub fn take(&mut self) -> Self {
        std::mem::take(self)
    }

    /// Hosts that need announcing.
    ///
    /// Under source-hash only hosts in a migrated bucket moved. In every other
    /// mode a change moves all hosts at once, so all are returned.
    pub fn hosts_to_announce<I>(&self, mode: BondMode, basis: u32, hosts: I) -> Vec<(MacAddr, u16)>
    where
        I: IntoIterator<Item = (MacAddr, u16)>,
    {
        hosts
            .into_iter()
            .filter(|&(mac, vlan)| {
                mode != BondMode::BalanceSlb || self.contains(mac_bucket(mac, vlan, basis))
            })
            .collect()
    }
}
