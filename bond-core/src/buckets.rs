//! Hash-bucket table and per-bucket byte counters.
//!
//! The table maps each of the `BOND_BUCKETS` flow-hash buckets to the slave
//! currently carrying it. It is only ever modified on a private copy by the
//! control plane and then published whole, so the packet path never sees a
//! half-updated assignment.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::hash::BOND_BUCKETS;
use crate::slave::SlaveHandle;

/// One traffic-classification slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashBucket<K> {
    pub index: u8,
    pub slave: Option<K>,
    pub tx_bytes: u64,
}

/// Mapping from bucket index to assigned slave
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketTable<K> {
    slots: Vec<Option<K>>,
}

impl<K: SlaveHandle> Default for BucketTable<K> {
    fn default() -> Self {
        Self::unassigned()
    }
}

impl<K: SlaveHandle> BucketTable<K> {
    /// A table with no bucket assigned
    pub fn unassigned() -> Self {
        Self {
            slots: vec![None; BOND_BUCKETS],
        }
    }

    /// Slave assigned to `bucket`
    pub fn get(&self, bucket: usize) -> Option<&K> {
        self.slots.get(bucket).and_then(Option::as_ref)
    }

    pub fn assign(&mut self, bucket: usize, slave: Option<K>) {
        if let Some(slot) = self.slots.get_mut(bucket) {
            *slot = slave;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, Option<&K>)> {
        self.slots.iter().enumerate().map(|(i, s)| (i, s.as_ref()))
    }

    /// Buckets currently assigned to `slave`
    pub fn buckets_of(&self, slave: &K) -> Vec<u8> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.as_ref() == Some(slave))
            .map(|(i, _)| i as u8)
            .collect()
    }

    #[cfg(test)]
    fn is_fully_unassigned(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    /// Clear every assignment
    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
    }

    /// Make every bucket point at a member of `enabled`.
    ///
    /// Buckets that are unassigned or assigned to a slave outside `enabled` are
    /// handed out round-robin in list order; buckets already on an enabled
    /// slave keep it. With no enabled slave the whole table is cleared.
    /// Returns the indices of buckets whose slave changed.
    pub fn repair(&mut self, enabled: &[K]) -> Vec<u8> {
        let mut moved = Vec::new();
        if enabled.is_empty() {
            for (i, slot) in self.slots.iter_mut().enumerate() {
                if slot.take().is_some() {
                    moved.push(i as u8);
                }
            }
            return moved;
        }

        let mut next = 0usize;
        for (i, slot) in self.slots.iter_mut().enumerate() {
            let valid = slot.as_ref().map(|s| enabled.contains(s)).unwrap_or(false);
            if !valid {
                *slot = Some(enabled[next % enabled.len()].clone());
                next += 1;
                moved.push(i as u8);
            }
        }
        moved
    }
}

/// Lock-free per-bucket byte counters bumped by the packet path
#[derive(Debug)]
pub struct ByteCounters {
    counts: Box<[AtomicU64]>,
}

impl Default for ByteCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl ByteCounters {
    pub fn new() -> Self {
        Self {
            counts: (0..BOND_BUCKETS).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    pub fn add(&self, bucket: usize, n_bytes: u64) {
        if let Some(c) = self.counts.get(bucket) {
            let _ = c.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_add(n_bytes))
            });
        }
    }

    pub fn get(&self, bucket: usize) -> u64 {
        self.counts
            .get(bucket)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Read and zero every counter
    pub fn take_all(&self) -> Vec<u64> {
        self.counts.iter().map(|c| c.swap(0, Ordering::Relaxed)).collect()
    }

    pub fn reset(&self) {
        self.counts.iter().for_each(|c| c.store(0, Ordering::Relaxed));
    }
}
