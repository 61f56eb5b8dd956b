//! Load rebalancing across enabled slaves.
//!
//! A pass looks at how many bytes each hash bucket carried since the last
//! pass and repeatedly moves a bucket from the most-loaded enabled slave to
//! the least-loaded one. It stops when the gap between those two falls under
//! the hysteresis threshold, when nothing on the most-loaded slave can be
//! moved without making things worse, or after a bounded number of moves.
//!
//! The planner is pure: it takes the current assignment and byte counts and
//! returns the migrations to apply, which keeps it deterministic for testing.

use std::collections::HashMap;

use crate::buckets::HashBucket;
use crate::hash::BOND_BUCKETS;
use crate::slave::SlaveHandle;

/// The gap between the most- and least-loaded slave must reach
/// `total >> REBALANCE_SKEW_SHIFT` (about 3% of all traffic) before a bucket moves
pub const REBALANCE_SKEW_SHIFT: u32 = 5;

/// Gaps below this many bytes per interval are never worth a migration
pub const REBALANCE_MIN_BYTES: u64 = 100_000;

/// Upper bound on migrations in a single pass
pub const REBALANCE_MAX_MOVES: usize = BOND_BUCKETS;

/// One bucket moving between slaves
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration<K> {
    pub bucket: u8,
    pub from: K,
    pub to: K,
    pub tx_bytes: u64,
}

/// Load carried by one enabled slave after the planned migrations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlaveLoad<K> {
    pub slave: K,
    pub tx_bytes: u64,
    pub buckets: Vec<u8>,
}

/// Result of a planning pass
#[derive(Debug, Clone)]
pub struct RebalancePlan<K> {
    pub migrations: Vec<Migration<K>>,
    pub loads: Vec<SlaveLoad<K>>,
    pub total_bytes: u64,
    pub threshold: u64,
}

impl<K> RebalancePlan<K> {
    /// Gap between the most- and least-loaded slave after the plan
    pub fn skew(&self) -> u64 {
        let max = self.loads.iter().map(|l| l.tx_bytes).max().unwrap_or(0);
        let min = self.loads.iter().map(|l| l.tx_bytes).min().unwrap_or(0);
        max - min
    }
}

struct Bal<K> {
    slave: K,
    tx_bytes: u64,
    /// Buckets with traffic, heaviest first
    entries: Vec<(u8, u64)>,
    buckets: Vec<u8>,
}

/// Rebalancing policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rebalancer {
    pub skew_shift: u32,
    pub min_bytes: u64,
    pub max_moves: usize,
}

impl Default for Rebalancer {
    fn default() -> Self {
        Self {
            skew_shift: REBALANCE_SKEW_SHIFT,
            min_bytes: REBALANCE_MIN_BYTES,
            max_moves: REBALANCE_MAX_MOVES,
        }
    }
}

impl Rebalancer {
    /// Smallest gap that justifies moving a bucket, given the total traffic
    pub fn threshold(&self, total_bytes: u64) -> u64 {
        (total_bytes >> self.skew_shift).max(self.min_bytes)
    }

    /// Plan the migrations for one pass.
    ///
    /// `enabled` lists the slaves eligible to receive traffic; buckets assigned
    /// to anything else are ignored.
    pub fn plan<K: SlaveHandle>(&self, enabled: &[K], buckets: &[HashBucket<K>]) -> RebalancePlan<K> {
        let mut bals: Vec<Bal<K>> = enabled
            .iter()
            .map(|s| Bal {
                slave: s.clone(),
                tx_bytes: 0,
                entries: Vec::new(),
                buckets: Vec::new(),
            })
            .collect();
        let index: HashMap<K, usize> = enabled
            .iter()
            .enumerate()
            .map(|(i, s)| (s.clone(), i))
            .collect();

        for bucket in buckets {
            let Some(&i) = bucket.slave.as_ref().and_then(|s| index.get(s)) else {
                continue;
            };
            bals[i].buckets.push(bucket.index);
            if bucket.tx_bytes > 0 {
                bals[i].tx_bytes = bals[i].tx_bytes.saturating_add(bucket.tx_bytes);
                bals[i].entries.push((bucket.index, bucket.tx_bytes));
            }
        }
        for bal in &mut bals {
            bal.entries.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        }

        let total_bytes = bals.iter().fold(0u64, |acc, b| acc.saturating_add(b.tx_bytes));
        let threshold = self.threshold(total_bytes);

        let mut migrations = Vec::new();
        let mut candidates: Vec<usize> = (0..bals.len()).collect();

        while candidates.len() >= 2 && migrations.len() < self.max_moves {
            let most = candidates
                .iter()
                .copied()
                .max_by(|&a, &b| bals[a].tx_bytes.cmp(&bals[b].tx_bytes).then(b.cmp(&a)));
            let least = candidates
                .iter()
                .copied()
                .min_by(|&a, &b| bals[a].tx_bytes.cmp(&bals[b].tx_bytes).then(a.cmp(&b)));
            let (Some(from), Some(to)) = (most, least) else {
                break;
            };
            if from == to {
                break;
            }

            let overload = bals[from].tx_bytes - bals[to].tx_bytes;
            if overload < threshold {
                break;
            }

            // Moving b bytes leaves a gap of |overload - 2b|, which only
            // shrinks when b < overload. Take the heaviest such bucket.
            let pick = bals[from].entries.iter().position(|&(_, b)| b < overload);
            let Some(pos) = pick else {
                candidates.retain(|&c| c != from);
                continue;
            };

            let (bucket, bytes) = bals[from].entries.remove(pos);
            bals[from].tx_bytes = bals[from].tx_bytes.saturating_sub(bytes);
            bals[from].buckets.retain(|&b| b != bucket);
            bals[to].tx_bytes = bals[to].tx_bytes.saturating_add(bytes);
            bals[to].buckets.push(bucket);
            let at = bals[to]
                .entries
                .iter()
                .position(|&(_, b)| b < bytes)
                .unwrap_or(bals[to].entries.len());
            bals[to].entries.insert(at, (bucket, bytes));

            migrations.push(Migration {
                bucket,
                from: bals[from].slave.clone(),
                to: bals[to].slave.clone(),
                tx_bytes: bytes,
            });
        }

        let loads = bals
            .into_iter()
            .map(|mut b| {
                b.buckets.sort_unstable();
                SlaveLoad {
                    slave: b.slave,
                    tx_bytes: b.tx_bytes,
                    buckets: b.buckets,
                }
            })
            .collect();

        RebalancePlan {
            migrations,
            loads,
            total_bytes,
            threshold,
        }
    }
}
