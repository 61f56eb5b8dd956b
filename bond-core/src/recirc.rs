//! Post-recirculation rules for balance-tcp bonds.
//!
//! When the datapath supports recirculation, each balance-tcp bond gets a
//! unique recirc id. Output to the bond is translated into a hash action
//! followed by a recirculation:
//!
//! ```text
//! ... actions= ... HASH(hash(L4)), RECIRC(recirc_id) ...
//! ```
//!
//! and one post-recirculation rule per hash bucket sends the packet on:
//!
//! ```text
//! recirc_id=<bond_recirc_id>, dp_hash=<0..255>/0xff, actions: output<slave>
//! ```
//!
//! The bond pulls byte statistics from those rules instead of accounting
//! packets itself, and rewrites their output actions when rebalancing moves a
//! bucket.

use std::fmt;

use tracing::{debug, error};

use crate::hash::{BOND_BUCKETS, BOND_MASK};
use crate::slave::{OfPort, SlaveHandle};

/// Priority of the internal post-recirculation rules
pub const RECIRC_RULE_PRIORITY: u16 = 20;

/// Match of one post-recirculation rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PostRecircMatch {
    pub recirc_id: u32,
    pub dp_hash: u32,
    pub dp_hash_mask: u32,
}

impl PostRecircMatch {
    pub fn new(recirc_id: u32, bucket: usize) -> Self {
        Self {
            recirc_id,
            dp_hash: bucket as u32 & BOND_MASK,
            dp_hash_mask: BOND_MASK,
        }
    }

    /// Whether a recirculated packet with this id and hash hits the rule
    pub fn matches(&self, recirc_id: u32, dp_hash: u32) -> bool {
        self.recirc_id == recirc_id && (dp_hash & self.dp_hash_mask) == self.dp_hash
    }
}

impl fmt::Display for PostRecircMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "priority={},recirc_id={:#x},dp_hash={:#x}/{:#x}",
            RECIRC_RULE_PRIORITY, self.recirc_id, self.dp_hash, self.dp_hash_mask
        )
    }
}

/// Datapath errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DatapathError {
    #[error("Flow table full")]
    TableFull,

    #[error("No such flow: {0}")]
    NoSuchFlow(String),

    #[error("Datapath error: {0}")]
    Other(String),
}

/// The switch's datapath / flow table, as seen by a bond
pub trait Datapath: Send + Sync {
    /// Whether the datapath can recirculate packets
    fn supports_recirc(&self) -> bool;

    /// Allocate a fresh recirculation id, `None` if the id space is exhausted
    fn alloc_recirc_id(&self) -> Option<u32>;

    /// Return a recirculation id to the pool
    fn free_recirc_id(&self, recirc_id: u32);

    /// Add (or replace) an internal rule outputting to `out_port`
    fn add_internal_flow(
        &self,
        rule: &PostRecircMatch,
        priority: u16,
        out_port: OfPort,
    ) -> Result<(), DatapathError>;

    /// Remove an internal rule
    fn delete_internal_flow(&self, rule: &PostRecircMatch, priority: u16) -> Result<(), DatapathError>;

    /// Cumulative bytes matched by an installed rule
    fn internal_flow_bytes(&self, rule: &PostRecircMatch) -> Option<u64>;
}

/// One post-recirculation rule: the slave that should receive a hash value's
/// traffic and what is currently installed for it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostRecircRule<K> {
    pub hash: u8,
    /// Slave that should receive this hash value's traffic
    pub slave: Option<K>,
    /// Output port matching `slave`
    pub out_port: Option<OfPort>,
    /// Output port of the rule installed in the datapath, if any
    pub installed_port: Option<OfPort>,
    /// Installed slave; what the datapath currently dispatches to
    pub installed_slave: Option<K>,
    /// Last cumulative byte count read from the datapath
    stats_baseline: u64,
}

impl<K> PostRecircRule<K> {
    /// Whether the datapath rule reflects the desired mapping
    pub fn is_installed(&self) -> bool {
        self.out_port.is_some() && self.installed_port == self.out_port
    }
}

/// Maintains the fixed set of post-recirculation rules of one bond
#[derive(Debug)]
pub struct RecircRuleManager<K> {
    recirc_id: u32,
    rules: Vec<PostRecircRule<K>>,
}

impl<K: SlaveHandle> RecircRuleManager<K> {
    pub fn new(recirc_id: u32) -> Self {
        let rules = (0..BOND_BUCKETS)
            .map(|i| PostRecircRule {
                hash: i as u8,
                slave: None,
                out_port: None,
                installed_port: None,
                installed_slave: None,
                stats_baseline: 0,
            })
            .collect();
        Self { recirc_id, rules }
    }

    pub fn rules(&self) -> &[PostRecircRule<K>] {
        &self.rules
    }

    /// Record which slave should receive `hash`'s traffic
    pub fn set_desired(&mut self, hash: usize, target: Option<(K, OfPort)>) {
        let Some(rule) = self.rules.get_mut(hash) else {
            return;
        };
        match target {
            Some((slave, port)) => {
                rule.slave = Some(slave);
                rule.out_port = Some(port);
            }
            None => {
                rule.slave = None;
                rule.out_port = None;
            }
        }
    }

    /// Number of rules whose installed state differs from the desired one
    pub fn pending(&self) -> usize {
        self.rules
            .iter()
            .filter(|r| r.installed_port != r.out_port)
            .count()
    }

    /// Push desired mappings to the datapath.
    ///
    /// With `force` every mapped rule is rewritten; otherwise only rules that
    /// differ from what is installed. Failures are logged and left pending so
    /// the next sync retries them. Returns the number of datapath operations
    /// that succeeded.
    pub fn sync(&mut self, datapath: &dyn Datapath, force: bool) -> usize {
        let mut done = 0;
        for (i, rule) in self.rules.iter_mut().enumerate() {
            let m = PostRecircMatch::new(self.recirc_id, i);
            match rule.out_port {
                Some(port) if force || rule.installed_port != Some(port) => {
                    match datapath.add_internal_flow(&m, RECIRC_RULE_PRIORITY, port) {
                        Ok(()) => {
                            rule.installed_port = Some(port);
                            rule.installed_slave = rule.slave.clone();
                            done += 1;
                        }
                        Err(e) => error!("failed to add post recirculation flow {m}: {e}"),
                    }
                }
                None if rule.installed_port.is_some() => {
                    match datapath.delete_internal_flow(&m, RECIRC_RULE_PRIORITY) {
                        Ok(()) => {
                            rule.installed_port = None;
                            rule.installed_slave = None;
                            rule.stats_baseline = 0;
                            done += 1;
                        }
                        Err(e) => error!("failed to remove post recirculation flow {m}: {e}"),
                    }
                }
                _ => {}
            }
        }
        debug!(recirc_id = self.recirc_id, ops = done, "post recirculation rules synced");
        done
    }

    /// Bytes each rule matched since the previous call
    pub fn pull_stats(&mut self, datapath: &dyn Datapath) -> Vec<u64> {
        self.rules
            .iter_mut()
            .enumerate()
            .map(|(i, rule)| {
                if rule.installed_port.is_none() {
                    return 0;
                }
                let m = PostRecircMatch::new(self.recirc_id, i);
                let Some(total) = datapath.internal_flow_bytes(&m) else {
                    return 0;
                };
                let delta = total.saturating_sub(rule.stats_baseline);
                rule.stats_baseline = total;
                delta
            })
            .collect()
    }

    /// Slave the installed rule for `dp_hash` outputs to
    pub fn installed_output(&self, dp_hash: u32) -> Option<&K> {
        self.rules
            .get((dp_hash & BOND_MASK) as usize)
            .and_then(|r| r.installed_slave.as_ref())
    }

    /// Remove every installed rule
    pub fn teardown(&mut self, datapath: &dyn Datapath) {
        for rule in &mut self.rules {
            rule.slave = None;
            rule.out_port = None;
        }
        self.sync(datapath, false);
    }
}
