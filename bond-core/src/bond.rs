//! The bond aggregate.
//!
//! A [`Bond`] owns its slaves, the enabled-slave list, the hash-bucket table
//! and (for balance-tcp with recirculation) the post-recirculation rules.
//! It is shared as `Arc<Bond<K>>` between the control plane and any number of
//! packet-path workers.
//!
//! Locking:
//! - `control` (slave-set lock) guards slave membership, settings, LACP state
//!   and everything only the control plane touches.
//! - `enabled` (enabled-list lock) guards the enabled list and the active
//!   slave. Whenever both are needed `control` is taken first.
//! - The packet path never takes `control`. It reads an immutable
//!   [`Selection`] snapshot published through `ArcSwap`, and only takes the
//!   enabled-list lock briefly for active-backup and admission decisions.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::admission::{AdmissibilityFilter, AdmissionView, MacLearning, Verdict};
use crate::buckets::{BucketTable, ByteCounters, HashBucket};
use crate::error::BondError;
use crate::hash::{bucket_index, hash_l4, hash_mac, BOND_BUCKETS};
use crate::learning::{LearningPacket, MigratedBuckets};
use crate::packet::{compose_rarp, Flow, FlowWildcards, MacAddr};
use crate::rebalance::Rebalancer;
use crate::recirc::{Datapath, PostRecircRule, RecircRuleManager};
use crate::settings::{BondConfig, BondMode, BondSettings, LacpStatus};
use crate::slave::{LinkDelays, LinkState, Netdev, OfPort, Slave, SlaveHandle};

/// What the caller must encode to use the recirculation fast path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecircParams {
    pub recirc_id: u32,
    /// Basis the datapath must hash the L4 fields with
    pub hash_bias: u32,
}

/// How output links are picked right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Balance {
    /// LACP is required but not negotiated and no fallback is configured
    Drop,
    ActiveBackup,
    /// Lowest-numbered enabled slave
    LowestId,
    Hashed(BondMode),
}

/// Immutable packet-path view of the bond
#[derive(Debug)]
struct Selection<K> {
    name: String,
    mode: BondMode,
    basis: u32,
    lacp_status: LacpStatus,
    lacp_fallback_ab: bool,
    lacp_fallback_id: bool,
    /// Rebalancing is on, so bytes must be accounted
    balanced: bool,
    recirc_id: Option<u32>,
    buckets: BucketTable<K>,
}

impl<K: SlaveHandle> Selection<K> {
    fn new(ctl: &ControlState<K>, buckets: BucketTable<K>) -> Self {
        Self {
            name: ctl.settings.name.clone(),
            mode: ctl.settings.mode,
            basis: ctl.settings.basis,
            lacp_status: ctl.lacp_status,
            lacp_fallback_ab: ctl.settings.lacp_fallback_ab,
            lacp_fallback_id: ctl.settings.lacp_fallback_id,
            balanced: ctl.settings.is_balanced(),
            recirc_id: ctl.recirc_id,
            buckets,
        }
    }

    fn balance(&self) -> Balance {
        if self.lacp_status == LacpStatus::Configured {
            return if self.lacp_fallback_ab {
                Balance::ActiveBackup
            } else if self.lacp_fallback_id {
                Balance::LowestId
            } else {
                Balance::Drop
            };
        }
        match self.mode {
            BondMode::ActiveBackup => Balance::ActiveBackup,
            mode => Balance::Hashed(mode),
        }
    }

    fn flow_hash(&self, flow: &Flow, vlan: u16) -> u32 {
        match self.mode {
            BondMode::BalanceTcp => hash_l4(flow, self.basis),
            _ => hash_mac(flow.dl_src, vlan, self.basis),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PortView {
    ofport: OfPort,
    may_enable: bool,
}

/// Guarded by the enabled-list lock
#[derive(Debug)]
struct EnabledSlaves<K> {
    ports: HashMap<K, PortView>,
    /// Enabled slaves in the order they were enabled
    list: Vec<K>,
    active: Option<K>,
    active_changed: bool,
    send_learning_packets: bool,
}

impl<K: SlaveHandle> EnabledSlaves<K> {
    fn is_enabled(&self, handle: &K) -> bool {
        self.list.contains(handle)
    }

    fn set_enabled(&mut self, handle: &K, enabled: bool) {
        if enabled {
            if !self.is_enabled(handle) {
                self.list.push(handle.clone());
            }
        } else {
            self.list.retain(|h| h != handle);
        }
    }

    fn lowest_id(&self) -> Option<K> {
        self.list
            .iter()
            .min_by_key(|h| self.ports.get(*h).map(|p| p.ofport).unwrap_or(OfPort::MAX))
            .cloned()
    }
}

/// Guarded by the slave-set lock
struct ControlState<K> {
    settings: BondSettings,
    slaves: HashMap<K, Slave<K>>,
    lacp_status: LacpStatus,
    revalidate: bool,
    next_rebalance: Option<Instant>,
    recirc_id: Option<u32>,
    recirc: Option<RecircRuleManager<K>>,
    migrated: MigratedBuckets,
}

impl<K: SlaveHandle> ControlState<K> {
    fn slave_name(&self, handle: &K) -> String {
        self.slaves
            .get(handle)
            .map(|s| s.name().to_string())
            .unwrap_or_else(|| format!("{handle:?}"))
    }

    fn link_delays(&self) -> LinkDelays {
        if self.lacp_status == LacpStatus::Disabled {
            LinkDelays {
                up: self.settings.up_delay,
                down: self.settings.down_delay,
            }
        } else {
            LinkDelays {
                up: Duration::ZERO,
                down: Duration::ZERO,
            }
        }
    }
}

/// A bond: several physical links presented as one port
pub struct Bond<K: SlaveHandle> {
    control: RwLock<ControlState<K>>,
    enabled: Mutex<EnabledSlaves<K>>,
    selection: ArcSwap<Selection<K>>,
    tx_bytes: ByteCounters,
    rebalancer: Rebalancer,
    datapath: Arc<dyn Datapath>,
    mac_learning: Arc<dyn MacLearning<K>>,
}

impl<K: SlaveHandle> Bond<K> {
    /// Create a bond with no slaves
    pub fn create(
        settings: BondSettings,
        datapath: Arc<dyn Datapath>,
        mac_learning: Arc<dyn MacLearning<K>>,
    ) -> Arc<Self> {
        let mut ctl = ControlState {
            settings,
            slaves: HashMap::new(),
            lacp_status: LacpStatus::Disabled,
            revalidate: false,
            next_rebalance: None,
            recirc_id: None,
            recirc: None,
            migrated: MigratedBuckets::default(),
        };
        if ctl.settings.mode == BondMode::BalanceTcp && datapath.supports_recirc() {
            ctl.recirc_id = datapath.alloc_recirc_id();
        }
        info!(
            bond = %ctl.settings.name,
            mode = %ctl.settings.mode,
            recirc_id = ?ctl.recirc_id,
            "bond created"
        );

        let selection = Selection::new(&ctl, BucketTable::unassigned());
        Arc::new(Self {
            control: RwLock::new(ctl),
            enabled: Mutex::new(EnabledSlaves {
                ports: HashMap::new(),
                list: Vec::new(),
                active: None,
                active_changed: false,
                send_learning_packets: false,
            }),
            selection: ArcSwap::from_pointee(selection),
            tx_bytes: ByteCounters::new(),
            rebalancer: Rebalancer::default(),
            datapath,
            mac_learning,
        })
    }

    pub fn name(&self) -> String {
        self.control.read().settings.name.clone()
    }

    pub fn settings(&self) -> BondSettings {
        self.control.read().settings.clone()
    }

    pub fn lacp_status(&self) -> LacpStatus {
        self.control.read().lacp_status
    }

    /// Whether the slaves currently behave as individual ports: LACP is
    /// configured but not negotiated and only the lowest-port fallback is on.
    pub fn is_individual(&self) -> bool {
        let sel = self.selection.load();
        sel.lacp_status == LacpStatus::Configured && sel.lacp_fallback_id && !sel.lacp_fallback_ab
    }

    /// Apply new settings in place.
    ///
    /// Returns true if flows must be revalidated: the mode, basis, rebalance
    /// interval or a fallback flag changed, or a pending revalidation was
    /// outstanding. Only a change of those settings rebuilds the bucket
    /// table, so reapplying the current settings keeps every assignment.
    /// Bonds held in a [`crate::registry::BondRegistry`] are renamed through
    /// its `reconfigure`, which also re-keys them.
    pub fn reconfigure(&self, settings: &BondSettings) -> bool {
        let mut guard = self.control.write();
        let ctl = &mut *guard;

        if ctl.settings.name != settings.name {
            info!(bond = %ctl.settings.name, "renamed to {}", settings.name);
        }
        let old = std::mem::replace(&mut ctl.settings, settings.clone());

        let structural = old.mode != settings.mode
            || old.basis != settings.basis
            || old.rebalance_interval != settings.rebalance_interval
            || old.lacp_fallback_ab != settings.lacp_fallback_ab
            || old.lacp_fallback_id != settings.lacp_fallback_id;
        if old.mode != settings.mode {
            info!(bond = %settings.name, "mode changed from {} to {}", old.mode, settings.mode);
        }
        let pending = std::mem::take(&mut ctl.revalidate);
        if old.rebalance_interval != settings.rebalance_interval {
            ctl.next_rebalance = None;
        }

        let want_recirc = settings.mode == BondMode::BalanceTcp && self.datapath.supports_recirc();
        match (want_recirc, ctl.recirc_id) {
            (true, None) => {
                ctl.recirc_id = self.datapath.alloc_recirc_id();
                match ctl.recirc_id {
                    Some(id) => info!(bond = %settings.name, recirc_id = id, "recirculation enabled"),
                    None => warn!(
                        bond = %settings.name,
                        "no recirculation id available, hashing every packet instead"
                    ),
                }
            }
            (false, Some(id)) => {
                self.release_recirc(ctl, id);
            }
            _ => {}
        }

        let mut link = self.enabled.lock();
        if structural {
            let mut table = BucketTable::unassigned();
            if settings.mode.is_hashed() {
                for b in table.repair(&link.list) {
                    ctl.migrated.mark(b as usize);
                }
            }
            self.tx_bytes.reset();
            ctl.next_rebalance = None;
            self.sync_recirc(ctl, &table, false);
            self.publish(ctl, table);
        } else {
            let table = self.selection.load().buckets.clone();
            self.sync_recirc(ctl, &table, false);
            self.publish(ctl, table);
        }
        if link.active.is_none() && !link.list.is_empty() {
            choose_active_slave(ctl, &mut link);
        }

        structural || pending
    }

    /// Parse `cfg` and apply it. A malformed config leaves the bond untouched.
    pub fn reconfigure_from_config(&self, cfg: &BondConfig) -> Result<bool, BondError> {
        let settings = BondSettings::try_from(cfg)?;
        Ok(self.reconfigure(&settings))
    }

    /// Add a slave, or refresh the port and device of an existing one.
    ///
    /// New slaves start disabled until `set_may_enable` and `run` enable them.
    pub fn register_slave(&self, handle: K, ofport: OfPort, netdev: Arc<dyn Netdev>) {
        let mut guard = self.control.write();
        let ctl = &mut *guard;

        if let Some(slave) = ctl.slaves.get_mut(&handle) {
            if slave.set_netdev(netdev) {
                debug!(bond = %ctl.settings.name, slave = %slave.name(), "netdev replaced");
            }
            if slave.ofport() != ofport {
                info!(
                    bond = %ctl.settings.name,
                    slave = %slave.name(),
                    "port number changed from {} to {}",
                    slave.ofport(),
                    ofport
                );
                slave.set_ofport(ofport);
                ctl.revalidate = true;
                if let Some(port) = self.enabled.lock().ports.get_mut(&handle) {
                    port.ofport = ofport;
                }
                let table = self.selection.load().buckets.clone();
                self.sync_recirc(ctl, &table, false);
            }
            return;
        }

        let slave = Slave::new(handle.clone(), ofport, netdev);
        info!(bond = %ctl.settings.name, slave = %slave.name(), ofport, "slave registered");
        ctl.slaves.insert(handle.clone(), slave);
        ctl.revalidate = true;
        self.enabled.lock().ports.insert(
            handle,
            PortView {
                ofport,
                may_enable: false,
            },
        );
    }

    /// Point a slave at a different network device
    pub fn set_slave_netdev(&self, handle: &K, netdev: Arc<dyn Netdev>) -> Result<(), BondError> {
        let mut ctl = self.control.write();
        let slave = ctl
            .slaves
            .get_mut(handle)
            .ok_or_else(|| BondError::SlaveNotFound(format!("{handle:?}")))?;
        slave.set_netdev(netdev);
        Ok(())
    }

    /// Remove a slave. Unknown handles are ignored.
    ///
    /// Returns whether a slave was removed.
    pub fn unregister_slave(&self, handle: &K) -> bool {
        let mut guard = self.control.write();
        let ctl = &mut *guard;

        let Some(slave) = ctl.slaves.remove(handle) else {
            return false;
        };
        info!(bond = %ctl.settings.name, slave = %slave.name(), "slave unregistered");
        ctl.revalidate = true;

        let mut link = self.enabled.lock();
        link.ports.remove(handle);
        link.set_enabled(handle, false);
        if link.active.as_ref() == Some(handle) {
            choose_active_slave(ctl, &mut link);
        }
        self.refresh_buckets(ctl, &mut link);
        true
    }

    /// Record whether the client considers a slave bondable. Takes effect on
    /// the next `run`.
    pub fn set_may_enable(&self, handle: &K, may_enable: bool) -> Result<(), BondError> {
        let mut ctl = self.control.write();
        let slave = ctl
            .slaves
            .get_mut(handle)
            .ok_or_else(|| BondError::SlaveNotFound(format!("{handle:?}")))?;
        slave.set_may_enable(may_enable);
        if let Some(port) = self.enabled.lock().ports.get_mut(handle) {
            port.may_enable = may_enable;
        }
        Ok(())
    }

    /// Periodic control-plane work: apply the LACP status, advance every
    /// slave's link state, fail over, repair the bucket table and keep the
    /// post-recirculation rules installed.
    ///
    /// Returns true if flows must be revalidated.
    pub fn run(&self, lacp_status: LacpStatus, now: Instant) -> bool {
        let mut guard = self.control.write();
        let ctl = &mut *guard;
        let mut changed = false;

        if ctl.lacp_status != lacp_status {
            info!(
                bond = %ctl.settings.name,
                "LACP status changed from {} to {}",
                ctl.lacp_status,
                lacp_status
            );
            ctl.lacp_status = lacp_status;
            ctl.revalidate = true;
            changed = true;
        }

        let delays = ctl.link_delays();
        let name = ctl.settings.name.clone();
        let mut flips: Vec<(OfPort, K, bool)> = ctl
            .slaves
            .values_mut()
            .filter_map(|s| {
                s.update_link_status(now, delays, &name)
                    .map(|enabled| (s.ofport(), s.handle().clone(), enabled))
            })
            .collect();
        flips.sort_by_key(|(ofport, _, _)| *ofport);

        let mut link = self.enabled.lock();
        if !flips.is_empty() {
            for (_, handle, enabled) in &flips {
                link.set_enabled(handle, *enabled);
            }
            ctl.revalidate = true;
            changed = true;
        }

        let active_ok = link.active.as_ref().is_some_and(|a| link.is_enabled(a));
        if !active_ok && (link.active.is_some() || !link.list.is_empty()) {
            choose_active_slave(ctl, &mut link);
        }
        if changed {
            self.refresh_buckets(ctl, &mut link);
        }
        drop(link);

        if ctl.recirc_id.is_some() {
            let table = self.selection.load().buckets.clone();
            self.sync_recirc(ctl, &table, false);
        }

        std::mem::take(&mut ctl.revalidate)
    }

    /// Earliest instant at which `run` or `rebalance` has work to do
    pub fn next_wakeup(&self) -> Option<Instant> {
        let ctl = self.control.read();
        let delay = ctl.slaves.values().filter_map(|s| s.delay_expires()).min();
        let rebalance = ctl.next_rebalance.filter(|_| ctl.settings.is_balanced());
        match (delay, rebalance) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Pick the slave a flow should leave on, `None` to drop.
    ///
    /// When `wc` is given, the fields the decision depended on are
    /// un-wildcarded in it.
    pub fn choose_output_slave(&self, flow: &Flow, wc: Option<&mut FlowWildcards>, vlan: u16) -> Option<K> {
        let sel = self.selection.load();
        match sel.balance() {
            Balance::Drop => None,
            Balance::ActiveBackup => self.active_backup_output(&sel.name),
            Balance::LowestId => self.enabled.lock().lowest_id(),
            Balance::Hashed(mode) => {
                if let Some(wc) = wc {
                    match mode {
                        BondMode::BalanceTcp => wc.unwildcard(
                            FlowWildcards::DL_TYPE
                                | FlowWildcards::NW_SRC
                                | FlowWildcards::NW_DST
                                | FlowWildcards::NW_PROTO
                                | FlowWildcards::TP_SRC
                                | FlowWildcards::TP_DST,
                        ),
                        _ => wc.unwildcard(FlowWildcards::DL_SRC | FlowWildcards::VLAN),
                    }
                }
                let bucket = bucket_index(sel.flow_hash(flow, vlan));
                sel.buckets.get(bucket).cloned()
            }
        }
    }

    fn active_backup_output(&self, bond: &str) -> Option<K> {
        let mut link = self.enabled.lock();
        if let Some(active) = link.active.as_ref().filter(|a| link.is_enabled(a)) {
            return Some(active.clone());
        }
        let next = link.list.first().cloned()?;
        info!(bond, slave = ?next, "active slave unavailable, promoting next enabled slave");
        link.active = Some(next.clone());
        link.active_changed = true;
        link.send_learning_packets = true;
        Some(next)
    }

    /// Count `n_bytes` sent by `flow` towards its hash bucket.
    ///
    /// Does nothing unless the bond hashes, rebalances and is not using
    /// recirculation (whose bytes come from the datapath).
    pub fn account(&self, flow: &Flow, vlan: u16, n_bytes: u64) {
        let sel = self.selection.load();
        if !sel.balanced || sel.recirc_id.is_some() || !matches!(sel.balance(), Balance::Hashed(_)) {
            return;
        }
        self.tx_bytes.add(bucket_index(sel.flow_hash(flow, vlan)), n_bytes);
    }

    /// Rebalance if the interval has elapsed. The first call only arms the
    /// timer. Returns the number of buckets moved.
    pub fn rebalance(&self, now: Instant) -> usize {
        self.rebalance_pass(now, false)
    }

    /// Rebalance now regardless of the interval
    pub fn force_rebalance(&self, now: Instant) -> usize {
        self.rebalance_pass(now, true)
    }

    fn rebalance_pass(&self, now: Instant, force: bool) -> usize {
        let mut guard = self.control.write();
        let ctl = &mut *guard;

        if !ctl.settings.mode.is_hashed() {
            return 0;
        }
        let interval = ctl.settings.rebalance_interval;
        if !force {
            if interval.is_zero() {
                return 0;
            }
            match ctl.next_rebalance {
                None => {
                    ctl.next_rebalance = Some(now + interval);
                    return 0;
                }
                Some(deadline) if now < deadline => return 0,
                Some(_) => {}
            }
        }
        if !interval.is_zero() {
            ctl.next_rebalance = Some(now + interval);
        }

        let recirculating = ctl.recirc_id.is_some();
        let bytes = match ctl.recirc.as_mut() {
            Some(mgr) if recirculating => mgr.pull_stats(&*self.datapath),
            _ => self.tx_bytes.take_all(),
        };

        let mut link = self.enabled.lock();
        let mut table = self.selection.load().buckets.clone();
        let buckets: Vec<HashBucket<K>> = table
            .iter()
            .map(|(i, slave)| HashBucket {
                index: i as u8,
                slave: slave.cloned(),
                tx_bytes: bytes.get(i).copied().unwrap_or(0),
            })
            .collect();

        let plan = self.rebalancer.plan(&link.list, &buckets);
        for load in &plan.loads {
            if let Some(slave) = ctl.slaves.get_mut(&load.slave) {
                slave.record_load(load.tx_bytes);
            }
        }
        debug!(
            bond = %ctl.settings.name,
            total_bytes = plan.total_bytes,
            threshold = plan.threshold,
            skew = plan.skew(),
            "rebalance pass"
        );
        if plan.migrations.is_empty() {
            return 0;
        }

        for m in &plan.migrations {
            info!(
                bond = %ctl.settings.name,
                "shift {}kB of load (with hash {}) from {} to {}",
                m.tx_bytes / 1024,
                m.bucket,
                ctl.slave_name(&m.from),
                ctl.slave_name(&m.to)
            );
            table.assign(m.bucket as usize, Some(m.to.clone()));
            ctl.migrated.mark(m.bucket as usize);
        }
        link.send_learning_packets = true;
        drop(link);

        if !recirculating {
            ctl.revalidate = true;
        }
        self.sync_recirc(ctl, &table, false);
        self.publish(ctl, table);
        plan.migrations.len()
    }

    /// Recirculation parameters, if this bond uses the recirculation fast path
    pub fn may_recirc(&self) -> Option<RecircParams> {
        let sel = self.selection.load();
        if !matches!(sel.balance(), Balance::Hashed(BondMode::BalanceTcp)) {
            return None;
        }
        sel.recirc_id.map(|recirc_id| RecircParams {
            recirc_id,
            hash_bias: sel.basis,
        })
    }

    /// Push post-recirculation rules to the datapath, creating them on first
    /// use. `force` rewrites every rule. Returns the datapath operations done.
    pub fn update_post_recirc_rules(&self, force: bool) -> usize {
        let mut guard = self.control.write();
        let ctl = &mut *guard;
        let table = self.selection.load().buckets.clone();
        self.sync_recirc(ctl, &table, force)
    }

    /// Snapshot of the post-recirculation rules
    pub fn post_recirc_rules(&self) -> Vec<PostRecircRule<K>> {
        self.control
            .read()
            .recirc
            .as_ref()
            .map(|m| m.rules().to_vec())
            .unwrap_or_default()
    }

    /// Should a packet for `dst` received on `slave` be accepted?
    pub fn check_admissibility(&self, slave: &K, dst: MacAddr, vlan: u16) -> Verdict {
        let sel = self.selection.load();
        let (known, enabled, may_enable, designated) = {
            let link = self.enabled.lock();
            let port = link.ports.get(slave);
            let designated = match sel.balance() {
                Balance::LowestId => link.lowest_id(),
                _ => link.active.clone(),
            };
            (
                port.is_some(),
                link.is_enabled(slave),
                port.is_some_and(|p| p.may_enable),
                designated,
            )
        };
        let view = AdmissionView {
            mode: sel.mode,
            lacp_status: sel.lacp_status,
            lacp_fallback_ab: sel.lacp_fallback_ab,
            lacp_fallback_id: sel.lacp_fallback_id,
            designated: designated.as_ref(),
            known,
            enabled,
            may_enable,
        };
        AdmissibilityFilter::check(&view, slave, dst, vlan, &*self.mac_learning)
    }

    /// Record that `eth_src` was seen on `slave`.
    ///
    /// Refused for unknown slaves, and for ordinary packets while the entry
    /// is locked by a recent gratuitous ARP. Returns whether it was learned.
    pub fn learn_mac(&self, slave: &K, eth_src: MacAddr, vlan: u16, is_grat_arp: bool) -> bool {
        if !self.enabled.lock().ports.contains_key(slave) {
            return false;
        }
        if !is_grat_arp && self.mac_learning.is_grat_arp_locked(eth_src, vlan) {
            debug!(%eth_src, vlan, "not learning, entry locked by gratuitous ARP");
            return false;
        }
        self.mac_learning.learn(eth_src, vlan, slave.clone(), is_grat_arp);
        true
    }

    /// Whether learning packets are due. Reading clears the request.
    pub fn should_send_learning_packets(&self) -> bool {
        let sel = self.selection.load();
        let mut link = self.enabled.lock();
        let may_send = sel.lacp_status == LacpStatus::Disabled
            && matches!(sel.mode, BondMode::BalanceSlb | BondMode::ActiveBackup)
            && link.active.is_some();
        std::mem::take(&mut link.send_learning_packets) && may_send
    }

    /// Build the learning frame for `eth_src` and pick the slave it leaves on
    pub fn compose_learning_packet(&self, eth_src: MacAddr, vlan: u16) -> Option<LearningPacket<K>> {
        let flow = Flow::from_eth_src(eth_src);
        let slave = self.choose_output_slave(&flow, None, vlan)?;
        Some(LearningPacket {
            slave,
            eth_src,
            vlan,
            frame: compose_rarp(eth_src, vlan),
        })
    }

    /// Learning frames for every host whose output slave changed since the
    /// last call
    pub fn compose_learning_packets<I>(&self, hosts: I) -> Vec<LearningPacket<K>>
    where
        I: IntoIterator<Item = (MacAddr, u16)>,
    {
        let migrated = self.control.write().migrated.take();
        let sel = self.selection.load_full();
        migrated
            .hosts_to_announce(sel.mode, sel.basis, hosts)
            .into_iter()
            .filter_map(|(mac, vlan)| self.compose_learning_packet(mac, vlan))
            .collect()
    }

    /// MAC of the active slave if it changed since the last call (or always,
    /// with `force`). `MacAddr::ZERO` means no slave is active.
    pub fn take_changed_active_slave(&self, force: bool) -> Option<MacAddr> {
        let ctl = self.control.read();
        let mut link = self.enabled.lock();
        if !link.active_changed && !force {
            return None;
        }
        link.active_changed = false;
        let mac = link
            .active
            .as_ref()
            .and_then(|h| ctl.slaves.get(h))
            .map(|s| s.netdev().mac())
            .unwrap_or(MacAddr::ZERO);
        Some(mac)
    }

    pub fn active_slave(&self) -> Option<K> {
        self.enabled.lock().active.clone()
    }

    pub fn enabled_slaves(&self) -> Vec<K> {
        self.enabled.lock().list.clone()
    }

    pub fn is_enabled(&self, handle: &K) -> bool {
        self.enabled.lock().is_enabled(handle)
    }

    /// Registered slaves ordered by port number
    pub fn slaves(&self) -> Vec<K> {
        let ctl = self.control.read();
        let mut slaves: Vec<&Slave<K>> = ctl.slaves.values().collect();
        slaves.sort_by_key(|s| s.ofport());
        slaves.into_iter().map(|s| s.handle().clone()).collect()
    }

    /// Handle of the slave whose device is called `name`
    pub fn find_slave(&self, name: &str) -> Option<K> {
        self.control
            .read()
            .slaves
            .values()
            .find(|s| s.name() == name)
            .map(|s| s.handle().clone())
    }

    pub fn slave_link_state(&self, handle: &K) -> Option<LinkState> {
        self.control.read().slaves.get(handle).map(|s| s.link_state())
    }

    /// Current bucket assignment with the bytes counted since the last pass
    pub fn buckets(&self) -> Vec<HashBucket<K>> {
        let sel = self.selection.load();
        sel.buckets
            .iter()
            .map(|(i, slave)| HashBucket {
                index: i as u8,
                slave: slave.cloned(),
                tx_bytes: self.tx_bytes.get(i),
            })
            .collect()
    }

    pub fn bucket_slave(&self, bucket: usize) -> Option<K> {
        self.selection.load().buckets.get(bucket).cloned()
    }

    /// Bucket `mac` on `vlan` hashes to under this bond's basis
    pub fn hash_bucket(&self, mac: MacAddr, vlan: u16) -> usize {
        bucket_index(hash_mac(mac, vlan, self.selection.load().basis))
    }

    /// Move one hash bucket to an enabled slave by hand
    pub fn migrate(&self, bucket: usize, slave: &K) -> Result<(), BondError> {
        if bucket >= BOND_BUCKETS {
            return Err(BondError::InvalidBucket(bucket));
        }
        let mut guard = self.control.write();
        let ctl = &mut *guard;

        if !ctl.settings.mode.is_hashed() {
            return Err(BondError::NotBalanced {
                bond: ctl.settings.name.clone(),
                mode: ctl.settings.mode,
            });
        }
        let target = ctl
            .slaves
            .get(slave)
            .ok_or_else(|| BondError::SlaveNotFound(format!("{slave:?}")))?;
        if !target.is_enabled() {
            return Err(BondError::SlaveDisabled(target.name().to_string()));
        }
        info!(bond = %ctl.settings.name, slave = %target.name(), "migrating hash {bucket}");

        let mut link = self.enabled.lock();
        let mut table = self.selection.load().buckets.clone();
        table.assign(bucket, Some(slave.clone()));
        ctl.migrated.mark(bucket);
        ctl.revalidate = true;
        link.send_learning_packets = true;
        drop(link);

        self.sync_recirc(ctl, &table, false);
        self.publish(ctl, table);
        Ok(())
    }

    /// Make an enabled slave the active one by hand
    pub fn set_active_slave(&self, slave: &K) -> Result<(), BondError> {
        let mut guard = self.control.write();
        let ctl = &mut *guard;

        let target = ctl
            .slaves
            .get(slave)
            .ok_or_else(|| BondError::SlaveNotFound(format!("{slave:?}")))?;
        if !target.is_enabled() {
            return Err(BondError::SlaveDisabled(target.name().to_string()));
        }
        let mut link = self.enabled.lock();
        if link.active.as_ref() != Some(slave) {
            info!(bond = %ctl.settings.name, slave = %target.name(), "active slave set by administrator");
            link.active = Some(slave.clone());
            link.active_changed = true;
            link.send_learning_packets = true;
            ctl.revalidate = true;
        }
        Ok(())
    }

    /// Status snapshot of the bond and its slaves
    pub fn status(&self) -> BondStatus<K> {
        let ctl = self.control.read();
        let link = self.enabled.lock();
        let sel = self.selection.load();

        let mut slaves: Vec<SlaveStatus<K>> = ctl
            .slaves
            .values()
            .map(|s| SlaveStatus {
                handle: s.handle().clone(),
                name: s.name().to_string(),
                ofport: s.ofport(),
                mac: s.netdev().mac(),
                speed_mbps: s.netdev().speed_mbps(),
                carrier: s.netdev().carrier(),
                state: s.link_state(),
                may_enable: s.may_enable(),
                active: link.active.as_ref() == Some(s.handle()),
                buckets: sel.buckets.buckets_of(s.handle()),
                tx_bytes: s.tx_bytes(),
            })
            .collect();
        slaves.sort_by_key(|s| s.ofport);

        BondStatus {
            name: ctl.settings.name.clone(),
            mode: ctl.settings.mode,
            basis: ctl.settings.basis,
            lacp_status: ctl.lacp_status,
            lacp_fallback_ab: ctl.settings.lacp_fallback_ab,
            lacp_fallback_id: ctl.settings.lacp_fallback_id,
            rebalance_interval: ctl.settings.rebalance_interval,
            up_delay: ctl.settings.up_delay,
            down_delay: ctl.settings.down_delay,
            recirc_id: ctl.recirc_id,
            active_slave: link.active.clone(),
            slaves,
        }
    }

    fn publish(&self, ctl: &ControlState<K>, buckets: BucketTable<K>) {
        self.selection.store(Arc::new(Selection::new(ctl, buckets)));
    }

    /// Bring the bucket table in line with the enabled list and publish it
    fn refresh_buckets(&self, ctl: &mut ControlState<K>, link: &mut EnabledSlaves<K>) {
        let mut table = self.selection.load().buckets.clone();
        if ctl.settings.mode.is_hashed() {
            let moved = table.repair(&link.list);
            if !moved.is_empty() {
                debug!(bond = %ctl.settings.name, buckets = moved.len(), "reassigned orphaned buckets");
                for b in moved {
                    ctl.migrated.mark(b as usize);
                }
                link.send_learning_packets = true;
            }
        } else {
            table.clear();
        }
        self.sync_recirc(ctl, &table, false);
        self.publish(ctl, table);
    }

    fn sync_recirc(&self, ctl: &mut ControlState<K>, table: &BucketTable<K>, force: bool) -> usize {
        let Some(recirc_id) = ctl.recirc_id else {
            return 0;
        };
        let ControlState {
            settings,
            slaves,
            recirc,
            ..
        } = ctl;
        let mgr = recirc.get_or_insert_with(|| {
            info!(bond = %settings.name, recirc_id, "creating post recirculation rules");
            RecircRuleManager::new(recirc_id)
        });
        for (i, slave) in table.iter() {
            let target = slave.and_then(|k| slaves.get(k).map(|s| (k.clone(), s.ofport())));
            mgr.set_desired(i, target);
        }
        mgr.sync(&*self.datapath, force)
    }

    fn release_recirc(&self, ctl: &mut ControlState<K>, recirc_id: u32) {
        if let Some(mut mgr) = ctl.recirc.take() {
            mgr.teardown(&*self.datapath);
        }
        self.datapath.free_recirc_id(recirc_id);
        ctl.recirc_id = None;
        info!(bond = %ctl.settings.name, recirc_id, "recirculation disabled");
    }
}

impl<K: SlaveHandle> Drop for Bond<K> {
    fn drop(&mut self) {
        let ctl = self.control.get_mut();
        if let Some(mut mgr) = ctl.recirc.take() {
            mgr.teardown(&*self.datapath);
        }
        if let Some(id) = ctl.recirc_id.take() {
            self.datapath.free_recirc_id(id);
        }
        debug!(bond = %ctl.settings.name, "bond destroyed");
    }
}

impl<K: SlaveHandle> fmt::Debug for Bond<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ctl = self.control.read();
        f.debug_struct("Bond")
            .field("name", &ctl.settings.name)
            .field("mode", &ctl.settings.mode)
            .field("slaves", &ctl.slaves.len())
            .field("recirc_id", &ctl.recirc_id)
            .finish()
    }
}

/// Pick a new active slave from the enabled list.
///
/// Prefers the slave whose device carries the MAC remembered from a previous
/// run, then the first enabled slave.
fn choose_active_slave<K: SlaveHandle>(ctl: &ControlState<K>, link: &mut EnabledSlaves<K>) {
    let old = link.active.take();
    let seed = ctl.settings.active_slave_mac;
    let preferred = (!seed.is_zero())
        .then(|| {
            link.list
                .iter()
                .find(|h| ctl.slaves.get(*h).is_some_and(|s| s.netdev().mac() == seed))
                .cloned()
        })
        .flatten();
    let new = preferred.or_else(|| link.list.first().cloned());

    match &new {
        Some(handle) => {
            info!(bond = %ctl.settings.name, "active slave is now {}", ctl.slave_name(handle));
            link.send_learning_packets = true;
        }
        None if old.is_some() => {
            info!(bond = %ctl.settings.name, "all slaves disabled, no active slave");
        }
        None => {}
    }
    if new != old {
        link.active_changed = true;
    }
    link.active = new;
}

/// Per-slave part of [`BondStatus`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlaveStatus<K> {
    pub handle: K,
    pub name: String,
    pub ofport: OfPort,
    pub mac: MacAddr,
    pub speed_mbps: u32,
    pub carrier: bool,
    pub state: LinkState,
    pub may_enable: bool,
    pub active: bool,
    /// Buckets currently assigned
    pub buckets: Vec<u8>,
    /// Bytes carried in the last rebalancing pass
    pub tx_bytes: u64,
}

/// Point-in-time view of a bond, as shown by administrative commands
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BondStatus<K> {
    pub name: String,
    pub mode: BondMode,
    pub basis: u32,
    pub lacp_status: LacpStatus,
    pub lacp_fallback_ab: bool,
    pub lacp_fallback_id: bool,
    pub rebalance_interval: Duration,
    pub up_delay: Duration,
    pub down_delay: Duration,
    pub recirc_id: Option<u32>,
    pub active_slave: Option<K>,
    pub slaves: Vec<SlaveStatus<K>>,
}

impl<K> fmt::Display for BondStatus<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "---- {} ----", self.name)?;
        writeln!(f, "bond_mode: {}", self.mode)?;
        match self.recirc_id {
            Some(id) => writeln!(f, "bond may use recirculation: yes, Recirc-ID : {id}")?,
            None => writeln!(f, "bond may use recirculation: no")?,
        }
        writeln!(f, "bond-hash-basis: {}", self.basis)?;
        writeln!(f, "updelay: {} ms", self.up_delay.as_millis())?;
        writeln!(f, "downdelay: {} ms", self.down_delay.as_millis())?;
        if self.mode.is_hashed() {
            writeln!(f, "rebalance interval: {} ms", self.rebalance_interval.as_millis())?;
        }
        writeln!(f, "lacp_status: {}", self.lacp_status)?;
        writeln!(f, "lacp_fallback_ab: {}", self.lacp_fallback_ab)?;
        writeln!(f, "lacp_fallback_id: {}", self.lacp_fallback_id)?;
        match self.slaves.iter().find(|s| s.active) {
            Some(s) => writeln!(f, "active slave mac: {}({})", s.mac, s.name)?,
            None => writeln!(f, "active slave mac: {}(none)", MacAddr::ZERO)?,
        }
        for s in &self.slaves {
            writeln!(f)?;
            writeln!(f, "slave {}: {}", s.name, s.state)?;
            if s.active {
                writeln!(f, "  active slave")?;
            }
            writeln!(f, "  may_enable: {}", s.may_enable)?;
            if self.mode.is_hashed() {
                writeln!(f, "  hash buckets: {}", s.buckets.len())?;
                writeln!(f, "  last pass load: {} kB", s.tx_bytes / 1024)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recirc::{DatapathError, PostRecircMatch};
    use std::sync::atomic::{AtomicBool, Ordering};

    struct MockNetdev {
        name: String,
        mac: MacAddr,
        carrier: AtomicBool,
    }

    impl Netdev for MockNetdev {
        fn name(&self) -> &str {
            &self.name
        }

        fn carrier(&self) -> bool {
            self.carrier.load(Ordering::Relaxed)
        }

        fn speed_mbps(&self) -> u32 {
            1_000
        }

        fn mac(&self) -> MacAddr {
            self.mac
        }
    }

    fn netdev(n: u8) -> Arc<MockNetdev> {
        Arc::new(MockNetdev {
            name: format!("eth{n}"),
            mac: MacAddr::new([2, 0, 0, 0, 0, n]),
            carrier: AtomicBool::new(true),
        })
    }

    #[derive(Default)]
    struct MockDatapath {
        recirc: bool,
        flows: Mutex<HashMap<PostRecircMatch, OfPort>>,
        freed: Mutex<Vec<u32>>,
    }

    impl Datapath for MockDatapath {
        fn supports_recirc(&self) -> bool {
            self.recirc
        }

        fn alloc_recirc_id(&self) -> Option<u32> {
            Some(42)
        }

        fn free_recirc_id(&self, recirc_id: u32) {
            self.freed.lock().push(recirc_id);
        }

        fn add_internal_flow(
            &self,
            rule: &PostRecircMatch,
            _priority: u16,
            out_port: OfPort,
        ) -> Result<(), DatapathError> {
            self.flows.lock().insert(*rule, out_port);
            Ok(())
        }

        fn delete_internal_flow(&self, rule: &PostRecircMatch, _priority: u16) -> Result<(), DatapathError> {
            self.flows.lock().remove(rule);
            Ok(())
        }

        fn internal_flow_bytes(&self, _rule: &PostRecircMatch) -> Option<u64> {
            Some(0)
        }
    }

    #[derive(Default)]
    struct MockTable {
        entries: Mutex<HashMap<(MacAddr, u16), (u32, bool)>>,
    }

    impl MacLearning<u32> for MockTable {
        fn lookup(&self, mac: MacAddr, vlan: u16) -> Option<u32> {
            self.entries.lock().get(&(mac, vlan)).map(|e| e.0)
        }

        fn learn(&self, mac: MacAddr, vlan: u16, port: u32, is_grat_arp: bool) {
            self.entries.lock().insert((mac, vlan), (port, is_grat_arp));
        }

        fn is_grat_arp_locked(&self, mac: MacAddr, vlan: u16) -> bool {
            self.entries.lock().get(&(mac, vlan)).is_some_and(|e| e.1)
        }
    }

    fn bond_with(mode: BondMode, dp: Arc<MockDatapath>, slaves: &[u8]) -> (Arc<Bond<u32>>, Vec<Arc<MockNetdev>>) {
        let bond = Bond::create(BondSettings::new("bond0", mode), dp, Arc::new(MockTable::default()));
        let devs: Vec<Arc<MockNetdev>> = slaves.iter().map(|&n| netdev(n)).collect();
        for (n, dev) in slaves.iter().zip(&devs) {
            bond.register_slave(*n as u32, *n as u32, dev.clone());
            bond.set_may_enable(&(*n as u32), true).unwrap();
        }
        (bond, devs)
    }

    #[test]
    fn test_new_slaves_wait_for_run() {
        let (bond, _) = bond_with(BondMode::BalanceSlb, Arc::default(), &[1, 2]);
        assert!(bond.enabled_slaves().is_empty());
        assert_eq!(bond.choose_output_slave(&Flow::default(), None, 0), None);

        assert!(bond.run(LacpStatus::Disabled, Instant::now()));
        assert_eq!(bond.enabled_slaves(), vec![1, 2]);
        assert!(bond.buckets().iter().all(|b| b.slave.is_some()));
    }

    #[test]
    fn test_set_may_enable_unknown_slave() {
        let (bond, _) = bond_with(BondMode::BalanceSlb, Arc::default(), &[1]);
        assert_eq!(
            bond.set_may_enable(&9, true),
            Err(BondError::SlaveNotFound("9".to_string()))
        );
    }

    #[test]
    fn test_source_hash_unwildcards_mac_and_vlan() {
        let (bond, _) = bond_with(BondMode::BalanceSlb, Arc::default(), &[1, 2]);
        bond.run(LacpStatus::Disabled, Instant::now());

        let mut wc = FlowWildcards::catchall();
        let flow = Flow::from_eth_src(MacAddr::new([2, 0, 0, 0, 9, 9]));
        let out = bond.choose_output_slave(&flow, Some(&mut wc), 10);
        assert!(out.is_some());
        assert!(wc.is_exact(FlowWildcards::DL_SRC));
        assert!(wc.is_exact(FlowWildcards::VLAN));
        assert!(!wc.is_exact(FlowWildcards::TP_SRC));
    }

    #[test]
    fn test_lacp_configured_without_fallback_drops() {
        let (bond, _) = bond_with(BondMode::BalanceTcp, Arc::default(), &[1, 2]);
        bond.run(LacpStatus::Configured, Instant::now());
        assert_eq!(bond.choose_output_slave(&Flow::default(), None, 0), None);

        bond.run(LacpStatus::Negotiated, Instant::now());
        assert!(bond.choose_output_slave(&Flow::default(), None, 0).is_some());
    }

    #[test]
    fn test_lacp_fallback_id_picks_lowest_port() {
        let dp: Arc<MockDatapath> = Arc::default();
        let mut settings = BondSettings::new("bond0", BondMode::BalanceTcp);
        settings.lacp_fallback_id = true;
        let bond: Arc<Bond<u32>> = Bond::create(settings, dp, Arc::new(MockTable::default()));
        for n in [7u8, 3, 5] {
            bond.register_slave(n as u32, n as u32, netdev(n));
            bond.set_may_enable(&(n as u32), true).unwrap();
        }
        bond.run(LacpStatus::Configured, Instant::now());

        for port in [1u16, 2, 3] {
            let flow = Flow {
                tp_src: port,
                ..Default::default()
            };
            assert_eq!(bond.choose_output_slave(&flow, None, 0), Some(3));
        }
        assert!(bond.is_individual());

        bond.run(LacpStatus::Negotiated, Instant::now());
        assert!(!bond.is_individual());
    }

    #[test]
    fn test_lacp_fallback_ab_takes_precedence() {
        let mut settings = BondSettings::new("bond0", BondMode::BalanceTcp);
        settings.lacp_fallback_ab = true;
        settings.lacp_fallback_id = true;
        let bond: Arc<Bond<u32>> =
            Bond::create(settings, Arc::new(MockDatapath::default()), Arc::new(MockTable::default()));
        for n in [4u8, 2] {
            bond.register_slave(n as u32, n as u32, netdev(n));
            bond.set_may_enable(&(n as u32), true).unwrap();
        }
        bond.run(LacpStatus::Configured, Instant::now());

        let active = bond.active_slave();
        assert_eq!(active, Some(2));
        assert!(!bond.is_individual());
        assert_eq!(bond.choose_output_slave(&Flow::default(), None, 0), active);
    }

    #[test]
    fn test_reconfigure_same_settings_is_noop() {
        let (bond, _) = bond_with(BondMode::BalanceSlb, Arc::default(), &[1, 2]);
        bond.run(LacpStatus::Disabled, Instant::now());
        let before = bond.buckets();

        assert!(!bond.reconfigure(&bond.settings()));
        assert_eq!(bond.buckets(), before);
    }

    #[test]
    fn test_reconfigure_same_settings_keeps_migration() {
        let (bond, _) = bond_with(BondMode::BalanceSlb, Arc::default(), &[1, 2]);
        bond.run(LacpStatus::Disabled, Instant::now());

        let other = if bond.bucket_slave(5) == Some(1) { 2 } else { 1 };
        bond.migrate(5, &other).unwrap();
        let before = bond.buckets();

        bond.reconfigure(&bond.settings());
        assert_eq!(bond.bucket_slave(5), Some(other));
        assert_eq!(bond.buckets(), before);
        assert!(!bond.reconfigure(&bond.settings()));
    }

    #[test]
    fn test_reconfigure_mode_change_revalidates() {
        let (bond, _) = bond_with(BondMode::BalanceSlb, Arc::default(), &[1, 2]);
        bond.run(LacpStatus::Disabled, Instant::now());

        let mut settings = bond.settings();
        settings.mode = BondMode::ActiveBackup;
        assert!(bond.reconfigure(&settings));
        assert!(bond.buckets().iter().all(|b| b.slave.is_none()));
        assert_eq!(bond.choose_output_slave(&Flow::default(), None, 0), Some(1));
    }

    #[test]
    fn test_reconfigure_from_bad_config_keeps_settings() {
        let (bond, _) = bond_with(BondMode::BalanceSlb, Arc::default(), &[1]);
        let cfg = BondConfig {
            mode: "round-robin".to_string(),
            ..Default::default()
        };
        assert!(bond.reconfigure_from_config(&cfg).is_err());
        assert_eq!(bond.settings().mode, BondMode::BalanceSlb);
    }

    #[test]
    fn test_recirc_id_follows_mode() {
        let dp = Arc::new(MockDatapath {
            recirc: true,
            ..Default::default()
        });
        let (bond, _) = bond_with(BondMode::BalanceTcp, dp.clone(), &[1, 2]);
        assert_eq!(
            bond.may_recirc(),
            Some(RecircParams {
                recirc_id: 42,
                hash_bias: 0
            })
        );

        bond.run(LacpStatus::Disabled, Instant::now());
        assert_eq!(dp.flows.lock().len(), BOND_BUCKETS);
        assert!(bond.post_recirc_rules().iter().all(|r| r.is_installed()));

        let mut settings = bond.settings();
        settings.mode = BondMode::BalanceSlb;
        bond.reconfigure(&settings);
        assert_eq!(bond.may_recirc(), None);
        assert!(dp.flows.lock().is_empty());
        assert_eq!(*dp.freed.lock(), vec![42]);
    }

    #[test]
    fn test_drop_releases_recirc_rules() {
        let dp = Arc::new(MockDatapath {
            recirc: true,
            ..Default::default()
        });
        let (bond, _) = bond_with(BondMode::BalanceTcp, dp.clone(), &[1]);
        bond.run(LacpStatus::Disabled, Instant::now());
        let second_ref = bond.clone();

        drop(bond);
        assert_eq!(dp.flows.lock().len(), BOND_BUCKETS);

        drop(second_ref);
        assert!(dp.flows.lock().is_empty());
        assert_eq!(*dp.freed.lock(), vec![42]);
    }

    #[test]
    fn test_account_ignored_in_active_backup() {
        let (bond, _) = bond_with(BondMode::ActiveBackup, Arc::default(), &[1, 2]);
        bond.run(LacpStatus::Disabled, Instant::now());
        bond.account(&Flow::default(), 0, 1_000);
        assert!(bond.buckets().iter().all(|b| b.tx_bytes == 0));
    }

    #[test]
    fn test_force_rebalance_with_huge_counts() {
        let (bond, _) = bond_with(BondMode::BalanceSlb, Arc::default(), &[1, 2]);
        let now = Instant::now();
        bond.run(LacpStatus::Disabled, now);

        for i in 0..4u8 {
            let flow = Flow::from_eth_src(MacAddr::new([2, 0, 0, 0, 1, i]));
            bond.account(&flow, 0, u64::MAX / 2 + 1);
        }
        assert!(bond.force_rebalance(now) <= BOND_BUCKETS);
        assert!(bond.buckets().iter().all(|b| b.slave.is_some()));
    }

    #[test]
    fn test_rebalance_waits_for_interval() {
        let (bond, _) = bond_with(BondMode::BalanceSlb, Arc::default(), &[1, 2]);
        let t0 = Instant::now();
        bond.run(LacpStatus::Disabled, t0);
        let interval = bond.settings().rebalance_interval;

        assert_eq!(bond.rebalance(t0), 0);
        assert_eq!(bond.next_wakeup(), Some(t0 + interval));
        assert_eq!(bond.rebalance(t0 + interval / 2), 0);
    }

    #[test]
    fn test_learn_mac_respects_grat_arp_lock() {
        let (bond, _) = bond_with(BondMode::BalanceSlb, Arc::default(), &[1, 2]);
        let host = MacAddr::new([2, 0, 0, 0, 0, 0x10]);

        assert!(bond.learn_mac(&1, host, 0, true));
        assert!(!bond.learn_mac(&2, host, 0, false));
        assert!(bond.learn_mac(&2, host, 0, true));
        assert!(!bond.learn_mac(&9, host, 0, true));
    }

    #[test]
    fn test_migrate_validates_arguments() {
        let (bond, _) = bond_with(BondMode::BalanceSlb, Arc::default(), &[1, 2]);
        bond.run(LacpStatus::Disabled, Instant::now());

        assert_eq!(bond.migrate(BOND_BUCKETS, &1), Err(BondError::InvalidBucket(BOND_BUCKETS)));
        assert!(matches!(bond.migrate(0, &9), Err(BondError::SlaveNotFound(_))));

        let target = if bond.bucket_slave(0) == Some(1) { 2 } else { 1 };
        bond.migrate(0, &target).unwrap();
        assert_eq!(bond.bucket_slave(0), Some(target));
        assert!(bond.should_send_learning_packets());
    }

    #[test]
    fn test_active_slave_seeded_from_mac() {
        let mut settings = BondSettings::new("bond0", BondMode::ActiveBackup);
        settings.active_slave_mac = MacAddr::new([2, 0, 0, 0, 0, 2]);
        let bond: Arc<Bond<u32>> =
            Bond::create(settings, Arc::new(MockDatapath::default()), Arc::new(MockTable::default()));
        for n in [1u8, 2] {
            bond.register_slave(n as u32, n as u32, netdev(n));
            bond.set_may_enable(&(n as u32), true).unwrap();
        }
        bond.run(LacpStatus::Disabled, Instant::now());

        assert_eq!(bond.active_slave(), Some(2));
        assert_eq!(bond.take_changed_active_slave(false), Some(MacAddr::new([2, 0, 0, 0, 0, 2])));
        assert_eq!(bond.take_changed_active_slave(false), None);
        assert!(bond.take_changed_active_slave(true).is_some());
    }

    #[test]
    fn test_status_lists_slaves_by_port() {
        let (bond, _) = bond_with(BondMode::ActiveBackup, Arc::default(), &[3, 1]);
        bond.run(LacpStatus::Disabled, Instant::now());

        let status = bond.status();
        let names: Vec<&str> = status.slaves.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["eth1", "eth3"]);
        assert_eq!(status.active_slave, Some(1));

        let text = status.to_string();
        assert!(text.starts_with("---- bond0 ----"));
        assert!(text.contains("bond_mode: active-backup"));
        assert!(text.contains("slave eth1: enabled\n  active slave"));
    }
}
