//! In-memory stand-ins for the switch around the bonds: network devices, a
//! datapath flow table and a MAC-learning table.

use bond_core::{Datapath, DatapathError, MacAddr, MacLearning, Netdev, OfPort, PostRecircMatch};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// How long a gratuitous ARP protects a MAC-learning entry
pub const GRAT_ARP_LOCK_TIME: Duration = Duration::from_secs(5);

/// Upper bound on concurrently allocated recirculation ids
const MAX_RECIRC_IDS: usize = 1024;

/// A network device whose state is set by hand
#[derive(Debug)]
pub struct StaticNetdev {
    name: String,
    mac: MacAddr,
    carrier: AtomicBool,
    speed_mbps: u32,
}

impl StaticNetdev {
    pub fn new(name: impl Into<String>, mac: MacAddr, carrier: bool, speed_mbps: u32) -> Self {
        Self {
            name: name.into(),
            mac,
            carrier: AtomicBool::new(carrier),
            speed_mbps,
        }
    }

    pub fn set_carrier(&self, carrier: bool) {
        self.carrier.store(carrier, Ordering::Relaxed);
    }
}

impl Netdev for StaticNetdev {
    fn name(&self) -> &str {
        &self.name
    }

    fn carrier(&self) -> bool {
        self.carrier.load(Ordering::Relaxed)
    }

    fn speed_mbps(&self) -> u32 {
        self.speed_mbps
    }

    fn mac(&self) -> MacAddr {
        self.mac
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FlowEntry {
    out_port: OfPort,
    n_bytes: u64,
}

/// Flow table holding the bonds' internal post-recirculation rules
#[derive(Debug)]
pub struct MemoryDatapath {
    recirc: bool,
    next_recirc_id: AtomicU32,
    recirc_ids: Mutex<Vec<u32>>,
    flows: Mutex<HashMap<PostRecircMatch, FlowEntry>>,
    tx_packets: AtomicU64,
}

impl MemoryDatapath {
    pub fn new(recirc: bool) -> Self {
        Self {
            recirc,
            next_recirc_id: AtomicU32::new(1),
            recirc_ids: Mutex::new(Vec::new()),
            flows: Mutex::new(HashMap::new()),
            tx_packets: AtomicU64::new(0),
        }
    }

    /// Send a recirculated packet through the rule matching `recirc_id` and
    /// `dp_hash`, counting its bytes. Returns the output port.
    pub fn recirculate(&self, recirc_id: u32, dp_hash: u32, n_bytes: u64) -> Option<OfPort> {
        let mut flows = self.flows.lock();
        let (_, entry) = flows.iter_mut().find(|(m, _)| m.matches(recirc_id, dp_hash))?;
        entry.n_bytes += n_bytes;
        self.tx_packets.fetch_add(1, Ordering::Relaxed);
        Some(entry.out_port)
    }

    /// Record a packet transmitted directly on a port
    pub fn transmit(&self, _out_port: OfPort, _frame: &[u8]) {
        self.tx_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn flow_count(&self) -> usize {
        self.flows.lock().len()
    }

    pub fn tx_packets(&self) -> u64 {
        self.tx_packets.load(Ordering::Relaxed)
    }
}

impl Datapath for MemoryDatapath {
    fn supports_recirc(&self) -> bool {
        self.recirc
    }

    fn alloc_recirc_id(&self) -> Option<u32> {
        let mut ids = self.recirc_ids.lock();
        if ids.len() >= MAX_RECIRC_IDS {
            return None;
        }
        let id = self.next_recirc_id.fetch_add(1, Ordering::Relaxed);
        ids.push(id);
        Some(id)
    }

    fn free_recirc_id(&self, recirc_id: u32) {
        self.recirc_ids.lock().retain(|&id| id != recirc_id);
    }

    fn add_internal_flow(
        &self,
        rule: &PostRecircMatch,
        _priority: u16,
        out_port: OfPort,
    ) -> Result<(), DatapathError> {
        let mut flows = self.flows.lock();
        let n_bytes = flows.get(rule).map(|e| e.n_bytes).unwrap_or(0);
        flows.insert(*rule, FlowEntry { out_port, n_bytes });
        Ok(())
    }

    fn delete_internal_flow(&self, rule: &PostRecircMatch, _priority: u16) -> Result<(), DatapathError> {
        self.flows
            .lock()
            .remove(rule)
            .map(|_| ())
            .ok_or_else(|| DatapathError::NoSuchFlow(rule.to_string()))
    }

    fn internal_flow_bytes(&self, rule: &PostRecircMatch) -> Option<u64> {
        self.flows.lock().get(rule).map(|e| e.n_bytes)
    }
}

#[derive(Debug, Clone)]
struct MacEntry {
    port: String,
    grat_arp_until: Option<Instant>,
}

/// MAC-learning table keyed by (MAC, VLAN), with ports named by slave name
#[derive(Debug, Default)]
pub struct MemoryMacTable {
    entries: Mutex<HashMap<(MacAddr, u16), MacEntry>>,
}

impl MemoryMacTable {
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl MacLearning<String> for MemoryMacTable {
    fn lookup(&self, mac: MacAddr, vlan: u16) -> Option<String> {
        self.entries.lock().get(&(mac, vlan)).map(|e| e.port.clone())
    }

    fn learn(&self, mac: MacAddr, vlan: u16, port: String, is_grat_arp: bool) {
        let grat_arp_until = is_grat_arp.then(|| Instant::now() + GRAT_ARP_LOCK_TIME);
        self.entries.lock().insert((mac, vlan), MacEntry { port, grat_arp_until });
    }

    fn is_grat_arp_locked(&self, mac: MacAddr, vlan: u16) -> bool {
        self.entries
            .lock()
            .get(&(mac, vlan))
            .and_then(|e| e.grat_arp_until)
            .is_some_and(|until| Instant::now() < until)
    }
}
