#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use bond_core::{
    Bond, BondMode, BondSettings, Datapath, DatapathError, MacAddr, MacLearning, Netdev, OfPort,
    PostRecircMatch,
};
use parking_lot::Mutex;

pub struct TestNetdev {
    pub name: String,
    pub mac: MacAddr,
    pub carrier: AtomicBool,
}

impl TestNetdev {
    pub fn new(n: u8) -> Arc<Self> {
        Arc::new(Self {
            name: format!("eth{n}"),
            mac: MacAddr::new([0x02, 0, 0, 0, 0, n]),
            carrier: AtomicBool::new(true),
        })
    }

    pub fn set_carrier(&self, up: bool) {
        self.carrier.store(up, Ordering::Relaxed);
    }
}

impl Netdev for TestNetdev {
    fn name(&self) -> &str {
        &self.name
    }

    fn carrier(&self) -> bool {
        self.carrier.load(Ordering::Relaxed)
    }

    fn speed_mbps(&self) -> u32 {
        10_000
    }

    fn mac(&self) -> MacAddr {
        self.mac
    }
}

#[derive(Default)]
pub struct TestDatapath {
    pub recirc: bool,
    pub next_id: AtomicU32,
    pub flows: Mutex<HashMap<PostRecircMatch, (OfPort, u64)>>,
}

impl TestDatapath {
    pub fn with_recirc() -> Arc<Self> {
        Arc::new(Self {
            recirc: true,
            next_id: AtomicU32::new(1),
            ..Default::default()
        })
    }

    /// Port the installed rule for `dp_hash` outputs to
    pub fn dispatch(&self, recirc_id: u32, dp_hash: u32) -> Option<OfPort> {
        self.flows
            .lock()
            .iter()
            .find(|(m, _)| m.matches(recirc_id, dp_hash))
            .map(|(_, (port, _))| *port)
    }

    pub fn hit(&self, recirc_id: u32, dp_hash: u32, n_bytes: u64) {
        let mut flows = self.flows.lock();
        if let Some((_, (_, bytes))) = flows.iter_mut().find(|(m, _)| m.matches(recirc_id, dp_hash)) {
            *bytes += n_bytes;
        }
    }
}

impl Datapath for TestDatapath {
    fn supports_recirc(&self) -> bool {
        self.recirc
    }

    fn alloc_recirc_id(&self) -> Option<u32> {
        Some(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn free_recirc_id(&self, _recirc_id: u32) {}

    fn add_internal_flow(&self, rule: &PostRecircMatch, _priority: u16, out_port: OfPort) -> Result<(), DatapathError> {
        let mut flows = self.flows.lock();
        let bytes = flows.get(rule).map(|f| f.1).unwrap_or(0);
        flows.insert(*rule, (out_port, bytes));
        Ok(())
    }

    fn delete_internal_flow(&self, rule: &PostRecircMatch, _priority: u16) -> Result<(), DatapathError> {
        self.flows.lock().remove(rule);
        Ok(())
    }

    fn internal_flow_bytes(&self, rule: &PostRecircMatch) -> Option<u64> {
        self.flows.lock().get(rule).map(|f| f.1)
    }
}

#[derive(Default)]
pub struct TestMacTable {
    pub entries: Mutex<HashMap<(MacAddr, u16), u32>>,
}

impl MacLearning<u32> for TestMacTable {
    fn lookup(&self, mac: MacAddr, vlan: u16) -> Option<u32> {
        self.entries.lock().get(&(mac, vlan)).copied()
    }

    fn learn(&self, mac: MacAddr, vlan: u16, port: u32, _is_grat_arp: bool) {
        self.entries.lock().insert((mac, vlan), port);
    }

    fn is_grat_arp_locked(&self, _mac: MacAddr, _vlan: u16) -> bool {
        false
    }
}

pub struct Fixture {
    pub bond: Arc<Bond<u32>>,
    pub devs: Vec<Arc<TestNetdev>>,
    pub datapath: Arc<TestDatapath>,
    pub macs: Arc<TestMacTable>,
}

/// A bond with slaves 1..=n on ports 1..=n, all bondable but not yet run
pub fn fixture(settings: BondSettings, datapath: Arc<TestDatapath>, n: u8) -> Fixture {
    let macs = Arc::new(TestMacTable::default());
    let bond: Arc<Bond<u32>> = Bond::create(settings, datapath.clone(), macs.clone());
    let devs: Vec<Arc<TestNetdev>> = (1..=n).map(TestNetdev::new).collect();
    for (i, dev) in devs.iter().enumerate() {
        let handle = i as u32 + 1;
        bond.register_slave(handle, handle, dev.clone());
        bond.set_may_enable(&handle, true).unwrap();
    }
    Fixture {
        bond,
        devs,
        datapath,
        macs,
    }
}

pub fn simple(mode: BondMode, n: u8) -> Fixture {
    fixture(BondSettings::new("bond0", mode), Arc::new(TestDatapath::default()), n)
}

pub fn host(i: u32) -> MacAddr {
    let b = i.to_be_bytes();
    MacAddr::new([0x02, 0xaa, b[0], b[1], b[2], b[3]])
}
