use anyhow::{Context, Result};
use bond_core::hash::hash_l4;
use bond_core::{Bond, BondRegistry, BondSettings, Flow, LacpStatus, MacAddr, OfPort};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

use crate::config::{self, DaemonConfig};
use crate::sim::{MemoryDatapath, MemoryMacTable, StaticNetdev};
use crate::state::{self, PersistedState};

pub type LogFn = Box<dyn Fn(String) + Send + Sync + 'static>;

/// Per-bond inputs the daemon feeds in on every pass
#[derive(Debug, Clone)]
struct BondInputs {
    lacp: LacpStatus,
    hosts: Vec<MacAddr>,
}

/// The bonds of one switch together with the simulated switch around them
pub struct Switch {
    registry: BondRegistry<String>,
    inputs: RwLock<HashMap<String, BondInputs>>,
    netdevs: HashMap<String, Arc<StaticNetdev>>,
    ofports: HashMap<String, OfPort>,
    datapath: Arc<MemoryDatapath>,
    host_bytes: u64,
    state: Mutex<PersistedState>,
}

impl Switch {
    /// Create every configured bond. Active slaves remembered in `state` seed
    /// bonds whose config does not name one.
    pub fn build(cfg: &DaemonConfig, state: PersistedState) -> Result<Self> {
        config::validate(cfg)?;

        let datapath = Arc::new(MemoryDatapath::new(cfg.recirculation));
        let macs = Arc::new(MemoryMacTable::default());
        let registry = BondRegistry::new();
        let mut inputs = HashMap::new();
        let mut netdevs = HashMap::new();
        let mut ofports = HashMap::new();

        for entry in &cfg.bonds {
            let mut bond_cfg = entry.bond.clone();
            if bond_cfg.active_slave_mac.is_none() {
                bond_cfg.active_slave_mac = state.active_slaves.get(&bond_cfg.name).cloned();
            }
            let settings = BondSettings::try_from(&bond_cfg)
                .with_context(|| format!("bond {}", bond_cfg.name))?;
            let bond: Arc<Bond<String>> = Bond::create(settings, datapath.clone(), macs.clone());

            for slave in &entry.slaves {
                let mac: MacAddr = slave
                    .mac
                    .parse()
                    .with_context(|| format!("slave {}", slave.name))?;
                let dev = Arc::new(StaticNetdev::new(
                    slave.name.clone(),
                    mac,
                    slave.carrier,
                    slave.speed_mbps,
                ));
                bond.register_slave(slave.name.clone(), slave.ofport, dev.clone());
                bond.set_may_enable(&slave.name, true)?;
                netdevs.insert(slave.name.clone(), dev);
                ofports.insert(slave.name.clone(), slave.ofport);
            }

            let lacp = entry
                .lacp
                .parse()
                .with_context(|| format!("bond {}", bond_cfg.name))?;
            let hosts = entry
                .hosts
                .iter()
                .map(|h| h.parse::<MacAddr>())
                .collect::<Result<Vec<_>, _>>()
                .with_context(|| format!("bond {}", bond_cfg.name))?;
            inputs.insert(bond_cfg.name.clone(), BondInputs { lacp, hosts });
            registry.insert(bond)?;
        }

        Ok(Self {
            registry,
            inputs: RwLock::new(inputs),
            netdevs,
            ofports,
            datapath,
            host_bytes: cfg.host_bytes_per_tick,
            state: Mutex::new(state),
        })
    }

    pub fn registry(&self) -> &BondRegistry<String> {
        &self.registry
    }

    pub fn netdev(&self, name: &str) -> Option<&Arc<StaticNetdev>> {
        self.netdevs.get(name)
    }

    pub fn datapath(&self) -> &Arc<MemoryDatapath> {
        &self.datapath
    }

    /// Change the LACP status reported to a bond from the next pass on
    pub fn set_lacp_status(&self, bond: &str, lacp: LacpStatus) -> Result<()> {
        let mut inputs = self.inputs.write();
        let entry = inputs
            .get_mut(bond)
            .with_context(|| format!("no such bond: {bond}"))?;
        entry.lacp = lacp;
        Ok(())
    }

    pub fn state(&self) -> PersistedState {
        self.state.lock().clone()
    }

    /// Earliest instant any bond has work to do
    pub fn next_wakeup(&self) -> Option<Instant> {
        self.registry.bonds().iter().filter_map(|b| b.next_wakeup()).min()
    }

    /// One control-loop pass over every bond.
    ///
    /// Returns true if the persisted state changed.
    pub fn tick(&self, now: Instant, log: &LogFn) -> bool {
        let mut dirty = false;

        for bond in self.registry.bonds() {
            let name = bond.name();
            let Some(inputs) = self.inputs.read().get(&name).cloned() else {
                continue;
            };

            if bond.run(inputs.lacp, now) {
                log(format!("Bond {name}: flows revalidated"));
            }

            self.send_host_traffic(&bond, &inputs.hosts);

            let moved = bond.rebalance(now);
            if moved > 0 {
                log(format!("Bond {name}: rebalanced, moved {moved} bucket(s)"));
            }

            if bond.should_send_learning_packets() {
                let packets = bond.compose_learning_packets(inputs.hosts.iter().map(|m| (*m, 0)));
                for packet in &packets {
                    if let Some(port) = self.ofports.get(&packet.slave) {
                        self.datapath.transmit(*port, &packet.frame);
                    }
                }
                if !packets.is_empty() {
                    log(format!("Bond {name}: sent {} learning packet(s)", packets.len()));
                }
            }

            if let Some(mac) = bond.take_changed_active_slave(false) {
                let active = bond.active_slave().unwrap_or_else(|| "none".to_string());
                log(format!("Bond {name}: active slave is now {active} ({mac})"));
                let mut state = self.state.lock();
                if mac.is_zero() {
                    state.active_slaves.remove(&name);
                } else {
                    state.active_slaves.insert(name.clone(), mac.to_string());
                }
                dirty = true;
            }
        }

        dirty
    }

    /// Push one packet per host through the bond, the way the forwarding path
    /// would
    fn send_host_traffic(&self, bond: &Bond<String>, hosts: &[MacAddr]) {
        if self.host_bytes == 0 {
            return;
        }
        for mac in hosts {
            let flow = Flow::from_eth_src(*mac);
            if let Some(params) = bond.may_recirc() {
                let dp_hash = hash_l4(&flow, params.hash_bias);
                self.datapath.recirculate(params.recirc_id, dp_hash, self.host_bytes);
            } else if let Some(slave) = bond.choose_output_slave(&flow, None, 0) {
                bond.account(&flow, 0, self.host_bytes);
                if let Some(port) = self.ofports.get(&slave) {
                    self.datapath.transmit(*port, &[]);
                }
            }
        }
    }
}

/// Load the persisted state named by `cfg`, if any
pub fn load_state(cfg: &DaemonConfig) -> Result<PersistedState> {
    match &cfg.state_path {
        Some(path) => state::load(path),
        None => Ok(PersistedState::default()),
    }
}

pub async fn run_daemon(cfg: DaemonConfig, stop: watch::Receiver<bool>, log: LogFn) -> Result<()> {
    let state = load_state(&cfg)?;
    let switch = Arc::new(Switch::build(&cfg, state)?);
    run_switch(switch, cfg.tick_interval, cfg.state_path.clone(), stop, log).await
}

/// Drive `switch` until stopped: a pass every `tick_interval`, plus an extra
/// pass whenever a bond asks to be woken earlier.
pub async fn run_switch(
    switch: Arc<Switch>,
    tick_interval: Duration,
    state_path: Option<PathBuf>,
    mut stop: watch::Receiver<bool>,
    log: LogFn,
) -> Result<()> {
    log(format!(
        "Daemon config: bonds={:?} tick_interval={tick_interval:?} state_path={state_path:?}",
        switch.registry().list()
    ));

    let mut tick = tokio::time::interval(tick_interval);

    loop {
        let wake = switch.next_wakeup().map(tokio::time::Instant::from_std);

        tokio::select! {
            _ = tick.tick() => {
                pass(&switch, state_path.as_ref(), &log);
            }
            _ = wakeup(wake) => {
                pass(&switch, state_path.as_ref(), &log);
            }
            res = stop.changed() => {
                if res.is_err() || *stop.borrow() {
                    log("Stop requested".to_string());
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                log("Ctrl+C received".to_string());
                break;
            }
        }
    }

    Ok(())
}

fn pass(switch: &Switch, state_path: Option<&PathBuf>, log: &LogFn) {
    if !switch.tick(Instant::now(), log) {
        return;
    }
    if let Some(path) = state_path {
        if let Err(e) = state::save(path, &switch.state()) {
            log(format!("Failed to persist state: {e:#}"));
        }
    }
}

async fn wakeup(at: Option<tokio::time::Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
