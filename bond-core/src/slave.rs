//! Bond slaves and their link-status state machine.
//!
//! A slave is enabled (eligible to carry traffic) only after its link has
//! been up, and the client has reported it bondable, for the configured
//! up-delay. Disabling is debounced the same way with the down-delay. While
//! LACP is in use both delays are zero.

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::info;

use crate::packet::MacAddr;

/// OpenFlow-style port number
pub type OfPort = u32;

/// Client-chosen identifier of a slave.
///
/// The bond never looks inside a handle; it only stores, compares and hashes
/// it, and hands it back from link selection.
pub trait SlaveHandle: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static {}

impl<T> SlaveHandle for T where T: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static {}

/// Network device backing a slave. Owned by the client; the bond only reads it.
pub trait Netdev: Send + Sync {
    /// Device name
    fn name(&self) -> &str;

    /// Whether the physical link has carrier
    fn carrier(&self) -> bool;

    /// Link speed in Mbit/s, 0 if unknown
    fn speed_mbps(&self) -> u32;

    /// Hardware address of the device
    fn mac(&self) -> MacAddr;
}

/// Where a slave sits in its link-status state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Not bondable and not carrying traffic
    Down,
    /// Up and waiting out the up-delay
    PendingUp,
    /// Carrying traffic
    Enabled,
    /// Went down, still carrying traffic until the down-delay expires
    PendingDown,
    /// Bondable but without carrier
    Disabled,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LinkState::Down => "down",
            LinkState::PendingUp => "pending-up",
            LinkState::Enabled => "enabled",
            LinkState::PendingDown => "pending-down",
            LinkState::Disabled => "disabled",
        };
        f.write_str(s)
    }
}

/// Delays in force for one link-status update
#[derive(Debug, Clone, Copy)]
pub(crate) struct LinkDelays {
    pub up: Duration,
    pub down: Duration,
}

/// A single physical link of a bond
pub struct Slave<K> {
    handle: K,
    name: String,
    ofport: OfPort,
    netdev: Arc<dyn Netdev>,

    /// Instant after which `enabled` may change. `None` when no change is pending.
    delay_expires: Option<Instant>,
    /// May be chosen for flows
    enabled: bool,
    /// Client considers this slave bondable
    may_enable: bool,

    /// Bytes carried by this slave's buckets in the last rebalancing pass
    tx_bytes: u64,
}

impl<K: SlaveHandle> Slave<K> {
    pub(crate) fn new(handle: K, ofport: OfPort, netdev: Arc<dyn Netdev>) -> Self {
        Self {
            handle,
            name: netdev.name().to_string(),
            ofport,
            netdev,
            delay_expires: None,
            enabled: false,
            may_enable: false,
            tx_bytes: 0,
        }
    }

    pub fn handle(&self) -> &K {
        &self.handle
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ofport(&self) -> OfPort {
        self.ofport
    }

    pub fn netdev(&self) -> &Arc<dyn Netdev> {
        &self.netdev
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn may_enable(&self) -> bool {
        self.may_enable
    }

    pub fn delay_expires(&self) -> Option<Instant> {
        self.delay_expires
    }

    pub fn tx_bytes(&self) -> u64 {
        self.tx_bytes
    }

    pub fn link_state(&self) -> LinkState {
        match (self.enabled, self.delay_expires.is_some()) {
            (true, false) => LinkState::Enabled,
            (true, true) => LinkState::PendingDown,
            (false, true) => LinkState::PendingUp,
            (false, false) if self.may_enable => LinkState::Disabled,
            (false, false) => LinkState::Down,
        }
    }

    pub(crate) fn set_ofport(&mut self, ofport: OfPort) {
        self.ofport = ofport;
    }

    /// Swap the backing device. Returns true if it actually changed.
    pub(crate) fn set_netdev(&mut self, netdev: Arc<dyn Netdev>) -> bool {
        if Arc::ptr_eq(&self.netdev, &netdev) {
            return false;
        }
        self.name = netdev.name().to_string();
        self.netdev = netdev;
        true
    }

    pub(crate) fn set_may_enable(&mut self, may_enable: bool) {
        self.may_enable = may_enable;
    }

    pub(crate) fn record_load(&mut self, tx_bytes: u64) {
        self.tx_bytes = tx_bytes;
    }

    /// Advance the state machine to `now`.
    ///
    /// Returns `Some(enabled)` when the slave's `enabled` flag flipped.
    pub(crate) fn update_link_status(
        &mut self,
        now: Instant,
        delays: LinkDelays,
        bond: &str,
    ) -> Option<bool> {
        let up = self.netdev.carrier() && self.may_enable;

        if (up == self.enabled) != self.delay_expires.is_none() {
            info!(bond, slave = %self.name, "link state {}", if up { "up" } else { "down" });
            if up == self.enabled {
                self.delay_expires = None;
                info!(
                    bond,
                    slave = %self.name,
                    "will not be {}",
                    if up { "disabled" } else { "enabled" }
                );
            } else {
                let delay = if up { delays.up } else { delays.down };
                self.delay_expires = Some(now + delay);
                if !delay.is_zero() {
                    info!(
                        bond,
                        slave = %self.name,
                        "will be {} if it stays {} for {:?}",
                        if up { "enabled" } else { "disabled" },
                        if up { "up" } else { "down" },
                        delay
                    );
                }
            }
        }

        match self.delay_expires {
            Some(expires) if now >= expires => self.enable(up, bond),
            _ => None,
        }
    }

    fn enable(&mut self, enable: bool, bond: &str) -> Option<bool> {
        self.delay_expires = None;
        if enable == self.enabled {
            return None;
        }
        self.enabled = enable;
        info!(bond, slave = %self.name, "{}", if enable { "enabled" } else { "disabled" });
        Some(enable)
    }
}

impl<K: SlaveHandle> fmt::Debug for Slave<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slave")
            .field("handle", &self.handle)
            .field("name", &self.name)
            .field("ofport", &self.ofport)
            .field("enabled", &self.enabled)
            .field("may_enable", &self.may_enable)
            .field("delay_expires", &self.delay_expires)
            .finish()
    }
}
