//! Ingress admissibility: whether a packet received on a slave should be
//! accepted, dropped, or dropped only if its MAC has moved.
//!
//! The switch's MAC-learning table is an external collaborator; the filter
//! only performs keyed lookups against it.

use std::fmt;

use crate::packet::MacAddr;
use crate::settings::{BondMode, LacpStatus};
use crate::slave::SlaveHandle;

/// Ingress verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Accept this packet
    Accept,
    /// Drop this packet
    Drop,
    /// Drop if a different port has been learned for the MAC; the caller
    /// should correct its learning state
    DropIfMoved,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Verdict::Accept => "accept",
            Verdict::Drop => "drop",
            Verdict::DropIfMoved => "drop-if-moved",
        };
        f.write_str(s)
    }
}

/// The switch's MAC-learning table, keyed by (MAC, VLAN).
///
/// Ports are identified with the same handle type the bond uses for slaves.
pub trait MacLearning<K>: Send + Sync {
    /// Port `mac` was last learned on
    fn lookup(&self, mac: MacAddr, vlan: u16) -> Option<K>;

    /// Record `mac` as reachable through `port`. A gratuitous ARP additionally
    /// locks the entry against non-gratuitous updates for a while.
    fn learn(&self, mac: MacAddr, vlan: u16, port: K, is_grat_arp: bool);

    /// Whether the entry is locked by a recent gratuitous ARP
    fn is_grat_arp_locked(&self, mac: MacAddr, vlan: u16) -> bool;
}

/// What the filter needs to know about the bond and the receiving slave
#[derive(Debug, Clone)]
pub struct AdmissionView<'a, K> {
    pub mode: BondMode,
    pub lacp_status: LacpStatus,
    pub lacp_fallback_ab: bool,
    pub lacp_fallback_id: bool,
    /// Active slave, or the lowest-numbered enabled slave under id fallback
    pub designated: Option<&'a K>,
    /// Whether the receiving slave belongs to the bond
    pub known: bool,
    pub enabled: bool,
    pub may_enable: bool,
}

/// Stateless ingress filter
#[derive(Debug, Clone, Copy, Default)]
pub struct AdmissibilityFilter;

impl AdmissibilityFilter {
    pub fn check<K: SlaveHandle>(
        view: &AdmissionView<'_, K>,
        slave: &K,
        dst: MacAddr,
        vlan: u16,
        ml: &dyn MacLearning<K>,
    ) -> Verdict {
        if !view.known {
            return Verdict::Drop;
        }

        // A negotiated LACP partner knows about the bond, so anything arriving
        // on a slave that is (or is about to be) enabled is fine.
        let mut single_link = view.mode == BondMode::ActiveBackup;
        match view.lacp_status {
            LacpStatus::Negotiated => {
                return if view.enabled || view.may_enable {
                    Verdict::Accept
                } else {
                    Verdict::Drop
                };
            }
            LacpStatus::Configured => {
                if !view.lacp_fallback_ab && !view.lacp_fallback_id {
                    return Verdict::Drop;
                }
                single_link = true;
            }
            LacpStatus::Disabled => {}
        }

        let on_designated = view.designated == Some(slave);

        if dst.is_multicast() && !on_designated {
            return Verdict::Drop;
        }

        if single_link {
            if on_designated {
                return Verdict::Accept;
            }
            // A host that has been learned behind this backup link has moved.
            return match ml.lookup(dst, vlan) {
                Some(port) if &port == slave => Verdict::DropIfMoved,
                _ => Verdict::Drop,
            };
        }

        match ml.lookup(dst, vlan) {
            None => Verdict::Accept,
            Some(port) if &port == slave => Verdict::Accept,
            Some(_) => Verdict::DropIfMoved,
        }
    }
}
