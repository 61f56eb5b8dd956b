//! Packet-level types consumed by the bond: MAC addresses, the flow key that
//! link selection hashes over, wildcard tracking, and learning frames.
//!
//! Learning frames are RARP broadcasts in network byte order:
//!
//! - Destination MAC (6 bytes): broadcast
//! - Source MAC (6 bytes): the host being announced
//! - Optional 802.1Q tag (4 bytes): TPID 0x8100 + VLAN id
//! - EtherType (2 bytes): 0x8035 (RARP)
//! - ARP body (28 bytes): Ethernet/IPv4, opcode 3, SHA = THA = source MAC
//! - Zero padding up to the 60-byte Ethernet minimum

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

/// EtherType for reverse ARP, used by learning frames
pub const ETH_TYPE_RARP: u16 = 0x8035;

/// EtherType for IPv4
pub const ETH_TYPE_IP: u16 = 0x0800;

/// Tag protocol identifier for 802.1Q VLAN tags
pub const ETH_TYPE_VLAN: u16 = 0x8100;

/// Minimum Ethernet frame size without FCS
pub const ETH_MIN_FRAME_SIZE: usize = 60;

/// RARP "reverse request" opcode
const ARP_OP_RARP: u16 = 3;

/// VLAN ids occupy the low 12 bits of the TCI
pub const VLAN_VID_MASK: u16 = 0x0fff;

/// A 48-bit Ethernet address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    /// The all-zeros address
    pub const ZERO: Self = Self([0; 6]);

    /// The broadcast address
    pub const BROADCAST: Self = Self([0xff; 6]);

    pub fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Multicast (and broadcast) addresses have the group bit set
    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; 6]
    }

    /// Address packed into the low 48 bits of a `u64`
    pub fn to_u64(&self) -> u64 {
        self.0.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b))
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

/// MAC address parsing errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MacParseError {
    #[error("Invalid MAC address '{0}': expected six hex octets separated by ':' or '-'")]
    Format(String),
}

impl FromStr for MacAddr {
    type Err = MacParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split(|c| c == ':' || c == '-').collect();
        if parts.len() != 6 {
            return Err(MacParseError::Format(s.to_string()));
        }

        let mut octets = [0u8; 6];
        for (slot, part) in octets.iter_mut().zip(parts) {
            if part.is_empty() || part.len() > 2 || !part.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(MacParseError::Format(s.to_string()));
            }
            *slot = u8::from_str_radix(part, 16).map_err(|_| MacParseError::Format(s.to_string()))?;
        }
        Ok(Self(octets))
    }
}

/// The subset of a packet's headers that link selection looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flow {
    pub dl_src: MacAddr,
    pub dl_dst: MacAddr,
    pub dl_type: u16,
    pub nw_src: IpAddr,
    pub nw_dst: IpAddr,
    pub nw_proto: u8,
    pub tp_src: u16,
    pub tp_dst: u16,
}

impl Default for Flow {
    fn default() -> Self {
        Self {
            dl_src: MacAddr::ZERO,
            dl_dst: MacAddr::ZERO,
            dl_type: ETH_TYPE_IP,
            nw_src: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            nw_dst: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            nw_proto: 0,
            tp_src: 0,
            tp_dst: 0,
        }
    }
}

impl Flow {
    /// Flow carrying only an Ethernet source, as used for source-hash decisions
    pub fn from_eth_src(dl_src: MacAddr) -> Self {
        Self {
            dl_src,
            ..Default::default()
        }
    }
}

/// Fields a forwarding decision depended on.
///
/// Callers that cache decisions as datapath flows must match on every field
/// set here; anything left clear may be wildcarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlowWildcards(u16);

impl FlowWildcards {
    /// Ethernet source
    pub const DL_SRC: u16 = 0b0000_0000_0001;

    /// Ethernet destination
    pub const DL_DST: u16 = 0b0000_0000_0010;

    /// EtherType
    pub const DL_TYPE: u16 = 0b0000_0000_0100;

    /// VLAN id
    pub const VLAN: u16 = 0b0000_0000_1000;

    /// IP source
    pub const NW_SRC: u16 = 0b0000_0001_0000;

    /// IP destination
    pub const NW_DST: u16 = 0b0000_0010_0000;

    /// IP protocol
    pub const NW_PROTO: u16 = 0b0000_0100_0000;

    /// Transport source port
    pub const TP_SRC: u16 = 0b0000_1000_0000;

    /// Transport destination port
    pub const TP_DST: u16 = 0b0001_0000_0000;

    /// Everything wildcarded
    pub fn catchall() -> Self {
        Self(0)
    }

    /// Mark fields as significant
    pub fn unwildcard(&mut self, fields: u16) {
        self.0 |= fields;
    }

    /// Check if a field is significant
    pub fn is_exact(&self, field: u16) -> bool {
        self.0 & field != 0
    }

    pub fn raw(&self) -> u16 {
        self.0
    }
}

/// Build the RARP frame that announces `eth_src` on `vlan` (0 = untagged).
pub fn compose_rarp(eth_src: MacAddr, vlan: u16) -> Vec<u8> {
    let mut buf = Vec::with_capacity(ETH_MIN_FRAME_SIZE + 4);
    buf.extend_from_slice(&MacAddr::BROADCAST.octets());
    buf.extend_from_slice(&eth_src.octets());

    let vid = vlan & VLAN_VID_MASK;
    if vid != 0 {
        buf.extend_from_slice(&ETH_TYPE_VLAN.to_be_bytes());
        buf.extend_from_slice(&vid.to_be_bytes());
    }
    buf.extend_from_slice(&ETH_TYPE_RARP.to_be_bytes());

    // ARP body: hardware type Ethernet, protocol IPv4.
    buf.extend_from_slice(&1u16.to_be_bytes());
    buf.extend_from_slice(&ETH_TYPE_IP.to_be_bytes());
    buf.push(6);
    buf.push(4);
    buf.extend_from_slice(&ARP_OP_RARP.to_be_bytes());
    buf.extend_from_slice(&eth_src.octets());
    buf.extend_from_slice(&[0u8; 4]);
    buf.extend_from_slice(&eth_src.octets());
    buf.extend_from_slice(&[0u8; 4]);

    if buf.len() < ETH_MIN_FRAME_SIZE {
        buf.resize(ETH_MIN_FRAME_SIZE, 0);
    }
    buf
}
