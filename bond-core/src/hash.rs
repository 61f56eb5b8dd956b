//! Flow hashing used to spread traffic over hash buckets.
//!
//! The mixing steps are the 32-bit murmur3 block and finalizer functions, so
//! a given (fields, basis) pair always lands in the same bucket on every
//! platform and across restarts.

use std::net::IpAddr;

use crate::packet::{Flow, MacAddr};

/// Number of hash buckets per bond
pub const BOND_BUCKETS: usize = 256;

/// Mask reducing a flow hash to a bucket index
pub const BOND_MASK: u32 = 0xff;

fn mhash_add(hash: u32, data: u32) -> u32 {
    let mut data = data.wrapping_mul(0xcc9e_2d51);
    data = data.rotate_left(15);
    data = data.wrapping_mul(0x1b87_3593);
    let hash = (hash ^ data).rotate_left(13);
    hash.wrapping_mul(5).wrapping_add(0xe654_6b64)
}

fn mhash_finish(mut hash: u32) -> u32 {
    hash ^= hash >> 16;
    hash = hash.wrapping_mul(0x85eb_ca6b);
    hash ^= hash >> 13;
    hash = hash.wrapping_mul(0xc2b2_ae35);
    hash ^= hash >> 16;
    hash
}

/// Hash a sequence of 32-bit words with `basis` as the seed
pub fn hash_words(words: &[u32], basis: u32) -> u32 {
    let hash = words.iter().fold(basis, |h, &w| mhash_add(h, w));
    mhash_finish(hash ^ (words.len() as u32 * 4))
}

/// Source-hash: Ethernet source plus VLAN
pub fn hash_mac(mac: MacAddr, vlan: u16, basis: u32) -> u32 {
    let packed = (u64::from(vlan) << 48) | mac.to_u64();
    hash_words(&[packed as u32, (packed >> 32) as u32], basis)
}

fn fold_ip(addr: IpAddr) -> u32 {
    match addr {
        IpAddr::V4(v4) => u32::from(v4),
        IpAddr::V6(v6) => v6
            .octets()
            .chunks_exact(4)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .fold(0, |acc, w| acc ^ w),
    }
}

/// Transport-hash over the L3/L4 5-tuple.
///
/// Source and destination are combined symmetrically so both directions of a
/// connection use the same slave.
pub fn hash_l4(flow: &Flow, basis: u32) -> u32 {
    let addrs = fold_ip(flow.nw_src) ^ fold_ip(flow.nw_dst);
    let ports = u32::from(flow.tp_src ^ flow.tp_dst);
    let words = [
        addrs,
        u32::from(flow.nw_proto),
        ports,
        u32::from(flow.dl_type),
    ];
    hash_words(&words, basis)
}

/// Reduce a hash to its bucket index
pub fn bucket_index(hash: u32) -> usize {
    (hash & BOND_MASK) as usize
}

/// Bucket a MAC/VLAN pair maps to under source-hash for `basis`
pub fn mac_bucket(mac: MacAddr, vlan: u16, basis: u32) -> usize {
    bucket_index(hash_mac(mac, vlan, basis))
}
