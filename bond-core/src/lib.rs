//! Core library for link bonding.
//!
//! A bond aggregates several physical links ("slaves") into one logical port.
//! This crate decides, for every outgoing flow, which slave carries it, keeps
//! load even across slaves, tracks link state with debouncing, and filters
//! inbound traffic so a bond never loops or duplicates packets.
//!
//! # Architecture
//!
//! - `slave`: slaves, their network devices and the link-status state machine
//! - `hash` / `buckets`: flow hashing and the 256-entry hash-bucket table
//! - `rebalance`: periodic redistribution of buckets across enabled slaves
//! - `recirc`: post-recirculation rules for the balance-tcp fast path
//! - `admission` / `learning`: ingress filtering and gratuitous learning frames
//! - `bond`: the aggregate that ties the above together
//! - `registry`: name-indexed bonds and administrative commands
//!
//! The switch around the bond (network devices, datapath, MAC-learning table)
//! is supplied through the [`Netdev`], [`Datapath`] and [`MacLearning`]
//! traits. Time is passed in explicitly so every state machine can be driven
//! deterministically.

pub mod admission;
pub mod bond;
pub mod buckets;
pub mod error;
pub mod hash;
pub mod learning;
pub mod packet;
pub mod rebalance;
pub mod recirc;
pub mod registry;
pub mod settings;
pub mod slave;

pub use admission::{MacLearning, Verdict};
pub use bond::{Bond, BondStatus, RecircParams, SlaveStatus};
pub use error::BondError;
pub use learning::LearningPacket;
pub use packet::{Flow, FlowWildcards, MacAddr};
pub use recirc::{Datapath, DatapathError, PostRecircMatch};
pub use registry::BondRegistry;
pub use settings::{BondConfig, BondMode, BondSettings, LacpStatus, SettingsError};
pub use slave::{LinkState, Netdev, OfPort, SlaveHandle};
