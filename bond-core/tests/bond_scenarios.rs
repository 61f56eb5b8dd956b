mod common;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use bond_core::hash::{bucket_index, hash_l4, mac_bucket, BOND_BUCKETS};
use bond_core::rebalance::Rebalancer;
use bond_core::{BondMode, BondSettings, Flow, LacpStatus, LinkState, MacAddr, Verdict};
use common::{fixture, host, simple, TestDatapath};

fn assert_buckets_valid(f: &common::Fixture) {
    let enabled = f.bond.enabled_slaves();
    for bucket in f.bond.buckets() {
        if enabled.is_empty() {
            assert_eq!(bucket.slave, None, "bucket {} assigned with no enabled slave", bucket.index);
        } else {
            let slave = bucket.slave.expect("bucket unassigned");
            assert!(enabled.contains(&slave), "bucket {} on disabled slave {}", bucket.index, slave);
        }
    }
}

/// Distinct hosts landing in distinct buckets currently owned by `slave`
fn hosts_on(f: &common::Fixture, slave: u32, count: usize) -> Vec<MacAddr> {
    let basis = f.bond.settings().basis;
    let mut seen = HashSet::new();
    (0..100_000)
        .map(host)
        .filter(|mac| {
            let b = mac_bucket(*mac, 0, basis);
            f.bond.bucket_slave(b) == Some(slave) && seen.insert(b)
        })
        .take(count)
        .collect()
}

#[test]
fn test_enable_requires_may_enable_and_up_delay() {
    let mut settings = BondSettings::new("bond0", BondMode::BalanceSlb);
    settings.up_delay = Duration::from_millis(100);
    let f = fixture(settings, Default::default(), 2);
    f.bond.set_may_enable(&2, false).unwrap();
    let t0 = Instant::now();

    f.bond.run(LacpStatus::Disabled, t0);
    assert_eq!(f.bond.slave_link_state(&1), Some(LinkState::PendingUp));
    assert_eq!(f.bond.slave_link_state(&2), Some(LinkState::Down));
    assert_eq!(f.bond.next_wakeup(), Some(t0 + Duration::from_millis(100)));

    f.bond.run(LacpStatus::Disabled, t0 + Duration::from_millis(99));
    assert!(f.bond.enabled_slaves().is_empty());

    f.bond.run(LacpStatus::Disabled, t0 + Duration::from_millis(100));
    assert_eq!(f.bond.enabled_slaves(), vec![1]);
    assert!(!f.bond.is_enabled(&2));
}

#[test]
fn test_lacp_ignores_link_delays() {
    let mut settings = BondSettings::new("bond0", BondMode::BalanceTcp);
    settings.up_delay = Duration::from_secs(30);
    let f = fixture(settings, Default::default(), 2);

    f.bond.run(LacpStatus::Negotiated, Instant::now());
    assert_eq!(f.bond.enabled_slaves(), vec![1, 2]);
}

#[test]
fn test_buckets_always_on_enabled_slaves() {
    let f = simple(BondMode::BalanceSlb, 3);
    let t0 = Instant::now();
    f.bond.run(LacpStatus::Disabled, t0);
    assert_buckets_valid(&f);

    f.devs[1].set_carrier(false);
    f.bond.run(LacpStatus::Disabled, t0);
    assert_eq!(f.bond.enabled_slaves(), vec![1, 3]);
    assert_buckets_valid(&f);

    f.bond.set_may_enable(&1, false).unwrap();
    f.devs[2].set_carrier(false);
    f.bond.run(LacpStatus::Disabled, t0);
    assert!(f.bond.enabled_slaves().is_empty());
    assert_buckets_valid(&f);
    assert_eq!(f.bond.choose_output_slave(&Flow::from_eth_src(host(1)), None, 0), None);

    f.devs[1].set_carrier(true);
    f.bond.run(LacpStatus::Disabled, t0);
    assert_eq!(f.bond.enabled_slaves(), vec![2]);
    assert_buckets_valid(&f);
}

#[test]
fn test_unregister_repairs_buckets() {
    let f = simple(BondMode::BalanceSlb, 2);
    f.bond.run(LacpStatus::Disabled, Instant::now());

    assert!(f.bond.unregister_slave(&1));
    assert!(!f.bond.unregister_slave(&1));
    assert_eq!(f.bond.enabled_slaves(), vec![2]);
    assert_eq!(f.bond.active_slave(), Some(2));
    assert!(f.bond.buckets().iter().all(|b| b.slave == Some(2)));
    assert!(f.bond.run(LacpStatus::Disabled, Instant::now()));
}

#[test]
fn test_register_twice_is_idempotent() {
    let f = simple(BondMode::BalanceSlb, 2);
    f.bond.run(LacpStatus::Disabled, Instant::now());
    let before = f.bond.status();

    f.bond.register_slave(1, 1, f.devs[0].clone());
    assert_eq!(f.bond.status(), before);
    assert!(!f.bond.run(LacpStatus::Disabled, Instant::now()));
}

#[test]
fn test_reconfigure_round_trip() {
    let f = simple(BondMode::BalanceTcp, 2);
    f.bond.run(LacpStatus::Disabled, Instant::now());
    let buckets = f.bond.buckets();

    assert!(!f.bond.reconfigure(&f.bond.settings()));
    assert_eq!(f.bond.buckets(), buckets);
    assert!(!f.bond.run(LacpStatus::Disabled, Instant::now()));

    let mut changed = f.bond.settings();
    changed.basis = 7;
    assert!(f.bond.reconfigure(&changed));
}

#[test]
fn test_active_backup_failover() {
    let f = simple(BondMode::ActiveBackup, 2);
    let t0 = Instant::now();
    f.bond.run(LacpStatus::Disabled, t0);
    assert_eq!(f.bond.active_slave(), Some(1));
    assert_eq!(f.bond.take_changed_active_slave(false), Some(f.devs[0].mac));

    f.devs[0].set_carrier(false);
    f.bond.run(LacpStatus::Disabled, t0);

    assert_eq!(f.bond.active_slave(), Some(2));
    assert_eq!(f.bond.take_changed_active_slave(false), Some(f.devs[1].mac));
    assert_eq!(f.bond.choose_output_slave(&Flow::default(), None, 0), Some(2));

    // The recovered slave does not take over again.
    f.devs[0].set_carrier(true);
    f.bond.run(LacpStatus::Disabled, t0);
    assert_eq!(f.bond.active_slave(), Some(2));
    assert_eq!(f.bond.take_changed_active_slave(false), None);
}

#[test]
fn test_active_backup_admissibility() {
    let f = simple(BondMode::ActiveBackup, 2);
    f.bond.run(LacpStatus::Disabled, Instant::now());

    for dst in [host(1), host(2), MacAddr::BROADCAST] {
        assert_eq!(f.bond.check_admissibility(&1, dst, 0), Verdict::Accept);
        assert_eq!(f.bond.check_admissibility(&2, dst, 0), Verdict::Drop);
    }

    f.bond.learn_mac(&2, host(3), 0, false);
    assert_eq!(f.bond.check_admissibility(&2, host(3), 0), Verdict::DropIfMoved);
}

#[test]
fn test_slb_admissibility_follows_learning() {
    let f = simple(BondMode::BalanceSlb, 2);
    f.bond.run(LacpStatus::Disabled, Instant::now());

    assert_eq!(f.bond.check_admissibility(&2, host(1), 0), Verdict::Accept);
    f.bond.learn_mac(&1, host(1), 0, false);
    assert_eq!(f.bond.check_admissibility(&1, host(1), 0), Verdict::Accept);
    assert_eq!(f.bond.check_admissibility(&2, host(1), 0), Verdict::DropIfMoved);
}

#[test]
fn test_rebalance_converges() {
    let f = simple(BondMode::BalanceSlb, 2);
    let t0 = Instant::now();
    f.bond.run(LacpStatus::Disabled, t0);

    let hosts = hosts_on(&f, 1, 16);
    assert_eq!(hosts.len(), 16);
    let load = |i: usize| if i < 8 { 2_000_000 } else { 1_000_000 };
    let send = || {
        for (i, mac) in hosts.iter().enumerate() {
            f.bond.account(&Flow::from_eth_src(*mac), 0, load(i));
        }
    };

    send();
    let moves = f.bond.force_rebalance(t0);
    assert!(moves > 0);
    assert!(f.bond.buckets().iter().all(|b| b.tx_bytes == 0));

    let status = f.bond.status();
    let total: u64 = status.slaves.iter().map(|s| s.tx_bytes).sum();
    let skew = status.slaves[0].tx_bytes.abs_diff(status.slaves[1].tx_bytes);
    assert_eq!(total, 24_000_000);
    assert!(skew < Rebalancer::default().threshold(total), "skew {skew}");
    assert_buckets_valid(&f);

    send();
    assert_eq!(f.bond.force_rebalance(t0), 0);
}

#[test]
fn test_rebalance_triggers_learning_packets() {
    let f = simple(BondMode::BalanceSlb, 2);
    let t0 = Instant::now();
    f.bond.run(LacpStatus::Disabled, t0);
    f.bond.should_send_learning_packets();
    f.bond.compose_learning_packets(Vec::new());

    let hosts = hosts_on(&f, 1, 4);
    for mac in &hosts {
        f.bond.account(&Flow::from_eth_src(*mac), 0, 1_000_000);
    }
    let interval = f.bond.settings().rebalance_interval;
    assert_eq!(f.bond.rebalance(t0), 0);
    assert_eq!(f.bond.rebalance(t0 + interval), 2);

    assert!(f.bond.should_send_learning_packets());
    assert!(!f.bond.should_send_learning_packets());

    let unmoved = hosts_on(&f, 1, 1)[0];
    let packets = f.bond.compose_learning_packets(hosts.iter().map(|m| (*m, 0)).chain([(unmoved, 0)]));
    assert_eq!(packets.len(), 2);
    for p in &packets {
        assert_eq!(p.slave, 2);
        assert_eq!(&p.frame[6..12], &p.eth_src.octets());
    }
    assert!(f.bond.compose_learning_packets(hosts.iter().map(|m| (*m, 0))).is_empty());
}

#[test]
fn test_learning_packets_not_sent_under_lacp() {
    let f = simple(BondMode::BalanceSlb, 2);
    f.bond.run(LacpStatus::Negotiated, Instant::now());
    assert!(!f.bond.should_send_learning_packets());
}

#[test]
fn test_lacp_fallback_recovers() {
    let mut settings = BondSettings::new("bond0", BondMode::BalanceTcp);
    settings.lacp_fallback_ab = true;
    let f = fixture(settings, Default::default(), 2);
    let t0 = Instant::now();

    f.bond.run(LacpStatus::Configured, t0);
    let flows: Vec<Flow> = (0..64u16)
        .map(|p| Flow {
            tp_src: p,
            ..Default::default()
        })
        .collect();
    let outputs: HashSet<u32> = flows
        .iter()
        .filter_map(|fl| f.bond.choose_output_slave(fl, None, 0))
        .collect();
    assert_eq!(outputs, HashSet::from([1]));

    assert!(f.bond.run(LacpStatus::Negotiated, t0));
    let outputs: HashSet<u32> = flows
        .iter()
        .filter_map(|fl| f.bond.choose_output_slave(fl, None, 0))
        .collect();
    assert_eq!(outputs, HashSet::from([1, 2]));
}

#[test]
fn test_recirc_mapping_is_stable() {
    let datapath = TestDatapath::with_recirc();
    let f = fixture(BondSettings::new("bond0", BondMode::BalanceTcp), datapath.clone(), 2);
    let t0 = Instant::now();
    f.bond.run(LacpStatus::Disabled, t0);

    let params = f.bond.may_recirc().expect("recirculation active");
    let flow = Flow {
        tp_src: 4242,
        tp_dst: 80,
        nw_proto: 6,
        ..Default::default()
    };
    let dp_hash = hash_l4(&flow, params.hash_bias);
    let bucket = bucket_index(dp_hash);

    let first = f.bond.choose_output_slave(&flow, None, 0);
    for _ in 0..10 {
        assert_eq!(f.bond.choose_output_slave(&flow, None, 0), first);
        assert_eq!(datapath.dispatch(params.recirc_id, dp_hash), first);
    }
    let rule = &f.bond.post_recirc_rules()[bucket];
    assert!(rule.is_installed());
    assert_eq!(rule.installed_slave, first);

    // Account through the datapath, then force all of it onto the other link.
    datapath.hit(params.recirc_id, dp_hash, 5_000_000);
    f.bond.account(&flow, 0, 5_000_000);
    assert!(f.bond.buckets().iter().all(|b| b.tx_bytes == 0));

    let other = if first == Some(1) { 2 } else { 1 };
    f.bond.migrate(bucket, &other).unwrap();
    assert_eq!(f.bond.choose_output_slave(&flow, None, 0), Some(other));
    assert_eq!(datapath.dispatch(params.recirc_id, dp_hash), Some(other));
}

#[test]
fn test_recirc_stats_drive_rebalance() {
    let datapath = TestDatapath::with_recirc();
    let f = fixture(BondSettings::new("bond0", BondMode::BalanceTcp), datapath.clone(), 2);
    let t0 = Instant::now();
    f.bond.run(LacpStatus::Disabled, t0);
    let params = f.bond.may_recirc().expect("recirculation active");

    let on_one: Vec<u32> = (0..BOND_BUCKETS as u32)
        .filter(|b| f.bond.bucket_slave(*b as usize) == Some(1))
        .take(4)
        .collect();
    for b in &on_one {
        datapath.hit(params.recirc_id, *b, 1_000_000);
    }

    assert_eq!(f.bond.force_rebalance(t0), 2);
    let moved: Vec<u32> = on_one
        .iter()
        .copied()
        .filter(|b| datapath.dispatch(params.recirc_id, *b) == Some(2))
        .collect();
    assert_eq!(moved.len(), 2);

    // Cumulative stats did not change, so nothing moves again.
    assert_eq!(f.bond.force_rebalance(t0), 0);
}

#[test]
fn test_drop_is_deferred_until_last_reference() {
    let datapath = TestDatapath::with_recirc();
    let f = fixture(BondSettings::new("bond0", BondMode::BalanceTcp), datapath.clone(), 2);
    f.bond.run(LacpStatus::Disabled, Instant::now());
    let worker = f.bond.clone();

    drop(f);
    assert_eq!(datapath.flows.lock().len(), BOND_BUCKETS);
    assert!(worker.choose_output_slave(&Flow::default(), None, 0).is_some());

    drop(worker);
    assert!(datapath.flows.lock().is_empty());
}

#[test]
fn test_packet_path_runs_alongside_control_plane() {
    const READERS: usize = 4;

    let f = simple(BondMode::BalanceSlb, 4);
    f.bond.run(LacpStatus::Disabled, Instant::now());

    let stop = Arc::new(AtomicBool::new(false));
    let start = Arc::new(Barrier::new(READERS + 1));

    let readers: Vec<_> = (0..READERS as u32)
        .map(|r| {
            let bond = f.bond.clone();
            let stop = stop.clone();
            let start = start.clone();
            thread::spawn(move || {
                start.wait();
                let mut picks = 0u64;
                let mut i = 0u32;
                loop {
                    let mac = host(r * 1_000 + i % 1_000);
                    let flow = Flow::from_eth_src(mac);
                    if let Some(slave) = bond.choose_output_slave(&flow, None, 0) {
                        assert!((1..=4).contains(&slave), "unknown slave {slave}");
                        bond.account(&flow, 0, 1_500);
                        let _ = bond.check_admissibility(&slave, mac, 0);
                        picks += 1;
                    }

                    let assigned = bond.buckets().iter().filter(|b| b.slave.is_some()).count();
                    assert!(
                        assigned == 0 || assigned == BOND_BUCKETS,
                        "saw a table with {assigned} assigned buckets"
                    );

                    i = i.wrapping_add(1);
                    if stop.load(Ordering::Relaxed) {
                        break;
                    }
                }
                picks
            })
        })
        .collect();

    let (done_tx, done_rx) = mpsc::channel();
    let control = {
        let bond = f.bond.clone();
        let flapping = f.devs[2].clone();
        let spare = f.devs[3].clone();
        let start = start.clone();
        thread::spawn(move || {
            start.wait();
            let t0 = Instant::now();
            for n in 0..200u32 {
                let now = t0 + Duration::from_millis(n as u64);
                flapping.set_carrier(n % 7 != 0);
                bond.run(LacpStatus::Disabled, now);
                bond.force_rebalance(now);
                let _ = bond.migrate((n as usize * 37) % BOND_BUCKETS, &(n % 4 + 1));
                match n % 10 {
                    5 => {
                        bond.unregister_slave(&4);
                    }
                    9 => {
                        bond.register_slave(4, 4, spare.clone());
                        bond.set_may_enable(&4, true).unwrap();
                    }
                    _ => {}
                }
            }
            let _ = done_tx.send(());
        })
    };

    let finished = done_rx.recv_timeout(Duration::from_secs(30));
    stop.store(true, Ordering::Relaxed);
    assert!(finished.is_ok(), "control plane stalled while readers were running");

    control.join().unwrap();
    let picks: u64 = readers.into_iter().map(|h| h.join().unwrap()).sum();
    assert!(picks > 0);
    assert_buckets_valid(&f);
}
