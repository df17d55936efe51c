// Integration tests for multicast relaying with visited-site cycle
// prevention
//
// Topologies are built from pairwise bridge clusters; a down-multicast
// originated in one site must surface exactly once at every node of every
// other site, regardless of relay cycles in the bridge graph.

use parking_lot::Mutex;
use relaymesh_core::relay::{BridgeConfig, SiteConfig};
use relaymesh_core::{
    LocalNetwork, Message, MsgFlags, RelayDelegate, RelayEngine, RelayOptions,
};
use std::sync::Arc;

#[derive(Default)]
struct Collector {
    delivered: Mutex<Vec<Message>>,
}

impl RelayDelegate for Collector {
    fn deliver(&self, msg: Message) {
        self.delivered.lock().push(msg);
    }

    fn site_unreachable(&self, _site: &str) {}
}

impl Collector {
    fn count_of(&self, payload: &[u8]) -> usize {
        self.delivered.lock().iter().filter(|m| m.payload == payload).count()
    }
}

fn options(site: &str, site_map: &[(&str, &[&str])]) -> RelayOptions {
    let mut opts = RelayOptions::new(site)
        .cluster(format!("{site}-cluster"))
        .async_relay_creation(false);
    for (name, bridges) in site_map {
        let cfg = SiteConfig {
            bridges: bridges.iter().map(|c| BridgeConfig { cluster: c.to_string() }).collect(),
        };
        opts = opts.add_site(*name, cfg);
    }
    opts
}

fn start_node(net: &LocalNetwork, opts: RelayOptions) -> (RelayEngine, Arc<Collector>) {
    let engine = RelayEngine::new(opts, Arc::new(net.clone())).unwrap();
    let collector = Arc::new(Collector::default());
    engine.set_delegate(Some(collector.clone()));
    engine.start().unwrap();
    (engine, collector)
}

/// A chain: A-B and B-C are bridged, A and C are not.
const CHAIN: &[(&str, &[&str])] =
    &[("A", &["bridge-ab"]), ("B", &["bridge-ab", "bridge-bc"]), ("C", &["bridge-bc"])];

/// A triangle: every pair of sites shares a bridge.
const TRIANGLE: &[(&str, &[&str])] = &[
    ("A", &["bridge-ab", "bridge-ca"]),
    ("B", &["bridge-ab", "bridge-bc"]),
    ("C", &["bridge-bc", "bridge-ca"]),
];

#[test]
fn test_chain_multicast_delivered_exactly_once_per_node() {
    let net = LocalNetwork::new();
    let (a_master, a1) = start_node(&net, options("A", CHAIN));
    let (_a2, a2) = start_node(&net, options("A", CHAIN));
    let (_b_master, b1) = start_node(&net, options("B", CHAIN));
    let (_b2, b2) = start_node(&net, options("B", CHAIN));
    let (_c_master, c1) = start_node(&net, options("C", CHAIN));

    let payload = b"fanout".to_vec();
    a_master.send(Message::multicast().with_payload(payload.clone())).unwrap();

    // Every node in every site, including the relaying masters, sees the
    // multicast exactly once. B relays onward to C; C relays nowhere.
    for inbox in [&a1, &a2, &b1, &b2, &c1] {
        assert_eq!(inbox.count_of(&payload), 1);
    }

    println!("✓ chain multicast: exactly one delivery per node");
}

#[test]
fn test_triangle_multicast_has_no_echo() {
    let net = LocalNetwork::new();
    let (a_master, a1) = start_node(&net, options("A", TRIANGLE));
    let (_b_master, b1) = start_node(&net, options("B", TRIANGLE));
    let (_b2, b2) = start_node(&net, options("B", TRIANGLE));
    let (_c_master, c1) = start_node(&net, options("C", TRIANGLE));

    let payload = b"ring".to_vec();
    a_master.send(Message::multicast().with_payload(payload.clone())).unwrap();

    // A reaches B and C directly; the visited set it attaches covers all
    // three sites, so neither B nor C forwards again.
    for inbox in [&a1, &b1, &b2, &c1] {
        assert_eq!(inbox.count_of(&payload), 1);
    }

    println!("✓ triangle multicast: cycle prevention holds");
}

#[test]
fn test_multicast_from_non_master_is_relayed_by_master() {
    let net = LocalNetwork::new();
    let (_a_master, a1) = start_node(&net, options("A", CHAIN));
    let (a_member, a2) = start_node(&net, options("A", CHAIN));
    let (_b_master, b1) = start_node(&net, options("B", CHAIN));

    let payload = b"from-member".to_vec();
    a_member.send(Message::multicast().with_payload(payload.clone())).unwrap();

    assert_eq!(a1.count_of(&payload), 1);
    assert_eq!(a2.count_of(&payload), 1);
    assert_eq!(b1.count_of(&payload), 1);

    println!("✓ a member's multicast is relayed by the site master");
}

#[test]
fn test_no_relay_flag_keeps_multicast_local() {
    let net = LocalNetwork::new();
    let (a_master, a1) = start_node(&net, options("A", CHAIN));
    let (_b_master, b1) = start_node(&net, options("B", CHAIN));

    let payload = b"local-only".to_vec();
    a_master
        .send(Message::multicast().with_payload(payload.clone()).with_flag(MsgFlags::NO_RELAY))
        .unwrap();

    assert_eq!(a1.count_of(&payload), 1);
    assert_eq!(b1.count_of(&payload), 0);

    println!("✓ NO_RELAY multicasts never cross bridges");
}

#[test]
fn test_batch_up_path_matches_single_path() {
    let net = LocalNetwork::new();
    let (a_master, a1) = start_node(&net, options("A", CHAIN));
    let (_b_master, b1) = start_node(&net, options("B", CHAIN));

    // Feed a batch containing a multicast and a plain message directly
    // into the up path, as a transport delivering a bundled frame would.
    let m1 = Message::multicast().with_payload(b"batched".to_vec());
    let m2 = Message::to(a_master.local_addr()).with_payload(b"direct".to_vec());
    a_master.up_batch(vec![m1, m2]);

    assert_eq!(a1.count_of(b"batched"), 1);
    assert_eq!(a1.count_of(b"direct"), 1);
    // The multicast in the batch was still relayed across the bridge.
    assert_eq!(b1.count_of(b"batched"), 1);

    println!("✓ batch up path relays and delivers like the single path");
}
