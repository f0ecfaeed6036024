use crate::node::{InfoHash, Node};
use crate::routing::k_closest;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddrV4;
use std::time::{Duration, Instant};

// Iterative get_peers lookup state. The registry is a pure state machine:
// it hands back probe lists and terminal deliveries, the engine does the
// socket work. That split keeps convergence testable without a transport.

/// Attempts budget: rounds in which the closest set stopped changing before
/// the searcher gives up and delivers what it has.
pub const SEARCH_ATTEMPTS: u8 = 8;
/// How many of the closest known nodes receive the opening probes.
pub const INITIAL_FANOUT: usize = 16;
/// Size of the tracked closest set used for convergence detection.
pub const CLOSEST_SET: usize = 16;

/// 4-byte big-endian transaction id; all probes of one searcher share it.
pub type SearchId = [u8; 4];

#[derive(Debug)]
struct Searcher {
    info_hash: InfoHash,
    nodes: HashSet<Node>,
    peers: HashSet<SocketAddrV4>,
    attempts: u8,
    started: Instant,
}

/// Terminal outcome: the best-effort peer set, possibly empty. Convergence,
/// exhaustion, and deadline all look the same downstream.
#[derive(Debug, PartialEq, Eq)]
pub struct Found {
    pub info_hash: InfoHash,
    pub peers: HashSet<SocketAddrV4>,
}

/// What a response did to its searcher.
#[derive(Debug, PartialEq, Eq)]
pub enum Step {
    /// Transaction id unknown; the reply is harvest material, not ours.
    Ignored,
    /// Keep going: probe these nodes with the same transaction id.
    Probe {
        info_hash: InfoHash,
        nodes: Vec<Node>,
    },
    /// Converged or exhausted; deliver exactly once.
    Done(Found),
}

#[derive(Default)]
pub struct Registry {
    searchers: HashMap<SearchId, Searcher>,
    seq: u32,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    pub fn len(&self) -> usize {
        self.searchers.len()
    }

    pub fn contains(&self, t: &[u8]) -> bool {
        SearchId::try_from(t)
            .map(|t| self.searchers.contains_key(&t))
            .unwrap_or(false)
    }

    /// Registers a new searcher and returns its transaction id plus any
    /// searcher displaced by a sequence wrap, which is delivered terminally
    /// rather than dropped.
    pub fn start(&mut self, info_hash: InfoHash, now: Instant) -> (SearchId, Option<Found>) {
        self.seq = self.seq.wrapping_add(1);
        let t = self.seq.to_be_bytes();

        let displaced = self.searchers.insert(
            t,
            Searcher {
                info_hash,
                nodes: HashSet::new(),
                peers: HashSet::new(),
                attempts: SEARCH_ATTEMPTS,
                started: now,
            },
        );

        (
            t,
            displaced.map(|old| Found {
                info_hash: old.info_hash,
                peers: old.peers,
            }),
        )
    }

    /// Applies one reply. Set unions make this commutative, so reordered
    /// replies converge to the same result, just with different probe
    /// spend.
    pub fn on_response(&mut self, t: &[u8], nodes: Vec<Node>, values: Vec<SocketAddrV4>) -> Step {
        let Ok(t) = SearchId::try_from(t) else {
            return Step::Ignored;
        };
        let Some(mut searcher) = self.searchers.remove(&t) else {
            return Step::Ignored;
        };

        let old_closest: HashSet<Node> =
            k_closest(searcher.nodes.iter().copied(), &searcher.info_hash.0, CLOSEST_SET)
                .into_iter()
                .collect();

        searcher.nodes.extend(nodes);
        searcher.peers.extend(values);

        let new_closest =
            k_closest(searcher.nodes.iter().copied(), &searcher.info_hash.0, CLOSEST_SET);

        if new_closest.iter().copied().collect::<HashSet<Node>>() == old_closest {
            searcher.attempts -= 1;
        }

        if searcher.attempts > 0 {
            let info_hash = searcher.info_hash;
            self.searchers.insert(t, searcher);
            Step::Probe {
                info_hash,
                nodes: new_closest,
            }
        } else {
            Step::Done(Found {
                info_hash: searcher.info_hash,
                peers: searcher.peers,
            })
        }
    }

    /// Removes every searcher older than `deadline` and returns their
    /// accumulated peer sets for delivery.
    pub fn sweep_expired(&mut self, now: Instant, deadline: Duration) -> Vec<Found> {
        let expired: Vec<SearchId> = self
            .searchers
            .iter()
            .filter(|(_, s)| now.duration_since(s.started) >= deadline)
            .map(|(t, _)| *t)
            .collect();

        expired
            .into_iter()
            .filter_map(|t| self.searchers.remove(&t))
            .map(|s| Found {
                info_hash: s.info_hash,
                peers: s.peers,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeId;
    use std::net::Ipv4Addr;

    fn fixed_nodes(n: u8) -> Vec<Node> {
        (1..=n)
            .map(|i| {
                let mut id = [0u8; 20];
                id[19] = i;
                Node {
                    id: NodeId(id),
                    addr: SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, i), 7000 + i as u16),
                }
            })
            .collect()
    }

    #[test]
    fn transaction_ids_are_big_endian_sequence() {
        let mut registry = Registry::new();
        let now = Instant::now();
        let (t1, _) = registry.start(InfoHash([1; 20]), now);
        let (t2, _) = registry.start(InfoHash([2; 20]), now);
        assert_eq!(t1, [0, 0, 0, 1]);
        assert_eq!(t2, [0, 0, 0, 2]);
        assert!(registry.contains(&t1));
        assert!(!registry.contains(&[9, 9, 9, 9]));
    }

    #[test]
    fn converges_after_stable_rounds() {
        let mut registry = Registry::new();
        let nodes = fixed_nodes(16);
        let (t, _) = registry.start(InfoHash([0xab; 20]), Instant::now());

        // First reply grows the closest set from empty, so it does not
        // count against the attempts budget.
        let step = registry.on_response(&t, nodes.clone(), vec![]);
        let Step::Probe { info_hash, nodes: probes } = &step else {
            panic!("expected probe, got {step:?}");
        };
        assert_eq!(*info_hash, InfoHash([0xab; 20]));
        assert_eq!(probes.len(), 16);

        // Seven more stable rounds burn attempts 8 down to 1.
        for _ in 0..7 {
            let step = registry.on_response(&t, nodes.clone(), vec![]);
            let Step::Probe { nodes: probes, .. } = &step else {
                panic!("expected probe, got {step:?}");
            };
            assert_eq!(probes.len(), 16);
        }

        // The ninth reply exhausts the budget: one terminal delivery with
        // the (empty) peer set, and the searcher is gone.
        let step = registry.on_response(&t, nodes.clone(), vec![]);
        assert_eq!(
            step,
            Step::Done(Found {
                info_hash: InfoHash([0xab; 20]),
                peers: HashSet::new(),
            })
        );
        assert_eq!(registry.len(), 0);
        assert_eq!(registry.on_response(&t, nodes, vec![]), Step::Ignored);
    }

    #[test]
    fn fresh_nodes_reset_nothing_but_peers_accumulate() {
        let mut registry = Registry::new();
        let (t, _) = registry.start(InfoHash([0xcd; 20]), Instant::now());

        let peer_a = SocketAddrV4::new(Ipv4Addr::new(1, 1, 1, 1), 1111);
        let peer_b = SocketAddrV4::new(Ipv4Addr::new(2, 2, 2, 2), 2222);

        registry.on_response(&t, fixed_nodes(4), vec![peer_a]);
        registry.on_response(&t, fixed_nodes(8), vec![peer_b]);

        // Force the deadline and collect the delivery.
        let found = registry.sweep_expired(
            Instant::now() + Duration::from_secs(61),
            Duration::from_secs(60),
        );
        assert_eq!(found.len(), 1);
        assert_eq!(
            found[0].peers,
            HashSet::from([peer_a, peer_b])
        );
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn unknown_transaction_is_ignored() {
        let mut registry = Registry::new();
        assert_eq!(
            registry.on_response(&[0, 0, 0, 9], fixed_nodes(2), vec![]),
            Step::Ignored
        );
        assert_eq!(registry.on_response(b"aa", vec![], vec![]), Step::Ignored);
    }

    #[test]
    fn sequence_wrap_displaces_with_delivery() {
        let mut registry = Registry::new();
        registry.seq = u32::MAX - 1;
        let now = Instant::now();

        let (t_old, none) = registry.start(InfoHash([1; 20]), now);
        assert!(none.is_none());
        assert_eq!(t_old, [0xff, 0xff, 0xff, 0xff]);

        registry.seq = u32::MAX - 1; // simulate a full wrap landing on the same t
        let (t_new, displaced) = registry.start(InfoHash([2; 20]), now);
        assert_eq!(t_new, t_old);
        assert_eq!(displaced.unwrap().info_hash, InfoHash([1; 20]));
        assert_eq!(registry.len(), 1);
    }
}
