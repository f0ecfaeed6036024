use crate::node::{ID_LEN, Node, NodeId, bucket_index, distance};
use rand::Rng;
use std::net::SocketAddrV4;

pub const BUCKET_COUNT: usize = 160;
pub const BUCKET_CAP: usize = 1600;

/// What `insert` did with the node; `Probe` asks the caller to send a
/// `find_node` to the address instead, keeping the table warm without
/// growing it.
#[derive(Debug, PartialEq, Eq)]
pub enum Insert {
    Added,
    Refreshed,
    Evicted,
    Probe(SocketAddrV4),
    Rejected,
}

/// 160 XOR-distance buckets around the local id. Bucket `i` holds nodes
/// whose distance to the local id has its highest set bit at position `i`.
pub struct RoutingTable {
    local: NodeId,
    buckets: Vec<Vec<Node>>,
}

impl RoutingTable {
    pub fn new(local: NodeId) -> RoutingTable {
        RoutingTable {
            local,
            buckets: (0..BUCKET_COUNT).map(|_| Vec::new()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }

    pub fn insert(&mut self, node: Node) -> Insert {
        let Some(idx) = bucket_index(&distance(&self.local.0, &node.id.0)) else {
            // Zero distance: the node claims our own id.
            return Insert::Rejected;
        };

        let bucket = &mut self.buckets[idx];
        if let Some(existing) = bucket.iter_mut().find(|n| n.id == node.id) {
            // Last-seen address wins.
            existing.addr = node.addr;
            return Insert::Refreshed;
        }

        if bucket.len() < BUCKET_CAP {
            bucket.push(node);
            return Insert::Added;
        }

        // Full bucket: a coin flip trades a uniformly-random member for the
        // newcomer, otherwise we only probe it. Deliberately biased toward
        // freshness over LRU bookkeeping.
        let mut rng = rand::thread_rng();
        if rng.gen_bool(0.5) {
            let victim = rng.gen_range(0..bucket.len());
            bucket.swap_remove(victim);
            bucket.push(node);
            Insert::Evicted
        } else {
            Insert::Probe(node.addr)
        }
    }

    /// Up to `k` known nodes closest to `target`: the target's home bucket
    /// first, then lower indices until `k` are gathered, then higher, with
    /// the final cut ranked across the whole union.
    pub fn closest(&self, target: &[u8; ID_LEN], k: usize) -> Vec<Node> {
        let home = bucket_index(&distance(&self.local.0, target)).unwrap_or(0);
        let mut pool: Vec<Node> = Vec::new();

        let mut gathered = 0;
        let mut idx = home as isize;
        while idx >= 0 && gathered < k {
            let picked = k_closest(self.buckets[idx as usize].iter().copied(), target, k);
            gathered += picked.len();
            pool.extend(picked);
            idx -= 1;
        }

        let mut gathered = 0;
        let mut idx = home + 1;
        while idx < BUCKET_COUNT && gathered < k {
            let picked = k_closest(self.buckets[idx].iter().copied(), target, k);
            gathered += picked.len();
            pool.extend(picked);
            idx += 1;
        }

        k_closest(pool, target, k)
    }
}

/// The `k` nodes nearest `target` by XOR distance, ascending, deduplicated
/// by id, distance ties broken by id. Shared by the routing table and the
/// per-info-hash searcher.
pub fn k_closest<I>(nodes: I, target: &[u8; ID_LEN], k: usize) -> Vec<Node>
where
    I: IntoIterator<Item = Node>,
{
    let mut all: Vec<Node> = nodes.into_iter().collect();
    all.sort_by(|a, b| {
        distance(&a.id.0, target)
            .cmp(&distance(&b.id.0, target))
            .then_with(|| a.id.cmp(&b.id))
    });
    all.dedup_by(|a, b| a.id == b.id);
    all.truncate(k);
    all
}
