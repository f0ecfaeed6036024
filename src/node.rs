use rand::Rng;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

pub const ID_LEN: usize = 20;

/// Compact node info: 20-byte id + 4-byte IPv4 + 2-byte big-endian port.
pub const COMPACT_NODE_LEN: usize = 26;
/// Compact peer info: 4-byte IPv4 + 2-byte big-endian port.
pub const COMPACT_PEER_LEN: usize = 6;

/// 160-bit DHT node identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub [u8; ID_LEN]);

/// 160-bit torrent identifier (SHA-1 of the info dictionary). Distinct from
/// `NodeId` but lives in the same key space, so the XOR metric applies.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InfoHash(pub [u8; ID_LEN]);

impl NodeId {
    pub fn random() -> NodeId {
        let mut id = [0u8; ID_LEN];
        rand::thread_rng().fill(&mut id[..]);
        NodeId(id)
    }

    pub fn from_slice(raw: &[u8]) -> Option<NodeId> {
        Some(NodeId(raw.try_into().ok()?))
    }
}

impl InfoHash {
    pub fn from_slice(raw: &[u8]) -> Option<InfoHash> {
        Some(InfoHash(raw.try_into().ok()?))
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// XOR metric over the 160-bit key space, big-endian.
pub fn distance(a: &[u8; ID_LEN], b: &[u8; ID_LEN]) -> [u8; ID_LEN] {
    let mut out = [0u8; ID_LEN];
    for i in 0..ID_LEN {
        out[i] = a[i] ^ b[i];
    }
    out
}

/// Position of the highest set bit of the distance (bit 0 = least
/// significant). `None` means zero distance: the id is our own.
pub fn bucket_index(distance: &[u8; ID_LEN]) -> Option<usize> {
    for (i, byte) in distance.iter().enumerate() {
        if *byte != 0 {
            let high_bit = 7 - byte.leading_zeros() as usize;
            return Some((ID_LEN - 1 - i) * 8 + high_bit);
        }
    }
    None
}

/// A DHT contact. Identity for routing purposes is the id; the full
/// (id, addr) pair is what set-union in the searcher deduplicates on.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Node {
    pub id: NodeId,
    pub addr: SocketAddrV4,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.addr)
    }
}

fn usable_addr(addr: &SocketAddrV4) -> bool {
    addr.port() != 0 && !addr.ip().is_unspecified()
}

pub fn encode_nodes(nodes: &[Node]) -> Vec<u8> {
    let mut out = Vec::with_capacity(nodes.len() * COMPACT_NODE_LEN);
    for node in nodes {
        out.extend_from_slice(&node.id.0);
        out.extend_from_slice(&node.addr.ip().octets());
        out.extend_from_slice(&node.addr.port().to_be_bytes());
    }
    out
}

/// Splits the blob into 26-byte records; a short tail is ignored, as are
/// records with port 0 or the unspecified address.
pub fn decode_nodes(raw: &[u8]) -> Vec<Node> {
    let mut out = Vec::with_capacity(raw.len() / COMPACT_NODE_LEN);
    for chunk in raw.chunks_exact(COMPACT_NODE_LEN) {
        let Some(id) = NodeId::from_slice(&chunk[..ID_LEN]) else {
            continue;
        };
        let ip = Ipv4Addr::new(chunk[20], chunk[21], chunk[22], chunk[23]);
        let port = u16::from_be_bytes([chunk[24], chunk[25]]);
        let addr = SocketAddrV4::new(ip, port);
        if usable_addr(&addr) {
            out.push(Node { id, addr });
        }
    }
    out
}

/// One compact peer record, filtered like nodes.
pub fn decode_peer(raw: &[u8]) -> Option<SocketAddrV4> {
    if raw.len() != COMPACT_PEER_LEN {
        return None;
    }
    let ip = Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]);
    let addr = SocketAddrV4::new(ip, u16::from_be_bytes([raw[4], raw[5]]));
    usable_addr(&addr).then_some(addr)
}
