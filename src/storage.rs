use crate::node::InfoHash;
use bincode::Options;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::{SystemTime, UNIX_EPOCH};

const TORRENT_RECORD_MAGIC: [u8; 4] = *b"MGT1";

fn bincode_opts() -> impl bincode::Options {
    // Varint encoding reduces disk usage for small integers.
    // Limit prevents accidental OOM / huge allocations on corrupted data.
    bincode::DefaultOptions::new()
        .with_varint_encoding()
        .with_limit(16 * 1024 * 1024)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TorrentFile {
    pub length: i64,
    pub path: Vec<String>,
}

/// One discovered torrent. Single-file torrents are stored in the
/// multi-file shape with the torrent name as the only path component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TorrentRecord {
    pub info_hash_hex: String,
    pub name: String,
    pub files: Vec<TorrentFile>,
    pub added_unix_ms: i64,
}

impl TorrentRecord {
    pub fn new(info_hash: InfoHash, name: String, files: Vec<TorrentFile>) -> TorrentRecord {
        TorrentRecord {
            info_hash_hex: info_hash.to_hex(),
            name,
            files,
            added_unix_ms: now_unix_ms(),
        }
    }
}

fn now_unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// The persistence capability the engine and fetcher consume. The crawler
/// itself is stateless across restarts; only the sink is durable.
pub trait TorrentSink: Send + Sync + 'static {
    fn exists(&self, info_hash: &InfoHash) -> impl Future<Output = anyhow::Result<bool>> + Send;
    fn store(&self, record: TorrentRecord) -> impl Future<Output = anyhow::Result<()>> + Send;
}

#[derive(Clone)]
pub struct SledSink {
    db: sled::Db,
}

impl SledSink {
    pub fn new(db: sled::Db) -> SledSink {
        SledSink { db }
    }

    pub fn get(&self, info_hash: &InfoHash) -> anyhow::Result<Option<TorrentRecord>> {
        let Some(bytes) = self.db.get(key_for_hash(info_hash))? else {
            return Ok(None);
        };
        Ok(Some(decode_torrent_record(&bytes)?))
    }
}

impl TorrentSink for SledSink {
    async fn exists(&self, info_hash: &InfoHash) -> anyhow::Result<bool> {
        Ok(self.db.contains_key(key_for_hash(info_hash))?)
    }

    async fn store(&self, record: TorrentRecord) -> anyhow::Result<()> {
        let key = key_for_hash_hex(&record.info_hash_hex);
        let bytes = encode_torrent_record(&record)?;
        // First write wins; a concurrent duplicate is not an error.
        let _ = self.db.compare_and_swap(key, None::<&[u8]>, Some(bytes))?;
        Ok(())
    }
}

fn key_for_hash(info_hash: &InfoHash) -> Vec<u8> {
    key_for_hash_hex(&info_hash.to_hex())
}

fn key_for_hash_hex(info_hash_hex: &str) -> Vec<u8> {
    let mut key = b"torrent:".to_vec();
    key.extend_from_slice(info_hash_hex.as_bytes());
    key
}

fn encode_torrent_record(record: &TorrentRecord) -> anyhow::Result<Vec<u8>> {
    let payload = bincode_opts().serialize(record)?;
    let mut out = Vec::with_capacity(TORRENT_RECORD_MAGIC.len() + payload.len());
    out.extend_from_slice(&TORRENT_RECORD_MAGIC);
    out.extend_from_slice(&payload);
    Ok(out)
}

fn decode_torrent_record(bytes: &[u8]) -> anyhow::Result<TorrentRecord> {
    let payload = bytes
        .strip_prefix(&TORRENT_RECORD_MAGIC)
        .ok_or_else(|| anyhow::anyhow!("bad torrent record magic"))?;
    Ok(bincode_opts().deserialize(payload)?)
}
