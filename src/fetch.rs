use crate::bencode::{self, Value};
use crate::config::Config;
use crate::node::InfoHash;
use crate::storage::{TorrentFile, TorrentRecord, TorrentSink};
use bytes::{Buf, Bytes, BytesMut};
use rand::Rng;
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use std::net::SocketAddrV4;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

// ut_metadata fetch: BT handshake with the extension reserved bit, BEP-10
// extended handshake, then the info dictionary in 16 KiB pieces (BEP-9),
// verified against the info-hash before anything is stored.

const PSTR: &[u8; 19] = b"BitTorrent protocol";
/// Bit 20 of the reserved field, i.e. reserved[5] & 0x10 (BEP-10).
const EXTENSION_BIT: u8 = 0x10;
const MSG_EXTENDED: u8 = 20;
const EXT_HANDSHAKE_ID: u8 = 0;
/// The ut_metadata id we advertise; peers address their metadata messages
/// to us with it.
const LOCAL_UT_METADATA: u8 = 1;

pub const METADATA_PIECE_SIZE: usize = 16 * 1024;

/// Frames past this size are junk for our purposes; even a maximum
/// metadata piece plus its bencoded header stays far below it.
const MAX_FRAME: usize = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("connect timed out")]
    ConnectTimeout,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("peer went quiet mid-exchange")]
    MessageTimeout,
    #[error("handshake mismatch")]
    HandshakeMismatch,
    #[error("peer does not support extension messages")]
    NoExtensions,
    #[error("peer did not advertise ut_metadata")]
    NoUtMetadata,
    #[error("missing or invalid metadata_size")]
    BadMetadataSize,
    #[error("metadata exceeds the size cap")]
    MetadataTooLarge,
    #[error("peer rejected metadata piece {0}")]
    Rejected(u32),
    #[error("malformed message")]
    Malformed,
    #[error("metadata hash does not match the info-hash")]
    InfoHashMismatch,
    #[error("malformed info dictionary")]
    MalformedInfo,
}

#[derive(Clone, Copy, Debug)]
pub struct FetchLimits {
    pub connect_timeout: Duration,
    pub message_timeout: Duration,
    pub peer_timeout: Duration,
    pub max_metadata_size: usize,
}

impl From<&Config> for FetchLimits {
    fn from(config: &Config) -> FetchLimits {
        FetchLimits {
            connect_timeout: config.fetch_connect_timeout,
            message_timeout: config.fetch_message_timeout,
            peer_timeout: config.fetch_peer_timeout,
            max_metadata_size: config.max_metadata_size,
        }
    }
}

/// Verified and parsed info dictionary, already normalized to the
/// multi-file shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub name: String,
    pub files: Vec<TorrentFile>,
}

/// Fetches, verifies, and stores metadata for one discovered info-hash.
/// Returns whether a record was written.
pub async fn run<S: TorrentSink>(
    info_hash: InfoHash,
    peers: Vec<SocketAddrV4>,
    sink: &S,
    limits: FetchLimits,
) -> anyhow::Result<bool> {
    let Some(metadata) = fetch_metadata(info_hash, &peers, limits).await else {
        return Ok(false);
    };

    // Another task or instance may have beaten us to it.
    if sink.exists(&info_hash).await? {
        return Ok(false);
    }

    let name = metadata.name.clone();
    sink.store(TorrentRecord::new(info_hash, metadata.name, metadata.files))
        .await?;
    tracing::info!(hash = %info_hash, name = %name, "fetch: stored metadata");
    Ok(true)
}

/// Walks the peer list sequentially; the first peer that yields a verified
/// info dictionary wins.
pub async fn fetch_metadata(
    info_hash: InfoHash,
    peers: &[SocketAddrV4],
    limits: FetchLimits,
) -> Option<Metadata> {
    for peer in peers {
        match timeout(limits.peer_timeout, fetch_from_peer(*peer, info_hash, limits)).await {
            Ok(Ok(metadata)) => return Some(metadata),
            Ok(Err(err)) => {
                tracing::debug!(%err, addr = %peer, hash = %info_hash, "fetch: peer failed");
            }
            Err(_) => {
                tracing::debug!(addr = %peer, hash = %info_hash, "fetch: peer deadline exceeded");
            }
        }
    }
    None
}

async fn fetch_from_peer(
    addr: SocketAddrV4,
    info_hash: InfoHash,
    limits: FetchLimits,
) -> Result<Metadata, FetchError> {
    let stream = timeout(limits.connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| FetchError::ConnectTimeout)??;

    let mut wire = Wire::new(stream, limits.message_timeout);
    wire.handshake(&info_hash).await?;
    let (ut_metadata_id, total_size) = wire.extended_handshake(limits.max_metadata_size).await?;
    let raw = wire.download(ut_metadata_id, total_size).await?;

    parse_verified(&info_hash, &raw)
}

/// Length-prefixed peer-wire framing over one TCP connection. Reads are
/// buffered: a frame may arrive split across reads, and one read may carry
/// several frames.
struct Wire {
    stream: TcpStream,
    buf: BytesMut,
    message_timeout: Duration,
}

impl Wire {
    fn new(stream: TcpStream, message_timeout: Duration) -> Wire {
        Wire {
            stream,
            buf: BytesMut::with_capacity(32 * 1024),
            message_timeout,
        }
    }

    /// 68-byte BEP-3 handshake with the BEP-10 extension bit. The reply
    /// must carry the same protocol string and info-hash, and the peer
    /// must support extensions.
    async fn handshake(&mut self, info_hash: &InfoHash) -> Result<(), FetchError> {
        let mut out = [0u8; 68];
        out[0] = 19;
        out[1..20].copy_from_slice(PSTR);
        out[25] |= EXTENSION_BIT;
        out[28..48].copy_from_slice(&info_hash.0);
        rand::thread_rng().fill(&mut out[48..68]);
        self.stream.write_all(&out).await?;

        let mut reply = [0u8; 68];
        timeout(self.message_timeout, self.stream.read_exact(&mut reply))
            .await
            .map_err(|_| FetchError::MessageTimeout)??;

        if reply[0] != 19 || &reply[1..20] != PSTR || reply[28..48] != info_hash.0 {
            return Err(FetchError::HandshakeMismatch);
        }
        if reply[25] & EXTENSION_BIT == 0 {
            return Err(FetchError::NoExtensions);
        }
        Ok(())
    }

    /// Announces `ut_metadata` and waits for the peer's extended handshake.
    /// Returns the peer's ut_metadata id and the declared metadata size.
    async fn extended_handshake(&mut self, max_size: usize) -> Result<(u8, usize), FetchError> {
        let mut m: BTreeMap<Vec<u8>, Value> = BTreeMap::new();
        m.insert(
            b"ut_metadata".to_vec(),
            Value::Int(LOCAL_UT_METADATA as i64),
        );
        let mut root: BTreeMap<Vec<u8>, Value> = BTreeMap::new();
        root.insert(b"m".to_vec(), Value::Dict(m));
        let payload = bencode::encode(&Value::Dict(root));
        self.send_extended(EXT_HANDSHAKE_ID, &payload).await?;

        loop {
            let (id, payload) = self.read_frame().await?;
            if id != MSG_EXTENDED || payload.first() != Some(&EXT_HANDSHAKE_ID) {
                continue;
            }
            let (dict, _) =
                bencode::decode_prefix(&payload[1..]).map_err(|_| FetchError::Malformed)?;

            let ut_metadata_id = dict
                .get(b"m")
                .and_then(|m| m.get(b"ut_metadata"))
                .and_then(Value::as_int)
                .and_then(|v| u8::try_from(v).ok())
                .ok_or(FetchError::NoUtMetadata)?;

            let total_size = dict
                .get(b"metadata_size")
                .and_then(Value::as_int)
                .ok_or(FetchError::BadMetadataSize)?;
            if total_size <= 0 {
                return Err(FetchError::BadMetadataSize);
            }
            let total_size = total_size as usize;
            if total_size > max_size {
                return Err(FetchError::MetadataTooLarge);
            }

            return Ok((ut_metadata_id, total_size));
        }
    }

    /// Requests pieces 0..ceil(total/16 KiB) in order and reassembles them.
    async fn download(&mut self, ut_metadata_id: u8, total_size: usize) -> Result<Vec<u8>, FetchError> {
        let piece_count = total_size.div_ceil(METADATA_PIECE_SIZE);
        let mut out: Vec<u8> = Vec::with_capacity(total_size);

        for piece in 0..piece_count as u32 {
            let mut request: BTreeMap<Vec<u8>, Value> = BTreeMap::new();
            request.insert(b"msg_type".to_vec(), Value::Int(0));
            request.insert(b"piece".to_vec(), Value::Int(piece as i64));
            self.send_extended(ut_metadata_id, &bencode::encode(&Value::Dict(request)))
                .await?;

            let expected = METADATA_PIECE_SIZE.min(total_size - out.len());
            loop {
                let (id, payload) = self.read_frame().await?;
                if id != MSG_EXTENDED || payload.first() != Some(&LOCAL_UT_METADATA) {
                    // Bitfields, haves, unrelated extensions: not ours.
                    continue;
                }
                let (header, used) =
                    bencode::decode_prefix(&payload[1..]).map_err(|_| FetchError::Malformed)?;

                match header.get(b"msg_type").and_then(Value::as_int) {
                    Some(2) => return Err(FetchError::Rejected(piece)),
                    Some(1) => {}
                    _ => continue,
                }
                if header.get(b"piece").and_then(Value::as_int) != Some(piece as i64) {
                    continue;
                }

                let data = &payload[1 + used..];
                if data.len() != expected {
                    return Err(FetchError::Malformed);
                }
                out.extend_from_slice(data);
                break;
            }
        }

        Ok(out)
    }

    async fn send_extended(&mut self, ext_id: u8, payload: &[u8]) -> Result<(), FetchError> {
        let mut out = Vec::with_capacity(payload.len() + 6);
        out.extend_from_slice(&((payload.len() + 2) as u32).to_be_bytes());
        out.push(MSG_EXTENDED);
        out.push(ext_id);
        out.extend_from_slice(payload);
        self.stream.write_all(&out).await?;
        Ok(())
    }

    /// Next non-keep-alive message as (id, payload).
    async fn read_frame(&mut self) -> Result<(u8, Bytes), FetchError> {
        loop {
            if self.buf.len() >= 4 {
                let len = u32::from_be_bytes(self.buf[..4].try_into().unwrap_or_default()) as usize;
                if len == 0 {
                    // Keep-alive.
                    self.buf.advance(4);
                    continue;
                }
                if len > MAX_FRAME {
                    return Err(FetchError::Malformed);
                }
                if self.buf.len() >= 4 + len {
                    self.buf.advance(4);
                    let mut frame = self.buf.split_to(len);
                    let id = frame.get_u8();
                    return Ok((id, frame.freeze()));
                }
            }

            let n = timeout(self.message_timeout, self.stream.read_buf(&mut self.buf))
                .await
                .map_err(|_| FetchError::MessageTimeout)??;
            if n == 0 {
                return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
            }
        }
    }
}

/// SHA-1 check against the declared info-hash, then the parse. `name` is
/// decoded as best-effort UTF-8; a single-file dictionary is normalized to
/// the multi-file shape.
fn parse_verified(info_hash: &InfoHash, raw: &[u8]) -> Result<Metadata, FetchError> {
    let digest: [u8; 20] = Sha1::digest(raw).into();
    if digest != info_hash.0 {
        return Err(FetchError::InfoHashMismatch);
    }

    let info = bencode::decode(raw).map_err(|_| FetchError::MalformedInfo)?;
    let name = info
        .get(b"name")
        .and_then(Value::as_bytes)
        .map(|b| String::from_utf8_lossy(b).into_owned())
        .ok_or(FetchError::MalformedInfo)?;

    let files = if let Some(entries) = info.get(b"files").and_then(Value::as_list) {
        entries
            .iter()
            .map(|entry| {
                let length = entry
                    .get(b"length")
                    .and_then(Value::as_int)
                    .ok_or(FetchError::MalformedInfo)?;
                let path = entry
                    .get(b"path")
                    .and_then(Value::as_list)
                    .ok_or(FetchError::MalformedInfo)?
                    .iter()
                    .filter_map(Value::as_bytes)
                    .map(|part| String::from_utf8_lossy(part).into_owned())
                    .collect();
                Ok(TorrentFile { length, path })
            })
            .collect::<Result<Vec<_>, FetchError>>()?
    } else if let Some(length) = info.get(b"length").and_then(Value::as_int) {
        vec![TorrentFile {
            length,
            path: vec![name.clone()],
        }]
    } else {
        return Err(FetchError::MalformedInfo);
    };

    Ok(Metadata { name, files })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    fn limits() -> FetchLimits {
        FetchLimits {
            connect_timeout: Duration::from_secs(1),
            message_timeout: Duration::from_secs(2),
            peer_timeout: Duration::from_secs(5),
            max_metadata_size: 10 * 1024 * 1024,
        }
    }

    fn single_file_info(name: &str, length: i64) -> Vec<u8> {
        let mut dict: BTreeMap<Vec<u8>, Value> = BTreeMap::new();
        dict.insert(b"name".to_vec(), Value::bytes(name.as_bytes()));
        dict.insert(b"length".to_vec(), Value::Int(length));
        dict.insert(b"piece length".to_vec(), Value::Int(16384));
        bencode::encode(&Value::Dict(dict))
    }

    fn hash_of(raw: &[u8]) -> InfoHash {
        InfoHash(Sha1::digest(raw).into())
    }

    fn handshake_reply(info_hash: &InfoHash, extensions: bool) -> [u8; 68] {
        let mut out = [0u8; 68];
        out[0] = 19;
        out[1..20].copy_from_slice(PSTR);
        if extensions {
            out[25] |= EXTENSION_BIT;
        }
        out[28..48].copy_from_slice(&info_hash.0);
        out[48..68].copy_from_slice(&[0x77; 20]);
        out
    }

    fn extended_frame(ext_id: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&((payload.len() + 2) as u32).to_be_bytes());
        out.push(MSG_EXTENDED);
        out.push(ext_id);
        out.extend_from_slice(payload);
        out
    }

    fn ext_handshake_payload(ut_metadata_id: i64, metadata_size: i64) -> Vec<u8> {
        let mut m: BTreeMap<Vec<u8>, Value> = BTreeMap::new();
        m.insert(b"ut_metadata".to_vec(), Value::Int(ut_metadata_id));
        let mut root: BTreeMap<Vec<u8>, Value> = BTreeMap::new();
        root.insert(b"m".to_vec(), Value::Dict(m));
        root.insert(b"metadata_size".to_vec(), Value::Int(metadata_size));
        bencode::encode(&Value::Dict(root))
    }

    fn data_piece_payload(piece: i64, data: &[u8]) -> Vec<u8> {
        let mut header: BTreeMap<Vec<u8>, Value> = BTreeMap::new();
        header.insert(b"msg_type".to_vec(), Value::Int(1));
        header.insert(b"piece".to_vec(), Value::Int(piece));
        let mut out = bencode::encode(&Value::Dict(header));
        out.extend_from_slice(data);
        out
    }

    /// A peer that replies to the handshake with `reply` and then plays
    /// back `frames`, keeping the socket open until the client goes away.
    async fn scripted_peer(reply: [u8; 68], frames: Vec<u8>) -> SocketAddrV4 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let SocketAddr::V4(addr) = listener.local_addr().unwrap() else {
            panic!("loopback listener should be v4");
        };

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut handshake = [0u8; 68];
            stream.read_exact(&mut handshake).await.unwrap();
            stream.write_all(&reply).await.unwrap();

            // Dribble the frames out in small chunks so the client sees
            // messages split across reads as well as coalesced ones.
            for chunk in frames.chunks(7) {
                if stream.write_all(chunk).await.is_err() {
                    return;
                }
            }

            let mut scratch = [0u8; 1024];
            while matches!(stream.read(&mut scratch).await, Ok(n) if n > 0) {}
        });

        addr
    }

    #[test]
    fn single_file_normalization() {
        let raw = single_file_info("ubuntu-24.04.iso", 123_456);
        let metadata = parse_verified(&hash_of(&raw), &raw).unwrap();
        assert_eq!(metadata.name, "ubuntu-24.04.iso");
        assert_eq!(
            metadata.files,
            vec![TorrentFile {
                length: 123_456,
                path: vec!["ubuntu-24.04.iso".to_string()],
            }]
        );
    }

    #[test]
    fn multi_file_paths_are_kept() {
        let mut file: BTreeMap<Vec<u8>, Value> = BTreeMap::new();
        file.insert(b"length".to_vec(), Value::Int(7));
        file.insert(
            b"path".to_vec(),
            Value::List(vec![Value::bytes(*b"dir"), Value::bytes(*b"a.txt")]),
        );
        let mut dict: BTreeMap<Vec<u8>, Value> = BTreeMap::new();
        dict.insert(b"name".to_vec(), Value::bytes(*b"pack"));
        dict.insert(b"files".to_vec(), Value::List(vec![Value::Dict(file)]));
        let raw = bencode::encode(&Value::Dict(dict));

        let metadata = parse_verified(&hash_of(&raw), &raw).unwrap();
        assert_eq!(metadata.files[0].path, vec!["dir", "a.txt"]);
    }

    #[test]
    fn hash_mismatch_is_rejected() {
        let raw = single_file_info("x", 1);
        let err = parse_verified(&InfoHash([0; 20]), &raw).unwrap_err();
        assert!(matches!(err, FetchError::InfoHashMismatch));
    }

    #[tokio::test]
    async fn peer_without_extension_bit_is_dropped() {
        let info_hash = InfoHash([0x42; 20]);
        let addr = scripted_peer(handshake_reply(&info_hash, false), Vec::new()).await;

        let got = fetch_metadata(info_hash, &[addr], limits()).await;
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn wrong_info_hash_in_handshake_is_dropped() {
        let info_hash = InfoHash([0x42; 20]);
        let addr = scripted_peer(handshake_reply(&InfoHash([0x43; 20]), true), Vec::new()).await;

        let got = fetch_metadata(info_hash, &[addr], limits()).await;
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn reassembled_pieces_failing_verification_are_discarded() {
        // Two pieces of garbage: sizes line up, the SHA-1 does not.
        let total = 20_000usize;
        let declared = InfoHash([0x99; 20]);

        let mut frames = extended_frame(EXT_HANDSHAKE_ID, &ext_handshake_payload(3, total as i64));
        frames.extend(extended_frame(
            LOCAL_UT_METADATA,
            &data_piece_payload(0, &vec![0xaa; METADATA_PIECE_SIZE]),
        ));
        frames.extend(extended_frame(
            LOCAL_UT_METADATA,
            &data_piece_payload(1, &vec![0xbb; total - METADATA_PIECE_SIZE]),
        ));

        let addr = scripted_peer(handshake_reply(&declared, true), frames).await;
        let got = fetch_metadata(declared, &[addr], limits()).await;
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn fetches_and_verifies_single_piece_metadata() {
        let raw = single_file_info("demo.bin", 512);
        let info_hash = hash_of(&raw);

        let mut frames = extended_frame(EXT_HANDSHAKE_ID, &ext_handshake_payload(3, raw.len() as i64));
        // A keep-alive and an unrelated message in between must be skipped.
        frames.extend_from_slice(&[0, 0, 0, 0]);
        frames.extend_from_slice(&[0, 0, 0, 1, 1]); // unchoke
        frames.extend(extended_frame(LOCAL_UT_METADATA, &data_piece_payload(0, &raw)));

        let addr = scripted_peer(handshake_reply(&info_hash, true), frames).await;
        let got = fetch_metadata(info_hash, &[addr], limits()).await.unwrap();
        assert_eq!(got.name, "demo.bin");
        assert_eq!(got.files[0].length, 512);
    }

    #[tokio::test]
    async fn oversized_metadata_is_refused() {
        let declared = InfoHash([0x13; 20]);
        let frames = extended_frame(
            EXT_HANDSHAKE_ID,
            &ext_handshake_payload(3, 11 * 1024 * 1024),
        );
        let addr = scripted_peer(handshake_reply(&declared, true), frames).await;
        assert!(fetch_metadata(declared, &[addr], limits()).await.is_none());
    }
}
