use crate::bencode::{self, Value};
use crate::node::{InfoHash, Node, NodeId, decode_nodes, decode_peer, encode_nodes};
use std::collections::BTreeMap;
use std::net::SocketAddrV4;

// Typed view of KRPC. The bencode tree stops at this boundary: everything
// past it works with these enums, not raw dictionaries.

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum KrpcError {
    #[error(transparent)]
    Bencode(#[from] bencode::BencodeError),
    #[error("missing or ill-typed {0} field")]
    Field(&'static str),
    #[error("unknown message type")]
    UnknownType,
    #[error("unknown query")]
    UnknownQuery,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub transaction_id: Vec<u8>,
    pub body: Body,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Query(Query),
    Response(Response),
    Error(RemoteError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    Ping {
        id: NodeId,
    },
    FindNode {
        id: NodeId,
        target: NodeId,
    },
    GetPeers {
        id: NodeId,
        info_hash: InfoHash,
    },
    AnnouncePeer {
        id: NodeId,
        info_hash: InfoHash,
        port: Option<u16>,
        implied_port: bool,
    },
}

impl Query {
    pub fn sender_id(&self) -> NodeId {
        match self {
            Query::Ping { id }
            | Query::FindNode { id, .. }
            | Query::GetPeers { id, .. }
            | Query::AnnouncePeer { id, .. } => *id,
        }
    }
}

/// Replies are untagged on the wire; one shape covers every query we send.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Response {
    pub id: Option<NodeId>,
    pub nodes: Vec<Node>,
    pub values: Vec<SocketAddrV4>,
    pub token: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    pub code: i64,
    pub message: String,
}

pub fn encode(msg: &Message) -> Vec<u8> {
    let mut top: BTreeMap<Vec<u8>, Value> = BTreeMap::new();
    top.insert(b"t".to_vec(), Value::bytes(msg.transaction_id.clone()));

    match &msg.body {
        Body::Query(query) => {
            top.insert(b"y".to_vec(), Value::bytes(*b"q"));
            let (name, args) = encode_query(query);
            top.insert(b"q".to_vec(), Value::bytes(name));
            top.insert(b"a".to_vec(), Value::Dict(args));
        }
        Body::Response(response) => {
            top.insert(b"y".to_vec(), Value::bytes(*b"r"));
            top.insert(b"r".to_vec(), Value::Dict(encode_response(response)));
        }
        Body::Error(err) => {
            top.insert(b"y".to_vec(), Value::bytes(*b"e"));
            top.insert(
                b"e".to_vec(),
                Value::List(vec![
                    Value::Int(err.code),
                    Value::bytes(err.message.as_bytes()),
                ]),
            );
        }
    }

    bencode::encode(&Value::Dict(top))
}

fn encode_query(query: &Query) -> (&'static [u8], BTreeMap<Vec<u8>, Value>) {
    let mut args: BTreeMap<Vec<u8>, Value> = BTreeMap::new();
    match query {
        Query::Ping { id } => {
            args.insert(b"id".to_vec(), Value::bytes(id.0));
            (b"ping", args)
        }
        Query::FindNode { id, target } => {
            args.insert(b"id".to_vec(), Value::bytes(id.0));
            args.insert(b"target".to_vec(), Value::bytes(target.0));
            (b"find_node", args)
        }
        Query::GetPeers { id, info_hash } => {
            args.insert(b"id".to_vec(), Value::bytes(id.0));
            args.insert(b"info_hash".to_vec(), Value::bytes(info_hash.0));
            (b"get_peers", args)
        }
        Query::AnnouncePeer {
            id,
            info_hash,
            port,
            implied_port,
        } => {
            args.insert(b"id".to_vec(), Value::bytes(id.0));
            args.insert(b"info_hash".to_vec(), Value::bytes(info_hash.0));
            if let Some(port) = port {
                args.insert(b"port".to_vec(), Value::Int(*port as i64));
            }
            args.insert(
                b"implied_port".to_vec(),
                Value::Int(i64::from(*implied_port)),
            );
            (b"announce_peer", args)
        }
    }
}

fn encode_response(response: &Response) -> BTreeMap<Vec<u8>, Value> {
    let mut out: BTreeMap<Vec<u8>, Value> = BTreeMap::new();
    if let Some(id) = response.id {
        out.insert(b"id".to_vec(), Value::bytes(id.0));
    }
    if !response.nodes.is_empty() {
        out.insert(b"nodes".to_vec(), Value::bytes(encode_nodes(&response.nodes)));
    }
    if !response.values.is_empty() {
        let values = response
            .values
            .iter()
            .map(|addr| {
                let mut raw = Vec::with_capacity(6);
                raw.extend_from_slice(&addr.ip().octets());
                raw.extend_from_slice(&addr.port().to_be_bytes());
                Value::Bytes(raw)
            })
            .collect();
        out.insert(b"values".to_vec(), Value::List(values));
    }
    if let Some(token) = &response.token {
        out.insert(b"token".to_vec(), Value::bytes(token.clone()));
    }
    out
}

pub fn decode(raw: &[u8]) -> Result<Message, KrpcError> {
    let top = bencode::decode(raw)?;
    let transaction_id = top
        .get(b"t")
        .and_then(Value::as_bytes)
        .ok_or(KrpcError::Field("t"))?
        .to_vec();

    let body = match top.get(b"y").and_then(Value::as_bytes) {
        Some(b"q") => Body::Query(decode_query(&top)?),
        Some(b"r") => {
            let args = top.get(b"r").ok_or(KrpcError::Field("r"))?;
            Body::Response(decode_response(args))
        }
        Some(b"e") => Body::Error(decode_error(&top)?),
        _ => return Err(KrpcError::UnknownType),
    };

    Ok(Message {
        transaction_id,
        body,
    })
}

fn node_id(args: &Value, key: &'static str) -> Result<NodeId, KrpcError> {
    args.get(key.as_bytes())
        .and_then(Value::as_bytes)
        .and_then(NodeId::from_slice)
        .ok_or(KrpcError::Field(key))
}

fn info_hash(args: &Value) -> Result<InfoHash, KrpcError> {
    args.get(b"info_hash")
        .and_then(Value::as_bytes)
        .and_then(InfoHash::from_slice)
        .ok_or(KrpcError::Field("info_hash"))
}

fn decode_query(top: &Value) -> Result<Query, KrpcError> {
    let name = top
        .get(b"q")
        .and_then(Value::as_bytes)
        .ok_or(KrpcError::Field("q"))?;
    let args = top.get(b"a").ok_or(KrpcError::Field("a"))?;
    if args.as_dict().is_none() {
        return Err(KrpcError::Field("a"));
    }
    let id = node_id(args, "id")?;

    match name {
        b"ping" => Ok(Query::Ping { id }),
        b"find_node" => Ok(Query::FindNode {
            id,
            target: node_id(args, "target")?,
        }),
        b"get_peers" => Ok(Query::GetPeers {
            id,
            info_hash: info_hash(args)?,
        }),
        b"announce_peer" => Ok(Query::AnnouncePeer {
            id,
            info_hash: info_hash(args)?,
            port: args
                .get(b"port")
                .and_then(Value::as_int)
                .and_then(|p| u16::try_from(p).ok()),
            implied_port: args
                .get(b"implied_port")
                .and_then(Value::as_int)
                .is_some_and(|v| v != 0),
        }),
        _ => Err(KrpcError::UnknownQuery),
    }
}

/// Replies stay tolerant: whatever of id/nodes/values/token is present and
/// well-formed is kept, the rest defaults. Responses are harvest material,
/// not something to bounce on a missing key.
fn decode_response(args: &Value) -> Response {
    let id = args
        .get(b"id")
        .and_then(Value::as_bytes)
        .and_then(NodeId::from_slice);
    let nodes = args
        .get(b"nodes")
        .and_then(Value::as_bytes)
        .map(decode_nodes)
        .unwrap_or_default();
    let values = args
        .get(b"values")
        .and_then(Value::as_list)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_bytes)
                .filter_map(decode_peer)
                .collect()
        })
        .unwrap_or_default();
    let token = args
        .get(b"token")
        .and_then(Value::as_bytes)
        .map(<[u8]>::to_vec);

    Response {
        id,
        nodes,
        values,
        token,
    }
}

fn decode_error(top: &Value) -> Result<RemoteError, KrpcError> {
    let items = top
        .get(b"e")
        .and_then(Value::as_list)
        .ok_or(KrpcError::Field("e"))?;
    let code = items
        .first()
        .and_then(Value::as_int)
        .ok_or(KrpcError::Field("e"))?;
    let message = items
        .get(1)
        .and_then(Value::as_bytes)
        .map(|b| String::from_utf8_lossy(b).into_owned())
        .unwrap_or_default();
    Ok(RemoteError { code, message })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn round_trip(msg: Message) {
        assert_eq!(decode(&encode(&msg)).unwrap(), msg);
    }

    #[test]
    fn query_round_trips() {
        let id = NodeId([0x11; 20]);
        round_trip(Message {
            transaction_id: b"aa".to_vec(),
            body: Body::Query(Query::Ping { id }),
        });
        round_trip(Message {
            transaction_id: vec![0, 0, 0, 7],
            body: Body::Query(Query::FindNode {
                id,
                target: NodeId([0x22; 20]),
            }),
        });
        round_trip(Message {
            transaction_id: vec![0xde, 0xad],
            body: Body::Query(Query::GetPeers {
                id,
                info_hash: InfoHash([0x33; 20]),
            }),
        });
        round_trip(Message {
            transaction_id: b"zz".to_vec(),
            body: Body::Query(Query::AnnouncePeer {
                id,
                info_hash: InfoHash([0x44; 20]),
                port: Some(51413),
                implied_port: false,
            }),
        });
    }

    #[test]
    fn response_round_trips() {
        let node = Node {
            id: NodeId([0x55; 20]),
            addr: SocketAddrV4::new(Ipv4Addr::new(1, 2, 3, 4), 6881),
        };
        round_trip(Message {
            transaction_id: vec![0, 0, 0, 1],
            body: Body::Response(Response {
                id: Some(NodeId([0x66; 20])),
                nodes: vec![node],
                values: vec![SocketAddrV4::new(Ipv4Addr::new(9, 8, 7, 6), 51413)],
                token: Some(b"tok".to_vec()),
            }),
        });
    }

    #[test]
    fn error_round_trips() {
        round_trip(Message {
            transaction_id: b"aa".to_vec(),
            body: Body::Error(RemoteError {
                code: 202,
                message: "Server Error".to_string(),
            }),
        });
    }

    #[test]
    fn rejects_junk() {
        assert!(decode(b"").is_err());
        assert!(decode(b"d1:y1:qe").is_err()); // no t
        assert!(matches!(
            decode(b"d1:t2:aa1:y1:xe"),
            Err(KrpcError::UnknownType)
        ));
        // get_peers without info_hash
        let raw = encode(&Message {
            transaction_id: b"aa".to_vec(),
            body: Body::Query(Query::Ping { id: NodeId([1; 20]) }),
        });
        let tweaked = String::from_utf8_lossy(&raw).replace("4:ping", "9:get_peers");
        assert!(decode(tweaked.as_bytes()).is_err());
    }

    #[test]
    fn response_decode_is_tolerant() {
        // A reply with only an id still decodes.
        let raw = b"d1:rd2:id20:\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01\x01e1:t2:aa1:y1:re";
        let msg = decode(raw).unwrap();
        let Body::Response(r) = msg.body else {
            panic!("expected response");
        };
        assert_eq!(r.id, Some(NodeId([1; 20])));
        assert!(r.nodes.is_empty() && r.values.is_empty() && r.token.is_none());
    }
}
