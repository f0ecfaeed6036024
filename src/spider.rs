use crate::config::Config;
use crate::fetch::{self, FetchLimits};
use crate::krpc::{self, Body, Message, Query, RemoteError, Response};
use crate::node::{InfoHash, Node, NodeId};
use crate::routing::{Insert, RoutingTable};
use crate::search::{Found, INITIAL_FANOUT, Registry, SearchId, Step};
use crate::storage::TorrentSink;
use anyhow::Context;
use rand::Rng;
use rand::seq::SliceRandom;
use std::collections::HashSet;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

// The DHT engine:
// - joins the overlay via the bootstrap routers (find_node toward ourselves)
// - answers ping / find_node / get_peers / announce_peer so other nodes keep
//   us in their routing tables
// - harvests info-hashes from get_peers / announce_peer queries, runs one
//   bounded get_peers lookup per hash, and hands the peer set to the fetcher
// - continuously sweeps random targets to keep the routing table growing
//
// All DHT state lives on this one task; fetchers run as their own tasks and
// only report back through the event channel.

const CANDIDATE_POOL_CAP: usize = 16_000;
const CANDIDATE_BATCH: usize = 8;
const CANDIDATE_BATCHES_PER_TICK: usize = 7;
const QUERY_FANOUT: usize = 8;

/// Bag of recently-learned node batches awaiting a find_node sweep. Not
/// ordered; a full pool drops a random batch to make room.
#[derive(Default)]
struct CandidatePool {
    batches: Vec<Vec<Node>>,
}

impl CandidatePool {
    fn push(&mut self, nodes: &[Node]) {
        if nodes.is_empty() {
            return;
        }
        let mut rng = rand::thread_rng();
        if self.batches.len() >= CANDIDATE_POOL_CAP {
            let victim = rng.gen_range(0..self.batches.len());
            self.batches.swap_remove(victim);
        }
        let batch: Vec<Node> = nodes
            .choose_multiple(&mut rng, CANDIDATE_BATCH)
            .copied()
            .collect();
        self.batches.push(batch);
    }

    fn drain(&mut self, max_batches: usize) -> Vec<Node> {
        let mut rng = rand::thread_rng();
        let mut out = Vec::new();
        for _ in 0..max_batches.min(self.batches.len()) {
            let idx = rng.gen_range(0..self.batches.len());
            out.extend(self.batches.swap_remove(idx));
        }
        out
    }

    fn len(&self) -> usize {
        self.batches.len()
    }
}

/// Flips the engine into a graceful stop at its next wakeup.
pub struct SpiderHandle {
    stop: watch::Sender<bool>,
}

impl SpiderHandle {
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }
}

enum Event {
    FetchDone { info_hash: InfoHash },
}

enum Wake {
    Stopped,
    Tick,
    Event(Event),
    Packet(std::io::Result<(usize, SocketAddr)>),
}

pub struct Spider<S> {
    config: Config,
    limits: FetchLimits,
    socket: UdpSocket,
    node_id: NodeId,
    table: RoutingTable,
    candidates: CandidatePool,
    searchers: Registry,
    in_progress: HashSet<InfoHash>,
    sink: Arc<S>,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
    stop_rx: watch::Receiver<bool>,
}

impl<S: TorrentSink> Spider<S> {
    pub async fn bind(config: Config, sink: Arc<S>) -> anyhow::Result<(Spider<S>, SpiderHandle)> {
        let socket = UdpSocket::bind(&config.bind)
            .await
            .with_context(|| format!("bind DHT socket on {}", config.bind))?;
        let node_id = NodeId::random();
        tracing::info!(bind = %socket.local_addr()?, id = %node_id, "spider: listening");

        let (stop_tx, stop_rx) = watch::channel(false);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let spider = Spider {
            limits: FetchLimits::from(&config),
            config,
            socket,
            node_id,
            table: RoutingTable::new(node_id),
            candidates: CandidatePool::default(),
            searchers: Registry::new(),
            in_progress: HashSet::new(),
            sink,
            events_tx,
            events_rx,
            stop_rx,
        };
        Ok((spider, SpiderHandle { stop: stop_tx }))
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        self.bootstrap().await;

        let mut tick = tokio::time::interval(self.config.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut buf = vec![0u8; 4096];

        loop {
            let wake = tokio::select! {
                changed = self.stop_rx.changed() => {
                    // A dropped handle counts as a stop request.
                    if changed.is_err() || *self.stop_rx.borrow() {
                        Wake::Stopped
                    } else {
                        continue;
                    }
                }
                _ = tick.tick() => Wake::Tick,
                event = self.events_rx.recv() => match event {
                    Some(event) => Wake::Event(event),
                    None => continue,
                },
                received = self.socket.recv_from(&mut buf) => Wake::Packet(received),
            };

            match wake {
                Wake::Stopped => break,
                Wake::Tick => {
                    self.auto_find_nodes().await;
                    self.sweep_searchers();
                }
                Wake::Event(Event::FetchDone { info_hash }) => {
                    self.in_progress.remove(&info_hash);
                }
                Wake::Packet(received) => {
                    let (n, from) = received.context("recv on DHT socket")?;
                    if let SocketAddr::V4(from) = from {
                        self.handle_datagram(&buf[..n], from).await;
                    }
                    // Pace the read loop to smooth outbound bursts.
                    tokio::time::sleep(self.config.interval).await;
                }
            }
        }

        tracing::info!("spider: stopping");
        // Give already-queued replies one beat before the socket goes away.
        tokio::time::sleep(self.config.interval).await;
        Ok(())
    }

    async fn bootstrap(&self) {
        for host in &self.config.bootstrap {
            match tokio::net::lookup_host(host).await {
                Ok(addrs) => {
                    for addr in addrs {
                        if let SocketAddr::V4(addr) = addr {
                            self.send_find_node(addr, self.node_id).await;
                        }
                    }
                }
                Err(err) => {
                    tracing::debug!(%err, host = %host, "spider: bootstrap resolve failed");
                }
            }
        }
    }

    async fn handle_datagram(&mut self, raw: &[u8], from: SocketAddrV4) {
        // Undecodable datagrams are dropped without a word.
        let Ok(msg) = krpc::decode(raw) else {
            return;
        };

        match msg.body {
            Body::Query(query) => {
                let sender = Node {
                    id: query.sender_id(),
                    addr: from,
                };
                match self.handle_query(&msg.transaction_id, &query, from).await {
                    Ok(Some(info_hash)) => self.enqueue(info_hash).await,
                    Ok(None) => {}
                    Err(err) => {
                        tracing::debug!(%err, addr = %from, "spider: query handler failed");
                        let error = Message {
                            transaction_id: msg.transaction_id,
                            body: Body::Error(RemoteError {
                                code: 202,
                                message: "Server Error".to_string(),
                            }),
                        };
                        self.send(&error, from).await;
                    }
                }
                self.insert_node(sender).await;
            }
            Body::Response(response) => {
                self.handle_response(&msg.transaction_id, response, from).await;
            }
            Body::Error(_) => {}
        }
    }

    /// Answers the four standard queries with the stable local id. Returns
    /// the info-hash the query made interesting, if any.
    async fn handle_query(
        &mut self,
        transaction_id: &[u8],
        query: &Query,
        from: SocketAddrV4,
    ) -> anyhow::Result<Option<InfoHash>> {
        let mut interesting = None;

        let reply = match query {
            Query::Ping { .. } => Response {
                id: Some(self.node_id),
                ..Response::default()
            },
            Query::FindNode { target, .. } => Response {
                id: Some(self.node_id),
                nodes: self.table.closest(&target.0, QUERY_FANOUT),
                ..Response::default()
            },
            Query::GetPeers { info_hash, .. } => {
                interesting = Some(*info_hash);
                // We never track peers, so there is never a `values` list;
                // nodes plus a fresh token still reads as a good citizen.
                let mut token = vec![0u8; 20];
                rand::thread_rng().fill(&mut token[..]);
                Response {
                    id: Some(self.node_id),
                    nodes: self.table.closest(&info_hash.0, QUERY_FANOUT),
                    token: Some(token),
                    ..Response::default()
                }
            }
            Query::AnnouncePeer { info_hash, .. } => {
                interesting = Some(*info_hash);
                Response {
                    id: Some(self.node_id),
                    ..Response::default()
                }
            }
        };

        let msg = Message {
            transaction_id: transaction_id.to_vec(),
            body: Body::Response(reply),
        };
        self.send(&msg, from).await;
        Ok(interesting)
    }

    async fn handle_response(&mut self, transaction_id: &[u8], response: Response, from: SocketAddrV4) {
        let Response {
            id, nodes, values, ..
        } = response;

        match self.searchers.on_response(transaction_id, nodes.clone(), values) {
            Step::Probe {
                info_hash,
                nodes: closest,
            } => {
                if let Ok(t) = SearchId::try_from(transaction_id) {
                    for node in closest {
                        self.send_get_peers(node.addr, info_hash, t).await;
                    }
                }
            }
            Step::Done(found) => self.dispatch_fetch(found),
            // Not a reply we are waiting on: keep the addresses for the
            // next discovery sweep.
            Step::Ignored => self.candidates.push(&nodes),
        }

        if let Some(id) = id {
            self.insert_node(Node { id, addr: from }).await;
        }
    }

    /// Admission: one in-flight lookup per info-hash, and nothing the sink
    /// already has.
    async fn enqueue(&mut self, info_hash: InfoHash) {
        if self.in_progress.contains(&info_hash) {
            return;
        }
        match self.sink.exists(&info_hash).await {
            Ok(true) => return,
            Ok(false) => {}
            Err(err) => {
                // Recoverable: a later announce will retry.
                tracing::warn!(%err, hash = %info_hash, "spider: sink probe failed");
                return;
            }
        }

        self.in_progress.insert(info_hash);
        tracing::info!(hash = %info_hash, "spider: discovered");
        self.start_searcher(info_hash).await;
    }

    async fn start_searcher(&mut self, info_hash: InfoHash) {
        let (t, displaced) = self.searchers.start(info_hash, Instant::now());
        if let Some(found) = displaced {
            // Sequence wrap landed on a live transaction id; deliver the old
            // searcher rather than losing it.
            self.dispatch_fetch(found);
        }
        for node in self.table.closest(&info_hash.0, INITIAL_FANOUT) {
            self.send_get_peers(node.addr, info_hash, t).await;
        }
    }

    /// One discovery tick: sweep a random target through the closest known
    /// nodes plus a few candidate batches.
    async fn auto_find_nodes(&mut self) {
        let target = NodeId::random();
        let mut nodes = self.table.closest(&target.0, QUERY_FANOUT);
        nodes.extend(self.candidates.drain(CANDIDATE_BATCHES_PER_TICK));
        for node in nodes {
            self.send_find_node(node.addr, target).await;
        }
    }

    fn sweep_searchers(&mut self) {
        let expired = self
            .searchers
            .sweep_expired(Instant::now(), self.config.search_deadline);
        for found in expired {
            self.dispatch_fetch(found);
        }
    }

    /// Hands a finished lookup to its own fetch task. The info-hash stays
    /// in-progress until the task reports back, whatever the outcome.
    fn dispatch_fetch(&self, found: Found) {
        let Found { info_hash, peers } = found;
        let sink = self.sink.clone();
        let limits = self.limits;
        let events = self.events_tx.clone();

        tokio::spawn(async move {
            let peers: Vec<SocketAddrV4> = peers.into_iter().collect();
            tracing::debug!(hash = %info_hash, peers = peers.len(), "fetch: starting");
            match fetch::run(info_hash, peers, sink.as_ref(), limits).await {
                Ok(true) => {}
                Ok(false) => tracing::debug!(hash = %info_hash, "fetch: no metadata obtained"),
                Err(err) => tracing::warn!(%err, hash = %info_hash, "fetch: sink failure"),
            }
            let _ = events.send(Event::FetchDone { info_hash });
        });
    }

    async fn insert_node(&mut self, node: Node) {
        if let Insert::Probe(addr) = self.table.insert(node) {
            // Table full here; a probe keeps the bucket fresh without
            // growing it.
            self.send_find_node(addr, NodeId::random()).await;
        }
    }

    /// The id we claim in outbound queries. Stealth mode blends into the
    /// DHT's query traffic with a fresh id per query; replies always carry
    /// the stable local id.
    fn query_id(&self) -> NodeId {
        if self.config.stealth_ids {
            NodeId::random()
        } else {
            self.node_id
        }
    }

    async fn send_find_node(&self, to: SocketAddrV4, target: NodeId) {
        let mut t = [0u8; 2];
        rand::thread_rng().fill(&mut t);
        let msg = Message {
            transaction_id: t.to_vec(),
            body: Body::Query(Query::FindNode {
                id: self.query_id(),
                target,
            }),
        };
        self.send(&msg, to).await;
    }

    async fn send_get_peers(&self, to: SocketAddrV4, info_hash: InfoHash, t: SearchId) {
        let msg = Message {
            transaction_id: t.to_vec(),
            body: Body::Query(Query::GetPeers {
                id: self.query_id(),
                info_hash,
            }),
        };
        self.send(&msg, to).await;
    }

    async fn send(&self, msg: &Message, to: SocketAddrV4) {
        if let Err(err) = self.socket.send_to(&krpc::encode(msg), to).await {
            tracing::trace!(%err, addr = %to, "spider: send failed");
        }
    }
}
