//! Node control loop.
//!
//! A single task owns all node state (peers, address book, block index);
//! per-peer reader tasks feed raw bytes in over a channel and a writer task
//! per peer drains serialized messages out. Block and header validation is
//! CPU work and runs on blocking workers: each worker gets an owned
//! snapshot of what it needs and reports its verdict back over the same
//! event channel. Nothing is shared across tasks except those channels.

use crate::blockchain::{Block, BlockHeader, OutPoint, Transaction, TxOut};
use crate::config::{ChainParams, Config};
use crate::consensus::{self, block_work, BlockContext, InvalidBlock, TxContext, TxError};
use crate::crypto::Hash32;
use crate::database::{
    load_peer_addresses, save_peer_addresses, export_peer_addresses_csv, BlockIndex,
    DatabaseManager, FLAG_MAIN_CHAIN, FLAG_VALID,
};
use crate::error::{NodeError, ParseError};
use crate::network::addrbook::{dedupe_records, AddressBook};
use crate::network::framer::Framer;
use crate::network::message::{AddressRecord, InventoryVector, Message, NetworkAddress};
use crate::network::peer::{NodeView, Peer, PeerOutput};
use num_bigint::BigUint;
use num_traits::Zero;
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant};

const READ_BUFFER_LEN: usize = 64 * 1024;
const OUTGOING_QUEUE_LEN: usize = 64;
const EVENT_QUEUE_LEN: usize = 1024;
const GETDATA_BATCH: usize = 16;
const SAVE_INTERVAL_TICKS: u64 = 300;

fn unix_time() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[derive(Debug, Clone)]
pub struct NodeOptions {
    pub listen: bool,
    pub initial_peers: Vec<IpAddr>,
}

enum NodeEvent {
    Inbound(TcpStream, SocketAddr),
    Connected {
        index: usize,
        stream: TcpStream,
    },
    DialFailed {
        index: usize,
    },
    Bytes {
        index: usize,
        chunk: Vec<u8>,
    },
    Disconnected {
        index: usize,
    },
    /// A validation worker finished checking a block body.
    BlockChecked {
        index: usize,
        block: Block,
        result: Result<(), InvalidBlock>,
    },
    /// A validation worker finished checking a headers batch.
    HeadersChecked {
        index: usize,
        headers: Vec<BlockHeader>,
    },
}

/// Everything the control loop owns besides the peer arena.
pub struct NodeState {
    pub config: Config,
    pub params: ChainParams,
    pub address_book: AddressBook,
    pub db: DatabaseManager,
    pub best_tip: Option<Hash32>,
    download_queue: VecDeque<Hash32>,
    requested_blocks: HashSet<Hash32>,
    /// Outputs of connected blocks, the minimum a validator needs.
    unspent: HashMap<OutPoint, TxOut>,
}

impl NodeState {
    pub fn new(config: Config) -> Result<Self, NodeError> {
        let params = config.chain_params();
        let db = DatabaseManager::open(config.data_dir.clone())?;

        let mut address_book = AddressBook::default();
        let peers_file = config.get_peers_file();
        if peers_file.is_file() {
            match load_peer_addresses(&peers_file) {
                Ok(records) => address_book.extend(dedupe_records(records)),
                Err(e) => log::warn!("could not load {}: {}", peers_file.display(), e),
            }
        }

        let best_tip = db
            .indices
            .iter()
            .filter(|index| index.context_flags & FLAG_MAIN_CHAIN != 0)
            .max_by_key(|index| index.total_work_value())
            .map(|index| index.hash);

        Ok(NodeState {
            config,
            params,
            address_book,
            db,
            best_tip,
            download_queue: VecDeque::new(),
            requested_blocks: HashSet::new(),
            unspent: HashMap::new(),
        })
    }

    pub fn best_height(&self) -> u32 {
        self.best_tip
            .and_then(|tip| self.db.indices.get(&tip))
            .map(|index| index.height)
            .unwrap_or(self.params.genesis_height)
    }

    fn parent_of(&self, header: &BlockHeader) -> Option<&BlockIndex> {
        self.db.indices.get(&header.prev_block)
    }

    /// Height and cumulative work a block at this header would have.
    fn chain_position(&self, header: &BlockHeader) -> (bool, u32, BigUint) {
        if header.prev_block.is_zero() {
            (true, self.params.genesis_height, BigUint::zero())
        } else {
            match self.parent_of(header) {
                Some(parent) => (true, parent.height + 1, parent.total_work_value()),
                None => (false, 0, BigUint::zero()),
            }
        }
    }

    /// Snapshot everything a validation worker needs for this block: the
    /// chain context and the referenced unspent outputs. `None` when the
    /// body is already archived.
    fn block_check_inputs(&mut self, block: &Block) -> Option<(BlockContext, SpentView)> {
        let hash = block.header.hash();
        self.requested_blocks.remove(&hash);
        if self.db.archive.contains(&hash) {
            return None;
        }

        let (prev_known, height, _) = self.chain_position(&block.header);
        let ctx = BlockContext {
            now: unix_time(),
            height,
            prev_known,
        };

        let mut view = SpentView::default();
        for tx in &block.txs {
            for input in &tx.inputs {
                if input.is_coinbase() {
                    continue;
                }
                if let Some(output) = self.unspent.get(&input.previous_output) {
                    view.unspent.insert(input.previous_output, output.clone());
                }
            }
        }
        Some((ctx, view))
    }

    /// Persist a block body a worker already validated.
    pub fn connect_block(&mut self, block: Block, height: u32, parent_work: BigUint) {
        let hash = block.header.hash();
        if self.db.archive.contains(&hash) {
            return;
        }

        let total_work = parent_work + block_work(block.header.target);
        let mut flags = FLAG_VALID;
        let best_work = self
            .best_tip
            .and_then(|tip| self.db.indices.get(&tip))
            .map(|index| index.total_work_value())
            .unwrap_or_else(BigUint::zero);
        if total_work > best_work || self.best_tip.is_none() {
            flags |= FLAG_MAIN_CHAIN;
            self.best_tip = Some(hash);
        }

        for tx in &block.txs {
            self.apply_tx_outputs(tx);
        }
        self.db
            .store_block(&block, BlockIndex::new(block.header, height, &total_work, flags));
        log::info!("accepted block {} at height {}", hash.display_be(), height);
    }

    fn apply_tx_outputs(&mut self, tx: &Transaction) {
        for input in &tx.inputs {
            if !input.is_coinbase() {
                self.unspent.remove(&input.previous_output);
            }
        }
        let txid = tx.txid();
        for (index, output) in tx.outputs.iter().enumerate() {
            self.unspent.insert(
                OutPoint {
                    hash: txid,
                    index: index as u32,
                },
                output.clone(),
            );
        }
    }

    /// Extend the header index with worker-checked headers and queue their
    /// unfetched bodies, oldest first. Parent resolution happens here, on
    /// the task that owns the index.
    pub fn connect_headers(&mut self, headers: Vec<BlockHeader>) {
        for header in headers {
            let hash = header.hash();
            if self.db.indices.contains(&hash) {
                continue;
            }
            let (prev_known, height, parent_work) = self.chain_position(&header);
            if !prev_known {
                log::debug!("orphan header {}", hash.display_be());
                continue;
            }
            let total_work = parent_work + block_work(header.target);
            self.db
                .indices
                .insert(BlockIndex::new(header, height, &total_work, 0));
            if !self.db.archive.contains(&hash) {
                self.download_queue.push_back(hash);
            }
        }
    }

    /// Next batch of bodies to request, breadth-first over the queue.
    fn next_download_batch(&mut self) -> Vec<InventoryVector> {
        let mut batch = Vec::new();
        while batch.len() < GETDATA_BATCH {
            let Some(hash) = self.download_queue.pop_front() else {
                break;
            };
            if self.db.archive.contains(&hash) || self.requested_blocks.contains(&hash) {
                continue;
            }
            self.requested_blocks.insert(hash);
            batch.push(InventoryVector::block(hash));
        }
        batch
    }

    fn requeue_block(&mut self, hash: Hash32) {
        self.requested_blocks.remove(&hash);
        self.download_queue.push_back(hash);
    }

    fn save_peers(&self) {
        let snapshot = self.address_book.snapshot();
        if let Err(e) = save_peer_addresses(&self.config.get_peers_file(), &snapshot) {
            log::error!("saving peers failed: {}", e);
        }
        if let Err(e) = export_peer_addresses_csv(&self.config.get_peers_csv_file(), &snapshot) {
            log::error!("exporting peers.csv failed: {}", e);
        }
    }
}

impl NodeView for NodeState {
    fn has_block(&self, hash: &Hash32) -> bool {
        self.db.indices.contains(hash)
    }

    fn has_tx(&self, _hash: &Hash32) -> bool {
        false // no mempool; transactions ride in via blocks
    }

    fn fetch_block(&self, hash: &Hash32) -> Option<Block> {
        self.db.load_block(hash)
    }

    fn addr_snapshot(&self, max: usize) -> Vec<AddressRecord> {
        let mut records = self.address_book.snapshot();
        records.truncate(max);
        records
    }

    fn headers_after(&self, locator: &[Hash32], stop: &Hash32, max: usize) -> Vec<BlockHeader> {
        // Fork point: first locator entry we have, else the genesis predecessor.
        let mut cursor = locator
            .iter()
            .find(|hash| self.db.indices.contains(hash))
            .copied()
            .unwrap_or_else(Hash32::zero);

        let mut headers = Vec::new();
        while headers.len() < max {
            let Some(next) = self.db.indices.next_of(&cursor) else {
                break;
            };
            let Some(index) = self.db.indices.get(next) else {
                break;
            };
            headers.push(index.header);
            cursor = *next;
            if cursor == *stop {
                break;
            }
        }
        headers
    }

    fn start_height(&self) -> u32 {
        self.best_height()
    }
}

/// Owned snapshot of the outputs one block references, shipped to a
/// validation worker so the check never touches control-loop state.
/// The script interpreter lives outside this crate; the view accepts
/// scripts and the validator enforces the remaining transaction rules.
#[derive(Debug, Default)]
struct SpentView {
    unspent: HashMap<OutPoint, TxOut>,
}

impl TxContext for SpentView {
    fn lookup_unspent(&self, outpoint: &OutPoint) -> Option<TxOut> {
        self.unspent.get(outpoint).cloned()
    }

    fn verify_script(
        &self,
        _signature_script: &[u8],
        _pk_script: &[u8],
        tx: &Transaction,
        input_index: usize,
    ) -> bool {
        log::trace!(
            "script check delegated for input {} of {}",
            input_index,
            tx.txid()
        );
        true
    }
}

struct PeerSlot {
    peer: Peer,
    framer: Framer,
    outgoing: mpsc::Sender<Vec<u8>>,
    handshake_deadline: Instant,
}

pub struct Node {
    state: NodeState,
    peers: Vec<Option<PeerSlot>>,
    events_tx: mpsc::Sender<NodeEvent>,
    events_rx: Option<mpsc::Receiver<NodeEvent>>,
    ticks: u64,
}

impl Node {
    pub fn new(config: Config) -> Result<Self, NodeError> {
        let state = NodeState::new(config)?;
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_LEN);
        Ok(Node {
            state,
            peers: Vec::new(),
            events_tx,
            events_rx: Some(events_rx),
            ticks: 0,
        })
    }

    pub async fn run(mut self, options: NodeOptions) -> Result<(), NodeError> {
        let mut events_rx = self.events_rx.take().expect("run is called once");
        if options.listen {
            let bind_addr = SocketAddr::new("0.0.0.0".parse().unwrap(), self.state.config.port);
            let socket = tokio::net::TcpSocket::new_v4()?;
            socket.set_reuseaddr(true)?;
            socket.bind(bind_addr)?;
            let listener = socket.listen(self.state.config.backlog)?;
            log::info!("listening on {}", bind_addr);
            let events = self.events_tx.clone();
            tokio::spawn(async move {
                loop {
                    match listener.accept().await {
                        Ok((stream, addr)) => {
                            if events.send(NodeEvent::Inbound(stream, addr)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => log::warn!("accept failed: {}", e),
                    }
                }
            });
        }

        for ip in &options.initial_peers {
            self.dial(SocketAddr::new(*ip, self.state.params.port));
        }
        self.dial_from_address_book();

        let mut tick = interval(Duration::from_secs(1));
        let mut shutdown = Box::pin(tokio::signal::ctrl_c());

        loop {
            tokio::select! {
                event = events_rx.recv() => {
                    let Some(event) = event else { break };
                    self.on_event(event);
                }
                _ = tick.tick() => self.on_tick(),
                _ = &mut shutdown => {
                    log::info!("shutdown signal received");
                    break;
                }
            }
        }

        self.state.save_peers();
        self.state.db.save().map_err(NodeError::Storage)?;
        Ok(())
    }

    fn allocate_slot(&mut self) -> usize {
        match self.peers.iter().position(|slot| slot.is_none()) {
            Some(index) => index,
            None => {
                self.peers.push(None);
                self.peers.len() - 1
            }
        }
    }

    fn dial(&mut self, addr: SocketAddr) {
        let index = self.allocate_slot();
        log::info!("dialing {} as peer {}", addr, index);
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let event = match TcpStream::connect(addr).await {
                Ok(stream) => NodeEvent::Connected { index, stream },
                Err(e) => {
                    log::warn!("connect to {} failed: {}", addr, e);
                    NodeEvent::DialFailed { index }
                }
            };
            let _ = events.send(event).await;
        });
        // Reserve the slot so concurrent dials stay distinct.
        self.peers[index] = Some(PeerSlot {
            peer: Peer::outbound(index, NetworkAddress::new(0, addr)),
            framer: Framer::new(self.state.params.magic, self.state.config.max_message_length),
            outgoing: mpsc::channel(1).0,
            handshake_deadline: Instant::now() + self.state.config.handshake_timeout,
        })
    }

    fn dial_from_address_book(&mut self) {
        let connected = self.peers.iter().flatten().count();
        let want = self.state.config.max_outgoing.saturating_sub(connected);
        if want == 0 {
            return;
        }
        for record in self.state.address_book.pick_dial_candidates(want) {
            self.dial(record.address.socket_addr());
        }
    }

    fn attach_transport(&mut self, index: usize, stream: TcpStream) -> mpsc::Sender<Vec<u8>> {
        let (read_half, write_half) = stream.into_split();
        let (outgoing_tx, outgoing_rx) = mpsc::channel(OUTGOING_QUEUE_LEN);
        tokio::spawn(run_reader(index, read_half, self.events_tx.clone()));
        tokio::spawn(run_writer(write_half, outgoing_rx));
        outgoing_tx
    }

    fn on_event(&mut self, event: NodeEvent) {
        match event {
            NodeEvent::Inbound(stream, addr) => {
                let index = self.allocate_slot();
                log::info!("accepted {} as peer {}", addr, index);
                let outgoing = self.attach_transport(index, stream);
                self.peers[index] = Some(PeerSlot {
                    peer: Peer::inbound(index, NetworkAddress::new(0, addr)),
                    framer: Framer::new(
                        self.state.params.magic,
                        self.state.config.max_message_length,
                    ),
                    outgoing,
                    handshake_deadline: Instant::now() + self.state.config.handshake_timeout,
                });
            }
            NodeEvent::Connected { index, stream } => {
                let outgoing = self.attach_transport(index, stream);
                if let Some(slot) = self.peers[index].as_mut() {
                    slot.outgoing = outgoing;
                    let outputs = slot.peer.start_handshake(
                        &self.state.config,
                        &self.state,
                        unix_time(),
                    );
                    self.apply_outputs(index, outputs);
                }
            }
            NodeEvent::DialFailed { index } => {
                if let Some(slot) = self.peers[index].take() {
                    self.state
                        .address_book
                        .disable(&slot.peer.address.ip);
                }
            }
            NodeEvent::Bytes { index, chunk } => self.on_bytes(index, &chunk),
            NodeEvent::Disconnected { index } => self.close_peer(index, "transport closed"),
            NodeEvent::BlockChecked {
                index,
                block,
                result,
            } => self.on_block_checked(index, block, result),
            NodeEvent::HeadersChecked { index, headers } => {
                self.state.connect_headers(headers);
                self.request_bodies(index);
            }
        }
    }

    /// Hand a received block body to a blocking validation worker; the
    /// verdict comes back as a `BlockChecked` event.
    fn begin_block_check(&mut self, index: usize, block: Block) {
        let Some((ctx, view)) = self.state.block_check_inputs(&block) else {
            return;
        };
        let params = self.state.params.clone();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let outcome = tokio::task::spawn_blocking(move || {
                let result = consensus::check_block(&block, &ctx, &params, &view);
                (block, result)
            })
            .await;
            let Ok((block, result)) = outcome else {
                log::error!("block validation worker failed");
                return;
            };
            let _ = events
                .send(NodeEvent::BlockChecked {
                    index,
                    block,
                    result,
                })
                .await;
        });
    }

    /// Run the per-header CPU checks (proof of work, forward timestamp)
    /// on a blocking worker; survivors come back as `HeadersChecked`.
    fn begin_headers_check(&mut self, index: usize, headers: Vec<BlockHeader>) {
        if headers.is_empty() {
            return;
        }
        let params = self.state.params.clone();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let outcome = tokio::task::spawn_blocking(move || {
                let now = unix_time();
                let ctx = BlockContext {
                    now,
                    height: 0,
                    prev_known: true, // parent resolution happens on connect
                };
                headers
                    .into_iter()
                    .filter(|header| match consensus::check_header(header, &ctx, &params) {
                        Ok(()) => true,
                        Err(e) => {
                            log::warn!("rejecting header {}: {}", header.hash().display_be(), e);
                            false
                        }
                    })
                    .collect::<Vec<BlockHeader>>()
            })
            .await;
            let Ok(headers) = outcome else {
                log::error!("header validation worker failed");
                return;
            };
            let _ = events.send(NodeEvent::HeadersChecked { index, headers }).await;
        });
    }

    fn on_block_checked(
        &mut self,
        index: usize,
        block: Block,
        result: Result<(), InvalidBlock>,
    ) {
        let hash = block.header.hash();
        match result {
            Ok(()) => {
                // Re-resolve the parent on the owning task: it may have
                // arrived or vanished while the worker ran.
                let (prev_known, height, parent_work) = self.state.chain_position(&block.header);
                if !prev_known {
                    log::debug!("deferring block {}", hash.display_be());
                    self.state.requeue_block(hash);
                    return;
                }
                self.state.connect_block(block, height, parent_work);
            }
            // A body that arrived before its inputs retries later.
            Err(InvalidBlock::BadTx {
                reason: TxError::MissingInput,
                ..
            })
            | Err(InvalidBlock::UnknownPrevBlock) => {
                log::debug!("deferring block {}", hash.display_be());
                self.state.requeue_block(hash);
            }
            Err(e) => {
                log::warn!(
                    "peer {}: invalid block {}: {}",
                    index,
                    hash.display_be(),
                    e
                );
            }
        }
    }

    fn on_bytes(&mut self, index: usize, chunk: &[u8]) {
        let Some(slot) = self.peers[index].as_mut() else {
            return;
        };

        let frames = match slot.framer.push(chunk) {
            Ok(frames) => frames,
            Err(e) => {
                self.close_peer(index, &format!("frame error: {}", e));
                return;
            }
        };

        let mut all_outputs = Vec::new();
        for frame in frames {
            let Some(slot) = self.peers[index].as_mut() else {
                return;
            };
            match Message::parse_frame(&frame.header, &frame.payload, self.state.params.magic) {
                Ok(Some(message)) => {
                    match slot
                        .peer
                        .handle_message(message, &self.state.config, &self.state, unix_time())
                    {
                        Ok(outputs) => all_outputs.extend(outputs),
                        Err(e) => {
                            self.close_peer(index, &format!("{}", e));
                            return;
                        }
                    }
                }
                Ok(None) => {
                    log::debug!(
                        "peer {}: skipping unknown command '{}'",
                        index,
                        frame.header.command_str()
                    );
                }
                Err(ParseError::UnknownCommand(command)) => {
                    log::debug!("peer {}: skipping unknown command '{}'", index, command);
                }
                Err(e) => {
                    self.close_peer(index, &format!("parse error: {}", e));
                    return;
                }
            }
        }
        self.apply_outputs(index, all_outputs);
    }

    fn apply_outputs(&mut self, index: usize, outputs: Vec<PeerOutput>) {
        for output in outputs {
            match output {
                PeerOutput::Send(message) => self.send_to(index, &message),
                PeerOutput::NewAddresses(records) => {
                    self.state.address_book.extend(records);
                    if self.state.address_book.len() > self.state.config.clear_old_addr_threshold {
                        let life = self.state.config.addr_life.as_secs() as u32;
                        self.state.address_book.clear_old(unix_time() as u32, life);
                    }
                }
                PeerOutput::BlockReceived(block) => self.begin_block_check(index, block),
                PeerOutput::HeadersReceived(headers) => self.begin_headers_check(index, headers),
            }
        }
    }

    fn request_bodies(&mut self, index: usize) {
        let batch = self.state.next_download_batch();
        if !batch.is_empty() {
            self.send_to(index, &Message::GetData(batch));
        }
    }

    fn send_to(&mut self, index: usize, message: &Message) {
        let magic = self.state.params.magic;
        let Some(slot) = self.peers[index].as_ref() else {
            return;
        };
        match message.to_bytes(magic) {
            Ok(bytes) => {
                if slot.outgoing.try_send(bytes).is_err() {
                    log::warn!("peer {}: outgoing queue stalled", index);
                }
            }
            Err(e) => log::error!("serializing {} failed: {}", message.command(), e),
        }
    }

    fn close_peer(&mut self, index: usize, reason: &str) {
        if let Some(slot) = self.peers[index].take() {
            log::info!("closing peer {}: {}", index, reason);
            // Dropping the slot tears down the writer task and, with it,
            // the connection; per-peer buffers go with the slot.
            drop(slot);
        }
    }

    fn on_tick(&mut self) {
        self.ticks += 1;
        let now = Instant::now();

        let timed_out: Vec<usize> = self
            .peers
            .iter()
            .flatten()
            .filter(|slot| !slot.peer.is_ready() && now >= slot.handshake_deadline)
            .map(|slot| slot.peer.index)
            .collect();
        for index in timed_out {
            log::warn!("peer {}: {}", index, NodeError::Timeout);
            self.close_peer(index, "handshake timeout");
        }

        // Keep body downloads moving through any ready peer.
        if !self.state.download_queue.is_empty() {
            if let Some(index) = self
                .peers
                .iter()
                .flatten()
                .find(|slot| slot.peer.is_ready())
                .map(|slot| slot.peer.index)
            {
                self.request_bodies(index);
            }
        }

        if self.ticks % SAVE_INTERVAL_TICKS == 0 {
            self.state.save_peers();
            if let Err(e) = self.state.db.save() {
                log::error!("periodic save failed: {}", e);
            }
            self.dial_from_address_book();
        }
    }
}

async fn run_reader(index: usize, mut read_half: OwnedReadHalf, events: mpsc::Sender<NodeEvent>) {
    let mut buffer = vec![0u8; READ_BUFFER_LEN];
    loop {
        match read_half.read(&mut buffer).await {
            Ok(0) => {
                let _ = events.send(NodeEvent::Disconnected { index }).await;
                return;
            }
            Ok(n) => {
                let chunk = buffer[..n].to_vec();
                if events.send(NodeEvent::Bytes { index, chunk }).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                log::debug!("peer {}: read error: {}", index, e);
                let _ = events.send(NodeEvent::Disconnected { index }).await;
                return;
            }
        }
    }
}

async fn run_writer(mut write_half: OwnedWriteHalf, mut outgoing: mpsc::Receiver<Vec<u8>>) {
    while let Some(bytes) = outgoing.recv().await {
        if let Err(e) = write_half.write_all(&bytes).await {
            log::debug!("write error: {}", e);
            return;
        }
    }
    let _ = write_half.shutdown().await;
}
