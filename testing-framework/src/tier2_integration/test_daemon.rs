//! TestDaemon - In-process simulated regtest node
//!
//! Wraps a tier-1 `SimChain` and its wallets behind the `NodeRpc` trait and
//! serves the wire protocol on a local TCP port, so the harness's peer
//! emulator and other daemons talk to it exactly as they would to a node.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use log::{debug, info, trace, warn};
use parking_lot::Mutex;
use regtest_common::{
    config::{NODE_NETWORK, NODE_WITNESS},
    crypto::Hash,
    descriptor::RawDescriptor,
    p2p::{
        BlockLocator, Decoded, Inventory, MessageCodec, NetworkMessage, VersionMessage,
        MAX_HEADERS_RESULTS,
    },
    time::get_current_time_in_seconds,
    transaction::Transaction,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
    sync::mpsc,
    task::JoinHandle,
    time::{timeout, Duration, Instant},
};

use super::{codes, MempoolEntry, NodeRpc, RpcError, ScanResult, ScanUnspent};
use crate::orchestrator::{Clock, DaemonSettings};
use crate::tier1_component::{decode_address, BlockOutcome, SimChain, SimWallet};

const WRITE_QUEUE_SIZE: usize = 1024;
const READ_BUFFER_SIZE: usize = 64 * 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Block hashes announced in answer to one `getblocks`.
pub const MAX_BLOCKS_PER_INV: usize = 2_000;

struct NodeState {
    chain: SimChain,
    wallets: BTreeMap<String, SimWallet>,
}

struct Outbound {
    message: NetworkMessage,
    // Relay delay: the writer holds the message until then
    not_before: Option<Instant>,
}

impl Outbound {
    fn now(message: NetworkMessage) -> Self {
        Self {
            message,
            not_before: None,
        }
    }
}

struct Session {
    remote: SocketAddr,
    outbound: bool,
    sender: mpsc::Sender<Outbound>,
    got_version: bool,
    // Handshake completes with the peer's verack
    ready: bool,
    peer_height: i32,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Session {
    fn abort(&self) {
        self.reader.abort();
        self.writer.abort();
    }
}

enum Action {
    Reply(NetworkMessage),
    /// Send to every other peer that completed the handshake
    Relay(NetworkMessage),
    Close,
}

struct DaemonInner {
    name: String,
    endpoint: SocketAddr,
    codec: MessageCodec,
    settings: DaemonSettings,
    clock: Arc<dyn Clock>,
    // Our version nonce, to detect connections to ourselves
    nonce: u64,
    running: AtomicBool,
    node: Mutex<NodeState>,
    sessions: Mutex<HashMap<u64, Session>>,
    next_session: AtomicU64,
}

/// In-process regtest node for integration testing
///
/// TestDaemon provides:
/// - The full `NodeRpc` surface over a simulated chain, mempool and wallets
/// - A TCP endpoint speaking the wire protocol (handshake, ping/pong,
///   inv/getdata, tx and block relay, getblocks/getheaders sync)
/// - Asynchronous relay to connected daemons, with an optional delay
/// - Direct state access for assertions
/// - Lifecycle management (stop/start)
///
/// # Example
///
/// ```rust,no_run
/// use regtest_testing_framework::tier2_integration::{NodeRpc, TestDaemonBuilder};
///
/// # async fn run() -> anyhow::Result<()> {
/// let node = TestDaemonBuilder::new().with_name("node0").build().await?;
/// node.create_wallet("w1").await?;
/// let address = node.get_new_address("w1").await?;
/// node.generate_to_address(101, &address).await?;
/// assert_eq!(node.get_balance("w1").await?, 50 * 100_000_000);
/// # Ok(())
/// # }
/// ```
pub struct TestDaemon {
    inner: Arc<DaemonInner>,
    listener: JoinHandle<()>,
}

impl TestDaemon {
    /// Bind a listener on `bind` and start serving peers.
    ///
    /// This is an internal constructor. Use `TestDaemonBuilder` instead.
    pub(crate) async fn spawn(
        name: String,
        bind: SocketAddr,
        codec: MessageCodec,
        chain: SimChain,
        settings: DaemonSettings,
        clock: Arc<dyn Clock>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(bind).await?;
        let endpoint = listener.local_addr()?;
        info!("{} listening on {} at height {}", name, endpoint, chain.height());

        let inner = Arc::new(DaemonInner {
            name,
            endpoint,
            codec,
            settings,
            clock,
            nonce: rand::random(),
            running: AtomicBool::new(true),
            node: Mutex::new(NodeState {
                chain,
                wallets: BTreeMap::new(),
            }),
            sessions: Mutex::new(HashMap::new()),
            next_session: AtomicU64::new(0),
        });
        let listener = tokio::spawn(accept_loop(inner.clone(), listener));
        Ok(Self { inner, listener })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.inner.endpoint
    }

    pub fn settings(&self) -> &DaemonSettings {
        &self.inner.settings
    }

    /// Clock driving relay delays
    pub fn clock(&self) -> Arc<dyn Clock> {
        self.inner.clock.clone()
    }

    // ========================================================================
    // Direct State Access (for test assertions)
    // ========================================================================

    /// Run `f` against the chain state.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let orphans = daemon.with_chain(|chain| chain.orphan_count());
    /// ```
    pub fn with_chain<R>(&self, f: impl FnOnce(&SimChain) -> R) -> R {
        f(&self.inner.node.lock().chain)
    }

    pub fn height(&self) -> u64 {
        self.with_chain(|chain| chain.height())
    }

    /// Endpoints of connected peers, outbound flag, handshake complete.
    pub fn peers(&self) -> Vec<(SocketAddr, bool, bool)> {
        let sessions = self.inner.sessions.lock();
        let mut peers: Vec<_> = sessions
            .values()
            .map(|session| (session.remote, session.outbound, session.ready))
            .collect();
        peers.sort();
        peers
    }

    // ========================================================================
    // Lifecycle Management (stop/start)
    // ========================================================================

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Stop the daemon
    ///
    /// Every peer connection is dropped, incoming connections are refused
    /// and RPC calls fail with a transport error until [`TestDaemon::start`].
    /// Chain state is kept.
    pub fn stop(&self) {
        info!("{} stopping", self.inner.name);
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.close_all_sessions();
    }

    pub fn start(&self) {
        info!("{} starting", self.inner.name);
        self.inner.running.store(true, Ordering::SeqCst);
    }

    pub fn restart(&self) {
        self.stop();
        self.start();
    }

    fn ensure_running(&self) -> Result<(), RpcError> {
        if !self.is_running() {
            return Err(RpcError::Transport(format!(
                "{} is not running",
                self.inner.name
            )));
        }
        Ok(())
    }

    // ========================================================================
    // Helper Methods
    // ========================================================================

    fn mine(&self, script_pubkey: &[u8], count: u64) -> Result<Vec<Hash>, RpcError> {
        let mut node = self.inner.node.lock();
        let mut hashes = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let block = node
                .chain
                .mine_block(script_pubkey, get_current_time_in_seconds() as u32)
                .map_err(|e| RpcError::rpc(codes::RPC_MISC_ERROR, e.to_string()))?;
            hashes.push(block.hash());
        }
        debug!(
            "{} mined {} blocks, tip {} at height {}",
            self.inner.name,
            count,
            node.chain.tip(),
            node.chain.height()
        );
        Ok(hashes)
    }

    async fn mine_and_announce(
        &self,
        script_pubkey: &[u8],
        count: u64,
    ) -> Result<Vec<Hash>, RpcError> {
        let hashes = self.mine(script_pubkey, count)?;
        if !hashes.is_empty() {
            let inventory = hashes.iter().map(|hash| Inventory::block(*hash)).collect();
            self.inner.relay(None, NetworkMessage::Inv(inventory)).await;
        }
        Ok(hashes)
    }

    async fn submit(&self, tx: Transaction) -> Result<Hash, RpcError> {
        let txid = tx.txid();
        let accepted = {
            let mut node = self.inner.node.lock();
            node.chain.accept_transaction(tx, get_current_time_in_seconds())
        };
        match accepted {
            Ok(txid) => {
                self.inner
                    .relay(None, NetworkMessage::Inv(vec![Inventory::tx(txid)]))
                    .await;
                Ok(txid)
            }
            Err(rejection) if rejection.is_already_in_mempool() => Ok(txid),
            Err(rejection) => {
                debug!("{} rejected {}: {}", self.inner.name, txid, rejection);
                Err(rejection.into())
            }
        }
    }
}

fn wallet_not_found() -> RpcError {
    RpcError::rpc(
        codes::RPC_WALLET_NOT_FOUND,
        "Requested wallet does not exist or is not loaded",
    )
}

fn parse_descriptor(descriptor: &str) -> Result<Vec<u8>, RpcError> {
    RawDescriptor::from_str(descriptor)
        .map(|descriptor| descriptor.script_pubkey().to_vec())
        .map_err(|e| RpcError::rpc(codes::RPC_INVALID_ADDRESS_OR_KEY, format!("Invalid descriptor: {}", e)))
}

impl Drop for TestDaemon {
    fn drop(&mut self) {
        self.listener.abort();
        self.inner.close_all_sessions();
    }
}

impl std::fmt::Display for TestDaemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TestDaemon({} @ {})", self.inner.name, self.inner.endpoint)
    }
}

// ========================================================================
// NodeRpc trait implementation
// ========================================================================

#[async_trait]
impl NodeRpc for TestDaemon {
    async fn create_wallet(&self, name: &str) -> Result<(), RpcError> {
        self.ensure_running()?;
        let mut node = self.inner.node.lock();
        if node.wallets.contains_key(name) {
            return Err(RpcError::rpc(
                codes::RPC_WALLET_ERROR,
                format!("Wallet \"{}\" already exists.", name),
            ));
        }
        node.wallets.insert(name.to_string(), SimWallet::new(name));
        Ok(())
    }

    async fn get_new_address(&self, wallet: &str) -> Result<String, RpcError> {
        self.ensure_running()?;
        let mut node = self.inner.node.lock();
        let wallet = node.wallets.get_mut(wallet).ok_or_else(wallet_not_found)?;
        Ok(wallet.new_address())
    }

    async fn get_balance(&self, wallet: &str) -> Result<u64, RpcError> {
        self.ensure_running()?;
        let node = self.inner.node.lock();
        let wallet = node.wallets.get(wallet).ok_or_else(wallet_not_found)?;
        Ok(wallet.balance(&node.chain))
    }

    async fn send_to_address(
        &self,
        wallet: &str,
        address: &str,
        amount: u64,
    ) -> Result<Hash, RpcError> {
        self.ensure_running()?;
        let script_pubkey = decode_address(address)?;
        let tx = {
            let mut guard = self.inner.node.lock();
            let NodeState { chain, wallets } = &mut *guard;
            let wallet = wallets.get_mut(wallet).ok_or_else(wallet_not_found)?;
            wallet.create_send(chain, script_pubkey, amount, self.inner.settings.wallet_fee_per_kvb)?
        };
        self.submit(tx).await
    }

    async fn get_raw_mempool(&self) -> Result<Vec<Hash>, RpcError> {
        self.ensure_running()?;
        Ok(self.with_chain(|chain| chain.mempool().txids()))
    }

    async fn get_mempool_entry(&self, txid: &Hash) -> Result<MempoolEntry, RpcError> {
        self.ensure_running()?;
        self.with_chain(|chain| {
            let mempool = chain.mempool();
            let entry = mempool.get(txid).ok_or_else(|| {
                RpcError::rpc(codes::RPC_INVALID_ADDRESS_OR_KEY, "Transaction not in mempool")
            })?;
            Ok(MempoolEntry {
                vsize: entry.vsize as u64,
                weight: entry.weight as u64,
                fee: entry.fee,
                time: entry.time,
                height: entry.height,
                depends: mempool.depends(txid),
            })
        })
    }

    async fn get_best_block_hash(&self) -> Result<Hash, RpcError> {
        self.ensure_running()?;
        Ok(self.with_chain(|chain| chain.tip()))
    }

    async fn get_block_count(&self) -> Result<u64, RpcError> {
        self.ensure_running()?;
        Ok(self.height())
    }

    async fn generate_to_address(&self, count: u64, address: &str) -> Result<Vec<Hash>, RpcError> {
        self.ensure_running()?;
        let script_pubkey = decode_address(address)?;
        self.mine_and_announce(&script_pubkey, count).await
    }

    async fn generate_to_descriptor(
        &self,
        count: u64,
        descriptor: &str,
    ) -> Result<Vec<Hash>, RpcError> {
        self.ensure_running()?;
        let script_pubkey = parse_descriptor(descriptor)?;
        self.mine_and_announce(&script_pubkey, count).await
    }

    async fn send_raw_transaction(&self, tx: &Transaction) -> Result<Hash, RpcError> {
        self.ensure_running()?;
        self.submit(tx.clone()).await
    }

    async fn scan_tx_out_set(&self, descriptors: &[String]) -> Result<ScanResult, RpcError> {
        self.ensure_running()?;
        let mut scripts = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            scripts.push(parse_descriptor(descriptor)?);
        }

        Ok(self.with_chain(|chain| {
            let unspents: Vec<ScanUnspent> = chain
                .scan_scripts(&scripts)
                .into_iter()
                .map(|(outpoint, coin)| ScanUnspent {
                    outpoint,
                    desc: RawDescriptor::new(coin.output.script_pubkey.clone())
                        .to_string_with_checksum(),
                    script_pubkey: coin.output.script_pubkey,
                    amount: coin.output.value,
                    coinbase: coin.coinbase,
                    height: coin.height,
                })
                .collect();
            ScanResult {
                height: chain.height(),
                best_block: chain.tip(),
                total_amount: unspents.iter().map(|unspent| unspent.amount).sum(),
                unspents,
            }
        }))
    }

    async fn add_node(&self, endpoint: SocketAddr) -> Result<(), RpcError> {
        self.ensure_running()?;
        let already = self
            .inner
            .sessions
            .lock()
            .values()
            .any(|session| session.outbound && session.remote == endpoint);
        if already {
            return Err(RpcError::rpc(
                codes::RPC_CLIENT_NODE_ALREADY_ADDED,
                "Error: Node already added",
            ));
        }

        let stream = match timeout(CONNECT_TIMEOUT, TcpStream::connect(endpoint)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(RpcError::rpc(
                    codes::RPC_CLIENT_NODE_NOT_CONNECTED,
                    format!("Unable to connect to {}: {}", endpoint, e),
                ))
            }
            Err(_) => {
                return Err(RpcError::rpc(
                    codes::RPC_CLIENT_NODE_NOT_CONNECTED,
                    format!("Timed out connecting to {}", endpoint),
                ))
            }
        };

        let sender = self.inner.start_session(stream, endpoint, true);
        let version = self.inner.version_message(endpoint);
        sender
            .send(Outbound::now(NetworkMessage::Version(version)))
            .await
            .map_err(|_| RpcError::rpc(codes::RPC_CLIENT_NODE_NOT_CONNECTED, "Connection closed"))?;
        debug!("{} connecting to {}", self.inner.name, endpoint);
        Ok(())
    }

    async fn disconnect_node(&self, endpoint: SocketAddr) -> Result<(), RpcError> {
        self.ensure_running()?;
        let mut sessions = self.inner.sessions.lock();
        let id = sessions
            .iter()
            .find(|(_, session)| session.remote == endpoint)
            .map(|(id, _)| *id)
            .ok_or_else(|| {
                RpcError::rpc(
                    codes::RPC_CLIENT_NODE_NOT_CONNECTED,
                    "Node not found in connected nodes",
                )
            })?;
        if let Some(session) = sessions.remove(&id) {
            debug!("{} disconnecting {}", self.inner.name, session.remote);
            session.abort();
        }
        Ok(())
    }

    async fn get_connection_count(&self) -> Result<usize, RpcError> {
        self.ensure_running()?;
        Ok(self
            .inner
            .sessions
            .lock()
            .values()
            .filter(|session| session.ready)
            .count())
    }

    fn p2p_endpoint(&self) -> SocketAddr {
        self.inner.endpoint
    }
}

// ========================================================================
// Peer protocol
// ========================================================================

impl DaemonInner {
    fn version_message(&self, remote: SocketAddr) -> VersionMessage {
        let height = self.node.lock().chain.height();
        VersionMessage::new(remote, self.nonce, height as i32)
            .with_services(NODE_NETWORK | NODE_WITNESS)
            .with_relay(true)
    }

    fn start_session(
        self: &Arc<Self>,
        stream: TcpStream,
        remote: SocketAddr,
        outbound: bool,
    ) -> mpsc::Sender<Outbound> {
        if let Err(e) = stream.set_nodelay(true) {
            warn!("{}: could not disable Nagle for {}: {}", self.name, remote, e);
        }
        let id = self.next_session.fetch_add(1, Ordering::SeqCst);
        let (read_half, write_half) = stream.into_split();
        let (sender, receiver) = mpsc::channel(WRITE_QUEUE_SIZE);

        // Registered before the reader can look the session up
        let mut sessions = self.sessions.lock();
        let writer = tokio::spawn(session_writer(write_half, receiver, self.codec, self.clock.clone()));
        let reader = tokio::spawn(session_reader(self.clone(), id, read_half, sender.clone()));
        sessions.insert(
            id,
            Session {
                remote,
                outbound,
                sender: sender.clone(),
                got_version: false,
                ready: false,
                peer_height: 0,
                reader,
                writer,
            },
        );
        trace!("{}: session {} with {} (outbound: {})", self.name, id, remote, outbound);
        sender
    }

    fn end_session(&self, id: u64) {
        if let Some(session) = self.sessions.lock().remove(&id) {
            debug!("{}: peer {} disconnected", self.name, session.remote);
            session.writer.abort();
        }
    }

    fn close_all_sessions(&self) {
        for (_, session) in self.sessions.lock().drain() {
            session.abort();
        }
    }

    async fn relay(&self, except: Option<u64>, message: NetworkMessage) {
        let delay = self.settings.relay_delay();
        let not_before = (!delay.is_zero()).then(|| self.clock.now() + delay);
        let targets: Vec<mpsc::Sender<Outbound>> = self
            .sessions
            .lock()
            .iter()
            .filter(|(id, session)| session.ready && Some(**id) != except)
            .map(|(_, session)| session.sender.clone())
            .collect();

        for sender in targets {
            let outbound = Outbound {
                message: message.clone(),
                not_before,
            };
            // A closed channel means the session is ending
            let _ = sender.send(outbound).await;
        }
    }

    fn on_message(&self, id: u64, message: NetworkMessage) -> Vec<Action> {
        match message {
            NetworkMessage::Version(version) => self.on_version(id, version),
            NetworkMessage::Verack => self.on_verack(id),
            NetworkMessage::Ping(nonce) => vec![Action::Reply(NetworkMessage::Pong(nonce))],
            NetworkMessage::Inv(items) => self.on_inv(items),
            NetworkMessage::GetData(items) => self.on_getdata(items),
            NetworkMessage::Tx(tx) => self.on_tx(tx),
            NetworkMessage::Block(block) => {
                let hash = block.hash();
                let mut node = self.node.lock();
                match node.chain.process_block(block) {
                    Ok(BlockOutcome::Connected { .. }) => {
                        vec![Action::Relay(NetworkMessage::Inv(vec![Inventory::block(
                            node.chain.tip(),
                        )]))]
                    }
                    Ok(BlockOutcome::Orphan { missing }) => {
                        trace!("{}: orphan {} needs {}, asking for blocks", self.name, hash, missing);
                        vec![Action::Reply(NetworkMessage::GetBlocks(BlockLocator::new(
                            node.chain.locator(),
                            Hash::zero(),
                        )))]
                    }
                    Ok(_) => Vec::new(),
                    Err(e) => {
                        debug!("{}: {}", self.name, e);
                        Vec::new()
                    }
                }
            }
            NetworkMessage::GetBlocks(locator) => {
                let node = self.node.lock();
                let hashes = node.chain.hashes_after(
                    &locator.locator_hashes,
                    &locator.stop_hash,
                    MAX_BLOCKS_PER_INV,
                );
                if hashes.is_empty() {
                    return Vec::new();
                }
                let inventory = hashes.into_iter().map(Inventory::block).collect();
                vec![Action::Reply(NetworkMessage::Inv(inventory))]
            }
            NetworkMessage::GetHeaders(locator) => {
                let node = self.node.lock();
                let headers = node.chain.headers_after(
                    &locator.locator_hashes,
                    &locator.stop_hash,
                    MAX_HEADERS_RESULTS,
                );
                vec![Action::Reply(NetworkMessage::Headers(headers))]
            }
            NetworkMessage::Headers(headers) => {
                let node = self.node.lock();
                let wanted: Vec<Inventory> = headers
                    .iter()
                    .map(|header| header.block_hash())
                    .filter(|hash| !node.chain.knows_block(hash))
                    .map(Inventory::block)
                    .collect();
                if wanted.is_empty() {
                    Vec::new()
                } else {
                    vec![Action::Reply(NetworkMessage::GetData(wanted))]
                }
            }
            NetworkMessage::MemPool => {
                let txids = self.node.lock().chain.mempool().txids();
                if txids.is_empty() {
                    return Vec::new();
                }
                let inventory = txids.into_iter().map(Inventory::tx).collect();
                vec![Action::Reply(NetworkMessage::Inv(inventory))]
            }
            other => {
                trace!("{}: ignoring {}", self.name, other.command());
                Vec::new()
            }
        }
    }

    fn on_version(&self, id: u64, version: VersionMessage) -> Vec<Action> {
        if version.nonce == self.nonce {
            debug!("{}: connected to self, dropping", self.name);
            return vec![Action::Close];
        }
        let (outbound, remote) = {
            let mut sessions = self.sessions.lock();
            let Some(session) = sessions.get_mut(&id) else {
                return Vec::new();
            };
            if session.got_version {
                return Vec::new();
            }
            session.got_version = true;
            session.peer_height = version.start_height;
            (session.outbound, session.remote)
        };

        let mut actions = Vec::new();
        if !outbound {
            actions.push(Action::Reply(NetworkMessage::Version(self.version_message(remote))));
        }
        actions.push(Action::Reply(NetworkMessage::Verack));
        actions
    }

    fn on_verack(&self, id: u64) -> Vec<Action> {
        let peer_height = {
            let mut sessions = self.sessions.lock();
            let Some(session) = sessions.get_mut(&id) else {
                return Vec::new();
            };
            session.ready = true;
            session.peer_height
        };

        let node = self.node.lock();
        if i64::from(peer_height) > node.chain.height() as i64 {
            vec![Action::Reply(NetworkMessage::GetBlocks(BlockLocator::new(
                node.chain.locator(),
                Hash::zero(),
            )))]
        } else {
            Vec::new()
        }
    }

    fn on_inv(&self, items: Vec<Inventory>) -> Vec<Action> {
        let node = self.node.lock();
        let wanted: Vec<Inventory> = items
            .into_iter()
            .filter(|item| {
                if item.inv_type.is_tx() {
                    !node.chain.mempool().contains(&item.hash)
                } else if item.inv_type.is_block() {
                    !node.chain.knows_block(&item.hash)
                } else {
                    false
                }
            })
            .collect();
        if wanted.is_empty() {
            Vec::new()
        } else {
            vec![Action::Reply(NetworkMessage::GetData(wanted))]
        }
    }

    fn on_getdata(&self, items: Vec<Inventory>) -> Vec<Action> {
        let node = self.node.lock();
        let mut actions = Vec::new();
        let mut missing = Vec::new();
        for item in items {
            if item.inv_type.is_tx() {
                match node.chain.mempool().get(&item.hash) {
                    Some(entry) => actions.push(Action::Reply(NetworkMessage::Tx(entry.tx.clone()))),
                    None => missing.push(item),
                }
            } else if item.inv_type.is_block() {
                match node.chain.get_block(&item.hash) {
                    Some(block) => actions.push(Action::Reply(NetworkMessage::Block(block.clone()))),
                    None => missing.push(item),
                }
            } else {
                missing.push(item);
            }
        }
        if !missing.is_empty() {
            actions.push(Action::Reply(NetworkMessage::NotFound(missing)));
        }
        actions
    }

    fn on_tx(&self, tx: Transaction) -> Vec<Action> {
        let txid = tx.txid();
        let mut node = self.node.lock();
        match node.chain.accept_transaction(tx, get_current_time_in_seconds()) {
            Ok(txid) => vec![Action::Relay(NetworkMessage::Inv(vec![Inventory::tx(txid)]))],
            Err(rejection) if rejection.is_already_in_mempool() => Vec::new(),
            Err(rejection) => {
                debug!("{}: peer tx {} rejected: {}", self.name, txid, rejection);
                Vec::new()
            }
        }
    }
}

async fn accept_loop(inner: Arc<DaemonInner>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                if !inner.running.load(Ordering::SeqCst) {
                    trace!("{}: refusing {} while stopped", inner.name, remote);
                    continue;
                }
                debug!("{}: inbound connection from {}", inner.name, remote);
                inner.start_session(stream, remote, false);
            }
            Err(e) => {
                warn!("{}: accept failed: {}", inner.name, e);
                inner.clock.sleep(Duration::from_millis(10)).await;
            }
        }
    }
}

async fn session_writer(
    mut stream: OwnedWriteHalf,
    mut receiver: mpsc::Receiver<Outbound>,
    codec: MessageCodec,
    clock: Arc<dyn Clock>,
) {
    while let Some(outbound) = receiver.recv().await {
        if let Some(due) = outbound.not_before {
            let now = clock.now();
            if due > now {
                clock.sleep(due - now).await;
            }
        }
        let bytes = match codec.encode(&outbound.message) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("not sending {}: {}", outbound.message, e);
                continue;
            }
        };
        if stream.write_all(&bytes).await.is_err() {
            return;
        }
    }
}

async fn session_reader(
    inner: Arc<DaemonInner>,
    id: u64,
    mut stream: OwnedReadHalf,
    sender: mpsc::Sender<Outbound>,
) {
    let mut buffer = BytesMut::with_capacity(READ_BUFFER_SIZE);
    'session: loop {
        loop {
            match inner.codec.decode(&buffer) {
                Ok(Decoded::Message { message, consumed }) => {
                    buffer.advance(consumed);
                    if log::log_enabled!(log::Level::Trace) {
                        trace!("{}: session {} received {}", inner.name, id, message);
                    }
                    for action in inner.on_message(id, message) {
                        match action {
                            Action::Reply(reply) => {
                                if sender.send(Outbound::now(reply)).await.is_err() {
                                    break 'session;
                                }
                            }
                            Action::Relay(message) => inner.relay(Some(id), message).await,
                            Action::Close => break 'session,
                        }
                    }
                }
                Ok(Decoded::NeedMoreData) => break,
                Err(e) => {
                    debug!("{}: session {} sent undecodable data: {}", inner.name, id, e);
                    break 'session;
                }
            }
        }

        match stream.read_buf(&mut buffer).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
    }
    inner.end_session(id);
}
