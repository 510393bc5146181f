use std::fmt::{self, Display, Formatter};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use log::{debug, trace, warn};
use parking_lot::{Mutex, RwLock};
use regtest_common::{
    config::{Network, NODE_NETWORK, NODE_WITNESS},
    p2p::{Decoded, MessageCodec, NetworkMessage, ProtocolError, VersionMessage},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::mpsc,
    task::JoinHandle,
    time::{timeout, Duration},
};

use super::{
    error::PeerError,
    handlers::{dispatch, HandlerRegistry, PeerFlags, Replies},
    message_log::MessageLog,
};
use crate::orchestrator::{poll_until, Clock, Probe, SystemClock, WaitConfig, WaitError};

// Messages queued for the writer task before senders wait
const WRITE_QUEUE_SIZE: usize = 256;
const READ_BUFFER_SIZE: usize = 64 * 1024;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub magic: [u8; 4],
    /// Answer `ping` with `pong` automatically
    pub auto_pong: bool,
    /// Send our `version` as soon as the transport is up
    pub send_version: bool,
    pub services: u64,
    pub start_height: i32,
    pub relay: bool,
    pub connect_timeout: Duration,
    pub wait: WaitConfig,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            magic: Network::Regtest.magic(),
            auto_pong: true,
            send_version: true,
            services: NODE_NETWORK | NODE_WITNESS,
            start_height: 0,
            relay: true,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            wait: WaitConfig::default(),
        }
    }
}

impl PeerConfig {
    pub fn with_auto_pong(mut self, auto_pong: bool) -> Self {
        self.auto_pong = auto_pong;
        self
    }

    pub fn with_send_version(mut self, send_version: bool) -> Self {
        self.send_version = send_version;
        self
    }

    pub fn with_services(mut self, services: u64) -> Self {
        self.services = services;
        self
    }

    pub fn with_start_height(mut self, start_height: i32) -> Self {
        self.start_height = start_height;
        self
    }

    pub fn with_relay(mut self, relay: bool) -> Self {
        self.relay = relay;
        self
    }

    pub fn with_wait(mut self, wait: WaitConfig) -> Self {
        self.wait = wait;
        self
    }
}

/// Lifecycle of a connection. Anything but `Open` is terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Open,
    /// The remote side closed the socket
    Disconnected,
    /// The receive path hit an undecodable message
    ProtocolFailure(ProtocolError),
    TransportFailure(String),
    /// Closed locally by `close()`
    Closed,
}

impl ConnectionStatus {
    fn to_error(&self) -> Option<PeerError> {
        match self {
            ConnectionStatus::Open => None,
            ConnectionStatus::Disconnected => Some(PeerError::Disconnected),
            ConnectionStatus::ProtocolFailure(e) => Some(PeerError::Protocol(e.clone())),
            ConnectionStatus::TransportFailure(e) => Some(PeerError::Transport(e.clone())),
            ConnectionStatus::Closed => Some(PeerError::Closed),
        }
    }
}

impl Display for ConnectionStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Open => write!(f, "open"),
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
            ConnectionStatus::ProtocolFailure(e) => write!(f, "failed ({})", e),
            ConnectionStatus::TransportFailure(e) => write!(f, "failed ({})", e),
            ConnectionStatus::Closed => write!(f, "closed"),
        }
    }
}

// State shared with the receive and write tasks
struct Shared {
    log: RwLock<MessageLog>,
    handlers: RwLock<HandlerRegistry>,
    flags: Arc<PeerFlags>,
    status: Mutex<ConnectionStatus>,
}

impl Shared {
    // Log first so waiters observe the message even if a handler panics
    fn on_message(&self, message: &NetworkMessage) -> Vec<NetworkMessage> {
        self.log.write().record(message);
        let handler = self.handlers.read().get(message.command());
        dispatch(handler, message)
    }

    // Only the first terminal state sticks
    fn terminate(&self, status: ConnectionStatus) {
        let mut current = self.status.lock();
        if *current == ConnectionStatus::Open {
            debug!("connection terminated: {}", status);
            *current = status;
        }
    }

    fn check_open(&self) -> Result<(), PeerError> {
        match self.status.lock().to_error() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// A scripted peer speaking the wire protocol to one node.
///
/// Receiving happens on a background task: every decoded message is logged
/// (count + last message per command) and handed to the handler registered
/// for its command. Scenario code observes the connection through the log
/// and the `wait_*` methods.
///
/// # Example
///
/// ```rust,no_run
/// use regtest_testing_framework::p2p::{PeerConfig, PeerConnection};
///
/// # async fn run() -> anyhow::Result<()> {
/// let peer = PeerConnection::connect("127.0.0.1:18444".parse()?, PeerConfig::default()).await?;
/// peer.wait_for_verack().await?;
/// peer.sync_with_ping().await?;
/// peer.close();
/// # Ok(())
/// # }
/// ```
pub struct PeerConnection {
    endpoint: SocketAddr,
    codec: MessageCodec,
    wait: WaitConfig,
    clock: Arc<dyn Clock>,
    shared: Arc<Shared>,
    sender: mpsc::Sender<Bytes>,
    ping_counter: AtomicU64,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl PeerConnection {
    pub async fn connect(endpoint: SocketAddr, config: PeerConfig) -> Result<Self, PeerError> {
        Self::connect_with_clock(endpoint, config, Arc::new(SystemClock)).await
    }

    pub async fn connect_with_clock(
        endpoint: SocketAddr,
        config: PeerConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, PeerError> {
        let stream = match timeout(config.connect_timeout, TcpStream::connect(endpoint)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(PeerError::Connect { endpoint, source }),
            Err(_) => {
                return Err(PeerError::ConnectTimeout {
                    endpoint,
                    timeout: config.connect_timeout,
                })
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            warn!("could not disable Nagle on {}: {}", endpoint, e);
        }
        debug!("connected to {}", endpoint);

        let codec = MessageCodec::new(config.magic);
        let flags = Arc::new(PeerFlags::new(config.auto_pong));
        let shared = Arc::new(Shared {
            log: RwLock::new(MessageLog::new()),
            handlers: RwLock::new(HandlerRegistry::with_defaults(flags.clone())),
            flags,
            status: Mutex::new(ConnectionStatus::Open),
        });

        let (read_half, write_half) = stream.into_split();
        let (sender, receiver) = mpsc::channel(WRITE_QUEUE_SIZE);
        let writer = tokio::spawn(write_loop(write_half, receiver, shared.clone()));
        let reader = tokio::spawn(receive_loop(read_half, codec, shared.clone(), sender.clone()));

        let connection = Self {
            endpoint,
            codec,
            wait: config.wait,
            clock,
            shared,
            sender,
            ping_counter: AtomicU64::new(0),
            reader,
            writer,
        };

        if config.send_version {
            let version = VersionMessage::new(endpoint, rand::random(), config.start_height)
                .with_services(config.services)
                .with_relay(config.relay);
            connection
                .send_without_ping(NetworkMessage::Version(version))
                .await?;
        }

        Ok(connection)
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.status.lock().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Open
    }

    /// Default timeout of the `wait_*` methods.
    pub fn wait_config(&self) -> WaitConfig {
        self.wait
    }

    // ========================================================================
    // Sending
    // ========================================================================

    /// Write one message. Does not wait for the node to process it.
    pub async fn send_without_ping(&self, message: NetworkMessage) -> Result<(), PeerError> {
        if log::log_enabled!(log::Level::Trace) {
            trace!("sending {} to {}", message, self.endpoint);
        }
        let bytes = self.codec.encode(&message)?;
        self.send_raw(Bytes::from(bytes)).await
    }

    /// Write pre-framed bytes as-is, e.g. to exercise malformed messages.
    pub async fn send_raw(&self, bytes: Bytes) -> Result<(), PeerError> {
        self.shared.check_open()?;
        if self.sender.send(bytes).await.is_err() {
            // The writer is gone; report why if the status knows
            return Err(self.shared.check_open().err().unwrap_or(PeerError::Closed));
        }
        Ok(())
    }

    /// Write one message, then wait until the node has processed it.
    pub async fn send_and_ping(&self, message: NetworkMessage) -> Result<(), PeerError> {
        self.send_without_ping(message).await?;
        self.sync_with_ping().await
    }

    /// Ping/pong barrier: once the node answers our ping, every message sent
    /// before it has been processed.
    pub async fn sync_with_ping(&self) -> Result<(), PeerError> {
        self.sync_with_ping_timeout(None).await
    }

    pub async fn sync_with_ping_timeout(&self, wait: Option<Duration>) -> Result<(), PeerError> {
        let nonce = self.ping_counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.send_without_ping(NetworkMessage::Ping(nonce)).await?;

        let label = format!("pong with nonce {} from {}", nonce, self.endpoint);
        self.wait_until_labeled(
            &label,
            |log| matches!(log.last("pong"), Some(NetworkMessage::Pong(n)) if *n == nonce),
            wait,
        )
        .await
    }

    // ========================================================================
    // Observing
    // ========================================================================

    pub fn message_count(&self, command: &str) -> u64 {
        self.shared.log.read().count(command)
    }

    pub fn last_message(&self, command: &str) -> Option<NetworkMessage> {
        self.shared.log.read().last(command).cloned()
    }

    /// Snapshot of the message log.
    pub fn message_log(&self) -> MessageLog {
        self.shared.log.read().clone()
    }

    /// `version` announced by the node, once received.
    pub fn remote_version(&self) -> Option<VersionMessage> {
        match self.last_message("version") {
            Some(NetworkMessage::Version(version)) => Some(version),
            _ => None,
        }
    }

    pub fn handshake_complete(&self) -> bool {
        self.shared.flags.verack_received.load(Ordering::SeqCst)
    }

    /// Block until `predicate` holds over the message log.
    ///
    /// `wait` overrides the connection's default timeout. A connection that
    /// fails while waiting aborts the wait with that failure; a predicate
    /// already satisfied by messages received before the failure still wins.
    pub async fn wait_until<F>(&self, predicate: F, wait: Option<Duration>) -> Result<(), PeerError>
    where
        F: FnMut(&MessageLog) -> bool,
    {
        self.wait_until_labeled("predicate", predicate, wait).await
    }

    async fn wait_until_labeled<F>(
        &self,
        label: &str,
        mut predicate: F,
        wait: Option<Duration>,
    ) -> Result<(), PeerError>
    where
        F: FnMut(&MessageLog) -> bool,
    {
        let config = match wait {
            Some(timeout) => self.wait.with_timeout(timeout),
            None => self.wait,
        };

        let result = poll_until(label, &config, self.clock.as_ref(), || {
            let probe = {
                let log = self.shared.log.read();
                if predicate(&log) {
                    Ok(Probe::Ready(()))
                } else {
                    match self.shared.check_open() {
                        Ok(()) => Ok(Probe::Pending(log.summary())),
                        Err(e) => Err(e),
                    }
                }
            };
            async move { probe }
        })
        .await;

        match result {
            Ok(()) => Ok(()),
            Err(WaitError::Timeout(e)) => Err(PeerError::Timeout(e)),
            Err(WaitError::Probe(e)) => Err(e),
        }
    }

    /// Wait until at least one `command` message has arrived and return the
    /// latest one.
    pub async fn wait_for_message(&self, command: &str) -> Result<NetworkMessage, PeerError> {
        let label = format!("'{}' from {}", command, self.endpoint);
        self.wait_until_labeled(&label, |log| log.has(command), None)
            .await?;
        self.last_message(command).ok_or(PeerError::Closed)
    }

    /// Wait for a `command` message newer than the `count` already seen.
    pub async fn wait_for_new_message(
        &self,
        command: &str,
        count: u64,
    ) -> Result<NetworkMessage, PeerError> {
        let label = format!("'{}' #{} from {}", command, count + 1, self.endpoint);
        self.wait_until_labeled(&label, |log| log.count(command) > count, None)
            .await?;
        self.last_message(command).ok_or(PeerError::Closed)
    }

    pub async fn wait_for_verack(&self) -> Result<(), PeerError> {
        let flags = self.shared.flags.clone();
        let label = format!("verack from {}", self.endpoint);
        self.wait_until_labeled(
            &label,
            move |_| flags.verack_received.load(Ordering::SeqCst),
            None,
        )
        .await
    }

    /// Wait until the connection leaves the open state for any reason.
    pub async fn wait_for_disconnect(&self) -> Result<(), PeerError> {
        let label = format!("disconnect of {}", self.endpoint);
        let result = poll_until(&label, &self.wait, self.clock.as_ref(), || {
            let status = self.status();
            async move {
                Ok::<_, PeerError>(match status {
                    ConnectionStatus::Open => Probe::Pending("still open".to_string()),
                    _ => Probe::Ready(()),
                })
            }
        })
        .await;

        match result {
            Ok(()) => Ok(()),
            Err(WaitError::Timeout(e)) => Err(PeerError::Timeout(e)),
            Err(WaitError::Probe(e)) => Err(e),
        }
    }

    // ========================================================================
    // Behaviour
    // ========================================================================

    /// Replace the handler of `command`.
    pub fn on<F>(&self, command: &str, handler: F)
    where
        F: Fn(&NetworkMessage, &mut Replies) + Send + Sync + 'static,
    {
        self.shared.handlers.write().set(command, handler);
    }

    pub fn remove_handler(&self, command: &str) {
        self.shared.handlers.write().remove(command);
    }

    pub fn set_auto_pong(&self, enabled: bool) {
        self.shared.flags.auto_pong.store(enabled, Ordering::SeqCst);
    }

    /// Tear down the transport. Every later operation fails with
    /// [`PeerError::Closed`].
    pub fn close(&self) {
        self.shared.terminate(ConnectionStatus::Closed);
        self.reader.abort();
        self.writer.abort();
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

impl Display for PeerConnection {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "PeerConnection[{}, {}]", self.endpoint, self.status())
    }
}

async fn write_loop(
    mut stream: OwnedWriteHalf,
    mut receiver: mpsc::Receiver<Bytes>,
    shared: Arc<Shared>,
) {
    while let Some(bytes) = receiver.recv().await {
        if let Err(e) = stream.write_all(&bytes).await {
            shared.terminate(ConnectionStatus::TransportFailure(e.to_string()));
            return;
        }
    }
}

async fn receive_loop(
    mut stream: OwnedReadHalf,
    codec: MessageCodec,
    shared: Arc<Shared>,
    sender: mpsc::Sender<Bytes>,
) {
    let mut buffer = BytesMut::with_capacity(READ_BUFFER_SIZE);
    loop {
        loop {
            match codec.decode(&buffer) {
                Ok(Decoded::Message { message, consumed }) => {
                    buffer.advance(consumed);
                    if log::log_enabled!(log::Level::Trace) {
                        trace!("received {}", message);
                    }
                    for reply in shared.on_message(&message) {
                        let bytes = match codec.encode(&reply) {
                            Ok(bytes) => bytes,
                            Err(e) => {
                                warn!("dropping automatic reply {}: {}", reply, e);
                                continue;
                            }
                        };
                        if sender.send(Bytes::from(bytes)).await.is_err() {
                            return;
                        }
                    }
                }
                Ok(Decoded::NeedMoreData) => break,
                Err(e) => {
                    warn!("dropping connection after undecodable data: {}", e);
                    shared.terminate(ConnectionStatus::ProtocolFailure(e));
                    return;
                }
            }
        }

        match stream.read_buf(&mut buffer).await {
            Ok(0) => {
                shared.terminate(ConnectionStatus::Disconnected);
                return;
            }
            Ok(_) => {}
            Err(e) => {
                shared.terminate(ConnectionStatus::TransportFailure(e.to_string()));
                return;
            }
        }
    }
}
