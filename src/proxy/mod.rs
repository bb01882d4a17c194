//! The proxy coordinator: listener fabric, pair registry, capture log,
//! and the operator-facing control surface.

use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use bytes::Bytes;
use color_eyre::eyre::{self, WrapErr};
use slotmap::SlotMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinSet};
use tokio_rustls::rustls::ServerConfig;
use tokio_util::sync::CancellationToken;

use crate::mqtt::capture::CaptureStore;
use crate::mqtt::codec::{self, CapturedPacket};
use crate::mqtt::Direction;

use pair::{ConnectionPair, PairCommand};
use socket::{DirectSocket, ProxySocket};
use tls::{TlsAcceptor, TlsSocket};

mod pair;
pub mod socket;
pub mod tls;

slotmap::new_key_type! {
    /// Stable identifier for a connection pair.
    ///
    /// Handed to the connection callback and used internally to deregister
    /// a pair when its relay task finishes. Completions never hold the pair
    /// itself; a key that no longer resolves means "already closed".
    pub struct PairId;
}

/// Sink for decoded packets, invoked on the relay task immediately after
/// the capture store append. Must not block; consumers that share state
/// with other threads are responsible for their own synchronization.
pub type PacketCallback = Box<dyn Fn(Direction, &CapturedPacket) + Send + Sync>;

/// Invoked once per accepted pair, before its relay loop starts.
pub type ConnectionCallback = Box<dyn Fn(&PairInfo) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct PairInfo {
    pub id: PairId,
    pub remote_addr: SocketAddr,
    /// Whether the client side is TLS-terminated.
    pub tls: bool,
}

/// State shared between the coordinator and the relay tasks.
pub(crate) struct Shared {
    capture: Mutex<CaptureStore>,
    broker_addr: RwLock<(String, u16)>,
    packet_callback: RwLock<Option<PacketCallback>>,
}

impl Shared {
    fn new() -> Self {
        Shared {
            capture: Mutex::new(CaptureStore::new()),
            broker_addr: RwLock::new(("127.0.0.1".to_owned(), 1883)),
            packet_callback: RwLock::new(None),
        }
    }

    /// The upstream destination, consulted on each new CONNECT.
    pub(crate) fn broker_addr(&self) -> (String, u16) {
        self.broker_addr
            .read()
            .expect("broker address lock poisoned")
            .clone()
    }

    /// Append a decoded packet to the capture log, then emit it to the
    /// registered sink.
    pub(crate) fn record(&self, direction: Direction, packet: CapturedPacket) {
        self.capture
            .lock()
            .expect("capture store mutex poisoned")
            .store(packet.clone());

        let callback = self
            .packet_callback
            .read()
            .expect("packet callback lock poisoned");

        if let Some(callback) = &*callback {
            callback(direction, &packet);
        }
    }
}

/// Control operations posted to the coordinator loop.
///
/// Executing these on the I/O context keeps them serialized with in-flight
/// relay registration; fallible operations reply over a oneshot.
enum ProxyCommand {
    Start {
        addr: SocketAddr,
        reply: oneshot::Sender<crate::Result<SocketAddr>>,
    },
    StartTls {
        addr: SocketAddr,
        reply: oneshot::Sender<crate::Result<SocketAddr>>,
    },
    Stop,
    SetBrokerConfig {
        host: String,
        port: u16,
    },
    SetTlsContext {
        config: Arc<ServerConfig>,
    },
    SetPacketCallback {
        callback: Option<PacketCallback>,
    },
    SetConnectionCallback {
        callback: Option<ConnectionCallback>,
    },
    Inject {
        topic: String,
        payload: Bytes,
        to_client: bool,
    },
    Replay {
        index: usize,
    },
    ClearCaptures,
    Shutdown,
}

/// Non-owning registration of a live pair: enough to deposit outbound
/// frames and to pick an inject/replay target, nothing more.
struct PairHandle {
    cmd_tx: mpsc::Sender<PairCommand>,
    tls: bool,
}

/// The intercepting proxy.
///
/// Owns the listeners, the TLS material, the pair registry, and the shared
/// capture state. Configure it (directly, before [`run`](Proxy::run), or
/// through a [`ProxyHandle`] from anywhere), then drive the event loop.
pub struct Proxy {
    plain: Option<TcpListener>,
    tls: Option<TlsAcceptor>,
    tls_context: Option<Arc<ServerConfig>>,

    connection_callback: Option<ConnectionCallback>,

    pairs: SlotMap<PairId, PairHandle>,
    tasks: JoinSet<PairId>,
    /// Cancelled and replaced on `stop` so pairs spawned afterwards get a
    /// fresh token.
    pairs_token: CancellationToken,

    shared: Arc<Shared>,

    cmd_tx: mpsc::Sender<ProxyCommand>,
    cmd_rx: mpsc::Receiver<ProxyCommand>,
}

impl Default for Proxy {
    fn default() -> Self {
        Self::new()
    }
}

impl Proxy {
    pub fn new() -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);

        Proxy {
            plain: None,
            tls: None,
            tls_context: None,
            connection_callback: None,
            pairs: SlotMap::with_key(),
            tasks: JoinSet::new(),
            pairs_token: CancellationToken::new(),
            shared: Arc::new(Shared::new()),
            cmd_tx,
            cmd_rx,
        }
    }

    /// A cloneable control surface whose calls execute on the proxy's
    /// event loop.
    pub fn handle(&self) -> ProxyHandle {
        ProxyHandle {
            cmd_tx: self.cmd_tx.clone(),
        }
    }

    /// Open the plain MQTT listener. An already-open listener is replaced.
    pub async fn start(&mut self, listen_addr: SocketAddr) -> crate::Result<SocketAddr> {
        let listener = TcpListener::bind(listen_addr)
            .await
            .wrap_err_with(|| format!("failed to bind listen_addr: {}", listen_addr))?;

        let local_addr = listener
            .local_addr()
            .wrap_err("error querying bound address")?;

        if self.plain.replace(listener).is_some() {
            tracing::info!("replacing active MQTT listener");
        }

        tracing::info!(%local_addr, "listening for MQTT connections");

        Ok(local_addr)
    }

    /// Open the TLS-terminating listener.
    ///
    /// Fails unless a certificate has been loaded with
    /// [`set_tls_certificate`](Proxy::set_tls_certificate).
    pub async fn start_tls(&mut self, listen_addr: SocketAddr) -> crate::Result<SocketAddr> {
        let Some(config) = self.tls_context.clone() else {
            eyre::bail!("no TLS certificate configured; load one before starting the TLS listener");
        };

        let acceptor = TlsAcceptor::bind(listen_addr, config).await?;

        let local_addr = acceptor
            .local_addr()
            .wrap_err("error querying bound address")?;

        if self.tls.replace(acceptor).is_some() {
            tracing::info!("replacing active MQTT-over-TLS listener");
        }

        tracing::info!(%local_addr, "listening for MQTT-over-TLS connections");

        Ok(local_addr)
    }

    /// Close both listeners and tear down every live pair.
    ///
    /// The proxy itself stays usable: `start`/`start_tls` may be called
    /// again afterwards.
    pub fn stop(&mut self) {
        // Dropping the acceptors closes them, cancelling pending accepts.
        self.plain = None;
        self.tls = None;

        self.pairs_token.cancel();
        self.pairs_token = CancellationToken::new();
        self.pairs.clear();

        tracing::info!("proxy stopped");
    }

    /// Set the upstream broker dialed on each new CONNECT.
    pub fn set_broker_config(&self, host: impl Into<String>, port: u16) {
        *self
            .shared
            .broker_addr
            .write()
            .expect("broker address lock poisoned") = (host.into(), port);
    }

    /// Load the PEM certificate chain and private key presented to
    /// intercepted clients.
    ///
    /// NOTE: uses blocking I/O internally.
    pub fn set_tls_certificate(&mut self, cert_file: &Path, key_file: &Path) -> crate::Result<()> {
        self.tls_context = Some(tls::load_server_config(cert_file, key_file)?);
        Ok(())
    }

    /// Replace the packet sink.
    pub fn set_packet_callback(
        &self,
        callback: impl Fn(Direction, &CapturedPacket) + Send + Sync + 'static,
    ) {
        self.replace_packet_callback(Some(Box::new(callback)));
    }

    fn replace_packet_callback(&self, callback: Option<PacketCallback>) {
        *self
            .shared
            .packet_callback
            .write()
            .expect("packet callback lock poisoned") = callback;
    }

    /// Replace the accepted-connection sink.
    pub fn set_connection_callback(
        &mut self,
        callback: impl Fn(&PairInfo) + Send + Sync + 'static,
    ) {
        self.connection_callback = Some(Box::new(callback));
    }

    /// Encode a synthetic QoS 0 PUBLISH and deposit it on the active pair,
    /// toward the client or the broker.
    ///
    /// With no active pair this is a no-op with a diagnostic.
    pub fn inject_packet(&self, topic: &str, payload: &[u8], to_client: bool) {
        if topic.len() > usize::from(u16::MAX) {
            tracing::warn!("rejecting injected PUBLISH: topic exceeds the 2-byte length prefix");
            return;
        }

        let frame = codec::encode_publish(topic, payload);
        self.deposit(frame, to_client, "injected PUBLISH");
    }

    /// Write a captured packet's raw bytes back to the client side of the
    /// active pair.
    ///
    /// A stale index (evicted or never stored) is a no-op with a
    /// diagnostic.
    pub fn replay_packet(&self, index: usize) {
        let frame = {
            let capture = self
                .shared
                .capture
                .lock()
                .expect("capture store mutex poisoned");

            match capture.get(index) {
                Some(packet) => packet.raw.clone(),
                None => {
                    tracing::warn!(index, "replay index out of range");
                    return;
                }
            }
        };

        self.deposit(frame, true, "replayed packet");
    }

    /// Drop all captured packets.
    pub fn clear_captures(&self) {
        self.shared
            .capture
            .lock()
            .expect("capture store mutex poisoned")
            .clear();
    }

    /// Number of live connection pairs.
    pub fn connections(&self) -> usize {
        self.tasks.len()
    }

    fn deposit(&self, frame: Bytes, to_client: bool, what: &'static str) {
        // Prefer the TLS session when both listener kinds have clients.
        let target = self
            .pairs
            .values()
            .find(|pair| pair.tls)
            .or_else(|| self.pairs.values().next());

        let Some(pair) = target else {
            tracing::warn!("no active connection pair; dropping {what}");
            return;
        };

        if let Err(e) = pair.cmd_tx.try_send(PairCommand::Write { frame, to_client }) {
            tracing::warn!("failed to deposit {what} onto connection pair: {e}");
        }
    }

    /// Drive accepts, pair lifecycle, and control commands until
    /// [`ProxyHandle::shutdown`] is received.
    pub async fn run(&mut self) -> crate::Result<()> {
        let mut shutdown = false;

        while !shutdown {
            tokio::select! {
                res = accept_plain(self.plain.as_ref()) => {
                    self.handle_accept(res);
                }
                socket = accept_tls(self.tls.as_mut()) => {
                    self.handle_tls_accepted(socket);
                }
                Some(res) = self.tasks.join_next() => {
                    self.handle_pair_finished(res);
                }
                Some(cmd) = self.cmd_rx.recv() => {
                    shutdown = self.handle_command(cmd).await;
                }
            }
        }

        Ok(())
    }

    /// Stop everything and wait for the relay tasks to drain.
    pub async fn shutdown(mut self) {
        self.stop();

        while let Some(res) = self.tasks.join_next().await {
            if let Err(e) = res {
                tracing::error!(?e, "connection pair task failed");
            }

            tracing::info!("{} connections remaining", self.tasks.len());
        }
    }

    fn handle_accept(&mut self, result: io::Result<(TcpStream, SocketAddr)>) {
        match result {
            Ok((stream, remote_addr)) => {
                tracing::info!(%remote_addr, "connection received");

                // Disable Nagle's algorithm; chunks are forwarded whole.
                if let Err(e) = stream.set_nodelay(true) {
                    tracing::debug!(?e, "error setting TCP_NODELAY on socket");
                }

                self.spawn_pair(DirectSocket::new(remote_addr, stream), false);
            }
            Err(e) => tracing::error!(?e, "accept failed"),
        }
    }

    fn handle_tls_accepted(&mut self, socket: TlsSocket) {
        tracing::info!(remote_addr = %socket.remote_addr(), "TLS connection established");

        self.spawn_pair(socket, true);
    }

    fn spawn_pair<S: ProxySocket + Sync>(&mut self, socket: S, tls: bool) {
        let remote_addr = socket.remote_addr();

        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let id = self.pairs.insert(PairHandle { cmd_tx, tls });

        if let Some(callback) = &self.connection_callback {
            callback(&PairInfo {
                id,
                remote_addr,
                tls,
            });
        }

        let pair = ConnectionPair::new(
            id,
            socket,
            cmd_rx,
            self.pairs_token.clone(),
            self.shared.clone(),
        );

        self.tasks.spawn(pair.run());
    }

    fn handle_pair_finished(&mut self, res: Result<PairId, JoinError>) {
        match res {
            Ok(id) => {
                self.pairs.remove(id);
            }
            Err(e) => tracing::error!(?e, "connection pair task failed"),
        }
    }

    /// Returns `true` when the command asks the event loop to exit.
    async fn handle_command(&mut self, cmd: ProxyCommand) -> bool {
        match cmd {
            ProxyCommand::Start { addr, reply } => {
                let _ = reply.send(self.start(addr).await);
            }
            ProxyCommand::StartTls { addr, reply } => {
                let _ = reply.send(self.start_tls(addr).await);
            }
            ProxyCommand::Stop => self.stop(),
            ProxyCommand::SetBrokerConfig { host, port } => self.set_broker_config(host, port),
            ProxyCommand::SetTlsContext { config } => self.tls_context = Some(config),
            ProxyCommand::SetPacketCallback { callback } => self.replace_packet_callback(callback),
            ProxyCommand::SetConnectionCallback { callback } => {
                self.connection_callback = callback;
            }
            ProxyCommand::Inject {
                topic,
                payload,
                to_client,
            } => self.inject_packet(&topic, &payload, to_client),
            ProxyCommand::Replay { index } => self.replay_packet(index),
            ProxyCommand::ClearCaptures => self.clear_captures(),
            ProxyCommand::Shutdown => return true,
        }

        false
    }
}

/// The operator-facing control surface: start/stop, broker config, TLS
/// material, callbacks, injection, and replay.
///
/// Every call is posted onto the proxy event loop; fallible operations
/// wait for the loop's reply.
#[derive(Clone)]
pub struct ProxyHandle {
    cmd_tx: mpsc::Sender<ProxyCommand>,
}

impl ProxyHandle {
    async fn send(&self, cmd: ProxyCommand) -> crate::Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| eyre::eyre!("proxy has shut down"))
    }

    /// Open the plain MQTT listener; returns the bound address.
    pub async fn start(&self, addr: SocketAddr) -> crate::Result<SocketAddr> {
        let (reply, reply_rx) = oneshot::channel();
        self.send(ProxyCommand::Start { addr, reply }).await?;
        reply_rx.await.wrap_err("proxy dropped the start request")?
    }

    /// Open the TLS-terminating listener; returns the bound address.
    pub async fn start_tls(&self, addr: SocketAddr) -> crate::Result<SocketAddr> {
        let (reply, reply_rx) = oneshot::channel();
        self.send(ProxyCommand::StartTls { addr, reply }).await?;
        reply_rx
            .await
            .wrap_err("proxy dropped the start_tls request")?
    }

    /// Close the listeners and tear down every live pair.
    pub async fn stop(&self) -> crate::Result<()> {
        self.send(ProxyCommand::Stop).await
    }

    pub async fn set_broker_config(
        &self,
        host: impl Into<String>,
        port: u16,
    ) -> crate::Result<()> {
        self.send(ProxyCommand::SetBrokerConfig {
            host: host.into(),
            port,
        })
        .await
    }

    /// Load TLS material from PEM files and install it.
    ///
    /// NOTE: uses blocking I/O internally; certificates are small and this
    /// is an operator action, not a hot path.
    pub async fn set_tls_certificate(&self, cert_file: &Path, key_file: &Path) -> crate::Result<()> {
        let config = tls::load_server_config(cert_file, key_file)?;
        self.send(ProxyCommand::SetTlsContext { config }).await
    }

    /// Replace the packet sink.
    pub async fn set_packet_callback(
        &self,
        callback: impl Fn(Direction, &CapturedPacket) + Send + Sync + 'static,
    ) -> crate::Result<()> {
        self.send(ProxyCommand::SetPacketCallback {
            callback: Some(Box::new(callback)),
        })
        .await
    }

    /// Replace the accepted-connection sink.
    pub async fn set_connection_callback(
        &self,
        callback: impl Fn(&PairInfo) + Send + Sync + 'static,
    ) -> crate::Result<()> {
        self.send(ProxyCommand::SetConnectionCallback {
            callback: Some(Box::new(callback)),
        })
        .await
    }

    /// Inject a synthetic QoS 0 PUBLISH toward the client or the broker of
    /// the active pair.
    pub async fn inject_packet(
        &self,
        topic: impl Into<String>,
        payload: impl Into<Bytes>,
        to_client: bool,
    ) -> crate::Result<()> {
        self.send(ProxyCommand::Inject {
            topic: topic.into(),
            payload: payload.into(),
            to_client,
        })
        .await
    }

    /// Replay a captured packet (by capture index) to the client side.
    pub async fn replay_packet(&self, index: usize) -> crate::Result<()> {
        self.send(ProxyCommand::Replay { index }).await
    }

    /// Drop all captured packets.
    pub async fn clear_captures(&self) -> crate::Result<()> {
        self.send(ProxyCommand::ClearCaptures).await
    }

    /// Ask the proxy event loop to exit.
    pub async fn shutdown(&self) -> crate::Result<()> {
        self.send(ProxyCommand::Shutdown).await
    }
}

async fn accept_plain(listener: Option<&TcpListener>) -> io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

async fn accept_tls(acceptor: Option<&mut TlsAcceptor>) -> TlsSocket {
    match acceptor {
        Some(acceptor) => acceptor.accept().await,
        None => std::future::pending().await,
    }
}
