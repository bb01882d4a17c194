use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::mqtt::codec::CapturedPacket;
use crate::mqtt::{Direction, PacketType};
use crate::proxy::socket::ProxySocket;
use crate::proxy::{PairId, Shared};

const READ_BUF_CAPACITY: usize = 8192;

/// Outbound frame deposited onto a pair by the coordinator.
#[derive(Debug)]
pub(crate) enum PairCommand {
    /// Write `frame` verbatim to the client side (`to_client`) or the
    /// broker side. Injected and replayed frames are not captured.
    Write { frame: Bytes, to_client: bool },
}

#[derive(Debug, thiserror::Error)]
enum PairError {
    #[error("error reading from client socket: {0}")]
    ClientRead(#[source] io::Error),
    #[error("error writing to client socket: {0}")]
    ClientWrite(#[source] io::Error),
    #[error("error reading from broker socket: {0}")]
    BrokerRead(#[source] io::Error),
    #[error("error writing to broker socket: {0}")]
    BrokerWrite(#[source] io::Error),
    #[error("error connecting to broker at {addr}: {source}")]
    BrokerConnect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("client sent data before CONNECT; nowhere to forward it")]
    DataBeforeConnect,
}

/// One bridged client session: the client-facing socket, the broker-facing
/// socket, and the relay loop between them.
///
/// The pair exclusively owns both sockets. The broker side stays
/// unconnected until the first CONNECT is observed from the client; reading
/// on that side begins only once the dial succeeds. Any read, write, or
/// connect error tears the whole pair down.
pub(crate) struct ConnectionPair<S> {
    id: PairId,
    remote_addr: SocketAddr,

    client: S,
    broker: Option<TcpStream>,
    client_buf: BytesMut,
    broker_buf: BytesMut,

    cmd_rx: mpsc::Receiver<PairCommand>,
    token: CancellationToken,
    shared: Arc<Shared>,
}

impl<S: ProxySocket> ConnectionPair<S> {
    pub(crate) fn new(
        id: PairId,
        client: S,
        cmd_rx: mpsc::Receiver<PairCommand>,
        token: CancellationToken,
        shared: Arc<Shared>,
    ) -> Self {
        ConnectionPair {
            id,
            remote_addr: client.remote_addr(),
            client,
            broker: None,
            client_buf: BytesMut::with_capacity(READ_BUF_CAPACITY),
            broker_buf: BytesMut::with_capacity(READ_BUF_CAPACITY),
            cmd_rx,
            token,
            shared,
        }
    }

    #[tracing::instrument(name = "ConnectionPair::run", skip(self), fields(remote_addr = %self.remote_addr))]
    pub(crate) async fn run(mut self) -> PairId {
        match self.run_inner().await {
            Ok(()) => tracing::debug!("connection pair closed"),
            Err(e) => tracing::debug!("connection pair torn down: {e}"),
        }

        self.close().await;
        self.id
    }

    async fn run_inner(&mut self) -> Result<(), PairError> {
        loop {
            tokio::select! {
                res = self.client.read(&mut self.client_buf) => {
                    let read = res.map_err(PairError::ClientRead)?;

                    if read == 0 {
                        tracing::debug!("connection closed by client");
                        return Ok(());
                    }

                    self.relay_client_chunk().await?;
                }
                res = read_broker(self.broker.as_mut(), &mut self.broker_buf) => {
                    let read = res.map_err(PairError::BrokerRead)?;

                    if read == 0 {
                        tracing::debug!("connection closed by broker");
                        return Ok(());
                    }

                    self.relay_broker_chunk().await?;
                }
                Some(cmd) = self.cmd_rx.recv() => {
                    self.handle_command(cmd).await?;
                }
                _ = self.token.cancelled() => {
                    return Ok(());
                }
            }
        }
    }

    /// Decode, capture, and forward one chunk read from the client.
    ///
    /// The first CONNECT observed here dials the configured broker; the
    /// connected socket is the latch, so later CONNECTs on the same pair
    /// cannot dial again.
    async fn relay_client_chunk(&mut self) -> Result<(), PairError> {
        let chunk = self.client_buf.split().freeze();

        let packet = CapturedPacket::decode(chunk.clone());
        let is_connect = packet.packet_type == Some(PacketType::Connect);
        self.shared.record(Direction::ClientToBroker, packet);

        if self.broker.is_none() {
            if !is_connect {
                return Err(PairError::DataBeforeConnect);
            }

            let stream = self.connect_broker().await?;
            self.broker = Some(stream);
        }

        // Connected above if it wasn't already.
        if let Some(broker) = &mut self.broker {
            broker
                .write_all(&chunk)
                .await
                .map_err(PairError::BrokerWrite)?;
        }

        Ok(())
    }

    async fn relay_broker_chunk(&mut self) -> Result<(), PairError> {
        let chunk = self.broker_buf.split().freeze();

        let packet = CapturedPacket::decode(chunk.clone());
        self.shared.record(Direction::BrokerToClient, packet);

        self.client
            .write_all(&chunk)
            .await
            .map_err(PairError::ClientWrite)
    }

    async fn handle_command(&mut self, cmd: PairCommand) -> Result<(), PairError> {
        match cmd {
            PairCommand::Write { frame, to_client } => {
                if to_client {
                    self.client
                        .write_all(&frame)
                        .await
                        .map_err(PairError::ClientWrite)?;
                } else if let Some(broker) = &mut self.broker {
                    broker
                        .write_all(&frame)
                        .await
                        .map_err(PairError::BrokerWrite)?;
                } else {
                    tracing::warn!("broker socket not connected; dropping outbound frame");
                }
            }
        }

        Ok(())
    }

    /// Resolve and dial the configured upstream broker.
    async fn connect_broker(&self) -> Result<TcpStream, PairError> {
        let (host, port) = self.shared.broker_addr();

        tracing::debug!(%host, port, "connecting to upstream broker");

        let stream = TcpStream::connect((host.as_str(), port))
            .await
            .map_err(|source| PairError::BrokerConnect {
                addr: format!("{host}:{port}"),
                source,
            })?;

        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(?e, "error setting TCP_NODELAY on broker socket");
        }

        tracing::info!("upstream broker {host}:{port} connected");

        Ok(stream)
    }

    /// Shut down both sockets. Errors here are expected when the far side
    /// already went away.
    async fn close(&mut self) {
        if let Err(e) = self.client.shutdown().await {
            tracing::trace!("error shutting down client socket: {e}");
        }

        if let Some(broker) = &mut self.broker {
            if let Err(e) = broker.shutdown().await {
                tracing::trace!("error shutting down broker socket: {e}");
            }
        }
    }
}

async fn read_broker(broker: Option<&mut TcpStream>, buf: &mut BytesMut) -> io::Result<usize> {
    match broker {
        Some(stream) => stream.read_buf(buf).await,
        // Broker reading starts only once a CONNECT has dialed the socket.
        None => std::future::pending().await,
    }
}
