use std::fs;
use std::io;
use std::iter;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use color_eyre::eyre::{self, WrapErr};
use rustls_pemfile::Item;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_rustls::rustls::{Certificate, PrivateKey, ServerConfig};

use crate::proxy::socket::DirectSocket;

pub type TlsSocket = DirectSocket<tokio_rustls::server::TlsStream<TcpStream>>;

/// TLS-terminating listener.
///
/// Handshakes run as spawned tasks so a slow or stalled handshake never
/// blocks the accept loop. A failed handshake is logged and dropped; the
/// connection pair for that socket is simply never created.
pub struct TlsAcceptor {
    acceptor: tokio_rustls::TlsAcceptor,
    listener: TcpListener,
    handshaking: JoinSet<eyre::Result<TlsSocket>>,
}

impl TlsAcceptor {
    pub async fn bind(listen_addr: SocketAddr, config: Arc<ServerConfig>) -> eyre::Result<Self> {
        let listener = TcpListener::bind(listen_addr)
            .await
            .wrap_err_with(|| format!("failed to bind listen_addr: {}", listen_addr))?;

        Ok(Self {
            acceptor: tokio_rustls::TlsAcceptor::from(config),
            listener,
            handshaking: JoinSet::new(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept the next client whose TLS handshake completes.
    ///
    /// Accept and handshake failures are logged and accepting continues.
    pub async fn accept(&mut self) -> TlsSocket {
        loop {
            tokio::select! {
                res = self.listener.accept() => {
                    match res {
                        Ok((stream, remote_addr)) => self.accepted(remote_addr, stream),
                        Err(e) => tracing::error!(?e, "accept failed"),
                    }
                }
                Some(res) = self.handshaking.join_next() => {
                    match res {
                        Ok(Ok(socket)) => return socket,
                        // Error is logged by `handshake()`
                        Ok(Err(_)) => (),
                        Err(e) => {
                            tracing::debug!("error from handshake task: {e}");
                        }
                    }
                }
            }
        }
    }

    fn accepted(&mut self, remote_addr: SocketAddr, stream: TcpStream) {
        tracing::debug!(%remote_addr, "accepted new TLS connection");

        // Uses `Arc` internally so clones are cheap
        let acceptor = self.acceptor.clone();

        self.handshaking
            .spawn(handshake(remote_addr, stream, acceptor));
    }
}

#[tracing::instrument(skip(stream, acceptor), err(level = tracing::Level::DEBUG))]
async fn handshake(
    remote_addr: SocketAddr,
    stream: TcpStream,
    acceptor: tokio_rustls::TlsAcceptor,
) -> eyre::Result<TlsSocket> {
    // Disable Nagle's algorithm since we always forward complete chunks.
    // https://en.wikipedia.org/wiki/Nagle's_algorithm
    if let Err(e) = stream.set_nodelay(true) {
        // It's unclear how this could actually fail and what it means when it does.
        tracing::debug!(?e, "error setting TCP_NODELAY on socket");
    }

    let stream = acceptor
        .accept(stream)
        .await
        .wrap_err("error from TlsAcceptor.accept()")?;

    Ok(DirectSocket::new(remote_addr, stream))
}

/// Load the server certificate chain and private key from PEM files.
///
/// The proxy presents this certificate to intercepted clients and performs
/// no client certificate verification of its own.
///
/// NOTE: uses blocking I/O internally.
pub fn load_server_config(cert_file: &Path, key_file: &Path) -> crate::Result<Arc<ServerConfig>> {
    let cert_pem = fs::read(cert_file)
        .wrap_err_with(|| format!("error reading from {}", cert_file.display()))?;

    let cert_chain: Vec<Certificate> = rustls_pemfile::certs(&mut &cert_pem[..])
        .wrap_err_with(|| {
            format!(
                "error reading certificate chain from {}",
                cert_file.display()
            )
        })?
        .into_iter()
        .map(Certificate)
        .collect();

    eyre::ensure!(
        !cert_chain.is_empty(),
        "no certificates found in {}",
        cert_file.display()
    );

    let key_pem = fs::read(key_file)
        .wrap_err_with(|| format!("error reading from {}", key_file.display()))?;

    let key = read_private_key(&key_pem)
        .wrap_err_with(|| format!("error reading private key from {}", key_file.display()))?;

    let config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)
        .wrap_err("certificate chain rejected (does the key match the certificate?)")?;

    Ok(Arc::new(config))
}

fn read_private_key(pem: &[u8]) -> crate::Result<PrivateKey> {
    let mut reader = pem;

    for item in iter::from_fn(|| rustls_pemfile::read_one(&mut reader).transpose()) {
        match item? {
            Item::PKCS8Key(der) | Item::RSAKey(der) | Item::ECKey(der) => {
                return Ok(PrivateKey(der));
            }
            _ => continue,
        }
    }

    eyre::bail!("no PEM-encoded private key found")
}
