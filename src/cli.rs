use std::net::SocketAddr;
use std::path::PathBuf;

use color_eyre::eyre::WrapErr;

use crate::proxy::Proxy;

/// An intercepting man-in-the-middle proxy for MQTT 3.1.1.
///
/// Clients connect to the proxy as if it were the broker; the proxy relays
/// every byte to the configured upstream broker and decodes each control
/// packet on the way through.
#[derive(clap::Parser, Debug)]
pub struct Args {
    /// Set the format of log output.
    #[clap(short, long, default_value = "full")]
    pub log: LogFormat,

    /// The TCP socket address to listen for plain MQTT connections from clients.
    #[clap(short = 'L', long, default_value = "0.0.0.0:1883")]
    pub listen_addr: SocketAddr,

    /// Enable terminating MQTT-over-TLS connections on a separate socket (0.0.0.0:8883 by default).
    ///
    /// The proxy presents `--tls-cert-file` to clients; the upstream broker
    /// connection stays plain TCP.
    #[clap(long, requires = "tls_cert_file", requires = "tls_key_file")]
    pub mqtts: bool,

    /// The TCP socket address to listen for MQTT-over-TLS (`mqtts`) connections from clients.
    #[clap(long, default_value = "0.0.0.0:8883")]
    pub mqtts_addr: SocketAddr,

    /// Path to the X.509 certificate chain (PEM) to present to intercepted clients.
    #[clap(long, env)]
    pub tls_cert_file: Option<PathBuf>,

    /// Path to the PEM-encoded private key matching `--tls-cert-file`.
    #[clap(long, env)]
    pub tls_key_file: Option<PathBuf>,

    /// The upstream broker host to forward intercepted sessions to.
    ///
    /// Resolved on the first CONNECT of each client session.
    #[clap(short = 'B', long, default_value = "test.mosquitto.org")]
    pub broker_host: String,

    /// The upstream broker port.
    #[clap(long, default_value = "1883")]
    pub broker_port: u16,
}

#[derive(clap::ValueEnum, Debug, Copy, Clone)]
pub enum LogFormat {
    /// Emit human-readable single line logs for each event.
    Full,
    /// A variant of full, optimized for shorter line lengths.
    Compact,
    /// Format events in multi-line very "prettified" form.
    Pretty,
    /// Emit JSON-lines formatted events.
    Json,
}

pub fn main(args: Args) -> crate::Result<()> {
    main_async(args)
}

// `#[tokio::main]` doesn't have to be attached to the actual `main()`, and it can accept args
#[tokio::main]
async fn main_async(args: Args) -> crate::Result<()> {
    let mut proxy = Proxy::new();

    proxy.set_broker_config(&args.broker_host, args.broker_port);

    proxy.set_connection_callback(|info| {
        tracing::info!(remote_addr = %info.remote_addr, tls = info.tls, "client session opened");
    });

    proxy.set_packet_callback(|direction, packet| {
        tracing::info!(
            %direction,
            packet = packet.type_label(),
            summary = %packet.summary(),
            "captured"
        );
    });

    proxy.start(args.listen_addr).await?;

    if args.mqtts {
        // clap guarantees both paths are present when `--mqtts` is set.
        if let Some((cert_file, key_file)) = args
            .tls_cert_file
            .as_deref()
            .zip(args.tls_key_file.as_deref())
        {
            proxy.set_tls_certificate(cert_file, key_file)?;
            proxy.start_tls(args.mqtts_addr).await?;
        }
    }

    tokio::select! {
        res = proxy.run() => {
            res?;
        }

        res = tokio::signal::ctrl_c() => {
            res.wrap_err("error from ctrl_c() handler")?;
        }
    }

    tracing::info!(
        "Ctrl-C received; waiting for {} connections to close",
        proxy.connections()
    );

    proxy.shutdown().await;

    Ok(())
}
