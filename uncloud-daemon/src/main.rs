//! Uncloud Machine Daemon (`uncloudd`)
//!
//! Runs the local backend, the request proxy, and the overlay network
//! control loop for one cluster machine.

use clap::Parser;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use uncloud_api::REMOTE_API_PORT;
use uncloud_machine::{BackendServer, DataDir, Machine};
use uncloud_proxy::{Director, ProxyServer};
use uncloud_wg::INTERFACE_NAME;

#[derive(Parser, Debug)]
#[command(name = "uncloudd", version, about = "Uncloud Machine Daemon")]
struct Args {
    /// Directory for machine state (key, roster, sockets)
    #[arg(long, default_value = uncloud_machine::data_dir::DEFAULT_BASE)]
    data_dir: PathBuf,

    /// Verbose logging (-v for debug, -vv for trace)
    #[arg(long, short, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    tracing::info!("uncloudd v{} starting...", env!("CARGO_PKG_VERSION"));

    #[cfg(not(target_os = "linux"))]
    anyhow::bail!("uncloudd requires a Linux kernel with WireGuard support");

    #[cfg(target_os = "linux")]
    {
        let device = uncloud_wg::linux::LinuxDevice::new(INTERFACE_NAME)
            .map_err(|e| anyhow::anyhow!("{e}"))?;
        run(args, Arc::new(device)).await
    }
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
async fn run(args: Args, device: Arc<dyn uncloud_wg::WgDevice>) -> anyhow::Result<()> {
    let data_dir = DataDir::new(args.data_dir);
    let director = Arc::new(Director::new(data_dir.backend_sock(), REMOTE_API_PORT));
    let machine = Arc::new(Machine::new(data_dir.clone(), device, director.clone())?);
    machine.start().await?;

    tracing::info!(public_key = %machine.public_key(), "machine identity loaded");

    let cancel = CancellationToken::new();

    // Local backend on the internal socket.
    let backend = BackendServer::new(machine.clone(), data_dir.backend_sock());
    let backend_task = tokio::spawn({
        let cancel = cancel.clone();
        async move { backend.run(cancel).await }
    });

    // Proxy for operators on the public socket.
    let proxy_unix_task = tokio::spawn({
        let director = director.clone();
        let cancel = cancel.clone();
        let sock = data_dir.proxy_sock();
        async move { ProxyServer::new(director).serve_unix(sock, cancel).await }
    });

    // Proxy for peers on the overlay network. Bound on the wildcard address
    // so it serves from first start, before the machine has a management IP.
    let proxy_tcp_task = tokio::spawn({
        let director = director.clone();
        let cancel = cancel.clone();
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, REMOTE_API_PORT));
        async move { ProxyServer::new(director).serve_tcp(addr, cancel).await }
    });

    tracing::info!("daemon ready");

    shutdown_signal().await;
    tracing::info!("shutdown signal received...");
    cancel.cancel();

    let (backend, proxy_unix, proxy_tcp) =
        tokio::join!(backend_task, proxy_unix_task, proxy_tcp_task);
    for result in [
        backend.map_err(anyhow::Error::from).and_then(|r| r.map_err(anyhow::Error::from)),
        proxy_unix.map_err(anyhow::Error::from).and_then(|r| r.map_err(anyhow::Error::from)),
        proxy_tcp.map_err(anyhow::Error::from).and_then(|r| r.map_err(anyhow::Error::from)),
    ] {
        if let Err(e) = result {
            tracing::error!("shutdown error: {e}");
        }
    }
    director.close();

    tracing::info!("daemon stopped");
    Ok(())
}

fn init_tracing(verbosity: u8) {
    let mut filter = EnvFilter::from_default_env();

    // Only apply defaults if RUST_LOG is not set
    if std::env::var("RUST_LOG").is_err() {
        let level = match verbosity {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        filter = filter.add_directive(level.parse().expect("static level directive"));
    }

    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint = signal(SignalKind::interrupt()).expect("Failed to install SIGINT handler");
        let mut sigterm =
            signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");
        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
    }
}
