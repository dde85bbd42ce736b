//! Rendezvous relay binary entry point
//!
//! Accepts WebSocket connections keyed by an identifier query parameter and
//! forwards control messages between them.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin rendezvous_server -- --bind 0.0.0.0:8080
//!
//! # Clients then connect to ws://<host>:8080/ws?id=<identifier>
//! ```

use clap::Parser;
use rendezvous_call::{RelayHub, RelayServer};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Rendezvous relay server
///
/// Routes offer, answer and ICE candidate messages between identified clients.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:8080", env = "RENDEZVOUS_BIND")]
    bind: SocketAddr,

    /// Query parameter carrying the client identifier
    #[arg(long, default_value = "id", env = "RENDEZVOUS_ID_PARAM")]
    id_param: String,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let shutdown_flag_handler = Arc::clone(&shutdown_flag);

    ctrlc::set_handler(move || {
        eprintln!("\nCtrl+C received, shutting down relay...");
        if shutdown_flag_handler.swap(true, Ordering::SeqCst) {
            eprintln!("Shutdown already in progress, forcing exit");
            std::process::exit(0);
        }
    })?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("rendezvous-relay")
        .enable_all()
        .build()?;

    runtime.block_on(async_main(args, shutdown_flag))
}

async fn async_main(args: Args, shutdown_flag: Arc<AtomicBool>) -> anyhow::Result<()> {
    init_tracing();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        bind = %args.bind,
        id_param = %args.id_param,
        "Rendezvous relay starting"
    );

    let hub = RelayHub::new();
    let handle = RelayServer::new(hub)
        .with_id_param(args.id_param)
        .start(args.bind)
        .await?;

    info!("Relay listening on {}", handle.url());

    while !shutdown_flag.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }

    info!("Shutdown signal received, stopping relay...");
    handle.shutdown().await;
    info!("Relay shut down gracefully");

    Ok(())
}

fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
