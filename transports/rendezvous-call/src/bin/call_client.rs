//! Call client binary entry point
//!
//! Registers with a rendezvous relay, optionally calls a peer, and reports
//! call state and notices until interrupted.
//!
//! # Usage
//!
//! ```bash
//! # Wait for incoming calls as "bob"
//! cargo run --bin call_client -- --id bob --signaling-url ws://localhost:8080/ws
//!
//! # Call bob as "alice"
//! cargo run --bin call_client -- --id alice --call bob \
//!   --signaling-url ws://localhost:8080/ws
//!
//! # Load settings from a TOML file
//! cargo run --bin call_client -- --id alice --config ./client.toml
//! ```

use clap::Parser;
use rendezvous_call::media::MutedPlayback;
use rendezvous_call::{ClientConfig, SignalingClient};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Rendezvous call client
///
/// One-to-one audio calls negotiated through a rendezvous relay.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Local identifier to register under
    #[arg(long, env = "RENDEZVOUS_ID")]
    id: String,

    /// Identifier to call once ready
    #[arg(long)]
    call: Option<String>,

    /// TOML configuration file (command line values override it)
    #[arg(long, env = "RENDEZVOUS_CONFIG")]
    config: Option<PathBuf>,

    /// Rendezvous server URL
    #[arg(long, env = "RENDEZVOUS_SIGNALING_URL")]
    signaling_url: Option<String>,

    /// STUN servers (comma-separated)
    #[arg(long, value_delimiter = ',', env = "RENDEZVOUS_STUN_SERVERS")]
    stun_servers: Vec<String>,

    /// Maximum reconnection attempts
    #[arg(long, env = "RENDEZVOUS_MAX_RECONNECT_ATTEMPTS")]
    max_reconnect_attempts: Option<u32>,

    /// Refuse remote audio playback
    #[arg(long, default_value_t = false)]
    mute: bool,
}

fn build_config_from_args(args: &Args) -> anyhow::Result<ClientConfig> {
    let mut config = match &args.config {
        Some(path) => ClientConfig::from_file(path)?,
        None => ClientConfig::default(),
    };

    if let Some(url) = &args.signaling_url {
        config.signaling_url = url.clone();
    }
    if !args.stun_servers.is_empty() {
        config.stun_servers = args.stun_servers.clone();
    }
    if let Some(max) = args.max_reconnect_attempts {
        config.reconnect.max_attempts = max;
    }

    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing();

    let config = build_config_from_args(&args)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        id = %args.id,
        signaling_url = %config.signaling_url,
        stun_servers = ?config.stun_servers,
        max_reconnect_attempts = config.reconnect.max_attempts,
        "Call client starting"
    );

    let mut builder = SignalingClient::builder(config);
    if args.mute {
        builder = builder.playback(Arc::new(MutedPlayback));
    }
    let client = builder.build()?;

    let mut status = client.status();
    let mut notices = client.notices();

    client.initialize(&args.id).await?;
    info!("Registered as {}", args.id);

    if let Some(remote) = &args.call {
        client.place_call(remote).await?;
        info!("Calling {}", remote);
    }

    loop {
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = status.borrow_and_update().clone();
                println!("call state: {}", state);
            }
            notice = notices.recv() => match notice {
                Ok(notice) => println!("{}", notice),
                Err(RecvError::Lagged(skipped)) => warn!("Skipped {} notices", skipped),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, hanging up...");
                break;
            }
        }
    }

    let report = client.shutdown().await;
    info!("Call client stopped ({})", report);
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
