use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use zif::{Config, EmptyPostStore, Keypair, LocalNode};

#[derive(Parser, Debug)]
#[command(name = "zifd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file; defaults apply when absent.
    #[arg(short, long, default_value = "zifd.toml")]
    config: PathBuf,

    /// Override the protocol bind address.
    #[arg(short, long)]
    bind: Option<String>,

    /// Peers to bootstrap through (host:port), may repeat.
    #[arg(short = 'B', long = "bootstrap", value_name = "PEER")]
    bootstrap: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let mut config = if args.config.exists() {
        Config::load(&args.config)
            .with_context(|| format!("loading {}", args.config.display()))?
    } else {
        Config::default()
    };
    if let Some(bind) = args.bind {
        config.bind.zif = bind;
    }

    // keep the identity across restarts
    let key_path = config.data_dir.join("identity.key");
    let keypair = match tokio::fs::read(&key_path).await {
        Ok(raw) if raw.len() == 32 => {
            let mut secret = [0u8; 32];
            secret.copy_from_slice(&raw);
            Keypair::from_secret_key_bytes(&secret)
        }
        _ => {
            let keypair = Keypair::generate();
            tokio::fs::create_dir_all(&config.data_dir).await?;
            tokio::fs::write(&key_path, keypair.secret_key_bytes()).await?;
            keypair
        }
    };

    let bind = config.bind.zif.clone();
    let node = LocalNode::open(config, keypair, Arc::new(EmptyPostStore)).await?;
    info!(address = %node.address(), "local node ready");

    let (local_addr, accept_loop) = node.listen(&bind).await?;
    info!(bind = %local_addr, "protocol listener up");

    if let Err(e) = node.peer_manager().load_seeds().await {
        info!(error = %e, "no seed list loaded");
    }

    for peer in &args.bootstrap {
        match node.bootstrap(peer).await {
            Ok(count) => info!(via = peer, peers = count, "bootstrap complete"),
            Err(e) => warn!(via = peer, error = %e, "bootstrap failed"),
        }
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal, exiting gracefully");
        }
        _ = accept_loop => {
            warn!("accept loop ended unexpectedly");
        }
    }

    for peer in node.peer_manager().peers() {
        peer.terminate().await;
    }

    Ok(())
}
