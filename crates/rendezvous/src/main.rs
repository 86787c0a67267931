//! rendezvous: room discovery service for mesh-sync peers.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use rendezvous::config::{ApiKey, Config};
use rendezvous::RendezvousServer;

#[derive(Parser, Debug)]
#[command(name = "rendezvous")]
#[command(about = "Room discovery service for mesh-sync peers")]
struct Args {
    /// Address to listen on (overrides the config file)
    #[arg(short, long, env = "RENDEZVOUS_BIND")]
    bind: Option<String>,

    /// Directory holding config.json
    #[arg(long, env = "RENDEZVOUS_CONFIG_PATH")]
    config_path: Option<String>,

    /// Accept joins without a token
    #[arg(long)]
    no_auth: bool,

    /// Additional API keys accepted as tokens
    #[arg(long = "api-key", env = "RENDEZVOUS_API_KEYS", value_delimiter = ',')]
    api_keys: Vec<String>,

    /// OIDC userinfo endpoint used to verify tokens
    #[arg(long, env = "RENDEZVOUS_USERINFO_URL")]
    userinfo_url: Option<String>,

    /// Seconds a verified token is remembered (0 disables caching)
    #[arg(long)]
    token_cache_ttl: Option<u64>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

impl Args {
    /// Apply command-line overrides on top of the loaded configuration.
    fn apply(&self, config: &mut Config) {
        if let Some(bind) = &self.bind {
            config.bind = bind.clone();
        }
        if self.no_auth {
            config.require_token = false;
        }
        for (i, key) in self.api_keys.iter().enumerate() {
            config.api_keys.push(ApiKey {
                key: key.clone(),
                name: format!("cli-{}", i + 1),
                active: true,
            });
        }
        if let Some(url) = &self.userinfo_url {
            config.userinfo.url = url.clone();
        }
        if let Some(ttl) = self.token_cache_ttl {
            config.token_cache_ttl_secs = ttl;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Respects RUST_LOG, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,rendezvous=debug"
    } else {
        "info,rendezvous=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = match &args.config_path {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    args.apply(&mut config);

    let verifier = config
        .build_verifier()
        .context("Failed to set up token verification")?;
    if verifier.is_none() {
        info!("Token verification disabled");
    }

    let server = Arc::new(RendezvousServer::new(verifier));
    let listener = RendezvousServer::bind(&config.bind).await?;

    info!("Rendezvous running. Press Ctrl+C to stop.");
    tokio::select! {
        result = Arc::clone(&server).serve(listener) => result?,
        _ = shutdown_signal() => {}
    }

    info!("Rendezvous shut down ({} rooms open)", server.rooms().room_count());
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
