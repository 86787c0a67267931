//! mesh-peer: headless participant in a mesh-synced text room.
//!
//! Lines read from stdin are appended to the shared document; the document
//! is printed whenever a peer changes it.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mesh_core::{
    Awareness, ClientId, MeshEvent, MeshProvider, PeerId, ProviderConfig, SharedText,
};
use mesh_peer::{DiscoveryClient, DiscoveryConfig, WsTransport};

#[derive(Parser, Debug)]
#[command(name = "mesh-peer")]
#[command(about = "Collaborative text peer for a mesh room")]
struct Args {
    /// Room to join
    #[arg(short, long)]
    room: String,

    /// Rendezvous service URL (e.g. ws://localhost:10000)
    #[arg(short, long)]
    discovery: Option<String>,

    /// Token presented to the rendezvous service
    #[arg(long, env = "MESH_PEER_TOKEN")]
    token: Option<String>,

    /// Peer ID (generated if not provided)
    #[arg(long)]
    peer_id: Option<String>,

    /// Address to accept peer channels on (dial-only if omitted)
    #[arg(short, long)]
    listen: Option<String>,

    /// Address announced to peers instead of the bound one
    #[arg(long, requires = "listen")]
    advertise: Option<String>,

    /// Known peer as ID=URL (repeatable)
    #[arg(long = "peer", value_parser = parse_peer)]
    peers: Vec<(PeerId, String)>,

    /// Display name shared with the room
    #[arg(long)]
    name: Option<String>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

fn parse_peer(s: &str) -> std::result::Result<(PeerId, String), String> {
    let (id, url) = s
        .split_once('=')
        .ok_or_else(|| format!("expected ID=URL, got {:?}", s))?;
    let id = id.parse::<PeerId>().map_err(|e| e.to_string())?;
    if url.is_empty() {
        return Err("peer URL is empty".into());
    }
    Ok((id, url.to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Respects RUST_LOG, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,mesh_peer=debug,mesh_core=debug"
    } else {
        "info,mesh_peer=info,mesh_core=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if args.discovery.is_none() && args.peers.is_empty() {
        bail!("Nothing to connect to: pass --discovery or at least one --peer");
    }

    let peer_id = match &args.peer_id {
        Some(id) => id.parse::<PeerId>().context("Invalid --peer-id")?,
        None => {
            let id = PeerId::generate();
            info!("Generated peer ID: {}", id);
            id
        }
    };

    let transport = match &args.listen {
        Some(listen) => WsTransport::bind(args.room.clone(), listen, args.advertise.clone())
            .await
            .with_context(|| format!("Failed to listen on {}", listen))?,
        None => WsTransport::dial_only(args.room.clone()),
    };
    for (id, url) in &args.peers {
        transport.add_peer(id.clone(), url.clone());
    }

    let mut config = ProviderConfig::new(args.room.clone())
        .with_peer_id(peer_id.clone())
        .with_initial_peers(args.peers.iter().map(|(id, _)| id.clone()));

    let discovery = match &args.discovery {
        Some(server) => {
            let mut discovery = DiscoveryConfig::new(server.clone(), args.room.clone(), peer_id.clone());
            discovery.token = args.token.clone();
            discovery.address = transport.advertised_address().map(str::to_string);
            let (client, announcements) = DiscoveryClient::join(discovery)
                .await
                .context("Failed to join room")?;
            config = config.with_discovery(announcements);
            Some(client)
        }
        None => None,
    };

    let client_id = ClientId::generate();
    let doc = SharedText::new(client_id).context("Failed to create document")?;
    let awareness = Awareness::new(client_id);
    awareness.set_local_field(
        "name",
        serde_json::Value::String(args.name.clone().unwrap_or_else(|| peer_id.to_string())),
    );

    let provider = MeshProvider::spawn(config, Arc::new(transport), doc, awareness);

    let (changed_tx, mut changed_rx) = mpsc::unbounded_channel();
    let _subscription = provider.events().subscribe(move |event| match event {
        MeshEvent::DocumentMerged { .. } => {
            let _ = changed_tx.send(());
        }
        MeshEvent::PeerConnected { peer_id, direction } => {
            info!("Connected to {} ({:?})", peer_id, direction)
        }
        MeshEvent::PeerDisconnected { peer_id } => info!("Disconnected from {}", peer_id),
        MeshEvent::DialFailed {
            peer_id,
            error,
            will_retry: false,
            ..
        } => warn!("Giving up on {}: {}", peer_id, error),
        _ => {}
    });

    let local = provider
        .wait_ready()
        .await
        .context("Transport failed to open")?;
    info!("Peer {} running in room {}. Type lines to append, Ctrl+C to stop.", local, args.room);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    if let Err(e) = provider.document().push_str(&format!("{}\n", line)) {
                        warn!("Failed to edit document: {}", e);
                    }
                }
                Ok(None) => stdin_open = false,
                Err(e) => {
                    warn!("Failed to read stdin: {}", e);
                    stdin_open = false;
                }
            },

            Some(()) = changed_rx.recv() => {
                while changed_rx.try_recv().is_ok() {}
                println!("----\n{}", provider.document().text());
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    provider.destroy().await;
    if let Some(discovery) = discovery {
        discovery.leave().await;
    }
    info!("Shutting down");
    Ok(())
}
