//! pqlan node binary.
//!
//! # Usage
//!
//! ```bash
//! # Create the long-term identity
//! pqlan --data-dir ~/.pqlan identity init
//!
//! # Exchange pairing payloads out of band, then import the other side's
//! pqlan pairing export --endpoint 192.168.1.20:7420
//! pqlan pairing import <hex>
//!
//! # Run: accept peers and dial known ones; stdin lines go to every peer
//! pqlan run --listen 0.0.0.0:7420 --connect 192.168.1.21:7420
//! ```

use std::{
    fmt::Display,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use clap::{Parser, Subcommand};
use pqlan_core::{EnvRng, IdentityStore, RedbTrustStorage, TrustPolicy};
use pqlan_crypto::{Fingerprint, SUITE_V1};
use pqlan_node::{Node, NodeConfig, NodeError, NodeEvent, SystemEnv, TRUST_DB_FILE};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    net::TcpListener,
};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// pqlan post-quantum LAN node
#[derive(Parser, Debug)]
#[command(name = "pqlan")]
#[command(about = "Post-quantum secure sessions between LAN peers")]
#[command(version)]
struct Args {
    /// Directory holding the identity and trust database
    #[arg(long, default_value = ".pqlan")]
    data_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Manage the local identity
    #[command(subcommand)]
    Identity(IdentityCommand),

    /// Exchange pairing payloads
    #[command(subcommand)]
    Pairing(PairingCommand),

    /// List known peers and their trust state
    Peers,

    /// Revoke a peer permanently
    Revoke {
        /// Peer fingerprint (hex)
        #[arg(value_parser = parse_fingerprint)]
        fingerprint: Fingerprint,
    },

    /// Run the node
    Run {
        /// Address to accept peers on
        #[arg(long)]
        listen: Option<String>,

        /// Peers to dial on startup
        #[arg(long)]
        connect: Vec<String>,

        /// Accept unknown peers on first use instead of requiring pairing
        #[arg(long)]
        tofu: bool,
    },
}

#[derive(Subcommand, Debug)]
enum IdentityCommand {
    /// Generate the long-term signing identity
    Init {
        /// Replace an existing identity. Forgets every known peer
        #[arg(long)]
        force: bool,
    },

    /// Print the local fingerprint
    Show,
}

#[derive(Subcommand, Debug)]
enum PairingCommand {
    /// Print this node's pairing payload as hex
    Export {
        /// Address peers can reach this node at
        #[arg(long)]
        endpoint: Option<String>,
    },

    /// Verify and trust a peer's pairing payload
    Import {
        /// Payload as printed by `pairing export`
        payload: String,
    },
}

fn parse_fingerprint(s: &str) -> Result<Fingerprint, String> {
    Fingerprint::from_hex(s).ok_or_else(|| format!("not a 64-character hex fingerprint: {s}"))
}

fn output(line: impl Display) -> io::Result<()> {
    writeln!(io::stdout().lock(), "{line}")
}

fn open_store(
    data_dir: &Path,
    policy: TrustPolicy,
) -> Result<IdentityStore<RedbTrustStorage>, NodeError> {
    std::fs::create_dir_all(data_dir)?;
    let storage = RedbTrustStorage::open(data_dir.join(TRUST_DB_FILE))?;
    Ok(IdentityStore::open(storage, policy)?)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    match args.command {
        Command::Identity(command) => identity(&args.data_dir, command)?,
        Command::Pairing(command) => pairing(&args.data_dir, command)?,
        Command::Peers => {
            let store = open_store(&args.data_dir, TrustPolicy::Strict)?;
            for peer in store.peers() {
                output(format_args!("{}  {:?}", peer.fingerprint, peer.trust_state))?;
            }
        },
        Command::Revoke { fingerprint } => {
            let store = open_store(&args.data_dir, TrustPolicy::Strict)?;
            store.revoke(&fingerprint)?;
            output(format_args!("revoked {fingerprint}"))?;
        },
        Command::Run { listen, connect, tofu } => {
            let policy = if tofu { TrustPolicy::TrustOnFirstUse } else { TrustPolicy::Strict };
            let store = open_store(&args.data_dir, policy)?;
            run(store, listen, connect).await?;
        },
    }

    Ok(())
}

fn identity(data_dir: &Path, command: IdentityCommand) -> Result<(), NodeError> {
    let store = open_store(data_dir, TrustPolicy::Strict)?;
    let env = SystemEnv::new();

    match command {
        IdentityCommand::Init { force } => {
            if let Ok(existing) = store.identity()
                && !force
            {
                output(format_args!("identity exists: {}", existing.fingerprint()))?;
                return Ok(());
            }
            let identity = store.generate_identity(&mut EnvRng::new(&env))?;
            output(format_args!("generated identity {}", identity.fingerprint()))?;
        },
        IdentityCommand::Show => {
            let identity = store.identity()?;
            output(format_args!("fingerprint {}", identity.fingerprint()))?;
            output(format_args!(
                "suite       {} / {} / {} / {}",
                SUITE_V1.kem, SUITE_V1.signature, SUITE_V1.aead, SUITE_V1.kdf
            ))?;
        },
    }
    Ok(())
}

fn pairing(data_dir: &Path, command: PairingCommand) -> Result<(), NodeError> {
    let store = open_store(data_dir, TrustPolicy::Strict)?;

    match command {
        PairingCommand::Export { endpoint } => {
            output(hex::encode(store.pairing_payload(endpoint)?))?;
        },
        PairingCommand::Import { payload } => {
            let record = store.verify_pairing_payload(&hex::decode(payload.trim())?)?;
            output(format_args!("verified {}", record.fingerprint))?;
        },
    }
    Ok(())
}

async fn run(
    store: IdentityStore<RedbTrustStorage>,
    listen: Option<String>,
    connect: Vec<String>,
) -> Result<(), NodeError> {
    let (node, mut events) = Node::new(Arc::new(store), SystemEnv::new(), NodeConfig::default())?;
    let _maintenance = node.spawn_maintenance();

    if let Some(addr) = listen {
        let listener = TcpListener::bind(addr.as_str()).await?;
        let node = node.clone();
        tokio::spawn(async move {
            if let Err(err) = node.listen(listener).await {
                tracing::error!("Listener failed: {}", err);
            }
        });
    }

    for addr in connect {
        match node.dial(addr.as_str(), None).await {
            Ok(peer) => tracing::info!("Connected to {} at {}", peer.short(), addr),
            Err(err) => tracing::warn!("Dial {} failed: {}", addr, err),
        }
    }

    let event_log = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            log_event(&event);
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let queued = node.broadcast(line.into_bytes());
        tracing::debug!("Line queued for {} peers", queued);
    }

    for peer in node.connected_peers() {
        if let Err(err) = node.disconnect(&peer, "shutting down").await {
            tracing::debug!("Disconnect {} failed: {}", peer.short(), err);
        }
    }
    // Let the peer tasks flush their goodbyes
    tokio::time::sleep(Duration::from_millis(100)).await;
    event_log.abort();
    Ok(())
}

fn log_event(event: &NodeEvent) {
    match event {
        NodeEvent::PeerConnected { peer } => tracing::info!("Peer {} connected", peer),
        NodeEvent::PeerRejected { peer, reason } => match peer {
            Some(peer) => tracing::warn!("Peer {} rejected: {}", peer.short(), reason),
            None => tracing::warn!("Peer rejected: {}", reason),
        },
        NodeEvent::PeerDisconnected { peer, reason } => {
            let reason = reason.as_deref().unwrap_or("closed");
            tracing::info!("Peer {} left ({})", peer.short(), reason);
        },
        NodeEvent::Message { from, payload } => {
            tracing::info!("{}: {}", from.short(), String::from_utf8_lossy(payload));
        },
        NodeEvent::GroupKeyInstalled { group, epoch, admin } => {
            tracing::info!("Group {} epoch {} from {}", group, epoch, admin.short());
        },
        NodeEvent::GroupMessage { group, from, payload } => {
            tracing::info!("[{}] {}: {}", group, from.short(), String::from_utf8_lossy(payload));
        },
    }
}
