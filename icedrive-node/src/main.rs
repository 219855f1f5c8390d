//! `icedrive`: run a blob storage node or talk to its local store.
//!
//! Every command reads `settings.toml` from the config directory (see
//! `--config-dir`); commands that miss locally consult the configured peers.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use icedrive_blob::{FileTransfer, LinkOutcome};
use icedrive_node::{save_session, Node, Settings};
use icedrive_protocol::ticket::ServiceTicket;
use icedrive_protocol::types::{BlobId, CallerIdentity};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "icedrive", version, about = "Content-addressed blob storage node")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Directory holding settings.toml (defaults to the platform config dir).
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Identity presented to the node for every operation.
    #[arg(long = "as", global = true, default_value = "local")]
    caller: String,
}

#[derive(Subcommand)]
enum Command {
    /// Answer peer queries until interrupted.
    Serve {
        /// Override the configured listen address.
        #[arg(long)]
        listen: Option<SocketAddr>,
    },
    /// Store a file and print its blob id.
    Upload { path: PathBuf },
    /// Write a blob to a file, fetching it from a peer if needed.
    Download { blob_id: BlobId, out: PathBuf },
    /// Add a link to a blob.
    Link { blob_id: BlobId },
    /// Remove a link from a blob; the last unlink deletes it.
    Unlink { blob_id: BlobId },
    /// List blobs held by this node.
    List,
    /// Add a peer ticket to the settings file.
    AddPeer { ticket: ServiceTicket },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_dir = cli.config_dir.unwrap_or_else(Settings::config_dir);
    let mut settings = Settings::load_from_dir(&config_dir);
    let caller = CallerIdentity::new(cli.caller);

    match cli.command {
        Command::AddPeer { ticket } => {
            let encoded = ticket.to_string();
            if settings.peers.contains(&encoded) {
                println!("peer {} already configured", ticket.peer_id);
                return Ok(());
            }
            settings.peers.push(encoded);
            settings.save_to_dir(&config_dir)?;
            println!("added peer {} at {}", ticket.peer_id, ticket.addr);
        }
        Command::Serve { listen } => {
            let node = Node::open(&settings)?;
            let listen = match listen {
                Some(addr) => addr,
                None => settings
                    .listen_addr
                    .parse()
                    .with_context(|| format!("invalid listen_addr {:?}", settings.listen_addr))?,
            };
            let running = node.spawn_server(listen).await?;
            println!("{}", running.ticket());

            tokio::select! {
                result = running.join() => result?,
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("interrupted, shutting down");
                }
            }
        }
        Command::Upload { path } => {
            let node = Node::open(&settings)?;
            let source = FileTransfer::open(&path)
                .await
                .with_context(|| format!("failed to open {}", path.display()))?;
            let blob_id = node.service().upload(&caller, source).await?;
            println!("{blob_id}");
        }
        Command::Download { blob_id, out } => {
            let node = Node::open(&settings)?;
            let session = node.service().download(&caller, blob_id).await?;
            let written = save_session(session, &out, settings.chunk_size).await?;
            println!("wrote {written} bytes to {}", out.display());
        }
        Command::Link { blob_id } => {
            let node = Node::open(&settings)?;
            match node.service().link(&caller, blob_id).await? {
                LinkOutcome::Local(links) => println!("{blob_id}: {links} links"),
                LinkOutcome::Remote(peer) => println!("{blob_id}: linked on peer {peer}"),
            }
        }
        Command::Unlink { blob_id } => {
            let node = Node::open(&settings)?;
            match node.service().unlink(&caller, blob_id).await? {
                LinkOutcome::Local(0) => println!("{blob_id}: deleted"),
                LinkOutcome::Local(links) => println!("{blob_id}: {links} links"),
                LinkOutcome::Remote(peer) => println!("{blob_id}: unlinked on peer {peer}"),
            }
        }
        Command::List => {
            let node = Node::open(&settings)?;
            for record in node.service().list(&caller)? {
                println!("{}  {:>10}  {} links", record.blob_id, record.size, record.links);
            }
        }
    }
    Ok(())
}
