//! A storage node assembled from settings: store, identity, peer directory,
//! resolver and, once serving, the TCP query server.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use icedrive_blob::{AcceptAll, BlobService, BlobStore, DataTransfer, FederationResolver, QueryServer};
use icedrive_net::directory::StaticDirectory;
use icedrive_net::tcp::{TcpAcceptor, TcpTransport};
use icedrive_protocol::ticket::{peer_id_from_secret, ServiceTicket};
use icedrive_protocol::types::PeerId;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;

use crate::settings::Settings;

const SECRET_FILE: &str = "node.key";

pub type Directory = Arc<StaticDirectory<TcpTransport>>;
pub type NodeService = BlobService<Directory, AcceptAll>;

/// Load the node secret from `dir`, generating and persisting one on first use.
pub fn load_or_create_secret(dir: &Path) -> Result<[u8; 32]> {
    let path = dir.join(SECRET_FILE);
    match std::fs::read(&path) {
        Ok(bytes) => {
            let secret: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
                anyhow::anyhow!(
                    "node key {} has {} bytes, expected 32",
                    path.display(),
                    bytes.len()
                )
            })?;
            Ok(secret)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
            let secret: [u8; 32] = rand::random();
            std::fs::write(&path, secret)
                .with_context(|| format!("failed to write node key {}", path.display()))?;
            tracing::info!(path = %path.display(), "generated new node key");
            Ok(secret)
        }
        Err(e) => Err(e).with_context(|| format!("failed to read node key {}", path.display())),
    }
}

/// One storage node.
pub struct Node {
    peer_id: PeerId,
    directory: Directory,
    service: Arc<NodeService>,
}

impl Node {
    /// Open the store under `settings.storage_dir` and register the
    /// configured peers. Does not listen; see [`Node::spawn_server`].
    pub fn open(settings: &Settings) -> Result<Self> {
        let secret = load_or_create_secret(&settings.storage_dir)?;
        let peer_id = peer_id_from_secret(&secret);

        let store = BlobStore::open(&settings.storage_dir)
            .context("failed to open blob store")?
            .with_chunk_size(settings.chunk_size);

        let directory: Directory = Arc::new(StaticDirectory::new());
        let node_dir = Arc::clone(&directory);
        let resolver =
            FederationResolver::new(Arc::new(store), node_dir, settings.resolver_config());
        let node = Self {
            peer_id,
            directory,
            service: Arc::new(BlobService::new(resolver, AcceptAll)),
        };

        for ticket in settings.peer_tickets() {
            if let Err(e) = node.add_peer(&ticket) {
                tracing::warn!(peer = %ticket.peer_id, error = %format!("{e:#}"), "skipping peer");
            }
        }

        tracing::info!(
            peer_id = %peer_id,
            storage = %settings.storage_dir.display(),
            peers = node.directory.len(),
            "node opened"
        );
        Ok(node)
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn service(&self) -> &Arc<NodeService> {
        &self.service
    }

    pub fn store(&self) -> &Arc<BlobStore> {
        self.service.store()
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    /// Register a peer from its ticket. Returns `true` if it was not known.
    pub fn add_peer(&self, ticket: &ServiceTicket) -> Result<bool> {
        if ticket.peer_id == self.peer_id {
            anyhow::bail!("ticket names this node");
        }
        let addr: SocketAddr = ticket
            .addr
            .parse()
            .with_context(|| format!("invalid peer address {:?}", ticket.addr))?;
        Ok(self
            .directory
            .announce(ticket.peer_id, TcpTransport::new(addr)))
    }

    /// Bind `listen_addr` and answer peer queries in the background.
    pub async fn spawn_server(&self, listen_addr: SocketAddr) -> Result<RunningServer> {
        let acceptor = TcpAcceptor::bind(listen_addr).await?;
        let local_addr = acceptor.local_addr()?;
        let idle_timeout = self.service.resolver().config().read_timeout;
        let server =
            Arc::new(QueryServer::new(Arc::clone(self.store())).with_idle_timeout(idle_timeout));
        let task = tokio::spawn(Arc::clone(&server).serve(acceptor));

        let ticket = ServiceTicket {
            peer_id: self.peer_id,
            addr: local_addr.to_string(),
        };
        tracing::info!(addr = %local_addr, ticket = %ticket, "query server started");
        Ok(RunningServer {
            ticket,
            server,
            task,
        })
    }
}

/// Handle to a query server started by [`Node::spawn_server`]. Dropping it
/// stops the server.
pub struct RunningServer {
    ticket: ServiceTicket,
    server: Arc<QueryServer>,
    task: JoinHandle<Result<()>>,
}

impl RunningServer {
    /// Ticket other nodes use to reach this one.
    pub fn ticket(&self) -> &ServiceTicket {
        &self.ticket
    }

    pub fn server(&self) -> &Arc<QueryServer> {
        &self.server
    }

    /// Run until the listener closes.
    pub async fn join(mut self) -> Result<()> {
        (&mut self.task).await.context("query server task panicked")?
    }
}

impl Drop for RunningServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Drain `session` into a new file at `out`, returning the bytes written.
///
/// The session is closed whether or not the copy succeeds.
pub async fn save_session<S: DataTransfer>(
    mut session: S,
    out: impl Into<PathBuf>,
    chunk_size: usize,
) -> Result<u64> {
    let out = out.into();
    let copied = copy_session(&mut session, &out, chunk_size).await;
    session.close().await.context("failed to close session")?;
    copied
}

async fn copy_session<S: DataTransfer>(session: &mut S, out: &Path, chunk_size: usize) -> Result<u64> {
    let mut file = tokio::fs::File::create(out)
        .await
        .with_context(|| format!("failed to create {}", out.display()))?;
    let mut written = 0u64;
    loop {
        let chunk = session.read(chunk_size).await?;
        if chunk.is_empty() {
            break;
        }
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    Ok(written)
}
