//! Content-addressed blob store with reference-counted lifecycle.
//!
//! Blob bytes live under `<root>/blobs/<2 hex>/<62 hex>`; link counts live in
//! SQLite at `<root>/blobs.db`. Uploads are drained into a temporary file
//! under `<root>/tmp/` while being hashed, and only renamed into place once
//! the digest is known.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use icedrive_protocol::types::BlobId;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension};
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;

use crate::digest::BlobDigest;
use crate::error::{BlobError, Result};
use crate::transfer::{DataTransfer, FileTransfer, TransferMetrics, DEFAULT_CHUNK_SIZE};

const DB_FILE: &str = "blobs.db";
const BLOBS_DIR: &str = "blobs";
const TMP_DIR: &str = "tmp";

/// One stored blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobRecord {
    pub blob_id: BlobId,
    pub location: PathBuf,
    pub links: u64,
    pub size: u64,
}

/// Store-level counters.
#[derive(Debug, Default)]
pub struct StoreMetrics {
    /// Bytes and chunks drained from upload sessions.
    pub ingest: TransferMetrics,
    pub blobs_committed: AtomicU64,
    pub dedup_hits: AtomicU64,
    pub uploads_aborted: AtomicU64,
    pub remote_inserts: AtomicU64,
    pub blobs_reclaimed: AtomicU64,
}

enum Commit {
    Duplicate(u64),
    New,
}

#[derive(Debug, Clone, Copy)]
enum Origin {
    Local,
    Remote,
}

impl Origin {
    fn as_str(self) -> &'static str {
        match self {
            Origin::Local => "upload",
            Origin::Remote => "remote",
        }
    }
}

/// Reference-counted content-addressed store.
///
/// All record mutations, commits, and reclaims are serialized through one
/// connection mutex. The mutex is only taken in synchronous sections; those
/// that also touch the filesystem run on the blocking pool.
pub struct BlobStore {
    root: PathBuf,
    conn: Arc<Mutex<Connection>>,
    chunk_size: usize,
    metrics: StoreMetrics,
}

impl BlobStore {
    /// Open (or create) a store rooted at `root`.
    ///
    /// Creates the directory tree and database, then reconciles them:
    /// leftover temporary uploads are removed, records whose bytes are gone
    /// are dropped, and stored files without a record are deleted.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join(BLOBS_DIR))?;
        std::fs::create_dir_all(root.join(TMP_DIR))?;

        let conn = Connection::open(root.join(DB_FILE))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS blobs (
                blob_id BLOB PRIMARY KEY,
                size INTEGER NOT NULL,
                links INTEGER NOT NULL CHECK (links >= 1)
            );",
        )?;

        let store = Self {
            root,
            conn: Arc::new(Mutex::new(conn)),
            chunk_size: DEFAULT_CHUNK_SIZE,
            metrics: StoreMetrics::default(),
        };
        store.reconcile()?;

        tracing::info!(
            root = %store.root.display(),
            blobs = store.count()?,
            "blob store opened"
        );
        Ok(store)
    }

    /// Set the chunk size used when draining upload sessions.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn metrics(&self) -> &StoreMetrics {
        &self.metrics
    }

    /// Where the bytes of `blob_id` live once committed.
    pub fn blob_path(&self, blob_id: &BlobId) -> PathBuf {
        let hex = blob_id.to_hex();
        self.root.join(BLOBS_DIR).join(&hex[..2]).join(&hex[2..])
    }

    /// Store the content of `source` and return its digest.
    ///
    /// A new digest is committed with one link; a known digest gains a link
    /// and the duplicate bytes are discarded. On a read failure nothing is
    /// registered and the partial upload is removed. `source` is closed on
    /// every path.
    pub async fn upload<S: DataTransfer>(&self, source: S) -> Result<BlobId> {
        self.ingest(source, Origin::Local).await
    }

    /// Same contract as [`upload`](Self::upload), for bytes arriving from a
    /// peer.
    pub async fn insert_from_remote<S: DataTransfer>(&self, source: S) -> Result<BlobId> {
        self.ingest(source, Origin::Remote).await
    }

    /// Open a read-only session over a stored blob.
    pub async fn download(&self, blob_id: &BlobId) -> Result<FileTransfer> {
        if !self.contains(blob_id)? {
            return Err(BlobError::UnknownBlob(*blob_id));
        }
        match FileTransfer::open(self.blob_path(blob_id)).await {
            Ok(session) => {
                tracing::debug!(blob_id = %blob_id.short(), size = session.len(), "download session opened");
                Ok(session)
            }
            // Reclaimed between the lookup and the open.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BlobError::UnknownBlob(*blob_id))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Add one link. Returns the new count.
    pub async fn link(&self, blob_id: &BlobId) -> Result<u64> {
        let conn = self.conn.lock();
        let links: Option<i64> = conn
            .query_row(
                "UPDATE blobs SET links = links + 1 WHERE blob_id = ?1 RETURNING links",
                rusqlite::params![blob_id.0.as_slice()],
                |row| row.get(0),
            )
            .optional()?;
        let links = links.ok_or(BlobError::UnknownBlob(*blob_id))? as u64;
        tracing::debug!(blob_id = %blob_id.short(), links, "blob linked");
        Ok(links)
    }

    /// Remove one link. Returns the remaining count; at zero the record is
    /// deleted and the bytes are reclaimed.
    pub async fn unlink(&self, blob_id: &BlobId) -> Result<u64> {
        let blob_id = *blob_id;
        let path = self.blob_path(&blob_id);
        let remaining = self
            .with_conn_blocking(move |conn| {
                let links: Option<i64> = conn
                    .query_row(
                        "SELECT links FROM blobs WHERE blob_id = ?1",
                        rusqlite::params![blob_id.0.as_slice()],
                        |row| row.get(0),
                    )
                    .optional()?;
                match links {
                    None => Err(BlobError::UnknownBlob(blob_id)),
                    Some(links) if links > 1 => {
                        conn.execute(
                            "UPDATE blobs SET links = links - 1 WHERE blob_id = ?1",
                            rusqlite::params![blob_id.0.as_slice()],
                        )?;
                        Ok((links - 1) as u64)
                    }
                    Some(_) => {
                        conn.execute(
                            "DELETE FROM blobs WHERE blob_id = ?1",
                            rusqlite::params![blob_id.0.as_slice()],
                        )?;
                        match std::fs::remove_file(&path) {
                            Ok(()) => {}
                            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                            // The record is gone; the next open sweeps the orphan.
                            Err(e) => tracing::warn!(
                                blob_id = %blob_id,
                                path = %path.display(),
                                error = %e,
                                "failed to remove reclaimed blob bytes"
                            ),
                        }
                        Ok(0)
                    }
                }
            })
            .await?;

        if remaining == 0 {
            self.metrics.blobs_reclaimed.fetch_add(1, Ordering::Relaxed);
            tracing::info!(blob_id = %blob_id, "blob reclaimed");
        } else {
            tracing::debug!(blob_id = %blob_id.short(), links = remaining, "blob unlinked");
        }
        Ok(remaining)
    }

    pub fn contains(&self, blob_id: &BlobId) -> Result<bool> {
        Ok(self.link_count(blob_id)?.is_some())
    }

    /// Current link count, `None` if the blob is not stored.
    pub fn link_count(&self, blob_id: &BlobId) -> Result<Option<u64>> {
        Ok(self.record(blob_id)?.map(|r| r.links))
    }

    pub fn record(&self, blob_id: &BlobId) -> Result<Option<BlobRecord>> {
        let conn = self.conn.lock();
        let row: Option<(i64, i64)> = conn
            .query_row(
                "SELECT links, size FROM blobs WHERE blob_id = ?1",
                rusqlite::params![blob_id.0.as_slice()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(row.map(|(links, size)| BlobRecord {
            blob_id: *blob_id,
            location: self.blob_path(blob_id),
            links: links as u64,
            size: size as u64,
        }))
    }

    /// All stored blobs, ordered by digest.
    pub fn list(&self) -> Result<Vec<BlobRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT blob_id, links, size FROM blobs ORDER BY blob_id")?;
        let rows = stmt.query_map([], |row| {
            let raw: Vec<u8> = row.get(0)?;
            Ok((raw, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (raw, links, size) = row?;
            let Some(blob_id) = blob_id_from_column(&raw) else {
                tracing::warn!(len = raw.len(), "skipping malformed blob id in metadata");
                continue;
            };
            records.push(BlobRecord {
                blob_id,
                location: self.blob_path(&blob_id),
                links: links as u64,
                size: size as u64,
            });
        }
        Ok(records)
    }

    fn count(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM blobs", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    async fn ingest<S: DataTransfer>(&self, mut source: S, origin: Origin) -> Result<BlobId> {
        let drained = self.drain_to_temp(&mut source).await;
        let closed = source.close().await;

        let (temp, blob_id, size) = match drained {
            Ok(drained) => drained,
            Err(e) => {
                self.metrics.uploads_aborted.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(origin = origin.as_str(), error = %e, "upload aborted");
                return Err(e);
            }
        };
        if let Err(e) = closed {
            // Every byte was read already; the content is complete.
            tracing::debug!(origin = origin.as_str(), error = %e, "source close failed after drain");
        }

        let links = self.commit(temp, blob_id, size).await?;
        if let Origin::Remote = origin {
            self.metrics.remote_inserts.fetch_add(1, Ordering::Relaxed);
        }
        tracing::info!(
            blob_id = %blob_id,
            origin = origin.as_str(),
            size,
            links,
            "blob committed"
        );
        Ok(blob_id)
    }

    /// Drain `source` into a fresh temporary file, hashing as it goes.
    async fn drain_to_temp<S: DataTransfer>(
        &self,
        source: &mut S,
    ) -> Result<(NamedTempFile, BlobId, u64)> {
        let temp = tempfile::Builder::new()
            .prefix("upload-")
            .tempfile_in(self.root.join(TMP_DIR))?;
        let mut file = tokio::fs::File::from_std(temp.as_file().try_clone()?);
        let mut digest = BlobDigest::new();

        loop {
            let chunk = source.read(self.chunk_size).await?;
            if chunk.is_empty() {
                break;
            }
            digest.update(&chunk);
            file.write_all(&chunk).await?;
            self.metrics.ingest.record_chunk(chunk.len());
            tracing::trace!(len = chunk.len(), total = digest.len(), "upload chunk");
        }
        file.flush().await?;
        file.sync_data().await?;

        let size = digest.len();
        Ok((temp, digest.finalize(), size))
    }

    /// Register drained content: move it into place for a new digest, or
    /// add a link and drop the duplicate. Returns the resulting link count.
    async fn commit(&self, temp: NamedTempFile, blob_id: BlobId, size: u64) -> Result<u64> {
        let path = self.blob_path(&blob_id);
        let outcome = self
            .with_conn_blocking(move |conn| {
                let bumped: Option<i64> = conn
                    .query_row(
                        "UPDATE blobs SET links = links + 1 WHERE blob_id = ?1 RETURNING links",
                        rusqlite::params![blob_id.0.as_slice()],
                        |row| row.get(0),
                    )
                    .optional()?;
                if let Some(links) = bumped {
                    return Ok(Commit::Duplicate(links as u64));
                }

                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                temp.persist(&path).map_err(|e| BlobError::Storage(e.error))?;

                if let Err(e) = conn.execute(
                    "INSERT INTO blobs (blob_id, size, links) VALUES (?1, ?2, 1)",
                    rusqlite::params![blob_id.0.as_slice(), size as i64],
                ) {
                    let _ = std::fs::remove_file(&path);
                    return Err(e.into());
                }
                Ok(Commit::New)
            })
            .await?;

        match outcome {
            Commit::Duplicate(links) => {
                self.metrics.dedup_hits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(blob_id = %blob_id.short(), links, "duplicate content, link added");
                Ok(links)
            }
            Commit::New => {
                self.metrics.blobs_committed.fetch_add(1, Ordering::Relaxed);
                Ok(1)
            }
        }
    }

    /// Run `f` under the connection mutex on the blocking pool.
    ///
    /// The work runs to completion even if the caller stops waiting, so a
    /// mutation is never left half done.
    async fn with_conn_blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || f(&conn.lock()))
            .await
            .map_err(|e| BlobError::Storage(std::io::Error::other(e)))?
    }

    fn reconcile(&self) -> Result<()> {
        let mut swept_temp = 0usize;
        for entry in std::fs::read_dir(self.root.join(TMP_DIR))? {
            let path = entry?.path();
            if path.is_file() && std::fs::remove_file(&path).is_ok() {
                swept_temp += 1;
            }
        }

        let records = self.list()?;
        let mut dropped = 0usize;
        {
            let conn = self.conn.lock();
            for record in &records {
                if !record.location.is_file() {
                    conn.execute(
                        "DELETE FROM blobs WHERE blob_id = ?1",
                        rusqlite::params![record.blob_id.0.as_slice()],
                    )?;
                    tracing::warn!(blob_id = %record.blob_id, "dropping record with missing bytes");
                    dropped += 1;
                }
            }
        }

        let mut orphans = 0usize;
        for shard in std::fs::read_dir(self.root.join(BLOBS_DIR))? {
            let shard = shard?.path();
            if !shard.is_dir() {
                continue;
            }
            for entry in std::fs::read_dir(&shard)? {
                let path = entry?.path();
                let known = stored_blob_id(&shard, &path)
                    .is_some_and(|id| records.iter().any(|r| r.blob_id == id));
                if !known {
                    tracing::warn!(path = %path.display(), "removing stored file without a record");
                    if path.is_dir() {
                        std::fs::remove_dir_all(&path)?;
                    } else {
                        std::fs::remove_file(&path)?;
                    }
                    orphans += 1;
                }
            }
        }

        if swept_temp + dropped + orphans > 0 {
            tracing::info!(swept_temp, dropped, orphans, "blob store reconciled");
        }
        Ok(())
    }
}

fn blob_id_from_column(raw: &[u8]) -> Option<BlobId> {
    <[u8; 32]>::try_from(raw).ok().map(BlobId)
}

/// Recover the digest from a `<shard>/<rest>` stored path.
fn stored_blob_id(shard: &Path, path: &Path) -> Option<BlobId> {
    let shard = shard.file_name()?.to_str()?;
    let rest = path.file_name()?.to_str()?;
    BlobId::from_hex(&format!("{shard}{rest}"))
}
