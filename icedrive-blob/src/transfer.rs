//! Chunked transfer sessions.
//!
//! A [`DataTransfer`] is a handle over one byte resource that hands out
//! bounded chunks until it is drained, then is closed exactly once. Blob
//! bytes move into and out of the store through sessions so no caller ever
//! holds a whole blob in memory.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use tokio::io::AsyncReadExt;

use crate::error::TransferError;

/// Default number of bytes requested per read.
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Upper bound on a single read, whatever the caller asks for.
pub const MAX_CHUNK_SIZE: usize = 1024 * 1024;

/// Transfer progress metrics.
#[derive(Debug, Default)]
pub struct TransferMetrics {
    pub bytes_transferred: AtomicU64,
    pub chunks_transferred: AtomicU64,
}

impl TransferMetrics {
    pub fn record_chunk(&self, len: usize) {
        self.bytes_transferred
            .fetch_add(len as u64, Ordering::Relaxed);
        self.chunks_transferred.fetch_add(1, Ordering::Relaxed);
    }
}

/// A session over a byte resource.
///
/// `read` returns up to `max_size` bytes; an empty chunk means the resource
/// is drained. After `close` every `read` fails with
/// [`TransferError::Closed`]. `close` may be called any number of times.
pub trait DataTransfer: Send {
    fn read(
        &mut self,
        max_size: usize,
    ) -> impl Future<Output = Result<Bytes, TransferError>> + Send;

    fn close(&mut self) -> impl Future<Output = Result<(), TransferError>> + Send;
}

fn clamp_read(max_size: usize) -> usize {
    max_size.clamp(1, MAX_CHUNK_SIZE)
}

/// Read-only session over a file on disk.
#[derive(Debug)]
pub struct FileTransfer {
    path: PathBuf,
    file: Option<tokio::fs::File>,
    len: u64,
}

impl FileTransfer {
    /// Open `path` for reading.
    pub async fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = tokio::fs::File::open(&path).await?;
        let len = file.metadata().await?.len();
        Ok(Self {
            path,
            file: Some(file),
            len,
        })
    }

    /// Size of the underlying file when the session was opened.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Drain the rest of the session into memory and close it.
    ///
    /// Meant for small blobs and tests.
    pub async fn read_to_vec(&mut self, chunk_size: usize) -> Result<Vec<u8>, TransferError> {
        let mut out = Vec::with_capacity(self.len as usize);
        let result = loop {
            match self.read(chunk_size).await {
                Ok(chunk) if chunk.is_empty() => break Ok(()),
                Ok(chunk) => out.extend_from_slice(&chunk),
                Err(e) => break Err(e),
            }
        };
        self.close().await?;
        result.map(|()| out)
    }
}

impl DataTransfer for FileTransfer {
    async fn read(&mut self, max_size: usize) -> Result<Bytes, TransferError> {
        let file = self.file.as_mut().ok_or(TransferError::Closed)?;
        let mut buf = vec![0u8; clamp_read(max_size)];
        let n = file.read(&mut buf).await?;
        buf.truncate(n);
        Ok(Bytes::from(buf))
    }

    async fn close(&mut self) -> Result<(), TransferError> {
        if self.file.take().is_some() {
            tracing::trace!(path = %self.path.display(), "file transfer closed");
        }
        Ok(())
    }
}

/// Session over bytes already in memory.
pub struct MemoryTransfer {
    remaining: Bytes,
    closed: bool,
}

impl MemoryTransfer {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            remaining: data.into(),
            closed: false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl DataTransfer for MemoryTransfer {
    async fn read(&mut self, max_size: usize) -> Result<Bytes, TransferError> {
        if self.closed {
            return Err(TransferError::Closed);
        }
        let n = clamp_read(max_size).min(self.remaining.len());
        Ok(self.remaining.split_to(n))
    }

    async fn close(&mut self) -> Result<(), TransferError> {
        self.closed = true;
        self.remaining = Bytes::new();
        Ok(())
    }
}
