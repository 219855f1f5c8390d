//! Transfer sessions carried over a peer stream.
//!
//! After a positive `DownloadBlob` answer the asking node drives the stream
//! with [`TransferRequest`] frames and the holder answers each `Read` with a
//! [`TransferReply`]. [`RemoteTransfer`] is the asking side;
//! [`serve_session`] is the holder side.

use std::time::Duration;

use bytes::Bytes;
use icedrive_net::framing::{read_frame, write_frame};
use icedrive_protocol::query::{TransferReply, TransferRequest};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::error::TransferError;
use crate::transfer::{DataTransfer, MAX_CHUNK_SIZE};

/// Pulls a blob from a peer one bounded read at a time.
pub struct RemoteTransfer<S, R> {
    send: S,
    recv: R,
    read_timeout: Duration,
    finished: bool,
    closed: bool,
}

impl<S, R> RemoteTransfer<S, R>
where
    S: AsyncWrite + Send + Unpin,
    R: AsyncRead + Send + Unpin,
{
    /// Wrap the halves of a stream whose query was answered with
    /// `DownloadBlobResponse`.
    pub fn new(send: S, recv: R, read_timeout: Duration) -> Self {
        Self {
            send,
            recv,
            read_timeout,
            finished: false,
            closed: false,
        }
    }

    async fn request_chunk(&mut self, max_size: u32) -> Result<Bytes, TransferError> {
        write_frame(&mut self.send, &TransferRequest::Read { max_size }).await?;
        match read_frame::<_, TransferReply>(&mut self.recv).await? {
            Some(TransferReply::Data(data)) => Ok(Bytes::from(data)),
            Some(TransferReply::Failed { reason }) => Err(TransferError::Remote { reason }),
            None => Err(TransferError::UnexpectedEof),
        }
    }
}

impl<S, R> DataTransfer for RemoteTransfer<S, R>
where
    S: AsyncWrite + Send + Unpin,
    R: AsyncRead + Send + Unpin,
{
    async fn read(&mut self, max_size: usize) -> Result<Bytes, TransferError> {
        if self.closed {
            return Err(TransferError::Closed);
        }
        if self.finished {
            return Ok(Bytes::new());
        }
        let max_size = max_size.clamp(1, MAX_CHUNK_SIZE) as u32;
        let chunk = tokio::time::timeout(self.read_timeout, self.request_chunk(max_size))
            .await
            .map_err(|_| TransferError::TimedOut(self.read_timeout))??;
        if chunk.is_empty() {
            self.finished = true;
        }
        Ok(chunk)
    }

    async fn close(&mut self) -> Result<(), TransferError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        // Best effort: the holder also ends the session when the stream drops.
        let sent = tokio::time::timeout(self.read_timeout, async {
            write_frame(&mut self.send, &TransferRequest::Close).await?;
            self.send.shutdown().await
        })
        .await;
        match sent {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(TransferError::TimedOut(self.read_timeout)),
        }
    }
}

/// Serve `session` over a stream until the peer closes it, the stream ends,
/// or the peer sends nothing for `idle_timeout`.
///
/// Returns the number of payload bytes sent. The session is closed on every
/// path.
pub async fn serve_session<T, S, R>(
    mut session: T,
    send: &mut S,
    recv: &mut R,
    idle_timeout: Duration,
) -> Result<u64, TransferError>
where
    T: DataTransfer,
    S: AsyncWrite + Send + Unpin,
    R: AsyncRead + Send + Unpin,
{
    let mut sent = 0u64;
    let result = loop {
        let next = tokio::time::timeout(idle_timeout, read_frame::<_, TransferRequest>(recv)).await;
        let request = match next {
            Ok(Ok(Some(request))) => request,
            Ok(Ok(None)) => break Ok(()),
            Ok(Err(e)) => break Err(TransferError::from(e)),
            Err(_) => {
                tracing::debug!(idle = ?idle_timeout, "peer went idle, ending transfer session");
                break Err(TransferError::TimedOut(idle_timeout));
            }
        };
        match request {
            TransferRequest::Close => break Ok(()),
            TransferRequest::Read { max_size } => {
                let reply = match session.read(max_size as usize).await {
                    Ok(chunk) => {
                        sent += chunk.len() as u64;
                        TransferReply::Data(chunk.to_vec())
                    }
                    Err(e) => TransferReply::Failed {
                        reason: e.to_string(),
                    },
                };
                let failed = matches!(reply, TransferReply::Failed { .. });
                if let Err(e) = write_frame(send, &reply).await {
                    break Err(e.into());
                }
                if failed {
                    break Ok(());
                }
            }
        }
    };
    session.close().await?;
    result.map(|()| sent)
}
