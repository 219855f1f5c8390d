//! Length-prefixed postcard framing for reliable streams.
//!
//! Each frame is a big-endian `u32` body length followed by the postcard
//! encoding of one message.

use std::io;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest frame body accepted from a peer.
pub const MAX_FRAME_LEN: u32 = 4 * 1024 * 1024;

fn invalid_data(e: impl std::error::Error + Send + Sync + 'static) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

/// Encode `msg` and write it as one frame, then flush.
pub async fn write_frame<W, T>(send: &mut W, msg: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = postcard::to_allocvec(msg).map_err(invalid_data)?;
    let len = u32::try_from(bytes.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME_LEN)
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("frame of {} bytes exceeds limit", bytes.len()),
            )
        })?;
    send.write_u32(len).await?;
    send.write_all(&bytes).await?;
    send.flush().await
}

/// Read and decode one frame.
///
/// Returns `Ok(None)` when the stream ends cleanly before a new frame starts.
pub async fn read_frame<R, T>(recv: &mut R) -> io::Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = match recv.read_u32().await {
        Ok(len) => len,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("peer announced frame of {len} bytes, limit is {MAX_FRAME_LEN}"),
        ));
    }
    let mut buf = vec![0u8; len as usize];
    recv.read_exact(&mut buf).await?;
    postcard::from_bytes(&buf).map(Some).map_err(invalid_data)
}
