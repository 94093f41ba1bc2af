//! Async frame I/O.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::packet::{Packet, LENGTH_PREFIX_LEN};
use crate::error::{ProtocolError, Result};

/// Write one packet and flush.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, packet: &Packet) -> Result<()> {
    writer.write_all(&packet.encode()).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame body (without the length prefix).
///
/// A frame longer than `max_len` is drained from the stream and rejected with
/// `FrameTooLarge`, so the next read starts on a frame boundary.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R, max_len: usize) -> Result<Vec<u8>> {
    let mut len_bytes = [0u8; LENGTH_PREFIX_LEN];
    reader.read_exact(&mut len_bytes).await?;
    let len = u64::from_be_bytes(len_bytes);

    if len > max_len as u64 {
        let drained = tokio::io::copy(&mut (&mut *reader).take(len), &mut tokio::io::sink()).await?;
        if drained < len {
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
        }
        return Err(ProtocolError::FrameTooLarge {
            len: usize::try_from(len).unwrap_or(usize::MAX),
            max: max_len,
        }
        .into());
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(body)
}
