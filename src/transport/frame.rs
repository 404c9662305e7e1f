//! Length-prefixed framing
//!
//! ```text
//! ┌──────────────────────┬──────────────────────────┐
//! │ length: u64 (LE, 8B) │ payload: `length` bytes  │
//! └──────────────────────┴──────────────────────────┘
//! ```
//!
//! A length of zero is the close sentinel: the peer is done sending.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame payload
pub const MAX_FRAME_SIZE: u64 = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_SIZE} byte limit")]
    TooLarge(u64),
    #[error("empty frame payload")]
    Empty,
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Write one frame and flush
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    if payload.is_empty() {
        return Err(FrameError::Empty);
    }
    let len = payload.len() as u64;
    if len > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(len));
    }
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Write the zero-length close sentinel
pub async fn write_close<W>(writer: &mut W) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&0u64.to_le_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame
///
/// Returns `Ok(None)` on the close sentinel or when the stream ends cleanly
/// on a frame boundary. A stream that ends mid-frame is an error.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 8];
    let mut filled = 0;
    while filled < header.len() {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
        }
        filled += n;
    }

    let len = u64::from_le_bytes(header);
    if len == 0 {
        return Ok(None);
    }
    if len > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(len));
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_arrive_in_order() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, b"first").await.unwrap();
        write_frame(&mut a, b"second").await.unwrap();

        assert_eq!(read_frame(&mut b).await.unwrap().unwrap(), b"first");
        assert_eq!(read_frame(&mut b).await.unwrap().unwrap(), b"second");
    }

    #[tokio::test]
    async fn test_header_is_little_endian() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"abc").await.unwrap();
        assert_eq!(&buf[..8], &[3, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(&buf[8..], b"abc");
    }

    #[tokio::test]
    async fn test_zero_length_is_clean_close() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, b"payload").await.unwrap();
        write_close(&mut a).await.unwrap();
        // data after the sentinel is never looked at
        write_frame(&mut a, b"ignored").await.unwrap();

        assert!(read_frame(&mut b).await.unwrap().is_some());
        assert!(read_frame(&mut b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_eof_on_boundary_is_clean_close() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        assert!(read_frame(&mut b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_truncated_frame_is_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&10u64.to_le_bytes()).await.unwrap();
        a.write_all(b"short").await.unwrap();
        drop(a);
        assert!(matches!(read_frame(&mut b).await, Err(FrameError::Io(_))));
    }

    #[tokio::test]
    async fn test_oversized_length_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&(MAX_FRAME_SIZE + 1).to_le_bytes()).await.unwrap();
        assert!(matches!(read_frame(&mut b).await, Err(FrameError::TooLarge(_))));
    }

    #[tokio::test]
    async fn test_empty_payload_cannot_be_written() {
        let mut buf = Vec::new();
        assert!(matches!(write_frame(&mut buf, b"").await, Err(FrameError::Empty)));
        assert!(buf.is_empty());
    }
}
