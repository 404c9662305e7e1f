//! Container log stream demultiplexing
//!
//! The Docker Engine multiplexes stdout and stderr of a non-TTY container onto
//! one byte stream. Every chunk carries an 8-byte header:
//!
//! ```text
//! ┌────────┬──────────────┬──────────────────────┐
//! │ stream │ 3B reserved  │ length: u32 (BE, 4B) │  followed by `length` bytes
//! └────────┴──────────────┴──────────────────────┘
//!   0 = stdin, 1 = stdout, 2 = stderr
//! ```

use thiserror::Error;

pub const HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdin,
    Stdout,
    Stderr,
}

impl StreamKind {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(StreamKind::Stdin),
            1 => Some(StreamKind::Stdout),
            2 => Some(StreamKind::Stderr),
            _ => None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DemuxError {
    #[error("invalid stream type byte {0}")]
    InvalidStream(u8),
}

/// Decode one chunk from the front of `buf`
///
/// Returns the stream, the chunk payload and the total number of bytes
/// consumed, or `None` if `buf` does not yet hold a complete chunk.
pub fn decode_chunk(buf: &[u8]) -> Result<Option<(StreamKind, &[u8], usize)>, DemuxError> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }
    let stream = StreamKind::from_byte(buf[0]).ok_or(DemuxError::InvalidStream(buf[0]))?;
    let len = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
    let end = HEADER_LEN + len;
    if buf.len() < end {
        return Ok(None);
    }
    Ok(Some((stream, &buf[HEADER_LEN..end], end)))
}

/// Buffers partial chunks across network reads
#[derive(Debug, Default)]
pub struct LogDemuxer {
    pending: Vec<u8>,
}

impl LogDemuxer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes from the log stream; returns every chunk completed so far
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<(StreamKind, Vec<u8>)>, DemuxError> {
        self.pending.extend_from_slice(data);

        let mut out = Vec::new();
        let mut offset = 0;
        while let Some((stream, payload, used)) = decode_chunk(&self.pending[offset..])? {
            out.push((stream, payload.to_vec()));
            offset += used;
        }
        self.pending.drain(..offset);
        Ok(out)
    }

    /// Bytes waiting for the rest of their chunk
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(stream: u8, payload: &[u8]) -> Vec<u8> {
        let mut v = vec![stream, 0, 0, 0];
        v.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        v.extend_from_slice(payload);
        v
    }

    #[test]
    fn test_decode_single_chunk() {
        let buf = chunk(1, b"hello");
        let (stream, payload, used) = decode_chunk(&buf).unwrap().unwrap();
        assert_eq!(stream, StreamKind::Stdout);
        assert_eq!(payload, b"hello");
        assert_eq!(used, buf.len());
    }

    #[test]
    fn test_incomplete_chunk_needs_more() {
        let buf = chunk(2, b"hello");
        assert!(decode_chunk(&buf[..5]).unwrap().is_none());
        assert!(decode_chunk(&buf[..10]).unwrap().is_none());
    }

    #[test]
    fn test_invalid_stream_byte() {
        let buf = chunk(7, b"x");
        assert_eq!(decode_chunk(&buf), Err(DemuxError::InvalidStream(7)));
    }

    #[test]
    fn test_demuxer_splits_interleaved_streams_across_reads() {
        let mut wire = chunk(1, b"out-1");
        wire.extend(chunk(2, b"err-1"));
        wire.extend(chunk(1, b"out-2"));

        let mut demux = LogDemuxer::new();
        let mut seen = Vec::new();
        for piece in wire.chunks(3) {
            seen.extend(demux.push(piece).unwrap());
        }

        assert_eq!(
            seen,
            vec![
                (StreamKind::Stdout, b"out-1".to_vec()),
                (StreamKind::Stderr, b"err-1".to_vec()),
                (StreamKind::Stdout, b"out-2".to_vec()),
            ]
        );
        assert_eq!(demux.buffered(), 0);
    }
}
