//! Chunked transfer of large field values
//!
//! Reads pull a large field of the current row into a [`FieldBuffer`] a few
//! bytes at a time; writes hand a new value to a `send_data` command in
//! pieces. Neither side knows about result streams.
//!
//! A read that fills the buffer before the value ends stops there and
//! reports [`ReadStatus::Truncated`]. The rest of the value is left unread;
//! this is not an error.

use crate::command::CommandIo;
use crate::config::Config;
use crate::constants::{DEFAULT_CHUNK_SIZE, DEFAULT_PIECE_SIZE};
use crate::error::{Error, Result};
use crate::types::FieldBuffer;

/// Result of a single chunk read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    /// `n` bytes read, more of the item remains
    Partial(usize),
    /// `n` bytes read and the item is complete
    ItemComplete(usize),
}

impl ChunkStatus {
    /// Bytes read by the call
    pub fn bytes_read(&self) -> usize {
        match self {
            ChunkStatus::Partial(n) | ChunkStatus::ItemComplete(n) => *n,
        }
    }
}

/// Result of reading a whole large field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// The whole value is in the buffer
    Complete,
    /// The buffer filled up before the value ended
    Truncated,
}

/// Reads and writes large fields in bounded pieces
#[derive(Debug, Clone, Copy)]
pub struct ChunkedTransfer {
    chunk_size: usize,
    piece_size: usize,
}

impl Default for ChunkedTransfer {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            piece_size: DEFAULT_PIECE_SIZE,
        }
    }
}

impl ChunkedTransfer {
    /// Create a transfer with explicit read and write sizes
    pub fn new(chunk_size: usize, piece_size: usize) -> Result<Self> {
        if chunk_size == 0 || piece_size == 0 {
            return Err(Error::InvalidArgument(format!(
                "chunk size {} and piece size {} must both be at least 1",
                chunk_size, piece_size
            )));
        }
        Ok(Self {
            chunk_size,
            piece_size,
        })
    }

    /// Take the sizes from a connection configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(config.chunk_size, config.send_piece_size)
    }

    /// Bytes requested per read call
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Bytes handed over per write call
    pub fn piece_size(&self) -> usize {
        self.piece_size
    }

    /// Read one chunk of `column` into `buffer`
    ///
    /// Requests `min(chunk_size, buffer.remaining())` bytes.
    pub async fn read_chunk(
        &self,
        cmd: &mut dyn CommandIo,
        column: usize,
        buffer: &mut FieldBuffer,
    ) -> Result<ChunkStatus> {
        let want = self.chunk_size.min(buffer.remaining());
        if want == 0 {
            return Err(Error::BufferOverflow {
                needed: 1,
                available: 0,
            });
        }

        let chunk = cmd.get_chunk(column, want).await?;
        let n = chunk.data.len();
        if n > want {
            return Err(Error::protocol(format!(
                "read returned {} bytes, asked for {}",
                n, want
            )));
        }
        if n == 0 && !chunk.item_complete {
            return Err(Error::protocol("empty read before end of item"));
        }
        buffer.append(&chunk.data)?;

        tracing::trace!(column, n, complete = chunk.item_complete, "Read chunk");
        Ok(if chunk.item_complete {
            ChunkStatus::ItemComplete(n)
        } else {
            ChunkStatus::Partial(n)
        })
    }

    /// Read `column` of the current row into `buffer` until the value ends
    /// or the buffer is full
    pub async fn read_into(
        &self,
        cmd: &mut dyn CommandIo,
        column: usize,
        buffer: &mut FieldBuffer,
    ) -> Result<ReadStatus> {
        loop {
            match self.read_chunk(cmd, column, buffer).await? {
                ChunkStatus::ItemComplete(_) => return Ok(ReadStatus::Complete),
                ChunkStatus::Partial(_) if buffer.is_full() => {
                    tracing::debug!(
                        column,
                        capacity = buffer.capacity(),
                        "Large field truncated to buffer capacity"
                    );
                    return Ok(ReadStatus::Truncated);
                }
                ChunkStatus::Partial(_) => {}
            }
        }
    }

    /// Hand `data` to a `send_data` command in `piece_size` pieces
    ///
    /// Returns the number of bytes handed over. The caller must still call
    /// [`CommandIo::send`] to flush the last pieces and submit.
    pub async fn write_from(&self, cmd: &mut dyn CommandIo, data: &[u8]) -> Result<usize> {
        let mut sent = 0;
        for piece in data.chunks(self.piece_size) {
            cmd.send_chunk(piece).await?;
            sent += piece.len();
        }
        tracing::trace!(sent, pieces = data.len().div_ceil(self.piece_size), "Wrote pieces");
        Ok(sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::mock::ScriptedCommand;

    const INITIAL: &[u8] = b"This is the initial value of the text field";

    #[tokio::test]
    async fn test_reconstructs_value_for_every_chunk_size() {
        for chunk in 1..=INITIAL.len() {
            let mut cmd = ScriptedCommand::default().with_field(INITIAL);
            let mut buf = FieldBuffer::new(255);
            let status = ChunkedTransfer::new(chunk, 1)
                .unwrap()
                .read_into(&mut cmd, 1, &mut buf)
                .await
                .unwrap();
            assert_eq!(status, ReadStatus::Complete, "chunk size {}", chunk);
            assert_eq!(buf.as_slice(), INITIAL, "chunk size {}", chunk);
            assert_eq!(cmd.count("get_chunk"), INITIAL.len().div_ceil(chunk).max(1));
        }
    }

    #[tokio::test]
    async fn test_truncates_to_capacity() {
        for capacity in [1, 7, 10, INITIAL.len() - 1] {
            let mut cmd = ScriptedCommand::default().with_field(INITIAL);
            let mut buf = FieldBuffer::new(capacity);
            let status = ChunkedTransfer::default()
                .read_into(&mut cmd, 1, &mut buf)
                .await
                .unwrap();
            assert_eq!(status, ReadStatus::Truncated);
            assert_eq!(buf.len(), capacity);
            assert_eq!(buf.as_slice(), &INITIAL[..capacity]);
        }
    }

    #[tokio::test]
    async fn test_exact_capacity_is_complete() {
        let mut cmd = ScriptedCommand::default().with_field(INITIAL);
        let mut buf = FieldBuffer::new(INITIAL.len());
        let status = ChunkedTransfer::default()
            .read_into(&mut cmd, 1, &mut buf)
            .await
            .unwrap();
        assert_eq!(status, ReadStatus::Complete);
        assert!(buf.is_full());
    }

    #[tokio::test]
    async fn test_empty_value() {
        let mut cmd = ScriptedCommand::default();
        let mut buf = FieldBuffer::new(16);
        let status = ChunkedTransfer::default()
            .read_into(&mut cmd, 1, &mut buf)
            .await
            .unwrap();
        assert_eq!(status, ReadStatus::Complete);
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_read_chunk_statuses() {
        let mut cmd = ScriptedCommand::default().with_field(b"abcdefg");
        let mut buf = FieldBuffer::new(16);
        let transfer = ChunkedTransfer::default();
        let first = transfer.read_chunk(&mut cmd, 1, &mut buf).await.unwrap();
        let second = transfer.read_chunk(&mut cmd, 1, &mut buf).await.unwrap();
        assert_eq!(first, ChunkStatus::Partial(5));
        assert_eq!(second, ChunkStatus::ItemComplete(2));
        assert_eq!(second.bytes_read(), 2);
    }

    #[tokio::test]
    async fn test_read_failure_propagates() {
        let mut cmd = ScriptedCommand::default().with_field(INITIAL);
        cmd.fail_on = Some("get_chunk");
        let mut buf = FieldBuffer::new(16);
        let err = ChunkedTransfer::default()
            .read_into(&mut cmd, 1, &mut buf)
            .await
            .unwrap_err();
        assert!(err.is_protocol_violation());
    }

    #[tokio::test]
    async fn test_write_in_single_byte_pieces() {
        let mut cmd = ScriptedCommand::default();
        let sent = ChunkedTransfer::default()
            .write_from(&mut cmd, INITIAL)
            .await
            .unwrap();
        assert_eq!(sent, INITIAL.len());
        assert_eq!(cmd.count("send_chunk"), INITIAL.len());
        assert_eq!(&cmd.sent[..], INITIAL);
    }

    #[tokio::test]
    async fn test_write_with_larger_pieces() {
        let mut cmd = ScriptedCommand::default();
        ChunkedTransfer::new(5, 4)
            .unwrap()
            .write_from(&mut cmd, b"0123456789")
            .await
            .unwrap();
        assert_eq!(cmd.count("send_chunk"), 3);
        assert_eq!(&cmd.sent[..], b"0123456789");
    }

    #[test]
    fn test_zero_sizes_rejected() {
        assert!(ChunkedTransfer::new(0, 1).is_err());
        assert!(ChunkedTransfer::new(1, 0).is_err());
    }
}
