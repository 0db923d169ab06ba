//! ONC RPC record transport
//!
//! Streams carry RPC messages as records: one or more fragments, each
//! preceded by a 4-byte record mark. Readers collect fragments until the
//! last-fragment bit is set.

use bytes::{Bytes, BytesMut};
use oncrpc::{encode_record, RecordFramer, RpcError, DEFAULT_MAX_FRAGMENT_LEN, RECORD_MARK_SIZE};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest record a reader will assemble (1 MiB)
pub const DEFAULT_MAX_RECORD_SIZE: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("record too large: {size} bytes exceeds maximum {max}")]
    RecordTooLarge { size: usize, max: usize },

    #[error(transparent)]
    Rpc(#[from] RpcError),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Record-marked transport over an async byte stream
pub struct RecordTransport<T> {
    inner: T,
    framer: RecordFramer,
    max_fragment_len: usize,
    max_record_size: usize,
    read_buf: BytesMut,
}

impl<T> RecordTransport<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            framer: RecordFramer::default(),
            max_fragment_len: DEFAULT_MAX_FRAGMENT_LEN,
            max_record_size: DEFAULT_MAX_RECORD_SIZE,
            read_buf: BytesMut::with_capacity(8192),
        }
    }

    /// Split outgoing records into fragments of at most `len` bytes
    pub fn with_max_fragment_len(mut self, len: usize) -> Self {
        self.max_fragment_len = len;
        self
    }

    pub fn with_max_record_size(mut self, max_size: usize) -> Self {
        self.max_record_size = max_size;
        self
    }
}

impl<T: AsyncRead + Unpin> RecordTransport<T> {
    /// Read one complete record, fragments joined
    pub async fn read_record(&mut self) -> Result<Bytes> {
        let mut record = BytesMut::new();
        loop {
            while self.read_buf.len() < RECORD_MARK_SIZE {
                if self.fill_buf().await? == 0 {
                    return Err(if self.read_buf.is_empty() && record.is_empty() {
                        TransportError::ConnectionClosed
                    } else {
                        unexpected_eof("incomplete record mark")
                    });
                }
            }

            let mark = self.framer.read_mark(&self.read_buf)?;
            let size = record.len() + mark.fragment_len as usize;
            if size > self.max_record_size {
                return Err(TransportError::RecordTooLarge {
                    size,
                    max: self.max_record_size,
                });
            }

            while self.read_buf.len() < mark.wire_len() {
                if self.fill_buf().await? == 0 {
                    return Err(unexpected_eof("incomplete fragment"));
                }
            }

            let fragment = self.read_buf.split_to(mark.wire_len());
            record.extend_from_slice(&fragment[RECORD_MARK_SIZE..]);
            if mark.is_last {
                return Ok(record.freeze());
            }
        }
    }

    async fn fill_buf(&mut self) -> Result<usize> {
        if self.read_buf.capacity() - self.read_buf.len() < 4096 {
            self.read_buf.reserve(8192);
        }
        Ok(self.inner.read_buf(&mut self.read_buf).await?)
    }
}

impl<T: AsyncWrite + Unpin> RecordTransport<T> {
    /// Record-mark `message` and write it out
    pub async fn write_record(&mut self, message: &[u8]) -> Result<()> {
        let data = encode_record(message, self.max_fragment_len);
        self.inner.write_all(&data).await?;
        self.inner.flush().await?;
        Ok(())
    }
}

fn unexpected_eof(what: &str) -> TransportError {
    TransportError::Io(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, what.to_string()))
}
