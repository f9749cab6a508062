//! Byte channels feeding the decode pipeline.
//!
//! A channel is a readable/writable byte stream with a cancellable read side.
//! Two concrete forms exist, with identical contracts:
//! - [`socket`]: TCP connection to the producing server
//! - [`accessory`]: USB accessory device node / file descriptor

pub mod accessory;
pub mod socket;

#[cfg(test)]
pub mod scripted;

use async_trait::async_trait;
use std::io::ErrorKind;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::ChannelError;
use crate::pipeline::reassembler::Discipline;

pub use accessory::open_accessory;
pub use socket::connect_socket;

/// Kind of transport behind a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Socket,
    Accessory,
}

impl ChannelKind {
    /// Framing discipline used on this kind of channel.
    pub fn discipline(&self) -> Discipline {
        match self {
            ChannelKind::Socket => Discipline::LengthPrefixed,
            ChannelKind::Accessory => Discipline::ShortRead,
        }
    }
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelKind::Socket => write!(f, "socket"),
            ChannelKind::Accessory => write!(f, "accessory"),
        }
    }
}

/// Result of one read.
///
/// `bytes_read == 0 && !eof` means nothing arrived yet and the caller should
/// simply read again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOutcome {
    pub bytes_read: usize,
    pub eof: bool,
}

impl ReadOutcome {
    pub fn data(bytes_read: usize) -> Self {
        Self {
            bytes_read,
            eof: false,
        }
    }

    pub fn eof() -> Self {
        Self {
            bytes_read: 0,
            eof: true,
        }
    }
}

/// Readable/writable byte stream.
///
/// Only the feed loop reads. `close` may be called from any task or thread,
/// any number of times; a pending `read` then returns `ChannelError::Closed`
/// and every `closed` future completes.
#[async_trait]
pub trait ByteChannel: Send + Sync {
    /// Read up to `buf.len()` bytes, waiting until at least one byte is
    /// available, the stream ends, or the channel fails.
    async fn read(&self, buf: &mut [u8]) -> Result<ReadOutcome, ChannelError>;

    /// Write all of `bytes`, returning the number written.
    async fn write(&self, bytes: &[u8]) -> Result<usize, ChannelError>;

    fn close(&self);

    fn is_closed(&self) -> bool;

    /// Complete once the channel has been closed.
    async fn closed(&self);

    fn kind(&self) -> ChannelKind;

    /// Human-readable description of the remote end, for logging.
    fn describe(&self) -> String;
}

/// Channel over any async reader/writer pair.
pub struct StreamChannel<R, W> {
    kind: ChannelKind,
    peer: String,
    reader: Mutex<R>,
    writer: Mutex<W>,
    closed: CancellationToken,
}

impl<R, W> StreamChannel<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(kind: ChannelKind, peer: impl Into<String>, reader: R, writer: W) -> Self {
        Self {
            kind,
            peer: peer.into(),
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            closed: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl<R, W> ByteChannel for StreamChannel<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn read(&self, buf: &mut [u8]) -> Result<ReadOutcome, ChannelError> {
        let requested = buf.len();
        let mut reader = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(ChannelError::Closed),
            reader = self.reader.lock() => reader,
        };

        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(ChannelError::Closed),
            res = reader.read(buf) => match res {
                Ok(0) if requested > 0 => Ok(ReadOutcome::eof()),
                Ok(n) => Ok(ReadOutcome::data(n)),
                Err(e) if matches!(e.kind(), ErrorKind::Interrupted | ErrorKind::WouldBlock) => {
                    Ok(ReadOutcome::data(0))
                }
                Err(e) => Err(e.into()),
            },
        }
    }

    async fn write(&self, bytes: &[u8]) -> Result<usize, ChannelError> {
        let mut writer = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(ChannelError::Closed),
            writer = self.writer.lock() => writer,
        };

        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(ChannelError::Closed),
            res = async {
                writer.write_all(bytes).await?;
                writer.flush().await
            } => {
                res?;
                Ok(bytes.len())
            }
        }
    }

    fn close(&self) {
        self.closed.cancel();
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    async fn closed(&self) {
        self.closed.cancelled().await
    }

    fn kind(&self) -> ChannelKind {
        self.kind
    }

    fn describe(&self) -> String {
        format!("{} {}", self.kind, self.peer)
    }
}
