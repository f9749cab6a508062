use anyhow::{Context, Result};
use log::info;
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use super::{ChannelKind, StreamChannel};

pub type SocketChannel = StreamChannel<OwnedReadHalf, OwnedWriteHalf>;

/// Connect to the producing server with Nagle's algorithm disabled.
pub async fn connect_socket(addr: SocketAddr) -> Result<SocketChannel> {
    info!("Connecting to {} ...", addr);
    let stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("Failed to connect to {}", addr))?;
    stream
        .set_nodelay(true)
        .context("Failed to disable Nagle's algorithm")?;
    info!("Connected to {}", addr);

    Ok(from_stream(stream, addr))
}

/// Wrap an already connected stream.
pub fn from_stream(stream: TcpStream, addr: SocketAddr) -> SocketChannel {
    let (reader, writer) = stream.into_split();
    StreamChannel::new(ChannelKind::Socket, addr.to_string(), reader, writer)
}
