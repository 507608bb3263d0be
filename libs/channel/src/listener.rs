use std::net::SocketAddr;

use tokio::net::TcpListener;

use crate::{ChannelError, FrameChannel};

/// Listening side: every accepted connection becomes its own [`FrameChannel`].
#[derive(Debug)]
pub struct FrameListener {
    listener: TcpListener,
    max_frame_len: usize,
}

impl FrameListener {
    /// Bind `host:port`. Port 0 picks an ephemeral port, see [`FrameListener::local_addr`].
    pub async fn bind(host: &str, port: u16, max_frame_len: usize) -> Result<Self, ChannelError> {
        let listener = TcpListener::bind((host, port))
            .await
            .map_err(|source| ChannelError::Bind {
                addr: format!("{host}:{port}"),
                source,
            })?;
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(%addr, "listening");
        }
        Ok(Self {
            listener,
            max_frame_len,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Wait for the next inbound connection.
    pub async fn accept(&self) -> Result<FrameChannel, ChannelError> {
        let (stream, peer) = self.listener.accept().await.map_err(ChannelError::Accept)?;
        tracing::debug!(%peer, "accepted connection");
        Ok(FrameChannel::accepted(stream, peer, self.max_frame_len))
    }
}
