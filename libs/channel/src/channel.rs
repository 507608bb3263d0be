use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::framing::{encode_frame, FrameDecoder, DEFAULT_MAX_FRAME_LEN};
use crate::ChannelError;

/// Reconnect interval used when the caller does not pick one.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(250);

const READ_CHUNK: usize = 64 * 1024;

// ═══════════════════════════════════════════════════════════════
//  Options and events
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct ChannelOptions {
    /// Pause between connection attempts (connecting role only).
    pub retry_interval: Duration,
    /// Largest frame accepted or sent; bigger inbound frames drop the connection.
    pub max_frame_len: usize,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            retry_interval: DEFAULT_RETRY_INTERVAL,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl ChannelOptions {
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }
}

/// Which side created the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Dials out and keeps redialing after a drop.
    Connecting,
    /// One inbound connection handed out by a [`crate::FrameListener`]; never reconnects.
    Accepted,
}

/// Connection lifecycle notifications, broadcast to every [`FrameSender::events`] receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// First successful connection.
    Connected { peer: String },
    /// Connection re-established after a drop. Layered protocols re-register state here.
    Reconnected { peer: String },
    /// Connection lost; a connecting channel will retry.
    Disconnected { reason: String },
    /// Channel shut down for good.
    Closed,
}

// ═══════════════════════════════════════════════════════════════
//  FrameSender / FrameReceiver
// ═══════════════════════════════════════════════════════════════

/// Cloneable write side of a channel.
///
/// `send` only enqueues; the link task does the actual write. Frames queued
/// while the connection is down are written after the next reconnect.
#[derive(Clone)]
pub struct FrameSender {
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    events: broadcast::Sender<ChannelEvent>,
    token: CancellationToken,
    max_frame_len: usize,
}

impl std::fmt::Debug for FrameSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameSender")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl FrameSender {
    /// Enqueue one frame payload for transmission.
    pub fn send(&self, payload: Vec<u8>) -> Result<(), ChannelError> {
        if payload.len() > self.max_frame_len {
            return Err(ChannelError::FrameTooLarge {
                len: payload.len(),
                max: self.max_frame_len,
            });
        }
        if self.token.is_cancelled() {
            return Err(ChannelError::Closed);
        }
        self.outbound.send(payload).map_err(|_| ChannelError::Closed)
    }

    /// Subscribe to lifecycle events from this point on.
    pub fn events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    /// Stop the channel: drop the connection and cancel pending reconnects.
    /// Safe to call any number of times.
    pub fn close(&self) {
        self.token.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled() || self.outbound.is_closed()
    }
}

/// Read side of a channel: received frame payloads in arrival order.
#[derive(Debug)]
pub struct FrameReceiver {
    inbound: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl FrameReceiver {
    /// Next received frame; `None` once the channel is closed.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.inbound.recv().await
    }

    /// Invoke `handler` once per received frame, in order, on a spawned task.
    pub fn on_message<F>(mut self, mut handler: F) -> JoinHandle<()>
    where
        F: FnMut(Vec<u8>) + Send + 'static,
    {
        tokio::spawn(async move {
            while let Some(frame) = self.inbound.recv().await {
                handler(frame);
            }
        })
    }
}

// ═══════════════════════════════════════════════════════════════
//  FrameChannel
// ═══════════════════════════════════════════════════════════════

/// Bidirectional length-prefixed message channel over TCP.
///
/// Dropping the channel closes it.
pub struct FrameChannel {
    role: Role,
    peer: String,
    sender: FrameSender,
    receiver: Option<FrameReceiver>,
}

impl std::fmt::Debug for FrameChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameChannel")
            .field("role", &self.role)
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

impl FrameChannel {
    /// Open a connecting channel to `host:port`.
    ///
    /// Returns immediately; the connection is established in the background
    /// and re-established every `options.retry_interval` after a drop (or an
    /// initial failure) until [`FrameChannel::close`]. Must be called inside a
    /// tokio runtime.
    pub fn connect(host: &str, port: u16, options: ChannelOptions) -> Self {
        let peer = format_addr(host, port);
        let (channel, link) = Self::build(Role::Connecting, peer.clone(), options.max_frame_len);
        let events = channel.sender.events.clone();
        tokio::spawn(run_connecting(peer, options.retry_interval, link, events));
        channel
    }

    /// Wrap an accepted connection.
    pub(crate) fn accepted(stream: TcpStream, peer: SocketAddr, max_frame_len: usize) -> Self {
        let peer = peer.to_string();
        let (channel, link) = Self::build(Role::Accepted, peer.clone(), max_frame_len);
        let events = channel.sender.events.clone();
        tokio::spawn(run_accepted(stream, peer, link, events));
        channel
    }

    fn build(role: Role, peer: String, max_frame_len: usize) -> (Self, Link) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(64);
        let token = CancellationToken::new();

        let link = Link {
            outbound: outbound_rx,
            pending: VecDeque::new(),
            inbound: inbound_tx,
            token: token.clone(),
            max_frame_len,
        };
        let channel = Self {
            role,
            peer,
            sender: FrameSender {
                outbound: outbound_tx,
                events,
                token,
                max_frame_len,
            },
            receiver: Some(FrameReceiver { inbound: inbound_rx }),
        };
        (channel, link)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Remote address (`host:port`).
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn sender(&self) -> FrameSender {
        self.sender.clone()
    }

    pub fn send(&self, payload: Vec<u8>) -> Result<(), ChannelError> {
        self.sender.send(payload)
    }

    pub fn events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.sender.events()
    }

    /// Detach the read side, e.g. to drive it from a dedicated task.
    pub fn take_receiver(&mut self) -> Option<FrameReceiver> {
        self.receiver.take()
    }

    /// Next received frame; `None` once closed or if the receiver was taken.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        match self.receiver.as_mut() {
            Some(receiver) => receiver.recv().await,
            None => None,
        }
    }

    /// Register the per-frame callback. Can be done once per channel.
    pub fn on_message<F>(&mut self, handler: F) -> Result<JoinHandle<()>, ChannelError>
    where
        F: FnMut(Vec<u8>) + Send + 'static,
    {
        let receiver = self.take_receiver().ok_or(ChannelError::ReceiverTaken)?;
        Ok(receiver.on_message(handler))
    }

    pub fn close(&self) {
        self.sender.close();
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

impl Drop for FrameChannel {
    fn drop(&mut self) {
        self.sender.close();
    }
}

fn format_addr(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

// ═══════════════════════════════════════════════════════════════
//  Link tasks
// ═══════════════════════════════════════════════════════════════

/// State that outlives a single TCP connection.
struct Link {
    outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    /// Dequeued frames whose write did not complete; resent first on reconnect.
    pending: VecDeque<Vec<u8>>,
    inbound: mpsc::UnboundedSender<Vec<u8>>,
    token: CancellationToken,
    max_frame_len: usize,
}

enum LinkEnd {
    Cancelled,
    /// Every sender handle is gone.
    Abandoned,
    Lost(String),
}

async fn run_connecting(
    addr: String,
    retry_interval: Duration,
    mut link: Link,
    events: broadcast::Sender<ChannelEvent>,
) {
    let mut connected_before = false;

    loop {
        let attempt = tokio::select! {
            _ = link.token.cancelled() => break,
            attempt = TcpStream::connect(addr.as_str()) => attempt,
        };

        match attempt {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                let event = if connected_before {
                    tracing::info!(peer = %addr, "channel reconnected");
                    ChannelEvent::Reconnected { peer: addr.clone() }
                } else {
                    tracing::debug!(peer = %addr, "channel connected");
                    ChannelEvent::Connected { peer: addr.clone() }
                };
                connected_before = true;
                let _ = events.send(event);

                match run_link(stream, &addr, &mut link).await {
                    LinkEnd::Cancelled | LinkEnd::Abandoned => break,
                    LinkEnd::Lost(reason) => {
                        tracing::warn!(peer = %addr, %reason, "channel lost, will reconnect");
                        let _ = events.send(ChannelEvent::Disconnected { reason });
                    }
                }
            }
            Err(e) => {
                tracing::debug!(peer = %addr, error = %e, "connect failed, will retry");
            }
        }

        tokio::select! {
            _ = link.token.cancelled() => break,
            _ = tokio::time::sleep(retry_interval) => {}
        }
    }

    if !link.pending.is_empty() || !link.outbound.is_empty() {
        tracing::debug!(
            peer = %addr,
            unsent = link.pending.len() + link.outbound.len(),
            "channel closed with unsent frames"
        );
    }
    let _ = events.send(ChannelEvent::Closed);
}

async fn run_accepted(
    stream: TcpStream,
    peer: String,
    mut link: Link,
    events: broadcast::Sender<ChannelEvent>,
) {
    let _ = stream.set_nodelay(true);
    let _ = events.send(ChannelEvent::Connected { peer: peer.clone() });

    if let LinkEnd::Lost(reason) = run_link(stream, &peer, &mut link).await {
        tracing::debug!(%peer, %reason, "inbound connection ended");
        let _ = events.send(ChannelEvent::Disconnected { reason });
    }
    link.token.cancel();
    let _ = events.send(ChannelEvent::Closed);
}

/// Pump frames over one TCP connection until it fails or the channel closes.
async fn run_link(stream: TcpStream, peer: &str, link: &mut Link) -> LinkEnd {
    let (mut reader, mut writer) = stream.into_split();
    let mut decoder = FrameDecoder::new(link.max_frame_len);
    let mut chunk = vec![0u8; READ_CHUNK];

    while let Some(frame) = link.pending.pop_front() {
        if let Some(end) = write_or_cancel(&mut writer, &frame, link).await {
            link.pending.push_front(frame);
            return end;
        }
    }

    loop {
        tokio::select! {
            _ = link.token.cancelled() => {
                let _ = writer.shutdown().await;
                return LinkEnd::Cancelled;
            }
            read = reader.read(&mut chunk) => match read {
                Ok(0) => return LinkEnd::Lost("connection closed by peer".into()),
                Ok(n) => match decoder.feed(&chunk[..n]) {
                    Ok(frames) => {
                        for frame in frames {
                            // Nobody listening is not an error for the link.
                            let _ = link.inbound.send(frame);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(%peer, error = %e, "protocol violation, dropping connection");
                        let _ = writer.shutdown().await;
                        return LinkEnd::Lost(format!("protocol violation: {e}"));
                    }
                },
                Err(e) => return LinkEnd::Lost(e.to_string()),
            },
            next = link.outbound.recv() => match next {
                Some(frame) => {
                    if let Some(end) = write_or_cancel(&mut writer, &frame, link).await {
                        link.pending.push_front(frame);
                        return end;
                    }
                }
                None => {
                    let _ = writer.shutdown().await;
                    return LinkEnd::Abandoned;
                }
            },
        }
    }
}

/// Write one frame; `Some` means the link is over.
async fn write_or_cancel(writer: &mut OwnedWriteHalf, payload: &[u8], link: &Link) -> Option<LinkEnd> {
    let mut buf = Vec::new();
    if let Err(e) = encode_frame(payload, link.max_frame_len, &mut buf) {
        tracing::warn!(error = %e, "dropping unencodable frame");
        return None;
    }

    tokio::select! {
        _ = link.token.cancelled() => Some(LinkEnd::Cancelled),
        written = writer.write_all(&buf) => match written {
            Ok(()) => None,
            Err(e) => Some(LinkEnd::Lost(e.to_string())),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FrameListener;

    #[tokio::test]
    async fn frames_flow_both_ways() {
        let listener = FrameListener::bind("127.0.0.1", 0, DEFAULT_MAX_FRAME_LEN).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut client = FrameChannel::connect("127.0.0.1", port, ChannelOptions::default());
        client.send(b"ping".to_vec()).unwrap();

        let mut server = listener.accept().await.unwrap();
        assert_eq!(server.role(), Role::Accepted);
        assert_eq!(server.recv().await.unwrap(), b"ping".to_vec());

        server.send(b"pong".to_vec()).unwrap();
        assert_eq!(client.recv().await.unwrap(), b"pong".to_vec());
    }

    #[tokio::test]
    async fn frames_sent_before_the_server_exists_are_delivered() {
        // Reserve a port, release it, start the server on it later.
        let probe = FrameListener::bind("127.0.0.1", 0, DEFAULT_MAX_FRAME_LEN).await.unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let options = ChannelOptions::default().with_retry_interval(Duration::from_millis(20));
        let client = FrameChannel::connect("127.0.0.1", port, options);
        client.send(b"early".to_vec()).unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        let listener = FrameListener::bind("127.0.0.1", port, DEFAULT_MAX_FRAME_LEN).await.unwrap();
        let mut server = listener.accept().await.unwrap();
        assert_eq!(server.recv().await.unwrap(), b"early".to_vec());
    }

    #[tokio::test]
    async fn reconnect_is_announced() {
        let listener = FrameListener::bind("127.0.0.1", 0, DEFAULT_MAX_FRAME_LEN).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let options = ChannelOptions::default().with_retry_interval(Duration::from_millis(20));
        let client = FrameChannel::connect("127.0.0.1", port, options);
        let mut events = client.events();

        let first = listener.accept().await.unwrap();
        assert!(matches!(events.recv().await.unwrap(), ChannelEvent::Connected { .. }));

        first.close();
        drop(first);
        assert!(matches!(events.recv().await.unwrap(), ChannelEvent::Disconnected { .. }));

        let mut second = listener.accept().await.unwrap();
        assert!(matches!(events.recv().await.unwrap(), ChannelEvent::Reconnected { .. }));

        client.send(b"after".to_vec()).unwrap();
        assert_eq!(second.recv().await.unwrap(), b"after".to_vec());
    }

    #[tokio::test]
    async fn oversized_inbound_frame_drops_connection() {
        let listener = FrameListener::bind("127.0.0.1", 0, 16).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut raw = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut server = listener.accept().await.unwrap();
        raw.write_all(&1024u32.to_be_bytes()).await.unwrap();

        assert_eq!(server.recv().await, None);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_stops_retrying() {
        let probe = FrameListener::bind("127.0.0.1", 0, DEFAULT_MAX_FRAME_LEN).await.unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let options = ChannelOptions::default().with_retry_interval(Duration::from_millis(10));
        let client = FrameChannel::connect("127.0.0.1", port, options);
        let mut events = client.events();

        client.close();
        client.close();
        assert_eq!(events.recv().await.unwrap(), ChannelEvent::Closed);
        assert!(client.is_closed());
        assert!(matches!(client.send(b"x".to_vec()), Err(ChannelError::Closed)));
    }
}
