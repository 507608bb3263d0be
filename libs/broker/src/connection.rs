use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use herald_api::{validate_topic_name, Message, Payload};
use herald_channel::{FrameChannel, FrameSender};
use herald_pubsub::ControlFrame;
use herald_store::{Backlog, StoreError};

use crate::registry::TopicRegistry;
use crate::topic::ConnectionId;

/// Why a connection's read loop ended.
enum Exit {
    PeerClosed,
    Shutdown,
    Violation(String),
}

/// Per-connection state: the topics this peer subscribed to and the task
/// streaming each of them.
struct Connection {
    id: ConnectionId,
    peer: String,
    sender: FrameSender,
    registry: Arc<TopicRegistry>,
    subscriptions: HashMap<String, JoinHandle<()>>,
    /// Streaming tasks that gave up report their topic here.
    ended: mpsc::UnboundedSender<String>,
}

/// Serve one accepted connection until the peer leaves, it breaks the
/// protocol, or `shutdown` fires. Subscriptions are torn down on the way out.
pub(crate) async fn serve_connection(
    mut channel: FrameChannel,
    id: ConnectionId,
    registry: Arc<TopicRegistry>,
    shutdown: CancellationToken,
) {
    let Some(mut receiver) = channel.take_receiver() else {
        return;
    };
    let (ended, mut ended_rx) = mpsc::unbounded_channel();
    let mut conn = Connection {
        id,
        peer: channel.peer().to_string(),
        sender: channel.sender(),
        registry,
        subscriptions: HashMap::new(),
        ended,
    };
    tracing::info!(peer = %conn.peer, connection = id, "client connected");

    let exit = loop {
        let bytes = tokio::select! {
            // An ended subscription is released before the next frame is
            // read, so a SUBSCRIBE answering its ERROR is never ignored.
            biased;
            _ = shutdown.cancelled() => break Exit::Shutdown,
            Some(topic) = ended_rx.recv() => {
                conn.release(&topic).await;
                continue;
            }
            frame = receiver.recv() => match frame {
                Some(bytes) => bytes,
                None => break Exit::PeerClosed,
            },
        };
        if let Err(reason) = conn.handle_frame(&bytes).await {
            break Exit::Violation(reason);
        }
    };

    match exit {
        Exit::PeerClosed => tracing::info!(peer = %conn.peer, connection = id, "client disconnected"),
        Exit::Shutdown => tracing::debug!(peer = %conn.peer, connection = id, "closing connection for shutdown"),
        Exit::Violation(reason) => {
            tracing::warn!(peer = %conn.peer, connection = id, %reason, "protocol violation, closing connection")
        }
    }

    conn.teardown().await;
    channel.close();
}

impl Connection {
    /// Err means the peer broke the protocol and must be dropped.
    async fn handle_frame(&mut self, bytes: &[u8]) -> Result<(), String> {
        let frame = ControlFrame::decode(bytes).map_err(|e| e.to_string())?;
        match frame {
            ControlFrame::Subscribe { topic } => self.subscribe(topic).await,
            ControlFrame::Publish { topic, payload } => {
                self.publish(topic, payload).await;
                Ok(())
            }
            other => Err(format!("{} is not accepted from clients", other.kind())),
        }
    }

    async fn subscribe(&mut self, topic: String) -> Result<(), String> {
        validate_topic_name(&topic).map_err(|e| e.to_string())?;
        if self.subscriptions.contains_key(&topic) {
            tracing::debug!(peer = %self.peer, %topic, "already subscribed, ignoring");
            return Ok(());
        }

        let handle = match self.registry.get_or_load(&topic).await {
            Ok(entry) => match entry.subscribe(self.id).await {
                Ok((backlog, live)) => tokio::spawn(stream_subscription(
                    topic.clone(),
                    backlog,
                    live,
                    self.sender.clone(),
                    self.ended.clone(),
                )),
                Err(e) => {
                    tracing::error!(%topic, error = %e, "cannot read topic backlog");
                    self.send_error(&topic, &e.to_string());
                    return Ok(());
                }
            },
            Err(e) => {
                tracing::error!(%topic, error = %e, "cannot load topic");
                self.send_error(&topic, &e.to_string());
                return Ok(());
            }
        };
        tracing::debug!(peer = %self.peer, %topic, "subscribed");
        self.subscriptions.insert(topic, handle);
        Ok(())
    }

    async fn publish(&mut self, topic: String, payload: Payload) {
        let entry = match self.registry.get_or_load(&topic).await {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(peer = %self.peer, %topic, error = %e, "publish rejected");
                self.send_error(&topic, &e.to_string());
                return;
            }
        };
        match entry.publish(payload).await {
            Ok(message) => {
                tracing::debug!(peer = %self.peer, %topic, sequence = message.sequence, "published");
            }
            Err(e) => {
                tracing::error!(peer = %self.peer, %topic, error = %e, "append failed");
                self.send_error(&topic, &format!("append failed: {e}"));
            }
        }
    }

    fn send_error(&self, topic: &str, message: &str) {
        send_error(&self.sender, topic, message);
    }

    /// Forget a subscription whose streaming task has stopped, so the peer
    /// can subscribe to the topic again.
    async fn release(&mut self, topic: &str) {
        if self.subscriptions.remove(topic).is_none() {
            return;
        }
        if let Some(entry) = self.registry.get(topic) {
            entry.unsubscribe(self.id).await;
        }
        tracing::debug!(peer = %self.peer, %topic, "subscription released");
    }

    async fn teardown(&mut self) {
        for (topic, handle) in self.subscriptions.drain() {
            handle.abort();
            if let Some(entry) = self.registry.get(&topic) {
                entry.unsubscribe(self.id).await;
            }
        }
    }
}

fn send_error(sender: &FrameSender, topic: &str, message: &str) {
    let frame = ControlFrame::Error {
        topic: topic.to_string(),
        message: message.to_string(),
    };
    match frame.encode() {
        Ok(bytes) => {
            let _ = sender.send(bytes);
        }
        Err(e) => tracing::error!(%topic, error = %e, "cannot encode error frame"),
    }
}

// ═══════════════════════════════════════════════════════════════
//  Streaming
// ═══════════════════════════════════════════════════════════════

enum Replay {
    Done(usize),
    Disconnected,
}

/// Replay the backlog, then forward live messages, all as DELIVER frames.
///
/// Whenever the task stops early it hands the topic back through `ended`.
/// If the backlog cannot be read the peer also gets an ERROR frame and the
/// live stream is never started.
async fn stream_subscription(
    topic: String,
    backlog: Backlog,
    mut live: mpsc::UnboundedReceiver<Arc<Message>>,
    sender: FrameSender,
    ended: mpsc::UnboundedSender<String>,
) {
    let replay = {
        let sender = sender.clone();
        tokio::task::spawn_blocking(move || replay_backlog(backlog, &sender)).await
    };
    let failure = match replay {
        Ok(Ok(Replay::Done(replayed))) => {
            tracing::debug!(%topic, replayed, "backlog replayed");
            None
        }
        Ok(Ok(Replay::Disconnected)) => {
            let _ = ended.send(topic);
            return;
        }
        Ok(Err(e)) => Some(e.to_string()),
        Err(e) => Some(e.to_string()),
    };
    if let Some(reason) = failure {
        tracing::error!(%topic, error = %reason, "backlog replay failed");
        let _ = ended.send(topic.clone());
        send_error(&sender, &topic, &format!("backlog replay failed: {reason}"));
        return;
    }

    while let Some(message) = live.recv().await {
        if !deliver(&sender, &message) {
            let _ = ended.send(topic);
            return;
        }
    }
}

fn replay_backlog(backlog: Backlog, sender: &FrameSender) -> Result<Replay, StoreError> {
    let mut replayed = 0;
    for item in backlog {
        if !deliver(sender, &*item?) {
            return Ok(Replay::Disconnected);
        }
        replayed += 1;
    }
    Ok(Replay::Done(replayed))
}

/// False once the message can no longer reach the peer.
fn deliver(sender: &FrameSender, message: &Message) -> bool {
    let frame = ControlFrame::Deliver {
        topic: message.topic.clone(),
        sequence: message.sequence,
        epoch: message.epoch,
        payload: message.payload.clone(),
    };
    match frame.encode() {
        Ok(bytes) => sender.send(bytes).is_ok(),
        Err(e) => {
            tracing::error!(topic = %message.topic, sequence = message.sequence, error = %e, "cannot encode delivery, ending stream");
            false
        }
    }
}
