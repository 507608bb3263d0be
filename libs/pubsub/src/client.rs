use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

use herald_api::{validate_topic_name, Epoch, Payload, Sequence};
use herald_channel::{
    ChannelError, ChannelEvent, ChannelOptions, FrameChannel, FrameReceiver, FrameSender,
};

use crate::{ClientError, ControlFrame};

type DeliveryHandler = Arc<dyn Fn(Delivery) + Send + Sync>;
type ErrorHandler = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// One message handed to a subscription handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    pub sequence: Sequence,
    pub epoch: Epoch,
    pub payload: Payload,
}

struct Subscription {
    handler: DeliveryHandler,
    /// Epoch of the history `last_sequence` counts in.
    epoch: Option<Epoch>,
    /// Highest sequence handed to `handler`; 0 before the first delivery.
    last_sequence: Sequence,
}

struct Shared {
    sender: FrameSender,
    subscriptions: Mutex<HashMap<String, Subscription>>,
    on_error: Mutex<Option<ErrorHandler>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ═══════════════════════════════════════════════════════════════
//  PubSubClient
// ═══════════════════════════════════════════════════════════════

/// Publisher/subscriber endpoint multiplexing any number of topics over one channel.
///
/// Subscriptions survive reconnects: whenever the channel reports
/// [`ChannelEvent::Reconnected`], a fresh `SUBSCRIBE` goes out for every
/// subscribed topic. The broker answers with the full backlog again; messages
/// at or below the last delivered sequence of a topic are dropped here, so a
/// handler sees each sequence at most once and always in increasing order.
/// If the broker lost a topic's history and started it over, its deliveries
/// carry a new epoch; the count then restarts and sequences begin again at 1.
pub struct PubSubClient {
    channel: FrameChannel,
    shared: Arc<Shared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for PubSubClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubSubClient")
            .field("channel", &self.channel)
            .field("topics", &self.topics())
            .finish_non_exhaustive()
    }
}

impl PubSubClient {
    /// Layer the protocol on an existing channel. Takes over its receiver.
    pub fn new(mut channel: FrameChannel) -> Result<Self, ClientError> {
        let receiver = channel
            .take_receiver()
            .ok_or(ClientError::Channel(ChannelError::ReceiverTaken))?;
        let events = channel.events();

        let shared = Arc::new(Shared {
            sender: channel.sender(),
            subscriptions: Mutex::new(HashMap::new()),
            on_error: Mutex::new(None),
        });

        let tasks = vec![
            tokio::spawn(read_loop(shared.clone(), receiver)),
            tokio::spawn(resubscribe_loop(shared.clone(), events)),
        ];

        Ok(Self {
            channel,
            shared,
            tasks: Mutex::new(tasks),
        })
    }

    /// Connect to a broker at `host:port`. `reconnect_interval` defaults to
    /// [`herald_channel::DEFAULT_RETRY_INTERVAL`].
    pub fn connect(
        host: &str,
        port: u16,
        reconnect_interval: Option<Duration>,
    ) -> Result<Self, ClientError> {
        let mut options = ChannelOptions::default();
        if let Some(interval) = reconnect_interval {
            options = options.with_retry_interval(interval);
        }
        Self::new(FrameChannel::connect(host, port, options))
    }

    /// Send a message to `topic`. Fire-and-forget: returns once queued.
    pub fn publish(&self, topic: &str, payload: impl Into<Payload>) -> Result<(), ClientError> {
        self.ensure_alive()?;
        validate_topic_name(topic)?;
        let frame = ControlFrame::publish(topic, payload.into());
        self.shared.sender.send(frame.encode()?)?;
        Ok(())
    }

    /// Publish a structured value as a JSON payload.
    pub fn publish_json<T: Serialize + ?Sized>(&self, topic: &str, value: &T) -> Result<(), ClientError> {
        self.publish(topic, Payload::from_json(value)?)
    }

    /// Subscribe `handler` to `topic`.
    ///
    /// The handler receives the topic's backlog followed by every newly
    /// published message, in sequence order. One handler per topic.
    pub fn subscribe<F>(&self, topic: &str, handler: F) -> Result<(), ClientError>
    where
        F: Fn(Delivery) + Send + Sync + 'static,
    {
        self.ensure_alive()?;
        validate_topic_name(topic)?;
        {
            let mut subscriptions = lock(&self.shared.subscriptions);
            if subscriptions.contains_key(topic) {
                return Err(ClientError::AlreadySubscribed(topic.to_string()));
            }
            subscriptions.insert(
                topic.to_string(),
                Subscription {
                    handler: Arc::new(handler),
                    epoch: None,
                    last_sequence: 0,
                },
            );
        }

        if let Err(e) = send_subscribe(&self.shared.sender, topic) {
            lock(&self.shared.subscriptions).remove(topic);
            return Err(e);
        }
        tracing::debug!(%topic, "subscribed");
        Ok(())
    }

    /// Handler for `ERROR` frames from the broker (`topic`, `message`).
    /// Without one, errors are logged.
    pub fn on_error<F>(&self, handler: F)
    where
        F: Fn(&str, &str) + Send + Sync + 'static,
    {
        *lock(&self.shared.on_error) = Some(Arc::new(handler));
    }

    /// Topics currently subscribed.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = lock(&self.shared.subscriptions).keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Close the channel and drop all local subscription state.
    /// Safe to call repeatedly.
    pub fn destroy(&self) {
        self.channel.close();
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        lock(&self.shared.subscriptions).clear();
        lock(&self.shared.on_error).take();
    }

    pub fn is_destroyed(&self) -> bool {
        self.channel.is_closed()
    }

    fn ensure_alive(&self) -> Result<(), ClientError> {
        if self.channel.is_closed() {
            return Err(ClientError::Destroyed);
        }
        Ok(())
    }
}

impl Drop for PubSubClient {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn send_subscribe(sender: &FrameSender, topic: &str) -> Result<(), ClientError> {
    sender.send(ControlFrame::subscribe(topic).encode()?)?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════
//  Background tasks
// ═══════════════════════════════════════════════════════════════

async fn read_loop(shared: Arc<Shared>, mut receiver: FrameReceiver) {
    while let Some(bytes) = receiver.recv().await {
        match ControlFrame::decode(&bytes) {
            Ok(ControlFrame::Deliver {
                topic,
                sequence,
                epoch,
                payload,
            }) => dispatch(
                &shared,
                Delivery {
                    topic,
                    sequence,
                    epoch,
                    payload,
                },
            ),
            Ok(ControlFrame::Error { topic, message }) => {
                let handler = lock(&shared.on_error).clone();
                match handler {
                    Some(handler) => handler(&topic, &message),
                    None => tracing::warn!(%topic, %message, "broker reported error"),
                }
            }
            Ok(other) => {
                tracing::warn!(kind = other.kind(), topic = %other.topic(), "unexpected frame from broker, ignoring");
            }
            Err(e) => {
                tracing::warn!(error = %e, "undecodable frame from broker, ignoring");
            }
        }
    }
    tracing::debug!("client read loop finished");
}

fn dispatch(shared: &Shared, delivery: Delivery) {
    let Delivery {
        ref topic,
        sequence,
        epoch,
        ..
    } = delivery;
    let handler = {
        let mut subscriptions = lock(&shared.subscriptions);
        let Some(subscription) = subscriptions.get_mut(topic) else {
            tracing::debug!(%topic, sequence, "delivery for topic without subscription");
            return;
        };
        if subscription.epoch != Some(epoch) {
            if subscription.epoch.is_some() {
                tracing::info!(
                    %topic,
                    epoch,
                    last_sequence = subscription.last_sequence,
                    "topic history was reset, restarting sequence count"
                );
            }
            subscription.epoch = Some(epoch);
            subscription.last_sequence = 0;
        }
        if sequence <= subscription.last_sequence {
            tracing::trace!(%topic, sequence, "duplicate delivery suppressed");
            return;
        }
        subscription.last_sequence = sequence;
        subscription.handler.clone()
    };

    handler(delivery);
}

async fn resubscribe_loop(shared: Arc<Shared>, mut events: broadcast::Receiver<ChannelEvent>) {
    loop {
        match events.recv().await {
            Ok(ChannelEvent::Reconnected { peer }) => resubscribe_all(&shared, &peer),
            Ok(ChannelEvent::Closed) | Err(RecvError::Closed) => break,
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                // A reconnect may be among the skipped events; the broker
                // ignores repeated SUBSCRIBEs on one connection.
                tracing::warn!(skipped, "channel events lagged, resubscribing");
                resubscribe_all(&shared, "unknown");
            }
        }
    }
}

fn resubscribe_all(shared: &Shared, peer: &str) {
    let topics: Vec<String> = lock(&shared.subscriptions).keys().cloned().collect();
    if topics.is_empty() {
        return;
    }
    tracing::info!(%peer, count = topics.len(), "resubscribing after reconnect");
    for topic in topics {
        if let Err(e) = send_subscribe(&shared.sender, &topic) {
            tracing::warn!(%topic, error = %e, "resubscribe failed");
        }
    }
}
