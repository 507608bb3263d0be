use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use herald_api::{Message, Payload};
use herald_store::{Backlog, StoreError, TopicStore};

use crate::BrokerError;

/// Identifies one accepted connection for the lifetime of the broker.
pub(crate) type ConnectionId = u64;

struct Subscriber {
    connection: ConnectionId,
    tx: mpsc::UnboundedSender<Arc<Message>>,
}

struct TopicState {
    store: TopicStore,
    subscribers: Vec<Subscriber>,
}

// ═══════════════════════════════════════════════════════════════
//  Topic
// ═══════════════════════════════════════════════════════════════

/// A loaded topic: its store plus the connections streaming it.
///
/// One mutex covers both, so an append and its fan-out happen as a unit
/// and a new subscriber's backlog ends exactly where its live stream begins.
/// Work touching the log runs on the blocking pool while holding the lock.
pub(crate) struct Topic {
    name: String,
    state: Arc<Mutex<TopicState>>,
}

impl Topic {
    pub fn new(store: TopicStore) -> Self {
        Self {
            name: store.topic().to_string(),
            state: Arc::new(Mutex::new(TopicState {
                store,
                subscribers: Vec::new(),
            })),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `f` on the blocking pool with the topic locked. The lock is
    /// released when `f` returns, even if the caller stopped waiting.
    async fn with_state<R, F>(&self, f: F) -> Result<R, BrokerError>
    where
        F: FnOnce(&mut TopicState) -> R + Send + 'static,
        R: Send + 'static,
    {
        let mut state = self.state.clone().lock_owned().await;
        Ok(tokio::task::spawn_blocking(move || f(&mut *state)).await?)
    }

    fn store_error(&self, source: StoreError) -> BrokerError {
        BrokerError::Store {
            topic: self.name.clone(),
            source,
        }
    }

    /// Append and hand the message to every live subscriber.
    pub async fn publish(&self, payload: Payload) -> Result<Arc<Message>, BrokerError> {
        let name = self.name.clone();
        let appended = self
            .with_state(move |state| -> Result<Arc<Message>, StoreError> {
                let message = state.store.append_message(payload)?;
                state.subscribers.retain(|sub| {
                    if sub.tx.send(message.clone()).is_ok() {
                        return true;
                    }
                    tracing::debug!(topic = %name, connection = sub.connection, "dropping closed subscriber");
                    false
                });
                Ok(message)
            })
            .await?;
        appended.map_err(|source| self.store_error(source))
    }

    /// Register `connection` and return its backlog together with the
    /// receiver of everything appended after it.
    pub async fn subscribe(
        &self,
        connection: ConnectionId,
    ) -> Result<(Backlog, mpsc::UnboundedReceiver<Arc<Message>>), BrokerError> {
        let name = self.name.clone();
        let registered = self
            .with_state(move |state| -> Result<_, StoreError> {
                let backlog = state.store.read_from(0)?;
                let (tx, rx) = mpsc::unbounded_channel();
                state.subscribers.push(Subscriber { connection, tx });
                tracing::debug!(
                    topic = %name,
                    connection,
                    snapshot = state.store.last_sequence(),
                    epoch = state.store.epoch(),
                    "subscriber registered"
                );
                Ok((backlog, rx))
            })
            .await?;
        registered.map_err(|source| self.store_error(source))
    }

    pub async fn unsubscribe(&self, connection: ConnectionId) {
        let mut state = self.state.lock().await;
        state.subscribers.retain(|sub| sub.connection != connection);
    }

    pub async fn evict_expired(&self) -> usize {
        self.state.lock().await.store.evict_expired()
    }

    pub async fn flush(&self) -> Result<(), BrokerError> {
        self.with_state(|state| state.store.flush())
            .await?
            .map_err(|source| self.store_error(source))
    }

    #[cfg(test)]
    pub async fn subscriber_count(&self) -> usize {
        self.state.lock().await.subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn topic(root: &std::path::Path) -> Topic {
        Topic::new(TopicStore::open(root, "t", Duration::from_secs(60)).unwrap())
    }

    #[tokio::test]
    async fn backlog_and_live_stream_meet_without_gap_or_overlap() {
        let root = tempfile::tempdir().unwrap();
        let topic = topic(root.path());
        topic.publish(Payload::from("m1")).await.unwrap();
        topic.publish(Payload::from("m2")).await.unwrap();

        let (backlog, mut live) = topic.subscribe(7).await.unwrap();
        topic.publish(Payload::from("m3")).await.unwrap();

        let replayed: Vec<u64> = backlog.map(|m| m.unwrap().sequence).collect();
        assert_eq!(replayed, vec![1, 2]);
        assert_eq!(live.recv().await.unwrap().sequence, 3);
    }

    #[tokio::test]
    async fn failed_append_is_reported_and_not_fanned_out() {
        let root = tempfile::tempdir().unwrap();
        let topic = topic(root.path());
        let (_, mut live) = topic.subscribe(1).await.unwrap();
        topic.publish(Payload::from("m1")).await.unwrap();
        assert_eq!(live.recv().await.unwrap().sequence, 1);

        std::fs::OpenOptions::new()
            .write(true)
            .open(root.path().join("t").join(herald_store::LOG_FILE_NAME))
            .unwrap()
            .set_len(0)
            .unwrap();

        assert!(matches!(
            topic.publish(Payload::from("m2")).await,
            Err(BrokerError::Store {
                source: StoreError::Poisoned { .. },
                ..
            })
        ));
        assert!(live.try_recv().is_err());
    }

    #[tokio::test]
    async fn closed_and_removed_subscribers_stop_receiving() {
        let root = tempfile::tempdir().unwrap();
        let topic = topic(root.path());

        let (_, dropped) = topic.subscribe(1).await.unwrap();
        let (_, _kept) = topic.subscribe(2).await.unwrap();
        let (_, _removed) = topic.subscribe(3).await.unwrap();
        drop(dropped);
        topic.unsubscribe(3).await;
        assert_eq!(topic.subscriber_count().await, 2);

        topic.publish(Payload::from("x")).await.unwrap();
        assert_eq!(topic.subscriber_count().await, 1);
    }
}
