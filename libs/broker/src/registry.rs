use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use herald_api::validate_topic_name;
use herald_store::{list_topics, TopicStore};

use crate::topic::Topic;
use crate::BrokerError;

// ═══════════════════════════════════════════════════════════════
//  TopicRegistry
// ═══════════════════════════════════════════════════════════════

/// All loaded topics of one broker, keyed by name.
///
/// The map lock only guards the map itself and is never held across an
/// await or disk access. Loading a topic from disk is serialized by
/// `load_lock` so two connections racing on a new name open it once.
pub(crate) struct TopicRegistry {
    root: PathBuf,
    cache_duration: Duration,
    topics: RwLock<HashMap<String, Arc<Topic>>>,
    load_lock: tokio::sync::Mutex<()>,
}

impl TopicRegistry {
    pub fn new(root: PathBuf, cache_duration: Duration) -> Self {
        Self {
            root,
            cache_duration,
            topics: RwLock::new(HashMap::new()),
            load_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Load every topic already present under the root. A topic that
    /// fails to load is logged and skipped; it is retried lazily on first use.
    pub fn scan(&self) -> Result<usize, BrokerError> {
        let names = list_topics(&self.root).map_err(|source| BrokerError::Store {
            topic: String::new(),
            source,
        })?;

        let mut loaded = 0;
        for name in names {
            match TopicStore::recover(&self.root, &name, self.cache_duration) {
                Ok(store) => {
                    self.insert(Arc::new(Topic::new(store)));
                    loaded += 1;
                }
                Err(e) => {
                    tracing::error!(topic = %name, error = %e, "failed to load topic, skipping");
                }
            }
        }
        Ok(loaded)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Topic>> {
        self.read().get(name).cloned()
    }

    /// Return the topic, loading its log or creating it empty on first use.
    pub async fn get_or_load(&self, name: &str) -> Result<Arc<Topic>, BrokerError> {
        if let Some(topic) = self.get(name) {
            return Ok(topic);
        }
        validate_topic_name(name)?;

        let _guard = self.load_lock.lock().await;
        if let Some(topic) = self.get(name) {
            return Ok(topic);
        }
        let (root, owned, cache_duration) = (self.root.clone(), name.to_string(), self.cache_duration);
        let store = tokio::task::spawn_blocking(move || TopicStore::recover(&root, &owned, cache_duration))
            .await?
            .map_err(|source| BrokerError::Store {
                topic: name.to_string(),
                source,
            })?;
        let topic = Arc::new(Topic::new(store));
        self.insert(topic.clone());
        tracing::info!(topic = %name, "topic loaded");
        Ok(topic)
    }

    pub fn all(&self) -> Vec<Arc<Topic>> {
        self.read().values().cloned().collect()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn insert(&self, topic: Arc<Topic>) {
        let mut topics = self.topics.write().unwrap_or_else(|p| p.into_inner());
        topics.insert(topic.name().to_string(), topic);
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<Topic>>> {
        self.topics.read().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_api::Payload;

    #[tokio::test]
    async fn topics_are_created_lazily_and_found_again_by_scan() {
        let root = tempfile::tempdir().unwrap();
        let registry = TopicRegistry::new(root.path().to_path_buf(), Duration::from_secs(1));
        assert!(registry.names().is_empty());

        let topic = registry.get_or_load("orders").await.unwrap();
        topic.publish(Payload::from("a")).await.unwrap();
        let again = registry.get_or_load("orders").await.unwrap();
        assert!(Arc::ptr_eq(&topic, &again));

        let fresh = TopicRegistry::new(root.path().to_path_buf(), Duration::from_secs(1));
        assert_eq!(fresh.scan().unwrap(), 1);
        assert_eq!(fresh.names(), vec!["orders"]);
    }

    #[tokio::test]
    async fn invalid_names_are_rejected_before_touching_disk() {
        let root = tempfile::tempdir().unwrap();
        let registry = TopicRegistry::new(root.path().to_path_buf(), Duration::from_secs(1));
        assert!(matches!(
            registry.get_or_load("a/b").await,
            Err(BrokerError::InvalidTopic(_))
        ));
        assert!(std::fs::read_dir(root.path()).unwrap().next().is_none());
    }
}
