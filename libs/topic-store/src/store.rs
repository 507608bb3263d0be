use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use herald_api::{now_ms, validate_topic_name, Epoch, Message, Payload, Sequence};

use crate::cache::RecencyCache;
use crate::log::{quarantine, DurableLog, LogRecord, LogScan, LOG_FILE_NAME};
use crate::StoreError;

// ════════════════════════════════════════════════════════════════
//  TopicStore
// ════════════════════════════════════════════════════════════════

/// Ordered, durable history of one topic.
///
/// Not internally synchronized: callers serialize `append` against each
/// other and against `read_from`. A [`Backlog`] obtained from `read_from`
/// may be consumed after the lock is released.
pub struct TopicStore {
    topic: String,
    log: DurableLog,
    cache: RecencyCache,
    last_sequence: Sequence,
    epoch: Epoch,
}

impl std::fmt::Debug for TopicStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicStore")
            .field("topic", &self.topic)
            .field("path", &self.log.path())
            .field("last_sequence", &self.last_sequence)
            .field("epoch", &self.epoch)
            .field("cached", &self.cache.len())
            .finish()
    }
}

impl TopicStore {
    /// Open the store of `topic` under `root`, creating it if absent.
    ///
    /// An existing log is validated; its highest sequence becomes the
    /// counter's starting point. The cache starts empty.
    pub fn open(root: &Path, topic: &str, cache_duration: Duration) -> Result<Self, StoreError> {
        validate_topic_name(topic)?;
        let (log, recovered) = DurableLog::open(&root.join(topic))?;
        if recovered.records > 0 {
            tracing::info!(
                %topic,
                last_sequence = recovered.last_sequence,
                records = recovered.records,
                epoch = recovered.epoch,
                "recovered topic log"
            );
        }
        Ok(Self {
            topic: topic.to_string(),
            log,
            cache: RecencyCache::new(cache_duration),
            last_sequence: recovered.last_sequence,
            epoch: recovered.epoch,
        })
    }

    /// Like [`open`](Self::open), but a corrupt log is set aside and the
    /// topic starts over empty instead of failing.
    pub fn recover(root: &Path, topic: &str, cache_duration: Duration) -> Result<Self, StoreError> {
        match Self::open(root, topic, cache_duration) {
            Err(StoreError::Corrupt { path, line, reason }) => {
                let moved = quarantine(&root.join(topic))?;
                tracing::error!(
                    %topic,
                    path = %path.display(),
                    line,
                    %reason,
                    quarantined = %moved.display(),
                    "topic log is corrupt, starting empty"
                );
                Self::open(root, topic, cache_duration)
            }
            other => other,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn path(&self) -> &Path {
        self.log.path()
    }

    /// Highest sequence assigned so far; 0 for an empty topic.
    pub fn last_sequence(&self) -> Sequence {
        self.last_sequence
    }

    /// Incarnation of this topic's history. Changes whenever the topic
    /// starts over at sequence 1 after its log was lost or set aside.
    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    /// Persist `payload` and return its sequence. The record is on stable
    /// storage when this returns. On error nothing was committed and the
    /// sequence is not consumed.
    pub fn append(&mut self, payload: Payload) -> Result<Sequence, StoreError> {
        self.append_message(payload).map(|m| m.sequence)
    }

    /// [`append`](Self::append), returning the stored message for fan-out.
    pub fn append_message(&mut self, payload: Payload) -> Result<Arc<Message>, StoreError> {
        let record = LogRecord {
            seq: self.last_sequence + 1,
            ts_ms: now_ms(),
            payload,
        };
        self.log.append(&record)?;
        self.last_sequence = record.seq;

        let message = Arc::new(Message {
            topic: self.topic.clone(),
            sequence: record.seq,
            epoch: self.epoch,
            payload: record.payload,
            ts_ms: record.ts_ms,
        });
        self.cache.push(message.clone(), Instant::now());
        tracing::trace!(topic = %self.topic, sequence = message.sequence, "appended");
        Ok(message)
    }

    /// Every message with sequence greater than `after`, ascending.
    ///
    /// The part of the range still cached is served from memory; anything
    /// older is streamed from the log on demand. Each call starts from
    /// current state, so the result never depends on eviction.
    pub fn read_from(&self, after: Sequence) -> Result<Backlog, StoreError> {
        let end = self.last_sequence;
        if after >= end {
            return Ok(Backlog::empty(&self.topic, self.epoch));
        }

        let tail = self.cache.tail_after(after);
        let disk_until = tail.first().map_or(end + 1, |m| m.sequence);
        let scan = if after + 1 < disk_until {
            Some(LogScan::open(self.log.path())?)
        } else {
            None
        };

        Ok(Backlog {
            topic: self.topic.clone(),
            epoch: self.epoch,
            after,
            disk_until,
            scan,
            tail: tail.into_iter(),
        })
    }

    /// Drop cache entries older than the cache duration. Returns how many.
    pub fn evict_expired(&mut self) -> usize {
        self.evict_expired_at(Instant::now())
    }

    pub fn evict_expired_at(&mut self, now: Instant) -> usize {
        let evicted = self.cache.evict_expired(now);
        if evicted > 0 {
            tracing::debug!(topic = %self.topic, evicted, "evicted cached messages");
        }
        evicted
    }

    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }

    /// Force file data and metadata to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.log.sync()
    }
}

// ════════════════════════════════════════════════════════════════
//  Backlog
// ════════════════════════════════════════════════════════════════

/// Lazy result of [`TopicStore::read_from`]: log records below the cached
/// range, then the cached tail.
pub struct Backlog {
    topic: String,
    epoch: Epoch,
    after: Sequence,
    /// Log records are read while their sequence is below this.
    disk_until: Sequence,
    scan: Option<LogScan>,
    tail: std::vec::IntoIter<Arc<Message>>,
}

impl Backlog {
    fn empty(topic: &str, epoch: Epoch) -> Self {
        Self {
            topic: topic.to_string(),
            epoch,
            after: 0,
            disk_until: 0,
            scan: None,
            tail: Vec::new().into_iter(),
        }
    }

    fn next_from_disk(&mut self) -> Option<Result<Arc<Message>, StoreError>> {
        let scan = self.scan.as_mut()?;
        loop {
            let record = match scan.next_record() {
                Ok(Some(record)) => record,
                Ok(None) => break,
                Err(e) => {
                    self.scan = None;
                    return Some(Err(e));
                }
            };
            if record.seq <= self.after {
                continue;
            }
            if record.seq >= self.disk_until {
                break;
            }
            return Some(Ok(Arc::new(Message {
                topic: self.topic.clone(),
                sequence: record.seq,
                epoch: self.epoch,
                payload: record.payload,
                ts_ms: record.ts_ms,
            })));
        }
        self.scan = None;
        None
    }
}

impl Iterator for Backlog {
    type Item = Result<Arc<Message>, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(item) = self.next_from_disk() {
            return Some(item);
        }
        self.tail.next().map(Ok)
    }
}

// ════════════════════════════════════════════════════════════════
//  Helpers
// ════════════════════════════════════════════════════════════════

/// Topics with a log under `root`, sorted. A missing root has none.
pub fn list_topics(root: &Path) -> Result<Vec<String>, StoreError> {
    let dir = match std::fs::read_dir(root) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::io(format!("read_dir {}", root.display()), e)),
    };

    let mut topics = Vec::new();
    for entry in dir {
        let entry = entry.map_err(|e| StoreError::io(format!("read_dir {}", root.display()), e))?;
        let path: PathBuf = entry.path();
        if !path.join(LOG_FILE_NAME).is_file() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            tracing::warn!(path = %path.display(), "skipping topic directory with non UTF-8 name");
            continue;
        };
        if validate_topic_name(name).is_err() {
            tracing::warn!(path = %path.display(), "skipping directory that is not a valid topic name");
            continue;
        }
        topics.push(name.to_string());
    }
    topics.sort();
    Ok(topics)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LONG: Duration = Duration::from_secs(3600);

    fn bodies(backlog: Backlog) -> Vec<(Sequence, String)> {
        backlog
            .map(|m| {
                let m = m.unwrap();
                (m.sequence, String::from_utf8(m.payload.as_bytes().to_vec()).unwrap())
            })
            .collect()
    }

    fn fill(store: &mut TopicStore, n: usize) {
        for i in 1..=n {
            store.append(Payload::from(format!("m{i}"))).unwrap();
        }
    }

    fn expected(range: std::ops::RangeInclusive<u64>) -> Vec<(Sequence, String)> {
        range.map(|s| (s, format!("m{s}"))).collect()
    }

    #[test]
    fn sequences_start_at_one_and_are_contiguous() {
        let root = tempfile::tempdir().unwrap();
        let mut store = TopicStore::open(root.path(), "t", LONG).unwrap();
        assert_eq!(store.last_sequence(), 0);
        assert_eq!(store.append(Payload::from("a")).unwrap(), 1);
        assert_eq!(store.append(Payload::from("b")).unwrap(), 2);
        assert_eq!(store.last_sequence(), 2);
    }

    #[test]
    fn read_from_is_the_same_before_and_after_eviction() {
        let root = tempfile::tempdir().unwrap();
        let mut store = TopicStore::open(root.path(), "t", Duration::from_millis(10)).unwrap();
        fill(&mut store, 5);

        let hot = bodies(store.read_from(0).unwrap());
        assert_eq!(store.evict_expired_at(Instant::now() + Duration::from_secs(1)), 5);
        assert_eq!(store.cached_len(), 0);
        let cold = bodies(store.read_from(0).unwrap());

        assert_eq!(hot, expected(1..=5));
        assert_eq!(cold, hot);
        assert_eq!(bodies(store.read_from(3).unwrap()), expected(4..=5));
    }

    #[test]
    fn read_from_merges_disk_prefix_with_cached_tail() {
        let root = tempfile::tempdir().unwrap();
        let mut store = TopicStore::open(root.path(), "t", Duration::from_millis(50)).unwrap();
        fill(&mut store, 3);
        store.evict_expired_at(Instant::now() + Duration::from_secs(1));
        for i in 4..=6 {
            store.append(Payload::from(format!("m{i}"))).unwrap();
        }
        assert_eq!(store.cached_len(), 3);

        assert_eq!(bodies(store.read_from(0).unwrap()), expected(1..=6));
        assert_eq!(bodies(store.read_from(2).unwrap()), expected(3..=6));
        assert_eq!(bodies(store.read_from(4).unwrap()), expected(5..=6));
        assert!(bodies(store.read_from(6).unwrap()).is_empty());
    }

    #[test]
    fn backlog_is_a_snapshot_of_the_range_at_call_time() {
        let root = tempfile::tempdir().unwrap();
        let mut store = TopicStore::open(root.path(), "t", Duration::ZERO).unwrap();
        fill(&mut store, 2);
        store.evict_expired_at(Instant::now() + Duration::from_secs(1));

        let backlog = store.read_from(0).unwrap();
        store.append(Payload::from("m3")).unwrap();
        assert_eq!(bodies(backlog), expected(1..=2));
    }

    #[test]
    fn reopen_continues_the_sequence_with_a_cold_cache() {
        let root = tempfile::tempdir().unwrap();
        {
            let mut store = TopicStore::open(root.path(), "t", LONG).unwrap();
            fill(&mut store, 3);
            store.flush().unwrap();
        }

        let mut store = TopicStore::open(root.path(), "t", LONG).unwrap();
        assert_eq!(store.last_sequence(), 3);
        assert_eq!(store.cached_len(), 0);
        assert_eq!(store.append(Payload::from("m4")).unwrap(), 4);
        assert_eq!(bodies(store.read_from(0).unwrap()), expected(1..=4));
    }

    #[test]
    fn recover_quarantines_a_corrupt_log() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("t")).unwrap();
        std::fs::write(root.path().join("t").join(LOG_FILE_NAME), "garbage\n").unwrap();

        assert!(matches!(
            TopicStore::open(root.path(), "t", LONG),
            Err(StoreError::Corrupt { .. })
        ));
        let store = TopicStore::recover(root.path(), "t", LONG).unwrap();
        assert_eq!(store.last_sequence(), 0);

        let quarantined = std::fs::read_dir(root.path().join("t"))
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with("log.jsonl.corrupt-"))
            .count();
        assert_eq!(quarantined, 1);
    }

    #[test]
    fn failed_append_leaves_the_log_reopenable() {
        let root = tempfile::tempdir().unwrap();
        let log_path = root.path().join("t").join(LOG_FILE_NAME);
        let mut store = TopicStore::open(root.path(), "t", LONG).unwrap();
        fill(&mut store, 2);

        // Bytes of an append whose sync failed: present on disk, never acknowledged.
        let stray = serde_json::to_string(&LogRecord {
            seq: 3,
            ts_ms: 0,
            payload: Payload::from("never acknowledged"),
        })
        .unwrap();
        let mut f = std::fs::OpenOptions::new().append(true).open(&log_path).unwrap();
        std::io::Write::write_all(&mut f, format!("{stray}\n").as_bytes()).unwrap();
        drop(f);

        assert_eq!(store.append(Payload::from("m3")).unwrap(), 3);
        drop(store);

        let store = TopicStore::open(root.path(), "t", LONG).unwrap();
        assert_eq!(store.last_sequence(), 3);
        assert_eq!(bodies(store.read_from(0).unwrap()), expected(1..=3));
    }

    #[test]
    fn messages_carry_the_epoch_and_a_reset_topic_gets_a_new_one() {
        let root = tempfile::tempdir().unwrap();
        let mut store = TopicStore::open(root.path(), "t", Duration::ZERO).unwrap();
        let before = store.epoch();
        let live = store.append_message(Payload::from("m1")).unwrap();
        assert_eq!(live.epoch, before);
        store.evict_expired_at(Instant::now() + Duration::from_secs(1));
        let replayed = store.read_from(0).unwrap().next().unwrap().unwrap();
        assert_eq!(replayed.epoch, before);
        drop(store);

        assert_eq!(TopicStore::open(root.path(), "t", LONG).unwrap().epoch(), before);

        std::thread::sleep(Duration::from_millis(2));
        std::fs::remove_dir_all(root.path().join("t")).unwrap();
        let store = TopicStore::open(root.path(), "t", LONG).unwrap();
        assert_eq!(store.last_sequence(), 0);
        assert_ne!(store.epoch(), before);
    }

    #[test]
    fn invalid_topic_names_never_touch_the_filesystem() {
        let root = tempfile::tempdir().unwrap();
        assert!(matches!(
            TopicStore::open(root.path(), "..", LONG),
            Err(StoreError::Topic(_))
        ));
    }

    #[test]
    fn list_topics_finds_only_directories_with_logs() {
        let root = tempfile::tempdir().unwrap();
        TopicStore::open(root.path(), "beta", LONG).unwrap();
        TopicStore::open(root.path(), "alpha", LONG).unwrap();
        std::fs::create_dir_all(root.path().join("empty")).unwrap();
        std::fs::write(root.path().join("stray.txt"), "x").unwrap();

        assert_eq!(list_topics(root.path()).unwrap(), vec!["alpha", "beta"]);
        assert!(list_topics(&root.path().join("missing")).unwrap().is_empty());
    }
}
