use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use herald_api::{Message, Sequence};

// ════════════════════════════════════════════════════════════════
//  RecencyCache
// ════════════════════════════════════════════════════════════════

/// Most recent messages of a topic, oldest first.
///
/// Entries always form a contiguous run of sequences ending at the newest
/// appended message: new entries go on the back, eviction only pops the front.
pub(crate) struct RecencyCache {
    entries: VecDeque<(Arc<Message>, Instant)>,
    ttl: Duration,
}

impl RecencyCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: VecDeque::new(),
            ttl,
        }
    }

    pub fn push(&mut self, message: Arc<Message>, now: Instant) {
        debug_assert!(
            self.entries
                .back()
                .is_none_or(|(last, _)| last.sequence + 1 == message.sequence)
        );
        self.entries.push_back((message, now));
    }

    /// Drop entries inserted more than `ttl` before `now`. Returns how many.
    pub fn evict_expired(&mut self, now: Instant) -> usize {
        let mut evicted = 0;
        while let Some((_, inserted)) = self.entries.front() {
            if now.saturating_duration_since(*inserted) <= self.ttl {
                break;
            }
            self.entries.pop_front();
            evicted += 1;
        }
        evicted
    }

    /// Sequence of the oldest cached message.
    pub fn first_sequence(&self) -> Option<Sequence> {
        self.entries.front().map(|(m, _)| m.sequence)
    }

    /// Cached messages with sequence greater than `after`.
    pub fn tail_after(&self, after: Sequence) -> Vec<Arc<Message>> {
        let Some(first) = self.first_sequence() else {
            return Vec::new();
        };
        let skip = after.saturating_add(1).saturating_sub(first) as usize;
        self.entries
            .iter()
            .skip(skip)
            .map(|(m, _)| m.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
