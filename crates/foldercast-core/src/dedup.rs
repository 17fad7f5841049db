//! Duplicate suppression for observed messages.
//!
//! Two sightings of the same `(chat, message)` pair inside one time bucket
//! are considered duplicates. Buckets are window-aligned: when the clock
//! crosses a bucket boundary the whole previous set is discarded at once, so
//! eviction is O(1) and memory is bounded by one window's traffic.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::domain::{ChatId, MessageId};

pub struct DedupCache {
    window: Duration,
    created: Instant,
    state: Mutex<DedupState>,
}

struct DedupState {
    bucket: u64,
    seen: HashSet<(i64, i32)>,
}

impl DedupCache {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            created: Instant::now(),
            state: Mutex::new(DedupState {
                bucket: 0,
                seen: HashSet::new(),
            }),
        }
    }

    /// Records the sighting and reports whether it was already seen within
    /// the current bucket.
    pub async fn is_duplicate(&self, chat: ChatId, message: MessageId) -> bool {
        self.is_duplicate_at(chat, message, Instant::now()).await
    }

    async fn is_duplicate_at(&self, chat: ChatId, message: MessageId, now: Instant) -> bool {
        let bucket = (now.saturating_duration_since(self.created).as_millis()
            / self.window.as_millis().max(1)) as u64;

        let mut state = self.state.lock().await;
        if bucket != state.bucket {
            state.bucket = bucket;
            state.seen.clear();
        }
        !state.seen.insert((chat.0, message.0))
    }
}
