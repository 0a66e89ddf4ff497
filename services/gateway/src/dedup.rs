//! In-memory duplicate suppression.
//!
//! Two layers: a FIFO-bounded set of recently handled event ids (the same
//! event arriving from several relays), and a TTL'd fingerprint map over
//! `(author, plaintext)` pairs (the same text retransmitted as a fresh
//! event).  Both sit behind one mutex each and are bounded.

use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

pub const DEFAULT_PROCESSED_CAP: usize = 1000;
pub const DEFAULT_FINGERPRINT_TTL: Duration = Duration::from_secs(300);
const FINGERPRINT_CAP: usize = 4096;

// ---------------------------------------------------------------------------
// Processed event ids
// ---------------------------------------------------------------------------

struct IdSet {
    order: VecDeque<String>,
    seen: HashSet<String>,
}

/// FIFO-bounded set of event ids.  The oldest id is evicted once the
/// capacity is exceeded.
pub struct ProcessedEvents {
    cap: usize,
    inner: Mutex<IdSet>,
}

impl ProcessedEvents {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            inner: Mutex::new(IdSet {
                order: VecDeque::new(),
                seen: HashSet::new(),
            }),
        }
    }

    /// Insert `id`; returns `false` when it was already present.
    pub fn insert(&self, id: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if !inner.seen.insert(id.to_owned()) {
            return false;
        }
        inner.order.push_back(id.to_owned());
        while inner.order.len() > self.cap {
            if let Some(evicted) = inner.order.pop_front() {
                inner.seen.remove(&evicted);
            }
        }
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock().unwrap().seen.contains(id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ProcessedEvents {
    fn default() -> Self {
        Self::new(DEFAULT_PROCESSED_CAP)
    }
}

// ---------------------------------------------------------------------------
// Content fingerprints
// ---------------------------------------------------------------------------

struct FpInner {
    order: VecDeque<String>,
    entries: HashMap<String, Instant>,
}

/// TTL'd, FIFO-bounded map of `(author, plaintext)` fingerprints.
pub struct FingerprintCache {
    ttl: Duration,
    cap: usize,
    inner: Mutex<FpInner>,
}

fn fingerprint(author: &str, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(author.as_bytes());
    hasher.update([0u8]);
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

impl FingerprintCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            cap: FINGERPRINT_CAP,
            inner: Mutex::new(FpInner {
                order: VecDeque::new(),
                entries: HashMap::new(),
            }),
        }
    }

    /// Record `(author, text)`; returns `true` when the pair has not been
    /// seen within the TTL (i.e. the message is fresh and should process).
    pub fn check_and_insert(&self, author: &str, text: &str) -> bool {
        let key = fingerprint(author, text);
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();

        if let Some(inserted_at) = inner.entries.get(&key)
            && now.saturating_duration_since(*inserted_at) < self.ttl
        {
            return false;
        }

        inner.entries.insert(key.clone(), now);
        inner.order.push_back(key);
        while inner.order.len() > self.cap {
            if let Some(evicted) = inner.order.pop_front() {
                inner.entries.remove(&evicted);
            }
        }
        true
    }

    /// Drop expired entries.  Returns how many were removed.
    pub fn prune(&self) -> usize {
        let now = Instant::now();
        let ttl = self.ttl;
        let mut inner = self.inner.lock().unwrap();
        let before = inner.entries.len();
        inner
            .entries
            .retain(|_, at| now.saturating_duration_since(*at) < ttl);
        let entries = std::mem::take(&mut inner.entries);
        inner.order.retain(|k| entries.contains_key(k));
        inner.entries = entries;
        before - inner.entries.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for FingerprintCache {
    fn default() -> Self {
        Self::new(DEFAULT_FINGERPRINT_TTL)
    }
}
