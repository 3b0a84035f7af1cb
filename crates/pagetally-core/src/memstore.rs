//! In-process ingestion buffer.
//!
//! Request handlers [`Memstore::append`] validated hits; the flush task swaps
//! the whole batch out with [`Memstore::persist`] and writes it to storage
//! without holding the lock. Failed writes go back in through
//! [`Memstore::requeue`].

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::clock::Clock;
use crate::error::HitError;
use crate::hit::Hit;
use crate::session::{SaltSchedule, SessionSource, SessionTable};

/// Deduplication key: identical submissions within the same second collapse.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BatchKey {
    website_id: String,
    path: String,
    event: bool,
    session: Option<i64>,
    second: i64,
}

impl BatchKey {
    fn of(hit: &Hit) -> Self {
        Self {
            website_id: hit.website_id.clone(),
            path: hit.path.clone(),
            event: hit.event,
            session: hit.session,
            second: hit.created_at.timestamp(),
        }
    }
}

/// A buffered hit plus the number of submissions merged into it.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferedHit {
    pub hit: Hit,
    pub count: u32,
}

#[derive(Debug, Default)]
struct Batch {
    entries: Vec<BufferedHit>,
    index: HashMap<BatchKey, usize>,
}

impl Batch {
    /// Insert or merge. Returns `true` when a new entry was created.
    fn insert(&mut self, hit: Hit, count: u32) -> bool {
        let key = BatchKey::of(&hit);
        if let Some(&pos) = self.index.get(&key) {
            if let Some(existing) = self.entries.get_mut(pos) {
                existing.count = existing.count.saturating_add(count);
                return false;
            }
        }
        self.index.insert(key, self.entries.len());
        self.entries.push(BufferedHit { hit, count });
        true
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

struct MemstoreState {
    batch: Batch,
    sessions: SessionTable,
}

/// Result of a successful [`Memstore::append`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Appended {
    /// The hit matched an entry already in the batch and was merged into it.
    pub merged: bool,
    /// Entries in the batch after this append.
    pub buffered: usize,
}

/// Shared ingestion buffer. Construct once per process and share behind an `Arc`.
pub struct Memstore {
    state: Mutex<MemstoreState>,
    clock: Arc<dyn Clock>,
}

impl Memstore {
    pub fn new(clock: Arc<dyn Clock>, schedule: SaltSchedule) -> Self {
        Self {
            state: Mutex::new(MemstoreState {
                batch: Batch::default(),
                sessions: SessionTable::new(schedule),
            }),
            clock,
        }
    }

    /// Keep new session numbers above those already stored.
    pub async fn reserve_sessions_after(&self, max_stored: i64) {
        self.state.lock().await.sessions.reserve_after(max_stored);
    }

    /// Validate `hit`, resolve its session, and buffer it.
    ///
    /// Only touches memory; never waits on storage.
    pub async fn append(&self, mut hit: Hit, source: SessionSource) -> Result<Appended, HitError> {
        let now = self.clock.now();
        hit.validate(now)?;

        let mut state = self.state.lock().await;
        let resolved = state.sessions.resolve(&hit.website_id, &source, now);
        hit.session = Some(resolved.session);
        hit.first_visit = resolved.first_visit;

        let merged = !state.batch.insert(hit, 1);
        Ok(Appended {
            merged,
            buffered: state.batch.len(),
        })
    }

    /// Swap the live batch for an empty one and hand back what was buffered,
    /// in append order.
    pub async fn persist(&self) -> Vec<BufferedHit> {
        let mut state = self.state.lock().await;
        std::mem::take(&mut state.batch).entries
    }

    /// Put rows back after a failed write. They go in front of anything
    /// appended since the swap, merging with duplicates.
    pub async fn requeue(&self, rows: Vec<BufferedHit>) {
        let mut state = self.state.lock().await;
        let newer = std::mem::take(&mut state.batch);
        let mut batch = Batch::default();
        for row in rows.into_iter().chain(newer.entries) {
            batch.insert(row.hit, row.count);
        }
        state.batch = batch;
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.batch.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
