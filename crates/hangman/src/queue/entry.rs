//! Queue entries: one job plus its lifecycle bookkeeping.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::job::{Job, JobError, JobStatus};

/// Monotonic, never-reused entry identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct EntryId(u64);

impl EntryId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for EntryId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

pub struct QueueEntry<T> {
    id: EntryId,
    payload: T,
    state: AtomicU8,
    enqueued_at: DateTime<Utc>,
    /// Cancelled when the entry's completion watcher should stop watching.
    detach: CancellationToken,
}

impl<T> QueueEntry<T> {
    pub(crate) fn new(id: EntryId, payload: T) -> Self {
        Self {
            id,
            payload,
            state: AtomicU8::new(JobStatus::Queued as u8),
            enqueued_at: Utc::now(),
            detach: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> EntryId {
        self.id
    }

    pub fn payload(&self) -> &T {
        &self.payload
    }

    /// Queue-side state, which may lead the job's own status.
    pub fn state(&self) -> JobStatus {
        JobStatus::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: JobStatus) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn enqueued_at(&self) -> DateTime<Utc> {
        self.enqueued_at
    }

    /// Stop the completion watcher for this entry.
    pub fn detach(&self) {
        self.detach.cancel();
    }

    pub fn is_detached(&self) -> bool {
        self.detach.is_cancelled()
    }

    /// Resolves once [`QueueEntry::detach`] has been called.
    pub async fn detached(&self) {
        self.detach.cancelled().await
    }
}

impl<T: Job> QueueEntry<T> {
    /// Detach the completion watcher, then force-terminate the job.
    ///
    /// The entry is not removed from the queue; callers remove it with
    /// `mark_complete`.
    pub fn kill(&self) -> Result<(), JobError> {
        self.detach();
        self.payload.kill()
    }
}

impl<T: fmt::Display> fmt::Debug for QueueEntry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueEntry")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("job", &self.payload.to_string())
            .finish()
    }
}

/// Serializable view of one entry.
#[derive(Debug, Clone, Serialize)]
pub struct EntrySnapshot {
    pub id: EntryId,
    pub status: JobStatus,
    pub job: String,
    pub enqueued_at: DateTime<Utc>,
}

impl<T: fmt::Display> From<&QueueEntry<T>> for EntrySnapshot {
    fn from(entry: &QueueEntry<T>) -> Self {
        Self {
            id: entry.id,
            status: entry.state(),
            job: entry.payload.to_string(),
            enqueued_at: entry.enqueued_at,
        }
    }
}
