//! Bounded-concurrency execution queue.
//!
//! Entries wait in a FIFO backlog until admission moves them into the
//! in-flight set, which never grows past `max_parallel`. Lowering the limit
//! lets the existing overflow drain; nothing is preempted.
//!
//! Admission runs after every mutation and holds the backlog lock for the
//! whole check / pop / insert / notify sequence, so concurrent admitters can
//! neither overshoot the limit nor reorder notifications.

mod entry;
mod executor;

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;
use tokio::sync::mpsc;

pub use entry::{EntryId, EntrySnapshot, QueueEntry};
pub use executor::run_admitted;

/// Receives each entry exactly once, at its Queued -> Executing transition.
pub type Admissions<T> = mpsc::UnboundedReceiver<Arc<QueueEntry<T>>>;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("no in-flight job with id {0}")]
    NotFound(EntryId),
    #[error("job id space exhausted")]
    IdSpaceExhausted,
}

pub struct ExecutionQueue<T> {
    next_id: AtomicU64,
    max_parallel: AtomicUsize,
    backlog: Mutex<VecDeque<Arc<QueueEntry<T>>>>,
    in_flight: DashMap<EntryId, Arc<QueueEntry<T>>>,
    admissions: mpsc::UnboundedSender<Arc<QueueEntry<T>>>,
}

impl<T: Send + Sync + 'static> ExecutionQueue<T> {
    pub fn new(max_parallel: usize) -> (Self, Admissions<T>) {
        let (admissions, rx) = mpsc::unbounded_channel();
        let queue = Self {
            next_id: AtomicU64::new(0),
            max_parallel: AtomicUsize::new(max_parallel),
            backlog: Mutex::new(VecDeque::new()),
            in_flight: DashMap::new(),
            admissions,
        };
        (queue, rx)
    }

    /// Append `payload` to the backlog and admit whatever fits.
    pub fn enqueue(&self, payload: T) -> Result<EntryId, QueueError> {
        // Ids are issued under the backlog lock so id order is backlog order.
        let mut backlog = self.lock_backlog();
        let raw = self
            .next_id
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_add(1))
            .map_err(|_| QueueError::IdSpaceExhausted)?;
        let id = EntryId::new(raw);
        backlog.push_back(Arc::new(QueueEntry::new(id, payload)));
        tracing::debug!(id = %id, "Job queued");

        self.admit_locked(&mut backlog);
        Ok(id)
    }

    /// Remove an in-flight entry, mark it complete, and admit the next.
    pub fn mark_complete(&self, id: EntryId) -> Result<Arc<QueueEntry<T>>, QueueError> {
        let (_, entry) = self
            .in_flight
            .remove(&id)
            .ok_or(QueueError::NotFound(id))?;
        entry.set_state(crate::JobStatus::Complete);
        tracing::debug!(id = %id, "Job complete");

        self.admit();
        Ok(entry)
    }

    /// Drop every backlogged entry without starting it.
    pub fn clear_backlog(&self) -> usize {
        let removed = {
            let mut backlog = self.lock_backlog();
            let removed = backlog.len();
            backlog.clear();
            removed
        };
        tracing::info!(removed, "Backlog cleared");
        removed
    }

    pub fn max_parallel(&self) -> usize {
        self.max_parallel.load(Ordering::Acquire)
    }

    pub fn set_max_parallel(&self, max_parallel: usize) {
        self.max_parallel.store(max_parallel, Ordering::Release);
        tracing::info!(max_parallel, "Maximum parallel jobs changed");
        self.admit();
    }

    pub fn get(&self, id: EntryId) -> Option<Arc<QueueEntry<T>>> {
        if let Some(entry) = self.in_flight.get(&id) {
            return Some(Arc::clone(entry.value()));
        }
        self.lock_backlog()
            .iter()
            .find(|entry| entry.id() == id)
            .cloned()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn backlog_len(&self) -> usize {
        self.lock_backlog().len()
    }

    /// In-flight entries by ascending id, then the backlog in FIFO order.
    ///
    /// Each half is read separately, so an entry admitted in between can be
    /// missed or seen twice.
    pub fn entries(&self) -> impl Iterator<Item = Arc<QueueEntry<T>>> {
        let mut in_flight: Vec<_> = self
            .in_flight
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        in_flight.sort_by_key(|entry| entry.id());

        let backlog: Vec<_> = self.lock_backlog().iter().cloned().collect();
        in_flight.into_iter().chain(backlog)
    }

    fn admit(&self) {
        let mut backlog = self.lock_backlog();
        self.admit_locked(&mut backlog);
    }

    fn admit_locked(&self, backlog: &mut VecDeque<Arc<QueueEntry<T>>>) {
        while self.in_flight.len() < self.max_parallel() {
            let Some(entry) = backlog.pop_front() else {
                break;
            };
            entry.set_state(crate::JobStatus::Executing);
            self.in_flight.insert(entry.id(), Arc::clone(&entry));
            tracing::debug!(id = %entry.id(), "Job admitted");
            if self.admissions.send(entry).is_err() {
                tracing::warn!("Admission receiver dropped, job will not start");
            }
        }
    }

    fn lock_backlog(&self) -> MutexGuard<'_, VecDeque<Arc<QueueEntry<T>>>> {
        self.backlog.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    fn with_next_id(self, next: u64) -> Self {
        self.next_id.store(next, Ordering::Release);
        self
    }
}

impl<T: fmt::Display + Send + Sync + 'static> ExecutionQueue<T> {
    pub fn snapshot(&self) -> Vec<EntrySnapshot> {
        self.entries()
            .map(|entry| EntrySnapshot::from(entry.as_ref()))
            .collect()
    }
}
