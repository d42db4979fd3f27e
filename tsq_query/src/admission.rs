//! Admission control: bounds the number of queries executing at once and keeps identical
//! queries from running concurrently.

use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tsq_types::QueryFingerprint;

#[derive(Debug, Clone, Copy, thiserror::Error)]
pub enum AdmissionError {
    #[error("cancelled while waiting for admission")]
    Cancelled,
}

/// An admitted query.
#[derive(Debug, Clone)]
pub struct RunningQuery<D> {
    pub descriptor: D,
    pub started: Instant,
    cancel: CancellationToken,
}

#[derive(Debug)]
struct QueueState<D> {
    available: usize,
    next_ticket: u64,
    /// Tickets of waiting callers in arrival order. Permits go to the front ticket only.
    waiting: VecDeque<u64>,
    /// Callers sitting out the collision backoff. They rejoin `waiting` at the back.
    backing_off: usize,
    running: HashMap<QueryFingerprint, RunningQuery<D>>,
}

/// A fair permit pool combined with a table of in-flight query fingerprints.
///
/// Permits and the table are guarded by one mutex so a permit is never handed to a query that
/// turns out to duplicate one already running.
#[derive(Debug)]
pub struct QueryQueue<D> {
    max_concurrent_queries: usize,
    collision_backoff: Duration,
    state: Mutex<QueueState<D>>,
    changed: Condvar,
    collisions: AtomicU64,
    retries: AtomicU64,
}

impl<D> QueryQueue<D> {
    pub fn new(max_concurrent_queries: usize, collision_backoff: Duration) -> Self {
        Self {
            max_concurrent_queries,
            collision_backoff,
            state: Mutex::new(QueueState {
                available: max_concurrent_queries,
                next_ticket: 0,
                waiting: VecDeque::new(),
                backing_off: 0,
                running: HashMap::new(),
            }),
            changed: Condvar::new(),
            collisions: AtomicU64::new(0),
            retries: AtomicU64::new(0),
        }
    }

    /// Block until a permit is free and no query with the same fingerprint is running, then
    /// register `fingerprint` as running.
    ///
    /// A caller whose fingerprint collides with a running query leaves the line, sleeps for the
    /// full collision backoff and then rejoins at the back. Cancelling
    /// `cancel` while waiting fails with [`AdmissionError::Cancelled`]; the token is also
    /// cancelled by [`cancel`](Self::cancel) once the query is running.
    pub fn acquire(
        &self,
        fingerprint: &QueryFingerprint,
        descriptor: D,
        cancel: &CancellationToken,
    ) -> Result<(), AdmissionError> {
        let mut state = self.state.lock();
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.waiting.push_back(ticket);

        let mut collided = false;
        loop {
            if cancel.is_cancelled() {
                state.waiting.retain(|t| *t != ticket);
                self.changed.notify_all();
                debug!(%fingerprint, "cancelled while waiting for admission");
                return Err(AdmissionError::Cancelled);
            }

            if state.waiting.front() == Some(&ticket) && state.available > 0 {
                if !state.running.contains_key(fingerprint) {
                    state.waiting.pop_front();
                    state.available -= 1;
                    state.running.insert(
                        fingerprint.clone(),
                        RunningQuery {
                            descriptor,
                            started: Instant::now(),
                            cancel: cancel.clone(),
                        },
                    );
                    // the next waiter may be admissible too
                    self.changed.notify_all();
                    debug!(%fingerprint, available = state.available, "query admitted");
                    return Ok(());
                }

                if !collided {
                    collided = true;
                    self.collisions.fetch_add(1, Ordering::Relaxed);
                    debug!(%fingerprint, "identical query in flight, waiting");
                }
                self.retries.fetch_add(1, Ordering::Relaxed);

                state.waiting.pop_front();
                state.backing_off += 1;
                // the next waiter may take the permit this one passed on
                self.changed.notify_all();

                let deadline = Instant::now() + self.collision_backoff;
                while Instant::now() < deadline && !cancel.is_cancelled() {
                    self.changed.wait_until(&mut state, deadline);
                }
                state.backing_off -= 1;
                state.waiting.push_back(ticket);
                continue;
            }

            self.changed.wait_for(&mut state, self.collision_backoff);
        }
    }

    /// Unregister `fingerprint` and return its permit. Releasing a fingerprint that is not
    /// running does nothing.
    pub fn release(&self, fingerprint: &QueryFingerprint) -> bool {
        let mut state = self.state.lock();
        match state.running.remove(fingerprint) {
            Some(query) => {
                state.available += 1;
                self.changed.notify_all();
                debug!(
                    %fingerprint,
                    elapsed = ?query.started.elapsed(),
                    available = state.available,
                    "query released"
                );
                true
            }
            None => {
                warn!(%fingerprint, "released a query that was not running");
                false
            }
        }
    }

    /// Signal cancellation to the running query with `fingerprint`.
    pub fn cancel(&self, fingerprint: &QueryFingerprint) -> bool {
        let state = self.state.lock();
        match state.running.get(fingerprint) {
            Some(query) => {
                info!(%fingerprint, "cancelling query");
                query.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn max_concurrent_queries(&self) -> usize {
        self.max_concurrent_queries
    }

    /// Callers blocked in [`acquire`](Self::acquire), including those backing off.
    pub fn waiting_count(&self) -> usize {
        let state = self.state.lock();
        state.waiting.len() + state.backing_off
    }

    pub fn available_permits(&self) -> usize {
        self.state.lock().available
    }

    /// Number of acquires that had to wait on an identical running query.
    pub fn collision_count(&self) -> u64 {
        self.collisions.load(Ordering::Relaxed)
    }

    /// Number of admission attempts that found an identical query running.
    pub fn retry_count(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    pub fn is_running(&self, fingerprint: &QueryFingerprint) -> bool {
        self.state.lock().running.contains_key(fingerprint)
    }
}

impl<D: Clone> QueryQueue<D> {
    pub fn running_queries(&self) -> Vec<(QueryFingerprint, RunningQuery<D>)> {
        self.state
            .lock()
            .running
            .iter()
            .map(|(fingerprint, query)| (fingerprint.clone(), query.clone()))
            .collect()
    }
}
