//! In-memory queue core.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::schedule::RetrySchedule;
use super::{RequestHandler, RequestRecord, RequestState, RetryPolicy};
use crate::config::QueueConfig;
use crate::domain::{Request, Ticket};
use crate::error::QueueError;
use crate::observability::QueueCounts;
use crate::worker::{self, RunHandle};

/// What happened to a request whose handler returned `false`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailOutcome {
    Scheduled { attempts: u32 },
    Cancelled,
    Unknown,
}

/// What `remove` did to the matching records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Removal {
    /// Pending or awaiting-retry records dropped on the spot.
    pub dropped: usize,
    /// In-flight records marked so they never come back.
    pub marked: usize,
}

impl Removal {
    pub fn total(self) -> usize {
        self.dropped + self.marked
    }
}

/// Everything guarded by the core lock.
///
/// Records, the pending FIFO and the retry schedule change together, so a
/// cancellation and the retry timer can never disagree about a request.
#[derive(Debug, Default)]
pub(crate) struct CoreState {
    records: HashMap<Ticket, RequestRecord>,
    pending: VecDeque<Ticket>,
    retries: RetrySchedule,
    next_ticket: u64,
}

impl CoreState {
    fn allocate_ticket(&mut self) -> Ticket {
        self.next_ticket += 1;
        Ticket::new(self.next_ticket)
    }

    pub fn push_pending(&mut self, request: Request) -> Ticket {
        let ticket = self.allocate_ticket();
        self.records.insert(ticket, RequestRecord::new(request));
        self.pending.push_back(ticket);
        ticket
    }

    /// Pop the head of the pending list and mark it in flight.
    pub fn dispatch_next(&mut self) -> Option<(Ticket, Request)> {
        while let Some(ticket) = self.pending.pop_front() {
            if let Some(record) = self.records.get_mut(&ticket)
                && record.state.is_runnable()
            {
                record.start_attempt();
                return Some((ticket, record.request.clone()));
            }
        }
        None
    }

    /// Called by a worker before running the handler.
    /// Returns `false` (and forgets the record) if it was removed meanwhile.
    pub fn begin_attempt(&mut self, ticket: Ticket) -> bool {
        match self.records.get(&ticket).map(|record| record.state) {
            Some(RequestState::InFlight) => true,
            Some(RequestState::CancelRequested) => {
                self.records.remove(&ticket);
                false
            }
            _ => false,
        }
    }

    pub fn complete(&mut self, ticket: Ticket) -> Option<RequestRecord> {
        self.records.remove(&ticket)
    }

    /// Check-and-clear the cancel mark and decide on a retry in one step.
    pub fn fail(&mut self, ticket: Ticket, policy: &RetryPolicy, now: Instant) -> FailOutcome {
        let Some(record) = self.records.get_mut(&ticket) else {
            return FailOutcome::Unknown;
        };

        if record.state == RequestState::CancelRequested {
            self.records.remove(&ticket);
            return FailOutcome::Cancelled;
        }

        let due = policy.next_run_at(now);
        record.schedule_retry();
        let attempts = record.attempts;
        self.retries.push(due, ticket);
        FailOutcome::Scheduled { attempts }
    }

    /// Move every due retry back to the pending tail.
    /// Stale entries (removed requests) are skipped.
    pub fn promote_due(&mut self, now: Instant) -> usize {
        let mut promoted = 0;
        while let Some(ticket) = self.retries.pop_due(now) {
            if let Some(record) = self.records.get_mut(&ticket)
                && record.state == RequestState::AwaitingRetry
            {
                record.requeue();
                self.pending.push_back(ticket);
                promoted += 1;
            }
        }
        promoted
    }

    pub fn next_retry_due(&self) -> Option<Instant> {
        self.retries.next_due()
    }

    /// Cancel every request carrying `id`.
    pub fn cancel(&mut self, id: &str) -> Removal {
        let mut removal = Removal::default();
        let matching: Vec<Ticket> = self
            .records
            .iter()
            .filter(|(_, record)| record.request.id == id)
            .map(|(ticket, _)| *ticket)
            .collect();

        for ticket in matching {
            let Some(record) = self.records.get_mut(&ticket) else {
                continue;
            };
            match record.state {
                state if state.is_detached() => {
                    self.records.remove(&ticket);
                    removal.dropped += 1;
                }
                RequestState::InFlight => {
                    record.request_cancel();
                    removal.marked += 1;
                }
                _ => {}
            }
        }

        // pending には ticket だけ残るので掃除する
        if removal.dropped > 0 {
            let records = &self.records;
            self.pending.retain(|ticket| records.contains_key(ticket));
        }
        removal
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn counts(&self) -> QueueCounts {
        let mut counts = QueueCounts::default();
        for record in self.records.values() {
            match record.state {
                RequestState::Pending => counts.pending += 1,
                RequestState::InFlight => counts.in_flight += 1,
                RequestState::CancelRequested => counts.cancel_requested += 1,
                RequestState::AwaitingRetry => counts.awaiting_retry += 1,
            }
        }
        counts
    }
}

/// Bounded-concurrency retry queue with no durability of its own.
///
/// `enqueue` only appends; callers pair it with `wake` to rouse an idle
/// dispatcher. `run` spawns the dispatcher, the retry scheduler and the
/// worker pool.
pub struct QueueCore {
    config: QueueConfig,
    policy: RetryPolicy,
    state: Mutex<CoreState>,
    /// Dispatcher wakeups. `notify_one` keeps at most one permit, so
    /// repeated wakes while nobody waits collapse into one.
    wake: Notify,
    /// Scheduler wakeups for newly scheduled retries.
    retry_notify: Notify,
    running: AtomicBool,
}

impl QueueCore {
    pub fn new(config: QueueConfig) -> Result<Self, QueueError> {
        config.validate()?;
        Ok(Self {
            policy: config.retry_policy(),
            config,
            state: Mutex::new(CoreState::default()),
            wake: Notify::new(),
            retry_notify: Notify::new(),
            running: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Append a request to the pending tail. Does not wake the dispatcher.
    pub async fn enqueue(&self, id: impl Into<String>, payload: impl Into<String>) {
        self.enqueue_request(Request::new(id, payload)).await;
    }

    pub async fn enqueue_request(&self, request: Request) {
        let id = request.id.clone();
        let ticket = self.state.lock().await.push_pending(request);
        debug!(queue = %self.config.name, %id, %ticket, "request enqueued");
    }

    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Cancel every request with this ID.
    ///
    /// Pending and awaiting-retry requests are dropped immediately; a
    /// request held by a worker is marked and discarded when that attempt
    /// ends. Returns how many requests were affected; zero is not an error.
    pub async fn remove(&self, id: &str) -> usize {
        let removal = self.state.lock().await.cancel(id);
        if removal.total() == 0 {
            warn!(queue = %self.config.name, %id, "did not find request to remove");
        } else {
            info!(
                queue = %self.config.name,
                %id,
                dropped = removal.dropped,
                marked = removal.marked,
                "request removed"
            );
        }
        removal.total()
    }

    /// Start the dispatcher, the retry scheduler and `concurrency` workers.
    ///
    /// A core runs at most once; a second call fails with
    /// [`QueueError::AlreadyRunning`].
    pub fn run(self: &Arc<Self>, handler: Arc<dyn RequestHandler>) -> Result<RunHandle, QueueError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(QueueError::AlreadyRunning);
        }
        info!(
            queue = %self.config.name,
            workers = self.config.concurrency,
            retry_period_ms = self.config.retry_period.as_millis() as u64,
            "starting queue"
        );
        Ok(worker::spawn(Arc::clone(self), handler))
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn pending_len(&self) -> usize {
        self.state.lock().await.pending_len()
    }

    pub async fn counts(&self) -> QueueCounts {
        self.state.lock().await.counts()
    }

    pub(crate) async fn dispatch_next(&self) -> Option<(Ticket, Request)> {
        self.state.lock().await.dispatch_next()
    }

    pub(crate) async fn wait_for_wake(&self) {
        self.wake.notified().await;
    }

    pub(crate) async fn wait_for_retry_change(&self) {
        self.retry_notify.notified().await;
    }

    pub(crate) async fn begin_attempt(&self, ticket: Ticket) -> bool {
        self.state.lock().await.begin_attempt(ticket)
    }

    pub(crate) async fn complete(&self, ticket: Ticket) {
        let record = self.state.lock().await.complete(ticket);
        if let Some(record) = record {
            debug!(
                queue = %self.config.name,
                id = %record.request.id,
                %ticket,
                attempts = record.attempts,
                "request done"
            );
        }
    }

    pub(crate) async fn fail(&self, ticket: Ticket) {
        let outcome = self
            .state
            .lock()
            .await
            .fail(ticket, &self.policy, Instant::now());

        match outcome {
            FailOutcome::Scheduled { attempts } => {
                debug!(
                    queue = %self.config.name,
                    %ticket,
                    attempts,
                    "attempt failed, retry scheduled"
                );
                // ロックの外で通知
                self.retry_notify.notify_one();
            }
            FailOutcome::Cancelled => {
                info!(queue = %self.config.name, %ticket, "attempt failed on a removed request, discarding");
            }
            FailOutcome::Unknown => {
                warn!(queue = %self.config.name, %ticket, "failed request is no longer tracked");
            }
        }
    }

    /// Promote due retries and report the next deadline.
    pub(crate) async fn promote_due_retries(&self) -> Option<Instant> {
        let (promoted, next_due) = {
            let mut state = self.state.lock().await;
            let promoted = state.promote_due(Instant::now());
            (promoted, state.next_retry_due())
        };
        if promoted > 0 {
            debug!(queue = %self.config.name, promoted, "retries back in pending list");
            self.wake();
        }
        next_due
    }
}
