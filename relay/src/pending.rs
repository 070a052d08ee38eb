//! Per-session table of in-flight requests keyed by correlation ID.
//!
//! Every slot is resolved at most once. Response, timeout and forced
//! failure all race for the same table lock; whoever removes the slot
//! first delivers the outcome and everyone after that is a no-op.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use backhaul_shared::protocol::TunneledResponse;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{FailureReason, TrackerError};

/// What a waiter eventually receives
pub type Outcome = Result<TunneledResponse, FailureReason>;

struct Slot {
    tx: oneshot::Sender<Outcome>,
    deadline: Instant,
}

#[derive(Default)]
struct PendingTable {
    slots: HashMap<String, Slot>,
    /// Set once by `fail_all`; later registrations are refused
    closed: Option<FailureReason>,
}

/// Pending request tracker owned by one tunnel session
#[derive(Default)]
pub struct PendingRequests {
    table: Mutex<PendingTable>,
}

impl PendingRequests {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn table(&self) -> MutexGuard<'_, PendingTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a new slot and hand back the handle the caller waits on
    pub fn register(
        self: &Arc<Self>,
        correlation_id: String,
        deadline: Instant,
    ) -> Result<Waiter, TrackerError> {
        let mut table = self.table();
        if let Some(reason) = table.closed {
            return Err(TrackerError::Closed(reason));
        }
        if table.slots.contains_key(&correlation_id) {
            return Err(TrackerError::DuplicateCorrelationId(correlation_id));
        }

        let (tx, rx) = oneshot::channel();
        table
            .slots
            .insert(correlation_id.clone(), Slot { tx, deadline });

        Ok(Waiter {
            correlation_id,
            deadline,
            rx,
            tracker: Arc::clone(self),
            settled: false,
        })
    }

    /// Deliver a response to its waiter. Returns false for unknown or
    /// already-settled IDs, which are dropped.
    pub fn resolve(&self, response: TunneledResponse) -> bool {
        let slot = self.table().slots.remove(&response.request_id);
        match slot {
            Some(slot) => {
                // Receiver may already be gone if the caller was dropped
                let _ = slot.tx.send(Ok(response));
                true
            }
            None => {
                debug!(request_id = %response.request_id, "dropping response for unknown request");
                false
            }
        }
    }

    /// Fail a single slot if it is still outstanding
    pub fn fail(&self, correlation_id: &str, reason: FailureReason) -> bool {
        let slot = self.table().slots.remove(correlation_id);
        match slot {
            Some(slot) => {
                let _ = slot.tx.send(Err(reason));
                true
            }
            None => false,
        }
    }

    /// Timer path: fail the slot with `Timeout` unless it already settled
    pub fn expire(&self, correlation_id: &str) -> bool {
        self.fail(correlation_id, FailureReason::Timeout)
    }

    /// Fail every slot whose deadline is at or before `now`
    pub fn expire_overdue(&self, now: Instant) -> usize {
        let mut table = self.table();
        let overdue: Vec<String> = table
            .slots
            .iter()
            .filter(|(_, slot)| slot.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &overdue {
            if let Some(slot) = table.slots.remove(id) {
                let _ = slot.tx.send(Err(FailureReason::Timeout));
            }
        }
        overdue.len()
    }

    /// Resolve every outstanding slot with `reason` and refuse new ones.
    pub fn fail_all(&self, reason: FailureReason) -> usize {
        let mut table = self.table();
        if table.closed.is_some() {
            warn!(%reason, "fail_all called on an already closed tracker");
        }
        table.closed.get_or_insert(reason);

        let count = table.slots.len();
        for (_, slot) in table.slots.drain() {
            let _ = slot.tx.send(Err(reason));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.table().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn forget(&self, correlation_id: &str) {
        self.table().slots.remove(correlation_id);
    }
}

/// Handle returned by [`PendingRequests::register`].
///
/// Dropping it before it settles removes the slot.
pub struct Waiter {
    correlation_id: String,
    deadline: Instant,
    rx: oneshot::Receiver<Outcome>,
    tracker: Arc<PendingRequests>,
    settled: bool,
}

impl Waiter {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Wait for the outcome, expiring the slot at the deadline.
    pub async fn wait(mut self) -> Outcome {
        let outcome = match tokio::time::timeout_at(self.deadline, &mut self.rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(FailureReason::ConnectionClosed),
            Err(_) => {
                if self.tracker.expire(&self.correlation_id) {
                    Err(FailureReason::Timeout)
                } else {
                    // Lost the race: the winner already sent into the channel
                    (&mut self.rx)
                        .await
                        .unwrap_or(Err(FailureReason::ConnectionClosed))
                }
            }
        };
        self.settled = true;
        outcome
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        if !self.settled {
            self.tracker.forget(&self.correlation_id);
        }
    }
}
