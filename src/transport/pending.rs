//! Pending-request correlation table.
//!
//! Shared between the verb-calling tasks (insert on send, remove on timeout)
//! and the read task (remove on response, drain on disconnect). The lock is
//! never held across an `.await`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

use crate::protocol::{RequestId, Response};
use crate::{AppError, Result};

/// How many timed-out ids are remembered so their late responses can be
/// recognised and dropped quietly.
const EXPIRED_CAPACITY: usize = 256;

/// Waiter half returned by [`PendingRequests::register`].
pub type ResponseWaiter = oneshot::Receiver<Result<Response>>;

/// What happened to an inbound response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Handed to the waiting caller.
    Delivered,
    /// The caller had already timed out; the response was discarded.
    Late,
    /// No request with this id was ever outstanding.
    Unknown,
}

#[derive(Debug, Default)]
struct Table {
    waiting: HashMap<RequestId, oneshot::Sender<Result<Response>>>,
    expired: VecDeque<RequestId>,
    expired_set: HashSet<RequestId>,
    closed: Option<String>,
}

/// Mutex-guarded map from request id to the caller awaiting its response.
#[derive(Debug, Default)]
pub struct PendingRequests {
    table: Mutex<Table>,
}

impl PendingRequests {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `id` and return the receiver its response will arrive on.
    ///
    /// # Errors
    ///
    /// - [`AppError::DaemonDisconnected`] once the table has been closed.
    /// - [`AppError::MalformedRequest`] if `id` is already outstanding.
    pub fn register(&self, id: RequestId) -> Result<ResponseWaiter> {
        let mut table = self.lock();
        if let Some(reason) = &table.closed {
            return Err(AppError::DaemonDisconnected(reason.clone()));
        }
        if table.waiting.contains_key(&id) {
            return Err(AppError::MalformedRequest(format!(
                "request id {id} is already outstanding"
            )));
        }
        let (tx, rx) = oneshot::channel();
        table.waiting.insert(id, tx);
        Ok(rx)
    }

    /// Route a response to its waiter.
    pub fn resolve(&self, response: Response) -> Resolution {
        let mut table = self.lock();
        if let Some(tx) = table.waiting.remove(&response.id) {
            // The caller may have been dropped mid-await; nothing to do then.
            let _ = tx.send(Ok(response));
            return Resolution::Delivered;
        }
        if table.expired_set.remove(&response.id) {
            table.expired.retain(|id| id != &response.id);
            return Resolution::Late;
        }
        Resolution::Unknown
    }

    /// Drop the waiter for a timed-out request and remember its id.
    pub fn expire(&self, id: &RequestId) {
        let mut table = self.lock();
        if table.waiting.remove(id).is_none() {
            return;
        }
        table.expired.push_back(id.clone());
        table.expired_set.insert(id.clone());
        while table.expired.len() > EXPIRED_CAPACITY {
            if let Some(oldest) = table.expired.pop_front() {
                table.expired_set.remove(&oldest);
            }
        }
    }

    /// Drop the waiter for a request that never reached the wire.
    pub fn forget(&self, id: &RequestId) {
        self.lock().waiting.remove(id);
    }

    /// Close the table and fail every outstanding waiter.
    ///
    /// Only the first close reason is kept. Returns the number of waiters
    /// that were failed.
    pub fn fail_all(&self, reason: &str) -> usize {
        let mut table = self.lock();
        if table.closed.is_none() {
            table.closed = Some(reason.to_owned());
        }
        let reason = table.closed.clone().unwrap_or_default();
        let drained: Vec<_> = table.waiting.drain().collect();
        drop(table);

        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(AppError::DaemonDisconnected(reason.clone())));
        }
        count
    }

    /// Whether [`fail_all`](Self::fail_all) has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed.is_some()
    }

    /// Reason the table was closed, if it was.
    #[must_use]
    pub fn close_reason(&self) -> Option<String> {
        self.lock().closed.clone()
    }

    /// Number of requests still awaiting a response.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().waiting.len()
    }

    /// Whether no request is awaiting a response.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
