//! Pending request table
//!
//! Correlates outbound request ids with their single-use response slots.
//! Every insert and removal happens under one lock, so registering a waiter
//! and resolving it can never race. Ids come from a lock-free counter and
//! are never reused within a session.

use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::atomic::{AtomicI64, Ordering},
    time::{Duration, Instant},
};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    errors::{MCPError, MCPResult},
    protocol::{JsonRpcResponse, RequestId},
};

/// Receiving half of a pending request slot
pub type ResponseReceiver = oneshot::Receiver<MCPResult<JsonRpcResponse>>;

/// Bookkeeping for one in-flight request
#[derive(Debug)]
struct PendingRequest {
    /// Method name, for diagnostics
    method: String,
    /// Response slot
    sender: oneshot::Sender<MCPResult<JsonRpcResponse>>,
    /// Registration time
    created_at: Instant,
}

#[derive(Debug, Default)]
struct PendingTable {
    waiters: HashMap<RequestId, PendingRequest>,
    closed: bool,
}

/// Pending request table with id generator
#[derive(Debug)]
pub struct PendingRequests {
    next_id: AtomicI64,
    inner: Mutex<PendingTable>,
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingRequests {
    /// Create an empty table; the first allocated id is 1
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
            inner: Mutex::new(PendingTable::default()),
        }
    }

    /// Allocate the next request id
    pub fn next_id(&self) -> RequestId {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Register a waiter for `id`
    pub fn register(&self, id: RequestId, method: &str) -> MCPResult<ResponseReceiver> {
        let mut table = self.inner.lock();
        if table.closed {
            return Err(MCPError::Closed);
        }
        if table.waiters.contains_key(&id) {
            return Err(MCPError::invalid_state(format!(
                "Request id {} is already pending",
                id
            )));
        }

        let (sender, receiver) = oneshot::channel();
        table.waiters.insert(
            id,
            PendingRequest {
                method: method.to_string(),
                sender,
                created_at: Instant::now(),
            },
        );
        Ok(receiver)
    }

    /// Deliver a response to its waiter.
    ///
    /// Returns `false` when no waiter exists for the id (never registered,
    /// already resolved, cancelled or timed out); the response is dropped.
    pub fn resolve(&self, response: JsonRpcResponse) -> bool {
        let Some(id) = response.id else {
            warn!("Dropping response without id: {:?}", response.error);
            return false;
        };

        let entry = self.inner.lock().waiters.remove(&id);
        match entry {
            Some(pending) => {
                debug!(
                    "Resolved request {} ({}) after {:?}",
                    id,
                    pending.method,
                    pending.created_at.elapsed()
                );
                // The waiter may have gone away between removal and send
                pending.sender.send(Ok(response)).is_ok()
            }
            None => {
                debug!("Dropping response for unknown or completed request {}", id);
                false
            }
        }
    }

    /// Fail a single waiter with `error`
    pub fn fail(&self, id: RequestId, error: MCPError) -> bool {
        let entry = self.inner.lock().waiters.remove(&id);
        match entry {
            Some(pending) => pending.sender.send(Err(error)).is_ok(),
            None => false,
        }
    }

    /// Remove a waiter without resolving it
    pub fn remove(&self, id: RequestId) -> bool {
        self.inner.lock().waiters.remove(&id).is_some()
    }

    /// Fail every waiter with `error`, leaving the table usable
    pub fn fail_all(&self, error: MCPError) -> usize {
        let drained: Vec<_> = self.inner.lock().waiters.drain().collect();
        let count = drained.len();
        for (_, pending) in drained {
            let _ = pending.sender.send(Err(error.clone()));
        }
        count
    }

    /// Close the table: release every waiter with a closed error and refuse
    /// new registrations
    pub fn close(&self) -> usize {
        let drained: Vec<_> = {
            let mut table = self.inner.lock();
            table.closed = true;
            table.waiters.drain().collect()
        };
        let count = drained.len();
        for (_, pending) in drained {
            let _ = pending.sender.send(Err(MCPError::Closed));
        }
        if count > 0 {
            debug!("Released {} pending request(s) on close", count);
        }
        count
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.inner.lock().waiters.contains_key(&id)
    }

    /// Wait for the response to `id`, the cancellation signal or the timeout,
    /// whichever comes first. On cancellation or timeout the waiter is removed
    /// so a late response is dropped.
    pub async fn wait(
        &self,
        id: RequestId,
        receiver: ResponseReceiver,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> MCPResult<JsonRpcResponse> {
        let deadline = tokio::time::Instant::now() + timeout;
        self.wait_until(id, receiver, cancel, deadline, timeout).await
    }

    /// Like [`wait`](Self::wait), against a deadline fixed earlier in the
    /// request. `timeout` is the full budget, reported when the deadline
    /// passes.
    pub async fn wait_until(
        &self,
        id: RequestId,
        receiver: ResponseReceiver,
        cancel: &CancellationToken,
        deadline: tokio::time::Instant,
        timeout: Duration,
    ) -> MCPResult<JsonRpcResponse> {
        tokio::select! {
            biased;
            result = receiver => match result {
                Ok(response) => response,
                Err(_) => Err(MCPError::Closed),
            },
            _ = cancel.cancelled() => {
                self.remove(id);
                debug!("Request {} cancelled", id);
                Err(MCPError::Cancelled)
            }
            _ = tokio::time::sleep_until(deadline) => {
                self.remove(id);
                warn!("Request {} timed out after {:?}", id, timeout);
                Err(MCPError::timeout(timeout.as_millis() as u64))
            }
        }
    }
}
