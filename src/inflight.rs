//! Inflight request tracking and resolve-once completion handles
//!
//! Every asynchronous block I/O operation registers its completion handle
//! here so that a periodic timeout sweep can fail it and a shutdown drain
//! can wait for it. Timeout and normal completion race to resolve the same
//! [`Promise`]; whichever removes the tracker entry first wins, the loser's
//! `try_set` is a no-op.

use crate::error::AgentError;
use crate::models::IoResponse;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// Identifier of a registered inflight request
///
/// Allocated from a 64-bit atomic counter; never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

/// Resolve-once completion handle
///
/// Cloneable; the first successful [`try_set`](Promise::try_set) delivers
/// the value to the paired [`ResponseFuture`], every later attempt is a
/// no-op. This replaces explicit cancellation: timeout sweep and real
/// completion may both resolve, exactly one delivery happens.
#[derive(Debug, Clone)]
pub struct Promise<R> {
    tx: Arc<Mutex<Option<oneshot::Sender<R>>>>,
}

impl<R: Send + 'static> Promise<R> {
    /// Create a promise together with the future its caller will await
    pub fn new() -> (Promise<R>, ResponseFuture<R>) {
        let (tx, rx) = oneshot::channel();
        (
            Promise {
                tx: Arc::new(Mutex::new(Some(tx))),
            },
            ResponseFuture { rx },
        )
    }

    fn lock(&self) -> MutexGuard<'_, Option<oneshot::Sender<R>>> {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolve the paired future if it has not been resolved yet
    ///
    /// Returns true when this call delivered the value.
    pub fn try_set(&self, value: R) -> bool {
        let sender = self.lock().take();
        match sender {
            Some(tx) => tx.send(value).is_ok(),
            None => false,
        }
    }

    /// Whether some resolver already consumed this promise
    pub fn is_resolved(&self) -> bool {
        self.lock().is_none()
    }
}

/// Future side of a [`Promise`]
///
/// Resolves to the response value. If every promise clone is dropped
/// without resolution (shutdown abandonment) the future yields an `Io`
/// error response instead of hanging forever.
#[derive(Debug)]
pub struct ResponseFuture<R> {
    rx: oneshot::Receiver<R>,
}

impl<R: IoResponse> ResponseFuture<R> {
    /// An already-resolved future, for synchronous validation failures
    pub fn ready(value: R) -> Self {
        let (tx, rx) = oneshot::channel();
        // receiver is held right here, the send cannot fail
        let _ = tx.send(value);
        ResponseFuture { rx }
    }
}

impl<R: IoResponse> Future for ResponseFuture<R> {
    type Output = R;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|result| match result {
            Ok(response) => response,
            Err(_) => R::from_error(AgentError::io("request abandoned")),
        })
    }
}

/// A tracked operation: when it started waiting and how to finish it
#[derive(Debug)]
pub struct InflightRequest<R> {
    pub submitted_at: Instant,
    pub promise: Promise<R>,
}

/// Thread-safe registry of pending asynchronous operations
///
/// Pure bookkeeping: registration, idempotent unregistration, emptiness and
/// size snapshots, and extraction of entries older than a deadline. A zero
/// `max_request_duration` disables storage entirely; registration still
/// hands out valid ids so callers can unconditionally unregister later.
#[derive(Debug)]
pub struct InflightTracker<R> {
    max_request_duration: Duration,
    next_id: AtomicU64,
    inflight: Mutex<HashMap<u64, InflightRequest<R>>>,
}

impl<R: Send + 'static> InflightTracker<R> {
    pub fn new(max_request_duration: Duration) -> Self {
        Self {
            max_request_duration,
            next_id: AtomicU64::new(0),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, InflightRequest<R>>> {
        self.inflight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a pending operation, returning its id
    pub fn register_request(&self, submitted_at: Instant, promise: Promise<R>) -> RequestId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if !self.max_request_duration.is_zero() {
            self.lock().insert(
                id,
                InflightRequest {
                    submitted_at,
                    promise,
                },
            );
        }
        RequestId(id)
    }

    /// Remove an entry; no-op when absent or when tracking is disabled
    pub fn unregister_request(&self, id: RequestId) {
        if !self.max_request_duration.is_zero() {
            self.lock().remove(&id.0);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn size(&self) -> usize {
        self.lock().len()
    }

    /// Remove and return every entry that outlived the configured duration
    ///
    /// Resolving the returned promises is the caller's responsibility.
    pub fn extract_timed_out(&self, now: Instant) -> Vec<InflightRequest<R>> {
        if self.max_request_duration.is_zero() {
            return Vec::new();
        }

        let mut inflight = self.lock();
        let timed_out: Vec<u64> = inflight
            .iter()
            .filter(|(_, request)| request.submitted_at + self.max_request_duration < now)
            .map(|(&id, _)| id)
            .collect();

        timed_out
            .into_iter()
            .filter_map(|id| inflight.remove(&id))
            .inspect(|request| debug_assert!(!request.promise.is_resolved()))
            .collect()
    }
}
