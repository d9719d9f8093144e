//! Generic id-correlated awaiter table.
//!
//! Both the MCP supervisor (JSON-RPC reply correlation) and the LLM layer
//! (queued request completion) need the same shape: register an id and get a
//! future back; some other task later resolves, rejects, or cancels that id.
//! Every registered awaiter completes exactly once: resolve, reject, cancel,
//! or deadline expiry, whichever comes first.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::warn;

use crate::{Error, Result};

/// One half of a registered awaiter; `recv` yields the correlated outcome.
#[derive(Debug)]
pub struct Awaiter<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> Awaiter<T> {
    /// Wait for the correlated resolve/reject/cancel.
    ///
    /// A dropped table side (component torn down without `reject_all`) is
    /// reported as a cancellation rather than a panic.
    pub async fn recv(self) -> Result<T> {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::new(
                crate::ErrorKind::ProviderUnreachable,
                "awaiter cancelled: table dropped",
            )),
        }
    }
}

/// Running completion counters, exposed for invariant checks and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AwaiterStats {
    pub issued: u64,
    pub resolved: u64,
    pub rejected: u64,
    pub cancelled: u64,
    pub pending: u64,
}

/// Table of pending awaiters keyed by request id.
///
/// Register with a deadline; if nothing completes the id in time the entry is
/// rejected with the supplied timeout error and removed, so the pending map
/// never holds an awaiter past its deadline.
#[derive(Debug)]
pub struct AwaiterTable<K, T> {
    pending: Mutex<HashMap<K, oneshot::Sender<Result<T>>>>,
    issued: AtomicU64,
    resolved: AtomicU64,
    rejected: AtomicU64,
    cancelled: AtomicU64,
}

impl<K, T> Default for AwaiterTable<K, T>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, T> AwaiterTable<K, T>
where
    K: Eq + Hash,
{
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            issued: AtomicU64::new(0),
            resolved: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
        }
    }

    /// Complete `id` successfully. Returns false when the id is unknown
    /// (already completed or never registered).
    pub fn resolve(&self, id: &K, value: T) -> bool {
        let Some(tx) = self.pending.lock().unwrap().remove(id) else {
            return false;
        };
        self.resolved.fetch_add(1, Ordering::Relaxed);
        let _ = tx.send(Ok(value));
        true
    }

    /// Complete `id` with an error. Returns false when the id is unknown.
    pub fn reject(&self, id: &K, error: Error) -> bool {
        let Some(tx) = self.pending.lock().unwrap().remove(id) else {
            return false;
        };
        self.rejected.fetch_add(1, Ordering::Relaxed);
        let _ = tx.send(Err(error));
        true
    }

    /// Cancel `id` (e.g. the owning session went away). Counted separately
    /// from rejections.
    pub fn cancel(&self, id: &K, error: Error) -> bool {
        let Some(tx) = self.pending.lock().unwrap().remove(id) else {
            return false;
        };
        self.cancelled.fetch_add(1, Ordering::Relaxed);
        let _ = tx.send(Err(error));
        true
    }

    /// Reject every pending awaiter with a clone of `error`. Used at shutdown
    /// ("terminated") and on fatal read errors. Returns how many were rejected.
    pub fn reject_all(&self, error: &Error) -> usize {
        let drained: Vec<_> = self.pending.lock().unwrap().drain().collect();
        let count = drained.len();
        self.rejected.fetch_add(count as u64, Ordering::Relaxed);
        for (_, tx) in drained {
            let _ = tx.send(Err(error.clone()));
        }
        count
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    pub fn stats(&self) -> AwaiterStats {
        AwaiterStats {
            issued: self.issued.load(Ordering::Relaxed),
            resolved: self.resolved.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            pending: self.pending.lock().unwrap().len() as u64,
        }
    }
}

impl<K, T> AwaiterTable<K, T>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Send + 'static,
{
    /// Register `id` and arm its deadline. The returned [`Awaiter`] completes
    /// when some other task resolves/rejects/cancels the id, or with
    /// `on_timeout` once `deadline` elapses.
    ///
    /// A duplicate registration fails immediately: ids are allocated
    /// monotonically by callers, so a collision is a caller bug we surface
    /// rather than silently replacing the first awaiter.
    pub fn register(self: &Arc<Self>, id: K, deadline: Duration, on_timeout: Error) -> Awaiter<T> {
        let (tx, rx) = oneshot::channel();

        {
            let mut pending = self.pending.lock().unwrap();
            if pending.contains_key(&id) {
                warn!("duplicate awaiter registration");
                let _ = tx.send(Err(Error::new(
                    crate::ErrorKind::ToolError,
                    "duplicate request id",
                )));
                return Awaiter { rx };
            }
            pending.insert(id.clone(), tx);
        }
        self.issued.fetch_add(1, Ordering::Relaxed);

        let table: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            if let Some(table) = table.upgrade() {
                table.reject(&id, on_timeout);
            }
        });

        Awaiter { rx }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    fn timeout_err() -> Error {
        Error::timeout("deadline elapsed")
    }

    #[tokio::test]
    async fn resolve_completes_awaiter() {
        let table: Arc<AwaiterTable<u64, String>> = Arc::new(AwaiterTable::new());
        let awaiter = table.register(1, Duration::from_secs(5), timeout_err());
        assert!(table.resolve(&1, "ok".to_string()));
        assert_eq!(awaiter.recv().await.unwrap(), "ok");
        assert_eq!(table.pending_len(), 0);
    }

    #[tokio::test]
    async fn resolve_unknown_id_is_noop() {
        let table: Arc<AwaiterTable<u64, ()>> = Arc::new(AwaiterTable::new());
        assert!(!table.resolve(&42, ()));
        assert!(!table.reject(&42, timeout_err()));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_rejects_and_removes() {
        let table: Arc<AwaiterTable<u64, ()>> = Arc::new(AwaiterTable::new());
        let awaiter = table.register(7, Duration::from_millis(50), timeout_err());
        let err = awaiter.recv().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ToolTimeout);
        assert_eq!(table.pending_len(), 0);
        // Late resolve after the deadline finds nothing.
        assert!(!table.resolve(&7, ()));
    }

    #[tokio::test]
    async fn reject_all_drains_pending() {
        let table: Arc<AwaiterTable<u64, ()>> = Arc::new(AwaiterTable::new());
        let a = table.register(1, Duration::from_secs(5), timeout_err());
        let b = table.register(2, Duration::from_secs(5), timeout_err());
        let n = table.reject_all(&Error::new(ErrorKind::ProviderUnreachable, "terminated"));
        assert_eq!(n, 2);
        assert_eq!(a.recv().await.unwrap_err().kind(), ErrorKind::ProviderUnreachable);
        assert_eq!(b.recv().await.unwrap_err().kind(), ErrorKind::ProviderUnreachable);
    }

    #[tokio::test]
    async fn duplicate_registration_fails_second() {
        let table: Arc<AwaiterTable<u64, ()>> = Arc::new(AwaiterTable::new());
        let first = table.register(3, Duration::from_secs(5), timeout_err());
        let second = table.register(3, Duration::from_secs(5), timeout_err());
        assert_eq!(second.recv().await.unwrap_err().kind(), ErrorKind::ToolError);
        // The first awaiter is untouched.
        assert!(table.resolve(&3, ()));
        assert!(first.recv().await.is_ok());
    }

    #[tokio::test]
    async fn counters_balance_at_quiescence() {
        let table: Arc<AwaiterTable<u64, ()>> = Arc::new(AwaiterTable::new());
        let a = table.register(1, Duration::from_secs(5), timeout_err());
        let b = table.register(2, Duration::from_secs(5), timeout_err());
        let c = table.register(3, Duration::from_secs(5), timeout_err());
        table.resolve(&1, ());
        table.reject(&2, timeout_err());
        table.cancel(&3, Error::new(ErrorKind::ProviderUnreachable, "cancelled"));
        let _ = a.recv().await;
        let _ = b.recv().await;
        let _ = c.recv().await;

        let stats = table.stats();
        assert_eq!(stats.issued, 3);
        assert_eq!(
            stats.resolved + stats.rejected + stats.cancelled + stats.pending,
            stats.issued
        );
    }
}
