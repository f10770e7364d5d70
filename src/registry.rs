use std::collections::HashSet;

use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
struct RegistryInner {
    ready: HashSet<String>,
    running: HashSet<String>,
}

/// Tracks which workers are idle (`ready`) versus holding a job (`running`).
///
/// A host is in at most one of the two sets at any instant. `acquire_ready`
/// suspends the caller until a ready host exists; the waiter is registered
/// before the sets are inspected so a release landing between the check and
/// the await cannot be lost.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    inner: Mutex<RegistryInner>,
    ready_notify: Notify,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a newly discovered host as ready unless it is already
    /// tracked in either state. Returns whether it was newly added.
    pub async fn add(&self, host: &str) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.ready.contains(host) || inner.running.contains(host) {
            return false;
        }
        inner.ready.insert(host.to_string());
        drop(inner);
        tracing::debug!(host, "Worker registered as ready");
        self.ready_notify.notify_waiters();
        true
    }

    /// Take an arbitrary ready host, moving it to `running`. Suspends until
    /// one exists; returns `None` only on cancellation.
    pub async fn acquire_ready(&self, cancel: &CancellationToken) -> Option<String> {
        loop {
            let notified = self.ready_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock().await;
                if let Some(host) = inner.ready.iter().next().cloned() {
                    inner.ready.remove(&host);
                    inner.running.insert(host.clone());
                    tracing::debug!(host = %host, "Worker acquired");
                    return Some(host);
                }
            }

            tokio::select! {
                _ = notified => {}
                _ = cancel.cancelled() => return None,
            }
        }
    }

    /// Return a host to `ready` after its job completed. A host not in
    /// `running` is added directly to `ready`.
    pub async fn release(&self, host: &str) {
        let mut inner = self.inner.lock().await;
        inner.running.remove(host);
        inner.ready.insert(host.to_string());
        drop(inner);
        tracing::debug!(host, "Worker released");
        self.ready_notify.notify_waiters();
    }

    /// Delete a host from whichever set contains it. Returns whether it was
    /// tracked. Used when a host is judged unhealthy or absent.
    pub async fn remove(&self, host: &str) -> bool {
        let mut inner = self.inner.lock().await;
        let found = inner.ready.remove(host) || inner.running.remove(host);
        drop(inner);
        if !found {
            tracing::warn!(host, "Remove requested for untracked worker");
        }
        found
    }

    /// Reconcile against the authoritative host set from discovery: new
    /// hosts join `ready`, tracked hosts missing from `active` are dropped.
    /// Returns the removed (dead) hosts.
    pub async fn reconcile(&self, active: &HashSet<String>) -> HashSet<String> {
        let mut inner = self.inner.lock().await;

        let mut dead: HashSet<String> = inner
            .ready
            .iter()
            .filter(|h| !active.contains(*h))
            .cloned()
            .collect();
        dead.extend(
            inner
                .running
                .iter()
                .filter(|h| !active.contains(*h))
                .cloned(),
        );
        for host in &dead {
            inner.ready.remove(host);
            inner.running.remove(host);
        }

        let mut added = false;
        for host in active {
            if !inner.ready.contains(host) && !inner.running.contains(host) {
                inner.ready.insert(host.clone());
                added = true;
            }
        }
        drop(inner);

        if !dead.is_empty() {
            tracing::info!(dead = ?dead, "Workers disappeared from fleet");
        }
        if added {
            self.ready_notify.notify_waiters();
        }
        dead
    }

    /// `(running, ready)` sizes for observability.
    pub async fn counts(&self) -> (usize, usize) {
        let inner = self.inner.lock().await;
        (inner.running.len(), inner.ready.len())
    }
}
