use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::catalog::JobPayload;

/// An in-flight dispatch: created when a worker acknowledges a job, resolved
/// exactly once by either the completion callback or the dead-host sweep.
#[derive(Debug, Clone)]
pub struct Session {
    pub worker: String,
    pub payload: JobPayload,
    pub status_url: String,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(worker: String, payload: JobPayload, status_url: String) -> Self {
        Self {
            worker,
            payload,
            status_url,
            created_at: Utc::now(),
        }
    }
}

/// Map from session id to its open [`Session`]. Mutated by the dispatcher
/// (insert), the completion handler (resolve) and fleet discovery (sweep);
/// each operation holds the lock for the whole mutation so a session can
/// never be resolved twice.
#[derive(Debug, Default)]
pub struct SessionTable {
    inner: Mutex<HashMap<Uuid, Session>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, session_id: Uuid, session: Session) {
        let mut inner = self.inner.lock().await;
        inner.insert(session_id, session);
    }

    /// Remove and return the session, if it is still open.
    pub async fn resolve(&self, session_id: &Uuid) -> Option<Session> {
        let mut inner = self.inner.lock().await;
        inner.remove(session_id)
    }

    /// Remove every session bound to a dead host, returning their payloads
    /// for rescheduling.
    pub async fn sweep_dead(&self, dead_hosts: &HashSet<String>) -> Vec<JobPayload> {
        let mut inner = self.inner.lock().await;
        let lost: Vec<Uuid> = inner
            .iter()
            .filter(|(_, s)| dead_hosts.contains(&s.worker))
            .map(|(id, _)| *id)
            .collect();
        let mut payloads = Vec::with_capacity(lost.len());
        for session_id in lost {
            if let Some(session) = inner.remove(&session_id) {
                tracing::info!(
                    session_id = %session_id,
                    worker = %session.worker,
                    "Recovering job from dead worker"
                );
                payloads.push(session.payload);
            }
        }
        payloads
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(scenario: &str) -> JobPayload {
        JobPayload {
            scenario_id: scenario.to_string(),
            raster_id: "r".to_string(),
            lng_min: -180.0,
            lat_min: -90.0,
            lng_max: -90.0,
            lat_max: 0.0,
        }
    }

    #[tokio::test]
    async fn resolve_is_single_shot() {
        let table = SessionTable::new();
        let id = Uuid::new_v4();
        table
            .insert(
                id,
                Session::new("w1:8888".to_string(), payload("A"), "http://w1/s".to_string()),
            )
            .await;

        let first = table.resolve(&id).await.expect("session still open");
        assert_eq!(first.worker, "w1:8888");
        assert!(first.created_at <= Utc::now());
        assert!(table.resolve(&id).await.is_none());
        assert!(table.is_empty().await);
    }

    #[tokio::test]
    async fn sweep_takes_only_dead_host_sessions() {
        let table = SessionTable::new();
        let doomed = Uuid::new_v4();
        let safe = Uuid::new_v4();
        table
            .insert(
                doomed,
                Session::new("w1:8888".to_string(), payload("A"), String::new()),
            )
            .await;
        table
            .insert(
                safe,
                Session::new("w2:8888".to_string(), payload("B"), String::new()),
            )
            .await;

        let dead: HashSet<String> = ["w1:8888".to_string()].into_iter().collect();
        let recovered = table.sweep_dead(&dead).await;
        assert_eq!(recovered, vec![payload("A")]);

        // The swept session is gone; a later callback for it finds nothing.
        assert!(table.resolve(&doomed).await.is_none());
        assert!(table.resolve(&safe).await.is_some());
    }

    #[tokio::test]
    async fn sweep_with_no_dead_hosts_is_a_no_op() {
        let table = SessionTable::new();
        table
            .insert(
                Uuid::new_v4(),
                Session::new("w1:8888".to_string(), payload("A"), String::new()),
            )
            .await;
        let recovered = table.sweep_dead(&HashSet::new()).await;
        assert!(recovered.is_empty());
        assert_eq!(table.len().await, 1);
    }
}
