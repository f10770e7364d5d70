use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::catalog::JobPayload;
use crate::config::CoordinatorConfig;
use crate::error::{Result, StitchError};
use crate::registry::WorkerRegistry;
use crate::session::{Session, SessionTable};

/// Exponential backoff between dispatch attempts. There is deliberately no
/// attempt cap: a persistently failing dispatch keeps retrying rather than
/// surfacing as fatal. Bounding it is a visible policy edit here, not a
/// hidden default.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after the given 0-indexed failed attempt:
    /// doubles from `base`, capped at `max`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self
            .base
            .saturating_mul(2u32.saturating_pow(attempt.min(31)));
        exp.min(self.max)
    }
}

#[derive(Debug, Serialize)]
struct DispatchRequest<'a> {
    job_payload: &'a JobPayload,
    callback_url: &'a str,
    bucket_uri_prefix: &'a str,
    session_id: Uuid,
    wgs84_pixel_size: f64,
}

#[derive(Debug, Deserialize)]
struct DispatchAck {
    status_url: String,
}

/// Drains job payloads from its input channel, sending each to an available
/// worker. `acquire_ready` is the only backpressure: drainage throttles to
/// fleet capacity.
pub struct Dispatcher {
    client: reqwest::Client,
    registry: Arc<WorkerRegistry>,
    sessions: Arc<SessionTable>,
    callback_url: String,
    bucket_uri_prefix: String,
    wgs84_pixel_size: f64,
    retry: RetryPolicy,
}

impl Dispatcher {
    pub fn new(
        config: &CoordinatorConfig,
        registry: Arc<WorkerRegistry>,
        sessions: Arc<SessionTable>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(config.dispatch_timeout)
            .build()?;
        Ok(Self {
            client,
            registry,
            sessions,
            callback_url: config.callback_url(),
            bucket_uri_prefix: config.bucket_uri_prefix.clone(),
            wgs84_pixel_size: config.wgs84_pixel_size,
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Consume payloads until the channel closes or shutdown is signalled.
    pub async fn run(
        self,
        mut jobs: mpsc::UnboundedReceiver<JobPayload>,
        cancel: CancellationToken,
    ) {
        loop {
            let payload = tokio::select! {
                job = jobs.recv() => match job {
                    Some(payload) => payload,
                    None => break,
                },
                _ = cancel.cancelled() => break,
            };
            self.dispatch_with_retry(payload, &cancel).await;
        }
        tracing::info!("Dispatcher stopped");
    }

    /// Retry a single payload under the retry policy until it is accepted by
    /// some worker or shutdown interrupts.
    async fn dispatch_with_retry(&self, payload: JobPayload, cancel: &CancellationToken) {
        let mut attempt: u32 = 0;
        loop {
            match self.try_dispatch(&payload, cancel).await {
                Ok(true) => return,
                Ok(false) => return, // cancelled while waiting for a worker
                Err(e) => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    tracing::warn!(
                        error = %e,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Dispatch failed, backing off"
                    );
                    attempt = attempt.saturating_add(1);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return,
                    }
                }
            }
        }
    }

    /// One dispatch attempt: acquire a worker, POST the job, record the
    /// session. On failure the worker is evicted as unhealthy. Returns
    /// `Ok(false)` when cancelled before a worker became available.
    async fn try_dispatch(&self, payload: &JobPayload, cancel: &CancellationToken) -> Result<bool> {
        let Some(worker) = self.registry.acquire_ready(cancel).await else {
            return Ok(false);
        };

        let session_id = Uuid::new_v4();
        match self.send_job(&worker, payload, session_id).await {
            Ok(ack) => {
                tracing::info!(
                    session_id = %session_id,
                    worker = %worker,
                    scenario = %payload.scenario_id,
                    raster = %payload.raster_id,
                    "Job dispatched"
                );
                self.sessions
                    .insert(
                        session_id,
                        Session::new(worker, payload.clone(), ack.status_url),
                    )
                    .await;
                Ok(true)
            }
            Err(e) => {
                self.registry.remove(&worker).await;
                Err(StitchError::Dispatch {
                    worker,
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn send_job(
        &self,
        worker: &str,
        payload: &JobPayload,
        session_id: Uuid,
    ) -> Result<DispatchAck> {
        let url = format!("http://{}/api/v1/stitch_grid_cell", worker);
        let request = DispatchRequest {
            job_payload: payload,
            callback_url: &self.callback_url,
            bucket_uri_prefix: &self.bucket_uri_prefix,
            session_id,
            wgs84_pixel_size: self.wgs84_pixel_size,
        };
        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await?
            .error_for_status()?;
        let ack: DispatchAck = response.json().await?;
        Ok(ack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delays_double_from_base_to_cap() {
        let retry = RetryPolicy::default();
        assert_eq!(retry.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(retry.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(retry.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(retry.delay_for_attempt(3), Duration::from_secs(8));
        assert_eq!(retry.delay_for_attempt(4), Duration::from_secs(10));
        assert_eq!(retry.delay_for_attempt(100), Duration::from_secs(10));
    }

    #[test]
    fn retry_policy_respects_custom_cap() {
        let retry = RetryPolicy {
            base: Duration::from_millis(10),
            max: Duration::from_millis(25),
        };
        assert_eq!(retry.delay_for_attempt(0), Duration::from_millis(10));
        assert_eq!(retry.delay_for_attempt(1), Duration::from_millis(20));
        assert_eq!(retry.delay_for_attempt(2), Duration::from_millis(25));
    }
}
