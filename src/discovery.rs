use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::catalog::JobPayload;
use crate::error::{Result, StitchError};
use crate::registry::WorkerRegistry;
use crate::session::SessionTable;

/// Source of the authoritative set of live worker addresses.
#[async_trait]
pub trait HostProvider: Send + Sync {
    async fn running_workers(&self) -> Result<HashSet<String>>;
}

/// Fixed worker list for local or offline operation.
#[derive(Debug, Clone)]
pub struct StaticHostProvider {
    hosts: HashSet<String>,
}

impl StaticHostProvider {
    pub fn new(hosts: impl IntoIterator<Item = String>) -> Self {
        Self {
            hosts: hosts.into_iter().collect(),
        }
    }
}

#[async_trait]
impl HostProvider for StaticHostProvider {
    async fn running_workers(&self) -> Result<HashSet<String>> {
        Ok(self.hosts.clone())
    }
}

#[derive(Debug, Deserialize)]
struct DescribeInstances {
    #[serde(rename = "Reservations", default)]
    reservations: Vec<Reservation>,
}

#[derive(Debug, Deserialize)]
struct Reservation {
    #[serde(rename = "Instances", default)]
    instances: Vec<Instance>,
}

#[derive(Debug, Deserialize)]
struct Instance {
    #[serde(rename = "Tags", default)]
    tags: Vec<Tag>,
    #[serde(rename = "State")]
    state: InstanceState,
    #[serde(rename = "PrivateIpAddress")]
    private_ip: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InstanceState {
    #[serde(rename = "Name")]
    name: String,
}

#[derive(Debug, Deserialize)]
struct Tag {
    #[serde(rename = "Value", default)]
    value: String,
}

/// Discovers workers by shelling out to the AWS CLI and filtering running
/// instances carrying the worker tag. The instance inventory is consumed as
/// an opaque JSON document; only the fields above are interpreted.
#[derive(Debug, Clone)]
pub struct Ec2HostProvider {
    worker_tag: String,
    worker_port: u16,
}

impl Ec2HostProvider {
    pub fn new(worker_tag: impl Into<String>, worker_port: u16) -> Self {
        Self {
            worker_tag: worker_tag.into(),
            worker_port,
        }
    }

    fn parse(&self, raw: &[u8]) -> Result<HashSet<String>> {
        let inventory: DescribeInstances = serde_json::from_slice(raw)
            .map_err(|e| StitchError::Discovery(format!("malformed instance inventory: {e}")))?;
        let mut hosts = HashSet::new();
        for reservation in inventory.reservations {
            for instance in reservation.instances {
                if instance.state.name != "running" {
                    continue;
                }
                if !instance.tags.iter().any(|t| t.value == self.worker_tag) {
                    continue;
                }
                if let Some(ip) = instance.private_ip {
                    hosts.insert(format!("{}:{}", ip, self.worker_port));
                }
            }
        }
        Ok(hosts)
    }
}

#[async_trait]
impl HostProvider for Ec2HostProvider {
    async fn running_workers(&self) -> Result<HashSet<String>> {
        let output = Command::new("aws")
            .args(["ec2", "describe-instances", "--output", "json"])
            .output()
            .await
            .map_err(|e| StitchError::Discovery(format!("spawning aws cli: {e}")))?;
        if !output.status.success() {
            return Err(StitchError::Discovery(format!(
                "aws cli exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        self.parse(&output.stdout)
    }
}

/// Periodically reconciles the worker registry against the host provider and
/// recovers sessions stranded on dead hosts.
///
/// This is the sole failure-detection mechanism: a silently dead worker is
/// noticed within one poll interval, not immediately. A failed cycle is
/// logged and the loop continues.
pub struct FleetMonitor {
    provider: Arc<dyn HostProvider>,
    registry: Arc<WorkerRegistry>,
    sessions: Arc<SessionTable>,
    reschedule_tx: mpsc::UnboundedSender<JobPayload>,
    poll_interval: Duration,
    /// One reconciliation then idle (static worker list mode).
    run_once: bool,
}

impl FleetMonitor {
    pub fn new(
        provider: Arc<dyn HostProvider>,
        registry: Arc<WorkerRegistry>,
        sessions: Arc<SessionTable>,
        reschedule_tx: mpsc::UnboundedSender<JobPayload>,
        poll_interval: Duration,
        run_once: bool,
    ) -> Self {
        Self {
            provider,
            registry,
            sessions,
            reschedule_tx,
            poll_interval,
            run_once,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        if self.run_once {
            if let Err(e) = self.poll_once().await {
                tracing::error!(error = %e, "Static worker reconciliation failed");
            }
            cancel.cancelled().await;
            return;
        }

        loop {
            if let Err(e) = self.poll_once().await {
                tracing::error!(error = %e, "Fleet discovery cycle failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = cancel.cancelled() => break,
            }
        }
        tracing::info!("Fleet monitor stopped");
    }

    /// One discovery cycle: query, reconcile, sweep sessions of dead hosts
    /// into the reschedule queue.
    pub async fn poll_once(&self) -> Result<()> {
        let active = self.provider.running_workers().await?;
        let dead = self.registry.reconcile(&active).await;
        if !dead.is_empty() {
            for payload in self.sessions.sweep_dead(&dead).await {
                // Receiver only drops at shutdown; the job is lost with it.
                let _ = self.reschedule_tx.send(payload);
            }
        }
        let (running, ready) = self.registry.counts().await;
        tracing::debug!(active = active.len(), running, ready, "Fleet reconciled");
        Ok(())
    }
}
