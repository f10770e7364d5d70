use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::catalog::{JobPayload, WorkCatalog};
use crate::config::CoordinatorConfig;
use crate::discovery::{Ec2HostProvider, FleetMonitor, HostProvider, StaticHostProvider};
use crate::dispatch::Dispatcher;
use crate::error::{Result, StitchError};
use crate::registry::WorkerRegistry;
use crate::server::{run_server, ApiState, CompletionReport};
use crate::session::SessionTable;

/// Owns all shared coordinator state and wires the subsystems together:
/// fleet discovery reconciles the registry and recovers lost sessions onto
/// the job channel; the dispatcher drains that channel against ready
/// workers; the API server closes sessions on worker callbacks.
pub struct Coordinator {
    pub config: CoordinatorConfig,
    pub registry: Arc<WorkerRegistry>,
    pub sessions: Arc<SessionTable>,
    pub catalog: Arc<WorkCatalog>,
    job_tx: mpsc::UnboundedSender<JobPayload>,
    job_rx: Option<mpsc::UnboundedReceiver<JobPayload>>,
    result_tx: mpsc::UnboundedSender<CompletionReport>,
    result_rx: Option<mpsc::UnboundedReceiver<CompletionReport>>,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        let (job_tx, job_rx) = mpsc::unbounded_channel();
        let (result_tx, result_rx) = mpsc::unbounded_channel();
        let catalog = Arc::new(WorkCatalog::new(&config.workspace_dir));
        Self {
            config,
            registry: Arc::new(WorkerRegistry::new()),
            sessions: Arc::new(SessionTable::new()),
            catalog,
            job_tx,
            job_rx: Some(job_rx),
            result_tx,
            result_rx: Some(result_rx),
        }
    }

    /// Take the stream of completion reports for downstream consumption.
    pub fn take_results(&mut self) -> Option<mpsc::UnboundedReceiver<CompletionReport>> {
        self.result_rx.take()
    }

    /// Create the workspace and the work catalog. Failure here is fatal to
    /// startup; everything after it degrades gracefully.
    pub async fn init_catalog(&self) -> Result<Option<usize>> {
        std::fs::create_dir_all(&self.config.workspace_dir)
            .map_err(|e| StitchError::Catalog(format!("creating workspace dir: {e}")))?;
        let catalog = self.catalog.clone();
        let scenarios = self.config.scenarios.clone();
        let rasters = self.config.rasters.clone();
        let step = self.config.grid_step_deg;
        tokio::task::spawn_blocking(move || {
            catalog.ensure_initialized(&scenarios, &rasters, step)
        })
        .await
        .map_err(|e| StitchError::Catalog(format!("catalog init task failed: {e}")))?
    }

    fn host_provider(&self) -> (Arc<dyn HostProvider>, bool) {
        match &self.config.worker_list {
            Some(workers) => (
                Arc::new(StaticHostProvider::new(workers.iter().cloned())),
                true,
            ),
            None => (
                Arc::new(Ec2HostProvider::new(
                    self.config.worker_tag.clone(),
                    self.config.worker_port,
                )),
                false,
            ),
        }
    }

    /// Seed the dispatcher with the current backlog, then run every
    /// subsystem until the token is cancelled.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        let catalog = self.catalog.clone();
        let backlog = tokio::task::spawn_blocking(move || catalog.load_backlog())
            .await
            .map_err(|e| StitchError::Catalog(format!("backlog read task failed: {e}")))??;
        tracing::info!(jobs = backlog.len(), "Seeding dispatch backlog");
        for payload in backlog {
            // The receiver lives on self until the dispatcher takes it.
            let _ = self.job_tx.send(payload);
        }

        let (provider, run_once) = self.host_provider();
        let monitor = FleetMonitor::new(
            provider,
            self.registry.clone(),
            self.sessions.clone(),
            self.job_tx.clone(),
            self.config.poll_interval,
            run_once,
        );
        let monitor_cancel = cancel.clone();
        tokio::spawn(async move {
            monitor.run(monitor_cancel).await;
        });

        let dispatcher = Dispatcher::new(
            &self.config,
            self.registry.clone(),
            self.sessions.clone(),
        )?;
        let job_rx = self
            .job_rx
            .take()
            .expect("coordinator run called twice");
        let dispatch_cancel = cancel.clone();
        tokio::spawn(async move {
            dispatcher.run(job_rx, dispatch_cancel).await;
        });

        let state = ApiState {
            registry: self.registry.clone(),
            sessions: self.sessions.clone(),
            catalog: self.catalog.clone(),
            results: self.result_tx.clone(),
        };
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.app_port));
        run_server(addr, state, cancel).await;
        Ok(())
    }
}
