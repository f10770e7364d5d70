use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the coordinator process.
///
/// All shared defaults live here so tests can build a coordinator against a
/// temp workspace and a static worker list without touching the EC2 path.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Port the HTTP API (worker callbacks + liveness) listens on.
    pub app_port: u16,
    /// Externally reachable address workers use to call back.
    pub external_addr: String,
    /// Static `host:port` worker addresses. When set, fleet discovery
    /// performs a single reconciliation against this list and then idles.
    pub worker_list: Option<Vec<String>>,
    /// Tag value that marks an EC2 instance as a stitch worker.
    pub worker_tag: String,
    /// Port every worker's RPC endpoint listens on.
    pub worker_port: u16,
    /// Interval between fleet discovery polls.
    pub poll_interval: Duration,
    /// Grid cell edge length in degrees.
    pub grid_step_deg: f64,
    /// Scenario identifiers to enumerate in the work catalog.
    pub scenarios: Vec<String>,
    /// Raster identifiers to enumerate in the work catalog.
    pub rasters: Vec<String>,
    /// Destination prefix workers upload results under.
    pub bucket_uri_prefix: String,
    /// Output pixel size in WGS84 degrees, forwarded with every job.
    pub wgs84_pixel_size: f64,
    /// Upper bound on a single dispatch HTTP request.
    pub dispatch_timeout: Duration,
    /// Directory holding the work catalog database and its token file.
    pub workspace_dir: PathBuf,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            app_port: 8080,
            external_addr: "localhost".to_string(),
            worker_list: None,
            worker_tag: "ndr-nci-stitcher-worker".to_string(),
            worker_port: 8888,
            poll_interval: Duration::from_secs(30),
            grid_step_deg: 2.0,
            scenarios: vec![
                "baseline_potter".to_string(),
                "baseline_napp_rate".to_string(),
                "ag_expansion".to_string(),
                "ag_intensification".to_string(),
                "restoration_potter".to_string(),
                "restoration_napp_rate".to_string(),
            ],
            rasters: vec!["n_export".to_string(), "modified_load".to_string()],
            bucket_uri_prefix: "s3://nci-ecoshards/ndr_scenarios".to_string(),
            wgs84_pixel_size: 0.002,
            dispatch_timeout: Duration::from_secs(300),
            workspace_dir: PathBuf::from("stitcher_workspace"),
        }
    }
}

impl CoordinatorConfig {
    pub fn new(app_port: u16, external_addr: impl Into<String>) -> Self {
        Self {
            app_port,
            external_addr: external_addr.into(),
            ..Default::default()
        }
    }

    pub fn with_worker_list(mut self, workers: Vec<String>) -> Self {
        self.worker_list = Some(workers);
        self
    }

    pub fn with_grid(mut self, step_deg: f64, scenarios: Vec<String>, rasters: Vec<String>) -> Self {
        self.grid_step_deg = step_deg;
        self.scenarios = scenarios;
        self.rasters = rasters;
        self
    }

    pub fn with_workspace_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workspace_dir = dir.into();
        self
    }

    /// URL workers POST their completion report to.
    pub fn callback_url(&self) -> String {
        format!(
            "http://{}:{}/api/v1/processing_complete",
            self.external_addr, self.app_port
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let cfg = CoordinatorConfig::default();
        assert_eq!(cfg.app_port, 8080);
        assert_eq!(cfg.external_addr, "localhost");
        assert!(cfg.worker_list.is_none());
        assert_eq!(cfg.worker_port, 8888);
        assert_eq!(cfg.poll_interval, Duration::from_secs(30));
        assert_eq!(cfg.grid_step_deg, 2.0);
        assert_eq!(cfg.scenarios.len(), 6);
        assert_eq!(cfg.rasters.len(), 2);
    }

    #[test]
    fn callback_url_uses_external_addr() {
        let cfg = CoordinatorConfig::new(9000, "10.1.2.3");
        assert_eq!(
            cfg.callback_url(),
            "http://10.1.2.3:9000/api/v1/processing_complete"
        );
    }

    #[test]
    fn with_worker_list_enables_static_mode() {
        let cfg = CoordinatorConfig::default()
            .with_worker_list(vec!["127.0.0.1:8888".to_string()]);
        assert_eq!(
            cfg.worker_list.as_deref(),
            Some(&["127.0.0.1:8888".to_string()][..])
        );
    }

    #[test]
    fn with_grid_overrides_catalog_shape() {
        let cfg = CoordinatorConfig::default().with_grid(
            90.0,
            vec!["A".to_string()],
            vec!["r".to_string()],
        );
        assert_eq!(cfg.grid_step_deg, 90.0);
        assert_eq!(cfg.scenarios, vec!["A".to_string()]);
        assert_eq!(cfg.rasters, vec!["r".to_string()]);
    }
}
