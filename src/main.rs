use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use gridstitch::config::CoordinatorConfig;
use gridstitch::coordinator::Coordinator;
use gridstitch::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "gridstitch")]
#[command(version)]
#[command(about = "Coordinates a fleet of raster-stitching workers over a global grid")]
struct Args {
    /// Port to listen on for worker callbacks
    #[arg(long, default_value_t = 8080)]
    app_port: u16,

    /// Externally reachable address workers use to call back
    #[arg(long, default_value = "localhost")]
    external_ip: String,

    /// host:port addresses of static workers (bypasses fleet discovery)
    #[arg(long, num_args = 1..)]
    worker_list: Option<Vec<String>>,

    /// Tag value marking an instance as a stitch worker
    #[arg(long, default_value = "ndr-nci-stitcher-worker")]
    worker_tag: String,

    /// Port workers listen on for job dispatch
    #[arg(long, default_value_t = 8888)]
    worker_port: u16,

    /// Seconds between fleet discovery polls
    #[arg(long, default_value_t = 30)]
    poll_interval_secs: u64,

    /// Grid cell edge length in degrees
    #[arg(long, default_value_t = 2.0)]
    grid_step: f64,

    /// Destination prefix workers upload results under
    #[arg(long, default_value = "s3://nci-ecoshards/ndr_scenarios")]
    bucket_uri_prefix: String,

    /// Output pixel size in WGS84 degrees
    #[arg(long, default_value_t = 0.002)]
    pixel_size: f64,

    /// Directory for the work catalog database
    #[arg(long, default_value = "stitcher_workspace")]
    workspace_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = CoordinatorConfig::new(args.app_port, args.external_ip);
    config.worker_list = args.worker_list;
    config.worker_tag = args.worker_tag;
    config.worker_port = args.worker_port;
    config.poll_interval = Duration::from_secs(args.poll_interval_secs);
    config.grid_step_deg = args.grid_step;
    config.bucket_uri_prefix = args.bucket_uri_prefix;
    config.wgs84_pixel_size = args.pixel_size;
    config.workspace_dir = args.workspace_dir;

    let mut coordinator = Coordinator::new(config);

    // Catalog creation is the only fatal startup step.
    match coordinator.init_catalog().await? {
        Some(rows) => tracing::info!(rows, "Created work catalog"),
        None => tracing::info!("Reusing work catalog from previous run"),
    }

    // Downstream result consumption is out of scope; drain and log so the
    // channel never backs up.
    if let Some(mut results) = coordinator.take_results() {
        tokio::spawn(async move {
            while let Some(report) = results.recv().await {
                tracing::info!(session_id = %report.session_id, "Result received");
            }
        });
    }

    let cancel = install_shutdown_handler();
    coordinator.run(cancel).await?;
    Ok(())
}
