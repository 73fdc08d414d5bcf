use anyhow::{bail, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use recordpool_uploader::config::{
    parse_option, AppConfig, CliConfig, FileConfig, DEFAULT_CONNECT_TIMEOUT_SECS,
    DEFAULT_MAX_POLL_TICKS, DEFAULT_POLL_INTERVAL_SECS, DEFAULT_STATUS_TIMEOUT_SECS,
};
use recordpool_uploader::progress_view::{self, job_line, summary_line, ViewMode};
use recordpool_uploader::{ArchiveSource, HttpIngestionClient, UploadQueue};

fn parse_path(s: &str) -> Result<PathBuf> {
    let path = PathBuf::from(s);
    Ok(path.canonicalize().unwrap_or(path))
}

fn parse_archive(s: &str) -> Result<PathBuf> {
    let path = parse_path(s)?;
    if !path.is_file() {
        bail!("Archive not found: {:?}", path);
    }
    Ok(path)
}

#[derive(Parser, Debug)]
#[command(version, about = "Upload archives to the record pool catalog and track their processing")]
struct CliArgs {
    /// Archives to upload, in order.
    #[clap(required = true, value_parser = parse_archive)]
    pub archives: Vec<PathBuf>,

    /// Path to a TOML config file. Values in the file override CLI arguments.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Base URL of the catalog API.
    #[clap(long)]
    pub base_url: Option<String>,

    /// Bearer token for the ingestion endpoints.
    #[clap(long)]
    pub auth_token: Option<String>,

    /// Catalog destination sent with every archive.
    #[clap(long)]
    pub destination: Option<String>,

    /// Metadata field sent with every archive, as key=value. Repeatable.
    #[clap(long = "option", value_parser = parse_option)]
    pub options: Vec<(String, String)>,

    /// Seconds between two status polls of an archive being processed.
    #[clap(long, default_value_t = DEFAULT_POLL_INTERVAL_SECS)]
    pub poll_interval_secs: u64,

    /// Number of status polls after which processing is considered timed out.
    #[clap(long, default_value_t = DEFAULT_MAX_POLL_TICKS)]
    pub max_poll_ticks: u32,

    /// Timeout in seconds for a single status request.
    #[clap(long, default_value_t = DEFAULT_STATUS_TIMEOUT_SECS)]
    pub status_timeout_secs: u64,

    /// Connection timeout in seconds for every request.
    #[clap(long, default_value_t = DEFAULT_CONNECT_TIMEOUT_SECS)]
    pub connect_timeout_secs: u64,

    /// Show a single summary bar instead of one bar per archive.
    #[clap(long)]
    pub minimized: bool,

    /// Do not render progress bars, log only.
    #[clap(long, conflicts_with = "minimized")]
    pub no_progress: bool,
}

impl CliArgs {
    fn to_cli_config(&self) -> CliConfig {
        CliConfig {
            base_url: self.base_url.clone(),
            auth_token: self.auth_token.clone(),
            destination: self.destination.clone(),
            options: self.options.iter().cloned().collect(),
            poll_interval_secs: self.poll_interval_secs,
            max_poll_ticks: self.max_poll_ticks,
            status_timeout_secs: self.status_timeout_secs,
            connect_timeout_secs: self.connect_timeout_secs,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()?;

    let file_config = match &cli_args.config {
        Some(path) => {
            info!("Loading config from {:?}", path);
            Some(FileConfig::load(path)?)
        }
        None => None,
    };
    let config = AppConfig::resolve(&cli_args.to_cli_config(), file_config)?;

    let client = HttpIngestionClient::new(
        config.base_url.clone(),
        config.auth_token.clone(),
        config.connect_timeout_secs,
        config.status_timeout_secs,
    )?;
    info!(
        "Uploading {} archives to {}",
        cli_args.archives.len(),
        client.base_url()
    );

    let queue = UploadQueue::new(Arc::new(client), config.queue_settings());
    let sources = cli_args
        .archives
        .iter()
        .map(|path| ArchiveSource::file(path.clone()))
        .collect();
    queue.enqueue(sources, &config.default_options).await;

    let stop_view = CancellationToken::new();
    let view = if cli_args.no_progress {
        None
    } else {
        let mode = if cli_args.minimized {
            ViewMode::Minimized
        } else {
            ViewMode::Detailed
        };
        Some(progress_view::spawn(queue.clone(), mode, stop_view.clone()))
    };

    let work = async {
        queue.run_all().await;
        queue.wait_until_settled().await;
    };
    tokio::pin!(work);
    let interrupted = tokio::select! {
        _ = &mut work => false,
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!("Failed to listen for Ctrl-C: {}", e);
            }
            true
        }
    };

    queue.shutdown().await;
    if interrupted {
        // Stops the pass after the transfer in flight
        warn!("Interrupted, finishing the current transfer");
        work.await;
    }
    stop_view.cancel();
    if let Some(view) = view {
        if let Err(e) = view.await {
            warn!("Progress view ended abnormally: {}", e);
        }
    }

    for job in queue.jobs().await {
        info!("{}", job_line(&job));
    }
    let summary = queue.summary().await;
    info!("{}", summary_line(&summary, false));

    if interrupted {
        bail!("Interrupted before all archives were processed");
    }
    if summary.failed > 0 {
        bail!("{} of {} archives failed", summary.failed, summary.total);
    }
    Ok(())
}
