//! Treesync server
//!
//! Run with: treesync-server --root ./home --remote-url https://peer/functions/v1/sync

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use treesync::{SyncConfig, SyncEngine, SyncServer};

#[derive(Parser, Debug)]
#[command(name = "treesync-server")]
#[command(about = "Bidirectional file-tree sync with a remote peer")]
#[command(version)]
struct Args {
    /// Directory to keep in sync
    #[arg(long, env = "TREESYNC_ROOT", default_value = "./home")]
    root: String,

    /// Sync journal file
    #[arg(long, env = "TREESYNC_JOURNAL", default_value = "./sync-log.json")]
    journal: String,

    /// Remote endpoint receiving outbound batches (unset = outbound disabled)
    #[arg(long, env = "TREESYNC_REMOTE_URL")]
    remote_url: Option<String>,

    /// Bearer credential sent to the remote endpoint
    #[arg(long, env = "TREESYNC_SECRET", hide_env_values = true)]
    secret: Option<String>,

    /// HTTP port for the control surface
    #[arg(long, env = "TREESYNC_PORT", default_value = "3001")]
    port: u16,

    /// Quiet period before a batch is published, in ms
    #[arg(long, env = "TREESYNC_QUIET_PERIOD_MS", default_value = "1000")]
    quiet_period_ms: u64,

    /// How long applied inbound changes suppress watcher echoes, in ms
    #[arg(long, env = "TREESYNC_ECHO_WINDOW_MS", default_value = "2000")]
    echo_window_ms: u64,

    /// Outbound request timeout in seconds
    #[arg(long, env = "TREESYNC_REQUEST_TIMEOUT_SECS", default_value = "30")]
    request_timeout_secs: u64,

    /// Emit logs as JSON
    #[arg(long, env = "TREESYNC_LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn into_config(self) -> SyncConfig {
        SyncConfig {
            root: PathBuf::from(shellexpand::tilde(&self.root).to_string()),
            journal_path: PathBuf::from(shellexpand::tilde(&self.journal).to_string()),
            remote_url: self.remote_url,
            secret: self.secret,
            port: self.port,
            quiet_period_ms: self.quiet_period_ms,
            echo_window_ms: self.echo_window_ms,
            request_timeout_secs: self.request_timeout_secs,
        }
    }
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (json_layer, text_layer) = if json {
        (
            Some(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr)),
            None,
        )
    } else {
        (
            None,
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_ansi(false),
            ),
        )
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.log_json);

    let config = args.into_config();
    let port = config.port;
    tracing::info!(
        root = %config.root.display(),
        journal = %config.journal_path.display(),
        remote = config.remote_endpoint().unwrap_or("<none>"),
        "Starting treesync {}",
        treesync::VERSION
    );

    let engine = SyncEngine::start(config).context("failed to start sync engine")?;
    let watcher = engine.watch().context("failed to watch sync root")?;

    SyncServer::new(engine, port)
        .start(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            tracing::info!("Shutting down");
        })
        .await
        .with_context(|| format!("server on port {} failed", port))?;

    watcher.stop();
    Ok(())
}
