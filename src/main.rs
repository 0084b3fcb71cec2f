use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use turnkey::config::Config;
use turnkey::domain::credential::StaticCredentialStore;
use turnkey::infrastructure::logging::init_logging;
use turnkey::infrastructure::metrics::init_metrics;
use turnkey::infrastructure::protocols::turn::TurnServer;

#[derive(Parser)]
#[command(name = "turnkey-server")]
#[command(about = "TURN relay server")]
struct Args {
    /// Configuration file path (TOML); TURNKEY__* variables override it
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = Config::load(args.config.as_deref()).context("loading configuration")?;
    let _log_guard = init_logging(&config.log);

    info!("Starting turnkey {}", env!("CARGO_PKG_VERSION"));

    if let Some(listen) = config.metrics.listen {
        init_metrics(listen).context("starting metrics exporter")?;
        info!("Prometheus metrics on http://{}/metrics", listen);
    }

    let credentials = StaticCredentialStore::from_users(config.turn.realm.clone(), &config.turn.users)
        .context("parsing users")?;
    if credentials.is_empty() {
        warn!("No users configured, every allocation will be rejected");
    } else {
        info!("Loaded {} user(s) for realm {}", credentials.len(), credentials.realm());
    }

    let mut server = TurnServer::start(&config.turn, Arc::new(credentials))
        .await
        .context("starting TURN server")?;
    info!("TURN server listening on {} ({})", server.local_addr(), server.transport());

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    server.shutdown().await;
    info!("TURN server stopped");

    Ok(())
}
