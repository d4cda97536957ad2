use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use monitord_core::monitor::{Monitor, MonitorConfig};
use monitord_core::watermark::Barrier;
use monitord_protocol::DbParams;
use monitord_server::{AppState, router};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Control plane for an external runtime-monitoring engine.
#[derive(Debug, Parser)]
#[command(name = "monitord", version)]
struct Cli {
    /// Address to serve the HTTP API on.
    #[arg(long, default_value = "0.0.0.0:8080")]
    addr: SocketAddr,

    /// State directory. Defaults to `~/.monitord`.
    #[arg(long, env = "MONITORD_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Monitoring engine binary to drive.
    #[arg(long, env = "MONITORD_ENGINE", default_value = "monpoly")]
    engine: PathBuf,

    #[arg(long, default_value = "questdb")]
    db_host: String,

    /// HTTP exec port of the store.
    #[arg(long, default_value_t = 9000)]
    db_port_sql: u16,

    /// Influx-line ingestion port of the store.
    #[arg(long, default_value_t = 9009)]
    db_port_influx: u16,

    #[arg(long, default_value = "admin")]
    db_user: String,

    #[arg(long, env = "MONITORD_DB_PASSWORD", default_value = "quest")]
    db_password: String,

    #[arg(long, default_value = "qdb")]
    db_name: String,
}

impl Cli {
    fn data_dir(&self) -> anyhow::Result<PathBuf> {
        if let Some(dir) = &self.data_dir {
            return Ok(dir.clone());
        }
        let home = dirs::home_dir().context("could not determine a home directory")?;
        Ok(home.join(".monitord"))
    }

    fn db_params(&self) -> DbParams {
        DbParams {
            host: self.db_host.clone(),
            port_sql: self.db_port_sql,
            port_influx: self.db_port_influx,
            user: self.db_user.clone(),
            password: self.db_password.clone(),
            database: self.db_name.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let data_dir = cli.data_dir()?;
    let config = MonitorConfig {
        data_dir: data_dir.clone(),
        engine_binary: cli.engine.clone(),
        db: cli.db_params(),
        barrier: Barrier::default(),
    };

    let monitor = Monitor::bootstrap(config)
        .await
        .with_context(|| format!("bootstrapping monitor state in {}", data_dir.display()))?;
    let state = AppState::new(monitor);
    let app = router(state.clone());

    let listener = tokio::net::TcpListener::bind(cli.addr)
        .await
        .with_context(|| format!("binding {}", cli.addr))?;
    info!(addr = %cli.addr, data_dir = %data_dir.display(), "monitord listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    // Let the engine persist its state before the process goes away, so
    // the next start can resume instead of replaying.
    match state.monitor.lock().await.stop(true).await {
        Ok(outcome) => info!(?outcome, "engine stopped on shutdown"),
        Err(err) => warn!(%err, "could not stop the engine cleanly on shutdown"),
    }
    Ok(())
}
