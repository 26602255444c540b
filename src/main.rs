use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use secrecy::SecretString;
use tracing::Level;

use parley_server::{JwtValidator, ServerConfig};
use parley_store::{Database, MessageRepo};
use parley_telemetry::{init_telemetry, LogFormat, TelemetryConfig};

/// Real-time chat relay.
#[derive(Parser)]
#[command(name = "parley", version, about)]
struct Cli {
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    host: String,

    #[arg(long, env = "PORT", default_value_t = 8080)]
    port: u16,

    /// HS256 secret used to verify bearer tokens.
    #[arg(long, env = "JWT_SECRET", hide_env_values = true)]
    jwt_secret: String,

    /// SQLite database for message history.
    #[arg(long, env = "DATABASE_PATH", default_value = "parley.db")]
    database_path: PathBuf,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: Level,

    /// `json` or `pretty`.
    #[arg(long, env = "LOG_FORMAT", default_value = "json")]
    log_format: LogFormat,

    /// Per-session outbound queue capacity.
    #[arg(long, env = "SEND_QUEUE_CAPACITY", default_value_t = 256)]
    send_queue_capacity: usize,

    /// Seconds of peer silence before a connection is dropped.
    #[arg(long, env = "LIVENESS_TIMEOUT_SECS", default_value_t = 60)]
    liveness_timeout_secs: u64,

    /// Allowed CORS origin; any origin when unset.
    #[arg(long, env = "CORS_ORIGIN")]
    cors_origin: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let telemetry = init_telemetry(TelemetryConfig {
        log_level: cli.log_level,
        format: cli.log_format,
        ..Default::default()
    });

    tracing::info!("starting parley");

    let jwt_secret = SecretString::from(cli.jwt_secret);
    if cli.send_queue_capacity == 0 {
        anyhow::bail!("SEND_QUEUE_CAPACITY must be at least 1");
    }

    let db = Database::open(&cli.database_path)
        .with_context(|| format!("failed to open database at {}", cli.database_path.display()))?;
    let repo = MessageRepo::new(db);

    let config = ServerConfig {
        host: cli.host,
        port: cli.port,
        send_queue_capacity: cli.send_queue_capacity,
        liveness_timeout: Duration::from_secs(cli.liveness_timeout_secs),
        cors_origin: cli.cors_origin,
        ..Default::default()
    };

    let handle = parley_server::start(
        config,
        Arc::new(JwtValidator::hs256(&jwt_secret)),
        Arc::new(repo),
        telemetry.metrics(),
    )
    .await
    .context("failed to start server")?;

    tracing::info!(port = handle.port, "parley ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    handle.shutdown().await;
    Ok(())
}
