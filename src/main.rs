use tracing_subscriber::EnvFilter;

use chainwatch_enforcer::config::Config;
use chainwatch_enforcer::orchestrator::{self, ShutdownOutcome};

#[tokio::main]
async fn main() -> eyre::Result<()> {
    color_eyre::install()?;

    // Structured logging (RUST_LOG for filtering, LOG_FORMAT=json for JSON lines)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    }

    tracing::info!("Chainwatch enforcer starting");

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());

    let config = Config::load(&config_path)?;
    tracing::info!(
        chain = %config.chain.name,
        token = %config.chain.token_address,
        pending = config.pending.enabled,
        enforcement = config.enforcement.enabled,
        "Configuration loaded from {}",
        config_path
    );

    match orchestrator::run(config).await? {
        ShutdownOutcome::Clean => {
            tracing::info!("Chainwatch enforcer stopped gracefully");
            Ok(())
        }
        ShutdownOutcome::TimedOut(tasks) => {
            tracing::error!(tasks = ?tasks, "Shutdown grace period exceeded");
            std::process::exit(1);
        }
    }
}
