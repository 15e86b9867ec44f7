use anyhow::Result;
use clap::Parser;
use iota_limiter::config::{Cli, Settings};
use iota_limiter::server::Server;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    let cli = Cli::parse();
    let settings = Settings::from_env()
        .map_err(|e| anyhow::anyhow!("failed to load configuration: {e}"))?
        .with_overrides(cli);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("iota_limiter={},tower_http=info", settings.log_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(
        bind = %settings.bind_addr,
        redis = %settings.redis_url,
        policy = %settings.fail_policy,
        "starting iota-limiter"
    );

    let server =
        Server::new(settings).map_err(|e| anyhow::anyhow!("failed to initialise server: {e}"))?;

    server
        .run()
        .await
        .map_err(|e| anyhow::anyhow!("server error: {e}"))?;

    Ok(())
}
