use clap::Parser;
use tracing_subscriber::EnvFilter;

use agi_proxy::cli::Cli;
use agi_proxy::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.log_json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }

    let config = Config::resolve(&cli)?;
    tracing::info!(
        agi_name = %config.instance.name,
        port = config.listen.port,
        tls = config.listen.tls.is_some(),
        "Starting agi-proxy"
    );

    agi_proxy::run(config).await?;
    Ok(())
}
