use clap::Parser;
use tracing::info;

use mchat::chat::config::Args;
use mchat::chat::server::Server;
use mchat::chat::shutdown;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let config = Args::parse().into_config()?;
    info!(version = env!("CARGO_PKG_VERSION"), "mchat starting");

    let server = Server::bind(config).await?;
    server.run(shutdown::signal_token()?).await?;

    info!("mchat stopped");
    Ok(())
}
