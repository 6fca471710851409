use anyhow::Context;
use canvas_web_proxy::{start_proxy_server, AppState, ProxyConfig, ServerArgs};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "canvas_web_proxy=info,tower_http=info";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env.local wins over .env; neither has to exist.
    dotenvy::from_filename(".env.local").ok();
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    let args = ServerArgs::parse();
    let config = ProxyConfig::try_from(args).context("invalid configuration")?;
    let bind_addr = config.bind_addr;

    info!(
        public_origin = %config.public_origin,
        whitelist = ?config.allow_list.hosts(),
        max_body_bytes = config.max_body_bytes,
        "starting canvas web proxy"
    );

    let state = AppState::new(config).context("failed to build HTTP clients")?;
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", bind_addr))?;

    info!("🚀 listening on http://{}", bind_addr);
    start_proxy_server(state, listener).await?;
    Ok(())
}
