use std::net::SocketAddr;
use std::sync::Arc;

use ambassador_commissions::{AppState, CommissionEngine, Config, PgStore, init_pool, init_router, run_migrations};
use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("Failed to load configuration")?;
    let pool = init_pool(&config).await?;
    run_migrations(&pool).await?;

    let engine = CommissionEngine::new(Arc::new(PgStore::new(pool)), config.referral_base_url.clone());
    let addr: SocketAddr = ([0, 0, 0, 0], config.server_port).into();
    let app = init_router(AppState { engine, config });

    let listener = TcpListener::bind(addr).await?;
    info!("listening on {addr}");
    axum::serve(listener, app).await?;
    Ok(())
}
