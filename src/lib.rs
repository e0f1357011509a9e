//! Referral commission engine for the dispensary POS: tiers, commission
//! accrual and reversal, ambassador balances and payouts.

mod api;
mod codes;
mod commission;
mod config;
mod engine;
mod error;
mod ledger;
mod money;
mod payout;
mod responses;
mod store;
mod tiers;
mod types;

use anyhow::Context;
use anyhow::Result;
use sqlx::{PgPool, postgres::PgPoolOptions};

pub use api::{AppState, init_router};
pub use codes::{generate_code, generate_link};
pub use commission::{compute_accrual, compute_reversal, compute_void};
pub use config::Config;
pub use engine::CommissionEngine;
pub use error::ReferralError;
pub use money::round2;
pub use store::{AmbassadorUnit, CommissionStore, MemoryStore, PgStore, TierUnit};
pub use tiers::{TierCatalog, default_tiers};
pub use types::*;

/// Initializes the database pool.
pub async fn init_pool(config: &Config) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to Postgres")?;
    Ok(pool)
}

/// Applies the bundled schema migrations.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!()
        .run(pool)
        .await
        .context("Failed to run migrations")?;
    Ok(())
}
