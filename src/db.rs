use anyhow::Result;
use sqlx::{postgres::{PgPoolOptions, PgConnectOptions}, PgPool, Postgres, Transaction, Connection, PgConnection};
use std::str::FromStr;
use tracing::info;
use uuid::Uuid;

use crate::config::DatabaseSettings;

/// Initialize the database connection pool for the application
pub async fn init_pool(settings: &DatabaseSettings) -> Result<PgPool> {
    info!("Initializing application database connection pool");

    let options = PgConnectOptions::from_str(&settings.url)?;

    let pool = PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .connect_with(options)
        .await?;

    info!(max_connections = settings.max_connections, "Application database connection pool initialized");
    Ok(pool)
}

/// Create a single admin database connection for migrations
pub async fn create_admin_connection(admin_url: &str) -> Result<PgConnection> {
    info!("Creating admin database connection for migrations");

    let options = PgConnectOptions::from_str(admin_url)?;
    let conn = PgConnection::connect_with(&options).await?;

    info!("Admin database connection established");
    Ok(conn)
}

/// Apply pending migrations over a dedicated admin connection, then close it
pub async fn run_migrations(admin_url: &str) -> Result<()> {
    let mut admin_conn = create_admin_connection(admin_url).await?;

    info!("Running database migrations with admin privileges");
    sqlx::migrate!("./sql/migrations").run(&mut admin_conn).await?;
    info!("Migrations completed successfully");

    let _ = admin_conn.close().await;
    Ok(())
}

/// Set the tenant context for a transaction; row-level security reads it
pub async fn set_transaction_tenant_context(tx: &mut Transaction<'_, Postgres>, tenant_id: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT set_tenant_context($1)")
        .bind(tenant_id)
        .execute(&mut **tx)
        .await?;

    Ok(())
}
