use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use dotenv::dotenv;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crmcore::auth::{AuthService, JwtConfig};
use crmcore::config::{Settings, CONFIG_PATH_VAR};
use crmcore::db;
use crmcore::flags::{FeatureFlags, FileFlagProvider};
use crmcore::model::Role;
use crmcore::routes::{build_router, AppState};
use crmcore::store::{PgStore, Store};

const DEMO_TENANT: &str = "Demo Tenant";
const DEMO_OWNER_EMAIL: &str = "owner@example.com";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize environment variables from .env file
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,tower_http=info")),
        )
        .init();

    info!("Starting crmcore");
    let settings = Settings::load()?;

    db::run_migrations(settings.admin_database_url()).await?;
    let pool = db::init_pool(&settings.database).await?;
    let store: Arc<dyn Store> = Arc::new(PgStore::new(pool));

    let flags = Arc::new(FeatureFlags::new(
        Arc::new(FileFlagProvider::new(env::var(CONFIG_PATH_VAR).ok())),
        Duration::from_secs(settings.flags.refresh_interval_secs),
    ));
    flags.refresh().await;

    let jwt = Arc::new(JwtConfig::new(&settings.jwt)?);
    let state = AppState::new(store.clone(), jwt, flags, settings.ledger);

    if settings.seed_demo {
        seed_demo(store.as_ref(), &state.auth).await?;
    }

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let app = build_router(state, cors);

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(%addr, "Listening");
    axum::serve(listener, app).await?;
    Ok(())
}

/// Ensure a demo tenant with one owner exists.
async fn seed_demo(store: &dyn Store, auth: &AuthService) -> Result<()> {
    let tenant = match store.find_tenant_by_name(DEMO_TENANT).await? {
        Some(tenant) => {
            info!("Demo tenant already exists");
            tenant
        }
        None => {
            info!("Creating demo tenant");
            store.insert_tenant(DEMO_TENANT).await?
        }
    };
    info!(tenant_id = %tenant.tenant_id, "Demo tenant ready");

    let owner = match store.find_user_by_email(DEMO_OWNER_EMAIL).await? {
        Some(user) => user,
        None => {
            let password =
                env::var("DEMO_OWNER_PASSWORD").unwrap_or_else(|_| "owner_password".to_string());
            auth.register_user(DEMO_OWNER_EMAIL, &password, "Demo Owner").await?
        }
    };
    store
        .upsert_membership(tenant.tenant_id, owner.user_id, &Role::Owner)
        .await?;
    info!(user_id = %owner.user_id, "Demo owner ready");
    Ok(())
}
