//! HTTP surface. Every tenant route authenticates, then passes the role gate,
//! then (for guarded writes) the feature flag, before touching a ledger.

mod auth;
mod credit;
mod extract;
mod health;
mod loyalty;
mod members;

use std::sync::Arc;

use axum::{
    routing::{get, post, put},
    Router,
};
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnFailure, DefaultOnResponse, TraceLayer},
};
use tracing::{Level, warn};
use uuid::Uuid;

use crate::auth::{AuthService, IdentityVerifier, JwtConfig};
use crate::authz::RoleGate;
use crate::config::LedgerSettings;
use crate::credit::CreditLedger;
use crate::error::{AppError, AppResult};
use crate::flags::FeatureFlags;
use crate::loyalty::LoyaltyLedger;
use crate::model::{Identity, Role};
use crate::store::Store;

pub use extract::{ApiJson, ApiPath, ApiQuery, Authenticated};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub gate: Arc<RoleGate>,
    pub credit: Arc<CreditLedger>,
    pub loyalty: Arc<LoyaltyLedger>,
    pub flags: Arc<FeatureFlags>,
    pub auth: Arc<AuthService>,
    pub verifier: Arc<dyn IdentityVerifier>,
}

impl AppState {
    /// Wire the services over one store. Bearer tokens are verified with
    /// `jwt` unless [`AppState::with_verifier`] replaces it.
    pub fn new(
        store: Arc<dyn Store>,
        jwt: Arc<JwtConfig>,
        flags: Arc<FeatureFlags>,
        ledger: LedgerSettings,
    ) -> Self {
        Self {
            gate: Arc::new(RoleGate::new(store.clone())),
            credit: Arc::new(CreditLedger::new(store.clone(), ledger)),
            loyalty: Arc::new(LoyaltyLedger::new(store.clone(), ledger.recent_transactions)),
            auth: Arc::new(AuthService::new(store.clone(), jwt.clone())),
            verifier: jwt,
            flags,
            store,
        }
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn IdentityVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    async fn authorize(&self, caller: &Identity, tenant_id: Uuid, min: Role) -> AppResult<Role> {
        self.gate.require_role(Some(caller), tenant_id, min).await
    }

    async fn require_feature(&self, name: &str) -> AppResult<()> {
        if self.flags.allows(name).await {
            return Ok(());
        }
        warn!(feature = name, "request refused by feature gate");
        Err(AppError::unavailable(format!("{name} is currently disabled")))
    }
}

/// Build the full application router
pub fn build_router(state: AppState, cors: CorsLayer) -> Router {
    let tenant = Router::new()
        .route("/credit", get(credit::get_summary).put(credit::upsert_account))
        .route(
            "/credit/transactions",
            get(credit::list_transactions).post(credit::record_transaction),
        )
        .route("/credit/transactions/:transaction_id/settle", post(credit::settle))
        .route("/credit/transactions/:transaction_id/reverse", post(credit::reverse))
        .route("/loyalty/accrue", post(loyalty::accrue))
        .route("/loyalty/redeem", post(loyalty::redeem))
        .route("/loyalty/:customer_id", get(loyalty::balance))
        .route("/members", get(members::list))
        .route("/members/:user_id", put(members::set_role).delete(members::remove));

    Router::new()
        .route("/health", get(health::health))
        .route("/ready", get(health::ready))
        .route("/auth/login", post(auth::login))
        .nest("/tenants/:tenant_id", tenant)
        .with_state(state)
        .layer(cors)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO))
                .on_failure(DefaultOnFailure::new().level(Level::ERROR)),
        )
}
