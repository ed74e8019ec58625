use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use tower::ServiceExt;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use crmcore::auth::{IdentityVerifier, JwtConfig};
use crmcore::config::{JwtSettings, LedgerSettings};
use crmcore::error::{AppError, AppResult};
use crmcore::flags::{
    FeatureFlags, FlagSetting, StaticFlagProvider, CREDIT_WRITES, LOYALTY_REDEMPTION,
};
use crmcore::model::{Identity, Role};
use crmcore::routes::{build_router, AppState};
use crmcore::store::{MembershipStore, MemoryStore};

/// Bearer tokens resolved from a fixed table.
struct StaticTokens(HashMap<String, Identity>);

impl IdentityVerifier for StaticTokens {
    fn verify(&self, token: &str) -> AppResult<Identity> {
        self.0.get(token).cloned().ok_or(AppError::Unauthenticated)
    }
}

struct TestApp {
    router: Router,
    state: AppState,
    store: Arc<MemoryStore>,
    flags: Arc<StaticFlagProvider>,
    tenant: Uuid,
    users: HashMap<&'static str, Uuid>,
}

fn jwt() -> Arc<JwtConfig> {
    Arc::new(
        JwtConfig::new(&JwtSettings {
            secret: "api_test_secret".to_string(),
            ..JwtSettings::default()
        })
        .unwrap(),
    )
}

/// One tenant with a member per role, plus a caller with no membership.
async fn setup() -> TestApp {
    let store = Arc::new(MemoryStore::new());
    let flags = Arc::new(StaticFlagProvider::all_enabled());
    let tenant = Uuid::new_v4();

    let mut tokens = HashMap::new();
    let mut users = HashMap::new();
    for name in ["owner", "admin", "manager", "member", "viewer", "stranger"] {
        let user_id = Uuid::new_v4();
        users.insert(name, user_id);
        tokens.insert(
            format!("{name}-token"),
            Identity {
                user_id,
                email: Some(format!("{name}@example.com")),
            },
        );
        if name != "stranger" {
            store
                .upsert_membership(tenant, user_id, &Role::from(name))
                .await
                .unwrap();
        }
    }

    let state = AppState::new(
        store.clone(),
        jwt(),
        Arc::new(FeatureFlags::new(flags.clone(), Duration::ZERO)),
        LedgerSettings::default(),
    )
    .with_verifier(Arc::new(StaticTokens(tokens)));

    TestApp {
        router: build_router(state.clone(), CorsLayer::new()),
        state,
        store,
        flags,
        tenant,
        users,
    }
}

impl TestApp {
    async fn call(&self, method: Method, uri: &str, token: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    fn url(&self, path: &str) -> String {
        format!("/tenants/{}{path}", self.tenant)
    }

    /// Open an account for `customer` with `limit` and return its id.
    async fn open_account(&self, customer: &str, limit: i64) -> String {
        let (status, body) = self
            .call(
                Method::PUT,
                &self.url("/credit"),
                Some("owner-token"),
                Some(json!({ "customerId": customer, "creditLimit": limit })),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        body["creditId"].as_str().unwrap().to_string()
    }
}

#[tokio::test]
async fn health_and_readiness_need_no_identity() {
    let app = setup().await;
    let (status, body) = app.call(Method::GET, "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    let (status, _) = app.call(Method::GET, "/ready", None, None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn identity_precedes_role_checks() {
    let app = setup().await;
    let uri = app.url("/members");

    let (status, body) = app.call(Method::GET, &uri, None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "authentication required");

    let (status, _) = app.call(Method::GET, &uri, Some("forged"), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = app.call(Method::GET, &uri, Some("stranger-token"), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = app.call(Method::GET, &uri, Some("viewer-token"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 5);
}

#[tokio::test]
async fn credit_writes_follow_the_role_ladder() {
    let app = setup().await;
    let body = json!({ "customerId": "cust-1", "creditLimit": 1000 });

    for token in ["viewer-token", "member-token", "manager-token"] {
        let (status, _) = app
            .call(Method::PUT, &app.url("/credit"), Some(token), Some(body.clone()))
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN, "{token}");
    }
    let (status, _) = app
        .call(Method::PUT, &app.url("/credit"), Some("admin-token"), Some(body))
        .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn summary_reflects_completed_transactions_only() {
    let app = setup().await;
    let credit_id = app.open_account("cust-1", 1000).await;
    let tx_uri = app.url("/credit/transactions");

    let (status, _) = app
        .call(
            Method::POST,
            &tx_uri,
            Some("manager-token"),
            Some(json!({ "creditId": credit_id, "transactionType": "charge", "amount": 400 })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, pending) = app
        .call(
            Method::POST,
            &tx_uri,
            Some("manager-token"),
            Some(json!({ "creditId": credit_id, "transactionType": "charge", "amount": 100, "status": "pending" })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(pending["status"], "pending");

    let (status, summary) = app
        .call(Method::GET, &app.url("/credit?customerId=cust-1"), Some("viewer-token"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(summary["currentBalance"], 400);
    assert_eq!(summary["availableCredit"], 600);
    assert_eq!(summary["recentTransactions"].as_array().unwrap().len(), 2);

    let settle_uri = app.url(&format!(
        "/credit/transactions/{}/settle",
        pending["transactionId"].as_str().unwrap()
    ));
    let (status, settled) = app
        .call(Method::POST, &settle_uri, Some("manager-token"), Some(json!({ "outcome": "completed" })))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(settled["status"], "completed");

    let (_, summary) = app
        .call(Method::GET, &app.url(&format!("/credit?creditId={credit_id}")), Some("viewer-token"), None)
        .await;
    assert_eq!(summary["currentBalance"], 500);
}

#[tokio::test]
async fn repeated_idempotency_key_returns_the_first_transaction() {
    let app = setup().await;
    let credit_id = app.open_account("cust-1", 1000).await;
    let request = json!({
        "creditId": credit_id,
        "transactionType": "charge",
        "amount": 250,
        "idempotencyKey": "order-42",
    });

    let (first_status, first) = app
        .call(Method::POST, &app.url("/credit/transactions"), Some("manager-token"), Some(request.clone()))
        .await;
    let (second_status, second) = app
        .call(Method::POST, &app.url("/credit/transactions"), Some("manager-token"), Some(request))
        .await;
    assert_eq!(first_status, StatusCode::CREATED);
    assert_eq!(second_status, StatusCode::CREATED);
    assert_eq!(first["transactionId"], second["transactionId"]);
    assert_eq!(app.store.transaction_count().await, 1);
}

#[tokio::test]
async fn over_limit_charge_is_rejected_and_payments_reduce_balance() {
    let app = setup().await;
    let credit_id = app.open_account("cust-1", 500).await;
    let uri = app.url("/credit/transactions");

    let (status, body) = app
        .call(
            Method::POST,
            &uri,
            Some("manager-token"),
            Some(json!({ "creditId": credit_id, "transactionType": "charge", "amount": 501 })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["details"][0]["field"], "amount");

    let (status, payment) = app
        .call(
            Method::POST,
            &uri,
            Some("manager-token"),
            Some(json!({ "creditId": credit_id, "transactionType": "payment", "amount": 120 })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(payment["amount"], -120);
}

#[tokio::test]
async fn malformed_bodies_and_queries_are_invalid_input() {
    let app = setup().await;
    let credit_id = app.open_account("cust-1", 500).await;
    let uri = app.url("/credit/transactions");

    let (status, _) = app
        .call(
            Method::POST,
            &uri,
            Some("manager-token"),
            Some(json!({ "creditId": credit_id, "transactionType": "gift", "amount": 5 })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = app
        .call(
            Method::POST,
            &uri,
            Some("manager-token"),
            Some(json!({ "creditId": credit_id, "transactionType": "charge", "amount": 5, "extra": true })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = app
        .call(Method::GET, &format!("{uri}?offset=-1"), Some("viewer-token"), None)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["details"][0]["field"], "offset");

    let (status, _) = app
        .call(Method::GET, &format!("{uri}?creditId=nope"), Some("viewer-token"), None)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn role_checks_precede_body_validation() {
    let app = setup().await;
    let uri = app.url("/credit/transactions");
    let wrong_shape = json!({ "amount": "lots" });

    let (status, _) = app
        .call(Method::POST, &uri, Some("stranger-token"), Some(wrong_shape.clone()))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, _) = app
        .call(Method::POST, &uri, Some("viewer-token"), Some(wrong_shape.clone()))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, _) = app
        .call(Method::POST, &uri, Some("manager-token"), Some(wrong_shape))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let request = Request::builder()
        .method(Method::PUT)
        .uri(app.url(&format!("/members/{}", app.users["viewer"])))
        .header(header::AUTHORIZATION, "Bearer stranger-token")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn page_size_is_clamped() {
    let app = setup().await;
    let credit_id = app.open_account("cust-1", 10_000).await;
    for i in 0..3 {
        let (status, _) = app
            .call(
                Method::POST,
                &app.url("/credit/transactions"),
                Some("manager-token"),
                Some(json!({ "creditId": credit_id, "transactionType": "fee", "amount": 10 + i })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
    }

    let (status, page) = app
        .call(
            Method::GET,
            &app.url("/credit/transactions?limit=500"),
            Some("viewer-token"),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["limit"], 100);
    assert_eq!(page["transactions"].as_array().unwrap().len(), 3);
    assert_eq!(page["transactions"][0]["amount"], 12);

    let (_, page) = app
        .call(
            Method::GET,
            &app.url("/credit/transactions?limit=0&type=fee"),
            Some("viewer-token"),
            None,
        )
        .await;
    assert_eq!(page["limit"], 1);
    assert_eq!(page["transactions"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn reversal_restores_the_balance() {
    let app = setup().await;
    let credit_id = app.open_account("cust-1", 1000).await;
    let (_, charge) = app
        .call(
            Method::POST,
            &app.url("/credit/transactions"),
            Some("manager-token"),
            Some(json!({ "creditId": credit_id, "transactionType": "charge", "amount": 300 })),
        )
        .await;
    let reverse_uri = app.url(&format!(
        "/credit/transactions/{}/reverse",
        charge["transactionId"].as_str().unwrap()
    ));

    let (status, _) = app
        .call(Method::POST, &reverse_uri, Some("manager-token"), Some(json!({})))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, compensating) = app
        .call(Method::POST, &reverse_uri, Some("admin-token"), Some(json!({ "reason": "refund" })))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(compensating["amount"], -300);
    assert_eq!(compensating["reversalOf"], charge["transactionId"]);

    let (status, _) = app
        .call(Method::POST, &reverse_uri, Some("admin-token"), Some(json!({})))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (_, summary) = app
        .call(Method::GET, &app.url("/credit"), Some("viewer-token"), None)
        .await;
    assert_eq!(summary["currentBalance"], 0);
}

#[tokio::test]
async fn redeem_reports_insufficient_points() {
    let app = setup().await;
    let (status, accrued) = app
        .call(
            Method::POST,
            &app.url("/loyalty/accrue"),
            Some("member-token"),
            Some(json!({ "customerId": "cust-9", "points": 100 })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(accrued["balance"], 100);

    let redeem = app.url("/loyalty/redeem");
    let (status, body) = app
        .call(Method::POST, &redeem, Some("member-token"), Some(json!({ "customerId": "cust-9", "points": 150 })))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Insufficient points");

    let (status, body) = app
        .call(Method::POST, &redeem, Some("member-token"), Some(json!({ "customerId": "cust-9", "points": 40 })))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "customerId": "cust-9", "balance": 60 }));

    let (status, summary) = app
        .call(Method::GET, &app.url("/loyalty/cust-9"), Some("viewer-token"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(summary["balance"], 60);

    let (status, _) = app
        .call(Method::POST, &redeem, Some("viewer-token"), Some(json!({ "customerId": "cust-9", "points": 1 })))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn kill_switches_refuse_guarded_writes() {
    let app = setup().await;
    let credit_id = app.open_account("cust-1", 1000).await;
    app.call(
        Method::POST,
        &app.url("/loyalty/accrue"),
        Some("member-token"),
        Some(json!({ "customerId": "cust-1", "points": 10 })),
    )
    .await;

    app.flags.set(CREDIT_WRITES, FlagSetting::killed());
    app.flags.set(LOYALTY_REDEMPTION, FlagSetting::killed());

    let (status, _) = app
        .call(
            Method::POST,
            &app.url("/credit/transactions"),
            Some("manager-token"),
            Some(json!({ "creditId": credit_id, "transactionType": "charge", "amount": 5 })),
        )
        .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    let (status, _) = app
        .call(
            Method::POST,
            &app.url("/loyalty/redeem"),
            Some("member-token"),
            Some(json!({ "customerId": "cust-1", "points": 5 })),
        )
        .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    // reads stay up
    let (status, _) = app
        .call(Method::GET, &app.url("/credit"), Some("viewer-token"), None)
        .await;
    assert_eq!(status, StatusCode::OK);

    app.flags.set(LOYALTY_REDEMPTION, FlagSetting::on());
    let (status, _) = app
        .call(
            Method::POST,
            &app.url("/loyalty/redeem"),
            Some("member-token"),
            Some(json!({ "customerId": "cust-1", "points": 5 })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn membership_management_guards_owners() {
    let app = setup().await;
    let owner = app.users["owner"];
    let newcomer = Uuid::new_v4();

    let (status, _) = app
        .call(
            Method::PUT,
            &app.url(&format!("/members/{newcomer}")),
            Some("admin-token"),
            Some(json!({ "role": "owner" })),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = app
        .call(
            Method::PUT,
            &app.url(&format!("/members/{newcomer}")),
            Some("admin-token"),
            Some(json!({ "role": "manager" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["role"], "manager");

    let (status, _) = app
        .call(Method::DELETE, &app.url(&format!("/members/{owner}")), Some("owner-token"), None)
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = app
        .call(Method::DELETE, &app.url(&format!("/members/{newcomer}")), Some("admin-token"), None)
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn login_issues_a_token_the_router_accepts() {
    let store = Arc::new(MemoryStore::new());
    let tenant = Uuid::new_v4();
    let state = AppState::new(
        store.clone(),
        jwt(),
        Arc::new(FeatureFlags::new(
            Arc::new(StaticFlagProvider::all_enabled()),
            Duration::from_secs(30),
        )),
        LedgerSettings::default(),
    );
    let user = state
        .auth
        .register_user("clerk@example.com", "hunter22", "Clerk")
        .await
        .unwrap();
    store
        .upsert_membership(tenant, user.user_id, &Role::Viewer)
        .await
        .unwrap();
    let app = TestApp {
        router: build_router(state.clone(), CorsLayer::new()),
        state,
        store,
        flags: Arc::new(StaticFlagProvider::default()),
        tenant,
        users: HashMap::new(),
    };

    let (status, _) = app
        .call(
            Method::POST,
            "/auth/login",
            None,
            Some(json!({ "email": "clerk@example.com", "password": "wrong" })),
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = app
        .call(
            Method::POST,
            "/auth/login",
            None,
            Some(json!({ "email": "clerk@example.com", "password": "hunter22" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let token = body["token"].as_str().unwrap().to_string();

    let (status, members) = app
        .call(Method::GET, &app.url("/members"), Some(&token), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(members[0]["userId"], user.user_id.to_string());
    assert!(app.state.verifier.verify(&token).is_ok());
}
