use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ApiJson, ApiPath, AppState, Authenticated};
use crate::error::{AppError, AppResult};
use crate::flags::LOYALTY_REDEMPTION;
use crate::loyalty::LoyaltySummary;
use crate::model::{LoyaltyEntry, Role};

pub async fn balance(
    State(state): State<AppState>,
    Authenticated(caller): Authenticated,
    ApiPath((tenant_id, customer_id)): ApiPath<(Uuid, String)>,
) -> AppResult<Json<LoyaltySummary>> {
    state.authorize(&caller, tenant_id, Role::Viewer).await?;
    Ok(Json(state.loyalty.balance(tenant_id, &customer_id).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AccrueRequest {
    customer_id: String,
    points: i64,
    reason: Option<String>,
    idempotency_key: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccrueResponse {
    entry: LoyaltyEntry,
    balance: i64,
}

pub async fn accrue(
    State(state): State<AppState>,
    Authenticated(caller): Authenticated,
    ApiPath(tenant_id): ApiPath<Uuid>,
    body: Result<ApiJson<AccrueRequest>, AppError>,
) -> AppResult<(StatusCode, Json<AccrueResponse>)> {
    state.authorize(&caller, tenant_id, Role::Member).await?;
    let ApiJson(body) = body?;
    let posted = state
        .loyalty
        .accrue(
            tenant_id,
            &body.customer_id,
            body.points,
            body.reason,
            body.idempotency_key,
        )
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(AccrueResponse {
            entry: posted.entry,
            balance: posted.balance,
        }),
    ))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RedeemRequest {
    customer_id: String,
    points: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RedeemResponse {
    customer_id: String,
    balance: i64,
}

pub async fn redeem(
    State(state): State<AppState>,
    Authenticated(caller): Authenticated,
    ApiPath(tenant_id): ApiPath<Uuid>,
    body: Result<ApiJson<RedeemRequest>, AppError>,
) -> AppResult<Json<RedeemResponse>> {
    state.authorize(&caller, tenant_id, Role::Member).await?;
    state.require_feature(LOYALTY_REDEMPTION).await?;
    let ApiJson(body) = body?;
    let balance = state
        .loyalty
        .redeem(tenant_id, &body.customer_id, body.points)
        .await?;
    Ok(Json(RedeemResponse {
        customer_id: body.customer_id.trim().to_string(),
        balance,
    }))
}
