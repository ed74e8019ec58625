use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{ApiJson, ApiPath, ApiQuery, AppState, Authenticated};
use crate::credit::{AccountChanges, AccountSelector, AccountSummary, NewTransaction};
use crate::error::{AppError, AppResult};
use crate::flags::CREDIT_WRITES;
use crate::model::{CreditAccount, CreditStatus, CreditTransaction, Role, TransactionStatus, TransactionType};
use crate::store::TransactionFilter;

fn parse_field<T: std::str::FromStr>(field: &str, raw: Option<&str>) -> AppResult<Option<T>> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(s) => s
            .parse()
            .map(Some)
            .map_err(|_| AppError::invalid(field, format!("invalid value: {s}"))),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryParams {
    credit_id: Option<String>,
    customer_id: Option<String>,
}

pub async fn get_summary(
    State(state): State<AppState>,
    Authenticated(caller): Authenticated,
    ApiPath(tenant_id): ApiPath<Uuid>,
    ApiQuery(params): ApiQuery<SummaryParams>,
) -> AppResult<Json<AccountSummary>> {
    state.authorize(&caller, tenant_id, Role::Viewer).await?;
    let selector = match parse_field::<Uuid>("creditId", params.credit_id.as_deref())? {
        Some(credit_id) => AccountSelector::Credit(credit_id),
        None => match params.customer_id.filter(|c| !c.trim().is_empty()) {
            Some(customer_id) => AccountSelector::Customer(customer_id),
            None => AccountSelector::Sole,
        },
    };
    Ok(Json(state.credit.get_account_summary(tenant_id, &selector).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UpsertAccountRequest {
    customer_id: Option<String>,
    credit_limit: Option<i64>,
    status: Option<CreditStatus>,
    payment_method_ref: Option<String>,
}

pub async fn upsert_account(
    State(state): State<AppState>,
    Authenticated(caller): Authenticated,
    ApiPath(tenant_id): ApiPath<Uuid>,
    body: Result<ApiJson<UpsertAccountRequest>, AppError>,
) -> AppResult<Json<CreditAccount>> {
    state.authorize(&caller, tenant_id, Role::Admin).await?;
    state.require_feature(CREDIT_WRITES).await?;
    let ApiJson(body) = body?;
    let account = state
        .credit
        .create_or_update_account(
            tenant_id,
            AccountChanges {
                customer_id: body.customer_id,
                credit_limit: body.credit_limit,
                status: body.status,
                payment_method_ref: body.payment_method_ref,
            },
        )
        .await?;
    Ok(Json(account))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListParams {
    credit_id: Option<String>,
    status: Option<String>,
    #[serde(rename = "type")]
    transaction_type: Option<String>,
    limit: Option<String>,
    offset: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionPage {
    transactions: Vec<CreditTransaction>,
    limit: i64,
    offset: i64,
}

pub async fn list_transactions(
    State(state): State<AppState>,
    Authenticated(caller): Authenticated,
    ApiPath(tenant_id): ApiPath<Uuid>,
    ApiQuery(params): ApiQuery<ListParams>,
) -> AppResult<Json<TransactionPage>> {
    state.authorize(&caller, tenant_id, Role::Viewer).await?;
    let filter = TransactionFilter {
        credit_id: parse_field("creditId", params.credit_id.as_deref())?,
        status: parse_field::<TransactionStatus>("status", params.status.as_deref())?,
        transaction_type: parse_field::<TransactionType>("type", params.transaction_type.as_deref())?,
    };
    let page = state.credit.page(
        parse_field("limit", params.limit.as_deref())?,
        parse_field("offset", params.offset.as_deref())?,
    )?;
    let transactions = state.credit.list_transactions(tenant_id, &filter, page).await?;
    Ok(Json(TransactionPage {
        transactions,
        limit: page.limit,
        offset: page.offset,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RecordTransactionRequest {
    credit_id: Uuid,
    #[serde(alias = "type")]
    transaction_type: TransactionType,
    amount: i64,
    description: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    due_date: Option<OffsetDateTime>,
    idempotency_key: Option<String>,
    status: Option<TransactionStatus>,
}

/// 201 whether the transaction was just created or replayed from its key.
pub async fn record_transaction(
    State(state): State<AppState>,
    Authenticated(caller): Authenticated,
    ApiPath(tenant_id): ApiPath<Uuid>,
    body: Result<ApiJson<RecordTransactionRequest>, AppError>,
) -> AppResult<(StatusCode, Json<CreditTransaction>)> {
    state.authorize(&caller, tenant_id, Role::Manager).await?;
    state.require_feature(CREDIT_WRITES).await?;
    let ApiJson(body) = body?;
    let outcome = state
        .credit
        .record_transaction(
            tenant_id,
            NewTransaction {
                credit_id: body.credit_id,
                transaction_type: body.transaction_type,
                amount: body.amount,
                description: body.description,
                due_date: body.due_date,
                idempotency_key: body.idempotency_key,
                status: body.status,
            },
        )
        .await?;
    Ok((StatusCode::CREATED, Json(outcome.into_transaction())))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SettleRequest {
    outcome: TransactionStatus,
}

pub async fn settle(
    State(state): State<AppState>,
    Authenticated(caller): Authenticated,
    ApiPath((tenant_id, transaction_id)): ApiPath<(Uuid, Uuid)>,
    body: Result<ApiJson<SettleRequest>, AppError>,
) -> AppResult<Json<CreditTransaction>> {
    state.authorize(&caller, tenant_id, Role::Manager).await?;
    state.require_feature(CREDIT_WRITES).await?;
    let ApiJson(body) = body?;
    let settled = state
        .credit
        .settle_transaction(tenant_id, transaction_id, body.outcome)
        .await?;
    Ok(Json(settled))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReverseRequest {
    reason: Option<String>,
}

pub async fn reverse(
    State(state): State<AppState>,
    Authenticated(caller): Authenticated,
    ApiPath((tenant_id, transaction_id)): ApiPath<(Uuid, Uuid)>,
    body: Result<ApiJson<ReverseRequest>, AppError>,
) -> AppResult<(StatusCode, Json<CreditTransaction>)> {
    state.authorize(&caller, tenant_id, Role::Admin).await?;
    state.require_feature(CREDIT_WRITES).await?;
    let ApiJson(body) = body?;
    let compensating = state
        .credit
        .reverse_transaction(tenant_id, transaction_id, body.reason)
        .await?;
    Ok((StatusCode::CREATED, Json(compensating)))
}
