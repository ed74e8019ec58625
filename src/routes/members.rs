use axum::{extract::State, http::StatusCode, Json};
use serde::Deserialize;
use uuid::Uuid;

use super::{ApiJson, ApiPath, AppState, Authenticated};
use crate::error::{AppError, AppResult};
use crate::model::{Membership, Role};

pub async fn list(
    State(state): State<AppState>,
    Authenticated(caller): Authenticated,
    ApiPath(tenant_id): ApiPath<Uuid>,
) -> AppResult<Json<Vec<Membership>>> {
    state.authorize(&caller, tenant_id, Role::Viewer).await?;
    Ok(Json(state.gate.list_members(tenant_id).await?))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetRoleRequest {
    role: Role,
}

pub async fn set_role(
    State(state): State<AppState>,
    Authenticated(caller): Authenticated,
    ApiPath((tenant_id, user_id)): ApiPath<(Uuid, Uuid)>,
    body: Result<ApiJson<SetRoleRequest>, AppError>,
) -> AppResult<Json<Membership>> {
    let actor = state.authorize(&caller, tenant_id, Role::Admin).await?;
    let ApiJson(body) = body?;
    let membership = state
        .gate
        .set_member_role(&actor, tenant_id, user_id, body.role)
        .await?;
    Ok(Json(membership))
}

pub async fn remove(
    State(state): State<AppState>,
    Authenticated(caller): Authenticated,
    ApiPath((tenant_id, user_id)): ApiPath<(Uuid, Uuid)>,
) -> AppResult<StatusCode> {
    let actor = state.authorize(&caller, tenant_id, Role::Admin).await?;
    state.gate.remove_member(&actor, tenant_id, user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
