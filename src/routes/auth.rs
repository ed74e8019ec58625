use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ApiJson, AppState};
use crate::error::AppResult;

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    email: String,
    password: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    user_id: Uuid,
    token: String,
}

pub async fn login(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<LoginRequest>,
) -> AppResult<Json<LoginResponse>> {
    let (identity, token) = state.auth.authenticate(&body.email, &body.password).await?;
    Ok(Json(LoginResponse {
        user_id: identity.user_id,
        token,
    }))
}
