use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use serde::Deserialize;
use uuid::Uuid;

use crate::engine::identity;
use crate::error::AppError;
use crate::models::user::{Role, User};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/users", post(register_user))
        .route("/users/:id", get(get_user))
        .route("/users/:id/public-id", post(ensure_public_id))
}

#[derive(Deserialize)]
pub struct RegisterUserRequest {
    pub role: Role,
    pub full_name: String,
    pub phone: Option<String>,
}

async fn register_user(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<RegisterUserRequest>,
) -> Result<Json<User>, AppError> {
    let user =
        identity::register_user(&state, payload.role, payload.full_name, payload.phone).await?;
    Ok(Json(user))
}

async fn get_user(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<User>, AppError> {
    let user = state
        .store
        .get_user(&id)
        .ok_or_else(|| AppError::NotFound(format!("user {id} not found")))?;
    Ok(Json(user))
}

async fn ensure_public_id(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<User>, AppError> {
    let user = identity::ensure_public_id(&state, id).await?;
    Ok(Json(user))
}
