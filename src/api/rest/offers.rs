use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use serde::Deserialize;
use uuid::Uuid;

use crate::engine::offers;
use crate::error::AppError;
use crate::models::offer::Offer;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/offers", post(submit_offer))
        .route("/offers/:id", get(get_offer))
        .route("/offers/:id/accept", post(accept_offer))
        .route("/offers/:id/reject", post(reject_offer))
}

#[derive(Deserialize)]
pub struct SubmitOfferRequest {
    pub listing_id: Uuid,
    pub proposer_id: Uuid,
    pub amount: f64,
    pub message: Option<String>,
}

#[derive(Deserialize)]
pub struct ResolveOfferRequest {
    pub owner_id: Uuid,
}

async fn submit_offer(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<SubmitOfferRequest>,
) -> Result<Json<Offer>, AppError> {
    let offer = offers::submit_offer(
        &state,
        payload.listing_id,
        payload.proposer_id,
        payload.amount,
        payload.message,
    )
    .await?;
    Ok(Json(offer))
}

async fn get_offer(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Offer>, AppError> {
    let offer = state
        .store
        .get_offer(&id)
        .ok_or_else(|| AppError::NotFound(format!("offer {id} not found")))?;
    Ok(Json(offer))
}

async fn accept_offer(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<ResolveOfferRequest>,
) -> Result<Json<Offer>, AppError> {
    let offer = offers::accept_offer(&state, id, payload.owner_id).await?;
    Ok(Json(offer))
}

async fn reject_offer(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<ResolveOfferRequest>,
) -> Result<Json<Offer>, AppError> {
    let offer = offers::reject_offer(&state, id, payload.owner_id).await?;
    Ok(Json(offer))
}
