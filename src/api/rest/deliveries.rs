use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::delivery;
use crate::error::AppError;
use crate::models::delivery::Delivery;
use crate::models::user::{Actor, Role};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/deliveries/:id", get(get_delivery))
        .route("/deliveries/:id/pickup", post(pickup))
        .route("/deliveries/:id/location", post(update_location))
        .route("/deliveries/:id/at-door", post(mark_at_door))
        .route("/deliveries/:id/deliver", post(deliver))
        .route("/deliveries/:id/confirm", post(confirm_delivery))
        .route("/deliveries/:id/cancel", post(cancel))
        .route("/deliveries/:id/dispute", post(dispute))
        .route("/deliveries/:id/proof-photos", post(add_proof_photo))
        .route("/listings/:id/delivery", get(get_delivery_for_listing))
        .route("/carriers/:id/deliveries", get(list_for_carrier))
        .route("/owners/:id/deliveries", get(list_for_owner))
}

/// Delivery plus rendered proof-photo URLs. The row itself only carries
/// opaque storage keys.
#[derive(Serialize)]
pub struct DeliveryResponse {
    #[serde(flatten)]
    pub delivery: Delivery,
    pub proof_photo_urls: Vec<String>,
}

fn render(state: &AppState, delivery: Delivery) -> DeliveryResponse {
    let proof_photo_urls = state.media.to_display_urls(&delivery.proof_photos);
    DeliveryResponse {
        delivery,
        proof_photo_urls,
    }
}

#[derive(Deserialize)]
pub struct PickupRequest {
    pub carrier_id: Uuid,
    pub qr_token: Option<String>,
}

#[derive(Deserialize)]
pub struct LocationRequest {
    pub carrier_id: Uuid,
    pub lat: f64,
    pub lng: f64,
}

#[derive(Deserialize)]
pub struct CarrierRequest {
    pub carrier_id: Uuid,
}

#[derive(Deserialize)]
pub struct ConfirmRequest {
    pub carrier_id: Uuid,
    pub id_token: String,
}

#[derive(Deserialize)]
pub struct ActorRequest {
    pub actor_id: Uuid,
    pub role: Role,
}

#[derive(Deserialize)]
pub struct DisputeRequest {
    pub actor_id: Uuid,
    pub role: Role,
    pub reason: Option<String>,
}

#[derive(Deserialize)]
pub struct ProofPhotoRequest {
    pub carrier_id: Uuid,
    pub photo_key: String,
}

async fn get_delivery(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<DeliveryResponse>, AppError> {
    let found = delivery::find_one(&state, id)?;
    Ok(Json(render(&state, found)))
}

async fn get_delivery_for_listing(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<DeliveryResponse>, AppError> {
    let found = delivery::find_by_listing(&state, id)?;
    Ok(Json(render(&state, found)))
}

async fn list_for_carrier(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Json<Vec<DeliveryResponse>> {
    let deliveries = delivery::find_by_carrier(&state, id)
        .into_iter()
        .map(|d| render(&state, d))
        .collect();
    Json(deliveries)
}

async fn list_for_owner(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Json<Vec<DeliveryResponse>> {
    let deliveries = delivery::find_by_owner(&state, id)
        .into_iter()
        .map(|d| render(&state, d))
        .collect();
    Json(deliveries)
}

async fn pickup(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<PickupRequest>,
) -> Result<Json<DeliveryResponse>, AppError> {
    let qr_token = payload.qr_token.unwrap_or_default();
    let updated = delivery::pickup(&state, id, payload.carrier_id, &qr_token).await?;
    Ok(Json(render(&state, updated)))
}

async fn update_location(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<LocationRequest>,
) -> Result<Json<DeliveryResponse>, AppError> {
    let updated =
        delivery::update_location(&state, id, payload.carrier_id, payload.lat, payload.lng).await?;
    Ok(Json(render(&state, updated)))
}

async fn mark_at_door(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<CarrierRequest>,
) -> Result<Json<DeliveryResponse>, AppError> {
    let updated = delivery::mark_at_door(&state, id, payload.carrier_id).await?;
    Ok(Json(render(&state, updated)))
}

async fn deliver(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<CarrierRequest>,
) -> Result<Json<DeliveryResponse>, AppError> {
    let updated = delivery::deliver(&state, id, payload.carrier_id).await?;
    Ok(Json(render(&state, updated)))
}

async fn confirm_delivery(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<ConfirmRequest>,
) -> Result<Json<DeliveryResponse>, AppError> {
    let updated = delivery::confirm_delivery_with_verification(
        &state,
        id,
        payload.carrier_id,
        &payload.id_token,
    )
    .await?;
    Ok(Json(render(&state, updated)))
}

async fn cancel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<ActorRequest>,
) -> Result<Json<DeliveryResponse>, AppError> {
    let actor = Actor {
        id: payload.actor_id,
        role: payload.role,
    };
    let updated = delivery::cancel(&state, id, actor).await?;
    Ok(Json(render(&state, updated)))
}

async fn dispute(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<DisputeRequest>,
) -> Result<Json<DeliveryResponse>, AppError> {
    let actor = Actor {
        id: payload.actor_id,
        role: payload.role,
    };
    let updated = delivery::dispute(&state, id, actor, payload.reason).await?;
    Ok(Json(render(&state, updated)))
}

async fn add_proof_photo(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<ProofPhotoRequest>,
) -> Result<Json<DeliveryResponse>, AppError> {
    let updated =
        delivery::add_proof_photo(&state, id, payload.carrier_id, &payload.photo_key).await?;
    Ok(Json(render(&state, updated)))
}
