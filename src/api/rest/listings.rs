use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::listing::{GeoPoint, Listing};
use crate::models::message::Message;
use crate::models::offer::Offer;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/listings", post(create_listing))
        .route("/listings/:id", get(get_listing))
        .route("/listings/:id/offers", get(list_offers))
        .route("/listings/:id/messages", get(list_messages))
}

#[derive(Deserialize)]
pub struct CreateListingRequest {
    pub owner_id: Uuid,
    pub title: String,
    pub description: String,
    pub pickup: GeoPoint,
    pub dropoff: GeoPoint,
    pub receiver_phone: Option<String>,
}

async fn create_listing(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateListingRequest>,
) -> Result<Json<Listing>, AppError> {
    if payload.title.trim().is_empty() {
        return Err(AppError::BadRequest("title cannot be empty".to_string()));
    }
    if state.store.get_user(&payload.owner_id).is_none() {
        return Err(AppError::BadRequest(format!(
            "owner {} not found",
            payload.owner_id
        )));
    }

    let now = Utc::now();
    let listing = Listing {
        id: Uuid::new_v4(),
        owner_id: payload.owner_id,
        title: payload.title,
        description: payload.description,
        pickup: payload.pickup,
        dropoff: payload.dropoff,
        receiver_phone: payload.receiver_phone,
        is_active: true,
        created_at: now,
        updated_at: now,
    };

    state.store.insert_listing(listing.clone());
    Ok(Json(listing))
}

async fn get_listing(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Listing>, AppError> {
    let listing = state
        .store
        .get_listing(&id)
        .ok_or_else(|| AppError::NotFound(format!("listing {id} not found")))?;
    Ok(Json(listing))
}

async fn list_offers(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<Offer>>, AppError> {
    if state.store.get_listing(&id).is_none() {
        return Err(AppError::NotFound(format!("listing {id} not found")));
    }

    let mut offers = state.store.offers_for_listing(&id);
    offers.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(Json(offers))
}

async fn list_messages(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<Message>>, AppError> {
    if state.store.get_listing(&id).is_none() {
        return Err(AppError::NotFound(format!("listing {id} not found")));
    }

    Ok(Json(state.store.messages_for_listing(&id)))
}
