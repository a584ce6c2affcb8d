use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Listing {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub title: String,
    pub description: String,
    pub pickup: GeoPoint,
    pub dropoff: GeoPoint,
    /// Receiver phone at the dropoff, matched against the identity token at
    /// delivery confirmation.
    pub receiver_phone: Option<String>,
    /// Admin moderation flag: hides the listing from public feeds.
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
