use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    PickupPending,
    InTransit,
    AtDoor,
    Delivered,
    Cancelled,
    Disputed,
}

impl DeliveryStatus {
    /// The full transition table. Every transition operation checks this
    /// before mutating; nothing else defines legality.
    pub fn can_transition_to(self, next: DeliveryStatus) -> bool {
        use DeliveryStatus::*;

        matches!(
            (self, next),
            (PickupPending, InTransit | Cancelled)
                | (InTransit, AtDoor | Delivered | Cancelled)
                | (AtDoor, Delivered | Cancelled)
                | (Delivered, Disputed)
        )
    }

    /// No sender/carrier-driven transition leaves these states. A delivered
    /// delivery can still be disputed, which the table above allows.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DeliveryStatus::Delivered | DeliveryStatus::Cancelled | DeliveryStatus::Disputed
        )
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeliveryStatus::PickupPending => "pickup_pending",
            DeliveryStatus::InTransit => "in_transit",
            DeliveryStatus::AtDoor => "at_door",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Cancelled => "cancelled",
            DeliveryStatus::Disputed => "disputed",
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delivery {
    pub id: Uuid,
    pub listing_id: Uuid,
    pub carrier_id: Option<Uuid>,
    pub status: DeliveryStatus,
    /// Sender shows this as a QR code; the carrier must scan and echo it to
    /// authorize pickup.
    pub pickup_qr_token: Option<String>,
    /// Live tracking is only active after a QR-validated pickup.
    pub tracking_enabled: bool,
    pub last_lat: Option<f64>,
    pub last_lng: Option<f64>,
    pub last_location_at: Option<DateTime<Utc>>,
    /// Opaque storage keys; display URLs are built by the media port.
    pub proof_photos: Vec<String>,
    pub dispute_reason: Option<String>,
    pub pickup_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub disputed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
