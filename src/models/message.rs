use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Chat line attached to a listing thread. Emitted as a best-effort side
/// effect of offer submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub listing_id: Uuid,
    pub sender_id: Uuid,
    pub carrier_id: Uuid,
    pub content: String,
    pub from_carrier: bool,
    pub created_at: DateTime<Utc>,
}
