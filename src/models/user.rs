use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Sender,
    Carrier,
    Admin,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub role: Role,
    pub full_name: String,
    pub phone: Option<String>,
    /// Sequential human-readable id, assigned exactly once.
    pub public_id: Option<u64>,
    pub delivered_count: u64,
    pub created_at: DateTime<Utc>,
}

/// The identity a state-changing request acts under.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Actor {
    pub id: Uuid,
    pub role: Role,
}
