use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryEventKind {
    Offer,
    OfferAccepted,
    DeliveryCancelled,
    DeliveryAtDoor,
    DeliveryDelivered,
    DeliveryDisputed,
}

/// Typed event emitted after every state-changing commit.
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryEvent {
    pub kind: DeliveryEventKind,
    pub delivery_id: Option<Uuid>,
    pub listing_id: Uuid,
    pub recipients: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    #[serde(flatten)]
    pub event: DeliveryEvent,
    pub title: String,
    pub body: String,
}

/// Outbound notification port. Best-effort by contract: implementations
/// swallow their own failures so a provider outage never blocks a state
/// transition.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: DeliveryEvent, title: &str, body: &str);
}

/// Fans notifications out over the process-wide broadcast channel consumed
/// by the websocket handler.
pub struct BroadcastNotifier {
    tx: broadcast::Sender<Notification>,
}

impl BroadcastNotifier {
    pub fn new(tx: broadcast::Sender<Notification>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl Notifier for BroadcastNotifier {
    async fn notify(&self, event: DeliveryEvent, title: &str, body: &str) {
        let notification = Notification {
            event,
            title: title.to_string(),
            body: body.to_string(),
        };

        if self.tx.send(notification).is_err() {
            debug!("notification dropped: no subscribers connected");
        }
    }
}
