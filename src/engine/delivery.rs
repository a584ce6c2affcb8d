use std::future::Future;
use std::time::Instant;

use chrono::Utc;
use tokio::time::timeout;
use tracing::info;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::delivery::{Delivery, DeliveryStatus};
use crate::models::listing::Listing;
use crate::models::user::{Actor, Role};
use crate::notify::{DeliveryEvent, DeliveryEventKind};
use crate::state::AppState;
use crate::verify::{generate_qr_token, normalize_phone, tokens_match};

fn assert_transition(from: DeliveryStatus, to: DeliveryStatus) -> Result<(), AppError> {
    if !from.can_transition_to(to) {
        return Err(AppError::BadRequest(format!(
            "invalid transition from '{from}' to '{to}'"
        )));
    }
    Ok(())
}

async fn timed<T, F>(state: &AppState, op: &'static str, fut: F) -> Result<T, AppError>
where
    F: Future<Output = Result<T, AppError>>,
{
    let start = Instant::now();
    let result = fut.await;

    let outcome = if result.is_ok() { "success" } else { "error" };
    state
        .metrics
        .delivery_op_latency_seconds
        .with_label_values(&[op])
        .observe(start.elapsed().as_secs_f64());
    state
        .metrics
        .delivery_ops_total
        .with_label_values(&[op, outcome])
        .inc();

    result
}

/// QR-gated pickup. A matching token binds the scanning carrier, starts the
/// transit leg and switches live tracking on. A missing or wrong token is an
/// explicit error, never a silent no-op.
pub async fn pickup(
    state: &AppState,
    delivery_id: Uuid,
    carrier_id: Uuid,
    qr_token: &str,
) -> Result<Delivery, AppError> {
    timed(state, "pickup", async {
        let delivery = get_delivery(state, delivery_id)?;
        assert_transition(delivery.status, DeliveryStatus::InTransit)?;

        let expected = delivery.pickup_qr_token.as_deref().unwrap_or("");
        if qr_token.is_empty() || expected.is_empty() || !tokens_match(qr_token, expected) {
            return Err(AppError::BadRequest("QR verification required".to_string()));
        }

        let updated = state.store.update_delivery(&delivery_id, |d| {
            assert_transition(d.status, DeliveryStatus::InTransit)?;
            d.carrier_id = Some(carrier_id);
            d.status = DeliveryStatus::InTransit;
            d.pickup_at = Some(Utc::now());
            d.tracking_enabled = true;
            Ok(())
        })?;

        info!(delivery_id = %delivery_id, carrier_id = %carrier_id, "delivery picked up");
        Ok(updated)
    })
    .await
}

/// Location pings are informational: no state-machine effect, but rejected
/// outside the tracking window to keep stale or rogue reports out.
pub async fn update_location(
    state: &AppState,
    delivery_id: Uuid,
    carrier_id: Uuid,
    lat: f64,
    lng: f64,
) -> Result<Delivery, AppError> {
    timed(state, "update_location", async {
        state.store.update_delivery(&delivery_id, |d| {
            if d.carrier_id.is_some_and(|c| c != carrier_id) {
                return Err(AppError::Forbidden(
                    "you are not the carrier for this delivery".to_string(),
                ));
            }
            if !matches!(d.status, DeliveryStatus::InTransit | DeliveryStatus::AtDoor) {
                return Err(AppError::BadRequest(
                    "location updates are only allowed in transit or at the door".to_string(),
                ));
            }
            if !d.tracking_enabled {
                return Err(AppError::BadRequest("live tracking is not enabled".to_string()));
            }

            d.last_lat = Some(lat);
            d.last_lng = Some(lng);
            d.last_location_at = Some(Utc::now());
            Ok(())
        })
    })
    .await
}

pub async fn mark_at_door(
    state: &AppState,
    delivery_id: Uuid,
    carrier_id: Uuid,
) -> Result<Delivery, AppError> {
    timed(state, "mark_at_door", async {
        let updated = state.store.update_delivery(&delivery_id, |d| {
            assert_transition(d.status, DeliveryStatus::AtDoor)?;
            assert_bound_carrier(d, carrier_id)?;
            d.status = DeliveryStatus::AtDoor;
            Ok(())
        })?;

        let listing = state.store.get_listing(&updated.listing_id);
        let body = format!(
            "The carrier has arrived at the address for \"{}\".",
            listing.as_ref().map_or("your shipment", |l| l.title.as_str())
        );
        notify_critical(
            state,
            DeliveryEventKind::DeliveryAtDoor,
            &updated,
            listing.as_ref(),
            "At the door",
            &body,
        )
        .await;

        Ok(updated)
    })
    .await
}

/// Unverified completion by the bound carrier.
pub async fn deliver(
    state: &AppState,
    delivery_id: Uuid,
    carrier_id: Uuid,
) -> Result<Delivery, AppError> {
    timed(state, "deliver", async {
        let updated = state.store.update_delivery(&delivery_id, |d| {
            assert_transition(d.status, DeliveryStatus::Delivered)?;
            assert_bound_carrier(d, carrier_id)?;
            d.status = DeliveryStatus::Delivered;
            d.delivered_at = Some(Utc::now());
            Ok(())
        })?;

        finish_delivered(state, &updated).await;
        Ok(updated)
    })
    .await
}

/// Verified completion: the identity token's phone claim must match the
/// listing's receiver phone. The provider round trip runs outside every
/// lock and under a bounded timeout; any ambiguity fails closed.
pub async fn confirm_delivery_with_verification(
    state: &AppState,
    delivery_id: Uuid,
    carrier_id: Uuid,
    id_token: &str,
) -> Result<Delivery, AppError> {
    timed(state, "confirm_delivery", async {
        let token = id_token.trim();
        if token.is_empty() {
            return Err(AppError::BadRequest("identity token required".to_string()));
        }

        let delivery = get_delivery(state, delivery_id)?;
        assert_transition(delivery.status, DeliveryStatus::Delivered)?;
        assert_bound_carrier(&delivery, carrier_id)?;

        let listing = get_listing(state, &delivery)?;
        let expected_phone = normalize_phone(listing.receiver_phone.as_deref().unwrap_or(""));
        if expected_phone.is_empty() {
            return Err(AppError::BadRequest(
                "listing has no receiver phone number".to_string(),
            ));
        }

        let identity = match timeout(state.verify_timeout, state.verifier.verify_token(token)).await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(AppError::BadRequest(
                    "identity verification timed out".to_string(),
                ))
            }
        };

        let token_phone = normalize_phone(&identity.phone_number);
        if token_phone.is_empty() {
            return Err(AppError::BadRequest(
                "identity token carries no phone number".to_string(),
            ));
        }
        if token_phone != expected_phone {
            return Err(AppError::Forbidden(
                "receiver phone could not be verified".to_string(),
            ));
        }

        let updated = state.store.update_delivery(&delivery_id, |d| {
            assert_transition(d.status, DeliveryStatus::Delivered)?;
            assert_bound_carrier(d, carrier_id)?;
            d.status = DeliveryStatus::Delivered;
            d.delivered_at = Some(Utc::now());
            Ok(())
        })?;

        finish_delivered(state, &updated).await;
        Ok(updated)
    })
    .await
}

/// Cancellation from any non-terminal state by an authorized actor.
pub async fn cancel(state: &AppState, delivery_id: Uuid, actor: Actor) -> Result<Delivery, AppError> {
    timed(state, "cancel", async {
        let delivery = get_delivery(state, delivery_id)?;
        if delivery.status.is_terminal() {
            return Err(AppError::BadRequest(
                "delivery is already in a terminal status".to_string(),
            ));
        }

        let listing = get_listing(state, &delivery)?;
        authorize_party(&delivery, &listing, &actor)?;

        let updated = state.store.update_delivery(&delivery_id, |d| {
            assert_transition(d.status, DeliveryStatus::Cancelled)?;
            d.status = DeliveryStatus::Cancelled;
            Ok(())
        })?;

        info!(delivery_id = %delivery_id, actor_id = %actor.id, "delivery cancelled");
        notify_critical(
            state,
            DeliveryEventKind::DeliveryCancelled,
            &updated,
            Some(&listing),
            "Cancelled",
            "The delivery was cancelled.",
        )
        .await;

        Ok(updated)
    })
    .await
}

/// Dispute of a delivered delivery, with an optional free-text reason.
pub async fn dispute(
    state: &AppState,
    delivery_id: Uuid,
    actor: Actor,
    reason: Option<String>,
) -> Result<Delivery, AppError> {
    timed(state, "dispute", async {
        let delivery = get_delivery(state, delivery_id)?;
        if delivery.status != DeliveryStatus::Delivered {
            return Err(AppError::BadRequest(
                "disputes can only be opened on delivered deliveries".to_string(),
            ));
        }

        let listing = get_listing(state, &delivery)?;
        authorize_party(&delivery, &listing, &actor)?;

        let updated = state.store.update_delivery(&delivery_id, move |d| {
            assert_transition(d.status, DeliveryStatus::Disputed)?;
            d.status = DeliveryStatus::Disputed;
            d.dispute_reason = reason.and_then(|r| {
                let trimmed = r.trim().to_string();
                (!trimmed.is_empty()).then_some(trimmed)
            });
            d.disputed_at = Some(Utc::now());
            Ok(())
        })?;

        info!(delivery_id = %delivery_id, actor_id = %actor.id, "dispute opened");
        notify_critical(
            state,
            DeliveryEventKind::DeliveryDisputed,
            &updated,
            Some(&listing),
            "Dispute",
            "A dispute was opened for the delivery.",
        )
        .await;

        Ok(updated)
    })
    .await
}

/// Attaches a proof-photo storage key. Allowed for the bound carrier on any
/// non-cancelled delivery; duplicate keys are ignored.
pub async fn add_proof_photo(
    state: &AppState,
    delivery_id: Uuid,
    carrier_id: Uuid,
    photo_key: &str,
) -> Result<Delivery, AppError> {
    timed(state, "add_proof_photo", async {
        let key = photo_key.trim().to_string();
        if key.is_empty() {
            return Err(AppError::BadRequest("photo key required".to_string()));
        }

        state.store.update_delivery(&delivery_id, move |d| {
            assert_bound_carrier(d, carrier_id)?;
            if d.status == DeliveryStatus::Cancelled {
                return Err(AppError::BadRequest(
                    "cannot attach proof to a cancelled delivery".to_string(),
                ));
            }
            if !d.proof_photos.iter().any(|existing| *existing == key) {
                d.proof_photos.push(key);
            }
            Ok(())
        })
    })
    .await
}

pub fn find_one(state: &AppState, delivery_id: Uuid) -> Result<Delivery, AppError> {
    get_delivery(state, delivery_id)
}

pub fn find_by_listing(state: &AppState, listing_id: Uuid) -> Result<Delivery, AppError> {
    state
        .store
        .delivery_for_listing(&listing_id)
        .ok_or_else(|| AppError::NotFound(format!("no delivery for listing {listing_id}")))
}

/// Carrier-facing list. Rows stuck in pickup_pending without a QR token
/// (historical data gap) are healed on read so the sender can always render
/// the code.
pub fn find_by_carrier(state: &AppState, carrier_id: Uuid) -> Vec<Delivery> {
    state
        .store
        .deliveries_for_carrier(&carrier_id)
        .into_iter()
        .map(|d| backfill_qr_token(state, d))
        .collect()
}

/// Sender-facing list across all of the owner's listings, with the same
/// token backfill as the carrier view.
pub fn find_by_owner(state: &AppState, owner_id: Uuid) -> Vec<Delivery> {
    state
        .store
        .listings_for_owner(&owner_id)
        .into_iter()
        .filter_map(|listing| state.store.delivery_for_listing(&listing.id))
        .map(|d| backfill_qr_token(state, d))
        .collect()
}

fn backfill_qr_token(state: &AppState, delivery: Delivery) -> Delivery {
    let needs_token = delivery.status == DeliveryStatus::PickupPending
        && delivery.pickup_qr_token.as_deref().is_none_or(str::is_empty);
    if !needs_token {
        return delivery;
    }

    state
        .store
        .update_delivery(&delivery.id, |d| {
            if d.status == DeliveryStatus::PickupPending
                && d.pickup_qr_token.as_deref().is_none_or(str::is_empty)
            {
                d.pickup_qr_token = Some(generate_qr_token());
            }
            Ok(())
        })
        .unwrap_or(delivery)
}

fn get_delivery(state: &AppState, delivery_id: Uuid) -> Result<Delivery, AppError> {
    state
        .store
        .get_delivery(&delivery_id)
        .ok_or_else(|| AppError::NotFound(format!("delivery {delivery_id} not found")))
}

fn get_listing(state: &AppState, delivery: &Delivery) -> Result<Listing, AppError> {
    state
        .store
        .get_listing(&delivery.listing_id)
        .ok_or_else(|| AppError::BadRequest(format!("listing {} not found", delivery.listing_id)))
}

fn assert_bound_carrier(delivery: &Delivery, carrier_id: Uuid) -> Result<(), AppError> {
    match delivery.carrier_id {
        Some(bound) if bound != carrier_id => Err(AppError::Forbidden(
            "you are not the carrier for this delivery".to_string(),
        )),
        Some(_) => Ok(()),
        None => Err(AppError::BadRequest(
            "delivery has no assigned carrier".to_string(),
        )),
    }
}

/// Per-role authority over a delivery: carriers must be the bound carrier
/// (an unbound delivery is still cancellable), senders must own the listing,
/// admins override.
fn authorize_party(delivery: &Delivery, listing: &Listing, actor: &Actor) -> Result<(), AppError> {
    match actor.role {
        Role::Admin => Ok(()),
        Role::Carrier => match delivery.carrier_id {
            Some(bound) if bound != actor.id => Err(AppError::Forbidden(
                "you are not the carrier for this delivery".to_string(),
            )),
            _ => Ok(()),
        },
        Role::Sender => {
            if listing.owner_id != actor.id {
                return Err(AppError::Forbidden(
                    "you are not the sender for this delivery".to_string(),
                ));
            }
            Ok(())
        }
    }
}

/// Post-commit work shared by both completion paths: lifetime counters for
/// both parties, then the delivered notification.
async fn finish_delivered(state: &AppState, delivery: &Delivery) {
    if let Some(carrier_id) = delivery.carrier_id {
        state.store.bump_delivered_count(&carrier_id);
    }

    let listing = state.store.get_listing(&delivery.listing_id);
    if let Some(listing) = listing.as_ref() {
        state.store.bump_delivered_count(&listing.owner_id);
    }

    info!(delivery_id = %delivery.id, "delivery completed");
    let body = format!(
        "\"{}\" was delivered.",
        listing.as_ref().map_or("Shipment", |l| l.title.as_str())
    );
    notify_critical(
        state,
        DeliveryEventKind::DeliveryDelivered,
        delivery,
        listing.as_ref(),
        "Delivered",
        &body,
    )
    .await;
}

async fn notify_critical(
    state: &AppState,
    kind: DeliveryEventKind,
    delivery: &Delivery,
    listing: Option<&Listing>,
    title: &str,
    body: &str,
) {
    let recipients: Vec<Uuid> = listing
        .map(|l| l.owner_id)
        .into_iter()
        .chain(delivery.carrier_id)
        .collect();
    if recipients.is_empty() {
        return;
    }

    state
        .notifier
        .notify(
            DeliveryEvent {
                kind,
                delivery_id: Some(delivery.id),
                listing_id: delivery.listing_id,
                recipients,
            },
            title,
            body,
        )
        .await;
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use uuid::Uuid;

    use super::*;
    use crate::config::Config;
    use crate::models::listing::GeoPoint;
    use crate::models::user::User;
    use crate::verify::HmacTokenVerifier;

    struct Fixture {
        state: Arc<AppState>,
        owner: Uuid,
        carrier: Uuid,
        delivery_id: Uuid,
        qr_token: String,
    }

    fn fixture() -> Fixture {
        fixture_with_receiver_phone(Some("05441234567".to_string()))
    }

    fn fixture_with_receiver_phone(receiver_phone: Option<String>) -> Fixture {
        let config = Config::from_env().expect("config from defaults");
        let state = Arc::new(AppState::new(&config));
        let now = Utc::now();

        let owner = insert_user(&state, Role::Sender);
        let carrier = insert_user(&state, Role::Carrier);

        let listing = Listing {
            id: Uuid::new_v4(),
            owner_id: owner,
            title: "Bookshelf".to_string(),
            description: "Oak bookshelf".to_string(),
            pickup: GeoPoint { lat: 41.0, lng: 29.0 },
            dropoff: GeoPoint { lat: 39.9, lng: 32.8 },
            receiver_phone,
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        state.store.insert_listing(listing.clone());

        let qr_token = generate_qr_token();
        let delivery = Delivery {
            id: Uuid::new_v4(),
            listing_id: listing.id,
            carrier_id: Some(carrier),
            status: DeliveryStatus::PickupPending,
            pickup_qr_token: Some(qr_token.clone()),
            tracking_enabled: false,
            last_lat: None,
            last_lng: None,
            last_location_at: None,
            proof_photos: Vec::new(),
            dispute_reason: None,
            pickup_at: None,
            delivered_at: None,
            disputed_at: None,
            created_at: now,
            updated_at: now,
        };
        state.store.insert_delivery(delivery.clone()).unwrap();

        Fixture {
            state,
            owner,
            carrier,
            delivery_id: delivery.id,
            qr_token,
        }
    }

    fn insert_user(state: &AppState, role: Role) -> Uuid {
        let user = User {
            id: Uuid::new_v4(),
            role,
            full_name: "fixture".to_string(),
            phone: None,
            public_id: None,
            delivered_count: 0,
            created_at: Utc::now(),
        };
        state.store.insert_user(user.clone());
        user.id
    }

    fn issue_token(phone: &str) -> String {
        // Same shared secret the default config wires into AppState.
        HmacTokenVerifier::new(b"dev-identity-secret".to_vec())
            .issue(phone, Utc::now().timestamp() + 60)
    }

    #[tokio::test]
    async fn pickup_with_wrong_token_fails_and_keeps_status() {
        let f = fixture();

        let err = pickup(&f.state, f.delivery_id, f.carrier, "wrong-token")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));

        let delivery = f.state.store.get_delivery(&f.delivery_id).unwrap();
        assert_eq!(delivery.status, DeliveryStatus::PickupPending);
        assert!(!delivery.tracking_enabled);
    }

    #[tokio::test]
    async fn pickup_with_matching_token_starts_transit() {
        let f = fixture();

        let delivery = pickup(&f.state, f.delivery_id, f.carrier, &f.qr_token)
            .await
            .unwrap();

        assert_eq!(delivery.status, DeliveryStatus::InTransit);
        assert_eq!(delivery.carrier_id, Some(f.carrier));
        assert!(delivery.tracking_enabled);
        assert!(delivery.pickup_at.is_some());
    }

    #[tokio::test]
    async fn pickup_twice_is_rejected_by_the_table() {
        let f = fixture();
        pickup(&f.state, f.delivery_id, f.carrier, &f.qr_token)
            .await
            .unwrap();

        let err = pickup(&f.state, f.delivery_id, f.carrier, &f.qr_token)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[tokio::test]
    async fn location_updates_only_inside_the_tracking_window() {
        let f = fixture();

        let err = update_location(&f.state, f.delivery_id, f.carrier, 41.0, 29.0)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));

        pickup(&f.state, f.delivery_id, f.carrier, &f.qr_token)
            .await
            .unwrap();
        let delivery = update_location(&f.state, f.delivery_id, f.carrier, 41.0, 29.0)
            .await
            .unwrap();
        assert_eq!(delivery.last_lat, Some(41.0));
        assert!(delivery.last_location_at.is_some());

        cancel(
            &f.state,
            f.delivery_id,
            Actor { id: f.owner, role: Role::Sender },
        )
        .await
        .unwrap();

        let err = update_location(&f.state, f.delivery_id, f.carrier, 41.1, 29.1)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[tokio::test]
    async fn location_update_by_other_carrier_is_forbidden() {
        let f = fixture();
        pickup(&f.state, f.delivery_id, f.carrier, &f.qr_token)
            .await
            .unwrap();

        let err = update_location(&f.state, f.delivery_id, Uuid::new_v4(), 41.0, 29.0)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
    }

    #[tokio::test]
    async fn at_door_requires_transit_and_the_bound_carrier() {
        let f = fixture();

        let err = mark_at_door(&f.state, f.delivery_id, f.carrier).await.unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));

        pickup(&f.state, f.delivery_id, f.carrier, &f.qr_token)
            .await
            .unwrap();

        let err = mark_at_door(&f.state, f.delivery_id, Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));

        let delivery = mark_at_door(&f.state, f.delivery_id, f.carrier).await.unwrap();
        assert_eq!(delivery.status, DeliveryStatus::AtDoor);
    }

    #[tokio::test]
    async fn deliver_bumps_both_lifetime_counters() {
        let f = fixture();
        pickup(&f.state, f.delivery_id, f.carrier, &f.qr_token)
            .await
            .unwrap();

        let delivery = deliver(&f.state, f.delivery_id, f.carrier).await.unwrap();
        assert_eq!(delivery.status, DeliveryStatus::Delivered);
        assert!(delivery.delivered_at.is_some());

        assert_eq!(f.state.store.get_user(&f.carrier).unwrap().delivered_count, 1);
        assert_eq!(f.state.store.get_user(&f.owner).unwrap().delivered_count, 1);
    }

    #[tokio::test]
    async fn confirm_accepts_equivalent_phone_formats() {
        // Listing stores "05441234567"; the token claims "+905441234567".
        let f = fixture();
        pickup(&f.state, f.delivery_id, f.carrier, &f.qr_token)
            .await
            .unwrap();

        let token = issue_token("+905441234567");
        let delivery =
            confirm_delivery_with_verification(&f.state, f.delivery_id, f.carrier, &token)
                .await
                .unwrap();
        assert_eq!(delivery.status, DeliveryStatus::Delivered);
        assert_eq!(f.state.store.get_user(&f.carrier).unwrap().delivered_count, 1);
    }

    #[tokio::test]
    async fn confirm_with_mismatched_phone_is_forbidden() {
        let f = fixture();
        pickup(&f.state, f.delivery_id, f.carrier, &f.qr_token)
            .await
            .unwrap();

        let token = issue_token("+905449999999");
        let err = confirm_delivery_with_verification(&f.state, f.delivery_id, f.carrier, &token)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));

        let delivery = f.state.store.get_delivery(&f.delivery_id).unwrap();
        assert_eq!(delivery.status, DeliveryStatus::InTransit);
    }

    #[tokio::test]
    async fn confirm_without_receiver_phone_is_rejected() {
        let f = fixture_with_receiver_phone(None);
        pickup(&f.state, f.delivery_id, f.carrier, &f.qr_token)
            .await
            .unwrap();

        let token = issue_token("+905441234567");
        let err = confirm_delivery_with_verification(&f.state, f.delivery_id, f.carrier, &token)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[tokio::test]
    async fn cancel_rejects_terminal_deliveries() {
        let f = fixture();
        pickup(&f.state, f.delivery_id, f.carrier, &f.qr_token)
            .await
            .unwrap();
        deliver(&f.state, f.delivery_id, f.carrier).await.unwrap();

        let err = cancel(
            &f.state,
            f.delivery_id,
            Actor { id: f.owner, role: Role::Sender },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[tokio::test]
    async fn cancel_checks_party_authorization() {
        let f = fixture();

        let err = cancel(
            &f.state,
            f.delivery_id,
            Actor { id: Uuid::new_v4(), role: Role::Sender },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));

        let err = cancel(
            &f.state,
            f.delivery_id,
            Actor { id: Uuid::new_v4(), role: Role::Carrier },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));

        // Admins override the ownership checks.
        let delivery = cancel(
            &f.state,
            f.delivery_id,
            Actor { id: Uuid::new_v4(), role: Role::Admin },
        )
        .await
        .unwrap();
        assert_eq!(delivery.status, DeliveryStatus::Cancelled);
    }

    #[tokio::test]
    async fn dispute_only_from_delivered_and_records_reason() {
        let f = fixture();

        let err = dispute(
            &f.state,
            f.delivery_id,
            Actor { id: f.owner, role: Role::Sender },
            Some("damaged".to_string()),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));

        pickup(&f.state, f.delivery_id, f.carrier, &f.qr_token)
            .await
            .unwrap();
        deliver(&f.state, f.delivery_id, f.carrier).await.unwrap();

        let delivery = dispute(
            &f.state,
            f.delivery_id,
            Actor { id: f.owner, role: Role::Sender },
            Some("  box arrived damaged  ".to_string()),
        )
        .await
        .unwrap();
        assert_eq!(delivery.status, DeliveryStatus::Disputed);
        assert_eq!(delivery.dispute_reason.as_deref(), Some("box arrived damaged"));
        assert!(delivery.disputed_at.is_some());
    }

    #[tokio::test]
    async fn proof_photos_dedup_and_reject_cancelled() {
        let f = fixture();
        pickup(&f.state, f.delivery_id, f.carrier, &f.qr_token)
            .await
            .unwrap();

        add_proof_photo(&f.state, f.delivery_id, f.carrier, "proofs/a.jpg")
            .await
            .unwrap();
        let delivery = add_proof_photo(&f.state, f.delivery_id, f.carrier, "proofs/a.jpg")
            .await
            .unwrap();
        assert_eq!(delivery.proof_photos, vec!["proofs/a.jpg"]);

        cancel(
            &f.state,
            f.delivery_id,
            Actor { id: f.owner, role: Role::Sender },
        )
        .await
        .unwrap();

        let err = add_proof_photo(&f.state, f.delivery_id, f.carrier, "proofs/b.jpg")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[tokio::test]
    async fn owner_view_backfills_missing_qr_token() {
        let f = fixture();
        f.state
            .store
            .update_delivery(&f.delivery_id, |d| {
                d.pickup_qr_token = None;
                Ok(())
            })
            .unwrap();

        let deliveries = find_by_owner(&f.state, f.owner);
        assert_eq!(deliveries.len(), 1);
        assert!(!deliveries[0].pickup_qr_token.as_deref().unwrap_or("").is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_pickups_apply_exactly_once() {
        let f = fixture();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let state = f.state.clone();
            let token = f.qr_token.clone();
            let delivery_id = f.delivery_id;
            let carrier = f.carrier;
            handles.push(tokio::spawn(async move {
                pickup(&state, delivery_id, carrier, &token).await
            }));
        }

        let mut successes = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                successes += 1;
            }
        }
        assert_eq!(successes, 1, "only one pickup may pass the status check");
    }
}
