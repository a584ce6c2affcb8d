use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::delivery::{Delivery, DeliveryStatus};
use crate::models::listing::Listing;
use crate::models::message::Message;
use crate::models::offer::{Offer, OfferStatus};
use crate::notify::{DeliveryEvent, DeliveryEventKind};
use crate::state::AppState;
use crate::verify::generate_qr_token;

/// Persists a pending offer against an open listing. The chat message and
/// the owner notification are best-effort: they can never fail the call.
pub async fn submit_offer(
    state: &AppState,
    listing_id: Uuid,
    proposer_id: Uuid,
    amount: f64,
    message: Option<String>,
) -> Result<Offer, AppError> {
    let listing = state
        .store
        .get_listing(&listing_id)
        .ok_or_else(|| AppError::BadRequest(format!("listing {listing_id} not found")))?;

    if listing.owner_id == proposer_id {
        return Err(AppError::BadRequest(
            "cannot submit an offer on your own listing".to_string(),
        ));
    }
    if !amount.is_finite() || amount <= 0.0 {
        return Err(AppError::BadRequest("amount must be > 0".to_string()));
    }

    let offer = {
        let _guard = state.store.lock_listing(listing_id).await;

        if state.store.accepted_offer_for_listing(&listing_id).is_some() {
            return Err(AppError::BadRequest(
                "listing already has an accepted offer".to_string(),
            ));
        }

        let now = Utc::now();
        let offer = Offer {
            id: Uuid::new_v4(),
            listing_id,
            proposer_id,
            amount,
            message,
            status: OfferStatus::Pending,
            created_at: now,
            updated_at: now,
        };
        state.store.insert_offer(offer.clone());
        offer
    };

    state.metrics.offers_total.with_label_values(&["submitted"]).inc();
    info!(offer_id = %offer.id, listing_id = %listing_id, amount, "offer submitted");

    let chat = Message {
        id: Uuid::new_v4(),
        listing_id,
        sender_id: listing.owner_id,
        carrier_id: proposer_id,
        content: format!("Carrier offered {amount:.2} for \"{}\"", listing.title),
        from_carrier: true,
        created_at: Utc::now(),
    };
    state.store.insert_message(chat);

    state
        .notifier
        .notify(
            DeliveryEvent {
                kind: DeliveryEventKind::Offer,
                delivery_id: None,
                listing_id,
                recipients: vec![listing.owner_id],
            },
            "New offer",
            &format!("A carrier offered {amount:.2} for \"{}\".", listing.title),
        )
        .await;

    Ok(offer)
}

/// Resolves the listing's offers in one atomic unit under the per-listing
/// lock: the target becomes accepted, every competitor becomes rejected, and
/// the delivery is created or reconciled before the lock is released.
/// Re-accepting the already-accepted offer is an idempotent success.
pub async fn accept_offer(
    state: &AppState,
    offer_id: Uuid,
    acting_owner_id: Uuid,
) -> Result<Offer, AppError> {
    let offer = state
        .store
        .get_offer(&offer_id)
        .ok_or_else(|| AppError::NotFound(format!("offer {offer_id} not found")))?;
    let listing = assert_listing_owned_by(state, offer.listing_id, acting_owner_id)?;

    let accepted = {
        let _guard = state.store.lock_listing(offer.listing_id).await;

        if let Some(existing) = state.store.accepted_offer_for_listing(&offer.listing_id) {
            if existing.id != offer_id {
                return Err(AppError::BadRequest(
                    "another offer is already accepted for this listing".to_string(),
                ));
            }
        }

        let accepted = state.store.resolve_offers(&offer.listing_id, offer_id)?;
        create_or_reconcile_delivery(state, &accepted)?;
        accepted
    };

    state.metrics.offers_total.with_label_values(&["accepted"]).inc();
    info!(offer_id = %offer_id, listing_id = %accepted.listing_id, "offer accepted");

    state
        .notifier
        .notify(
            DeliveryEvent {
                kind: DeliveryEventKind::OfferAccepted,
                delivery_id: state
                    .store
                    .delivery_for_listing(&accepted.listing_id)
                    .map(|d| d.id),
                listing_id: accepted.listing_id,
                recipients: vec![accepted.proposer_id],
            },
            "Offer accepted",
            &format!("Your offer for \"{}\" was accepted.", listing.title),
        )
        .await;

    Ok(accepted)
}

/// Pending offers move to rejected; offers that are already resolved are
/// returned unchanged so a stale reject can never re-open the listing.
pub async fn reject_offer(
    state: &AppState,
    offer_id: Uuid,
    acting_owner_id: Uuid,
) -> Result<Offer, AppError> {
    let offer = state
        .store
        .get_offer(&offer_id)
        .ok_or_else(|| AppError::NotFound(format!("offer {offer_id} not found")))?;
    assert_listing_owned_by(state, offer.listing_id, acting_owner_id)?;

    let _guard = state.store.lock_listing(offer.listing_id).await;

    let offer = state
        .store
        .get_offer(&offer_id)
        .ok_or_else(|| AppError::NotFound(format!("offer {offer_id} not found")))?;
    if offer.status.is_resolved() {
        return Ok(offer);
    }

    let rejected = state.store.set_offer_status(&offer_id, OfferStatus::Rejected)?;
    state.metrics.offers_total.with_label_values(&["rejected"]).inc();
    Ok(rejected)
}

fn assert_listing_owned_by(
    state: &AppState,
    listing_id: Uuid,
    owner_id: Uuid,
) -> Result<Listing, AppError> {
    let listing = state
        .store
        .get_listing(&listing_id)
        .ok_or_else(|| AppError::BadRequest(format!("listing {listing_id} not found")))?;
    if listing.owner_id != owner_id {
        return Err(AppError::Forbidden(
            "only the listing owner can resolve its offers".to_string(),
        ));
    }
    Ok(listing)
}

/// Construction rule for the delivery spawned by an acceptance. Runs under
/// the listing lock, so racing resolutions serialize here.
///
/// - no delivery yet: create one in pickup_pending, bound to the winner,
///   with a fresh QR token and tracking off
/// - delivery still in pickup_pending: backfill the carrier binding and a
///   missing token instead of erroring (heals rows from retried
///   acceptances)
/// - delivery past pickup_pending: leave it untouched; an acceptance cannot
///   rewind an in-flight delivery
fn create_or_reconcile_delivery(state: &AppState, accepted: &Offer) -> Result<(), AppError> {
    match state.store.delivery_for_listing(&accepted.listing_id) {
        None => {
            let now = Utc::now();
            let delivery = Delivery {
                id: Uuid::new_v4(),
                listing_id: accepted.listing_id,
                carrier_id: Some(accepted.proposer_id),
                status: DeliveryStatus::PickupPending,
                pickup_qr_token: Some(generate_qr_token()),
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
            state.store.insert_delivery(delivery)?;
        }
        Some(existing) if existing.status == DeliveryStatus::PickupPending => {
            let proposer_id = accepted.proposer_id;
            state.store.update_delivery(&existing.id, |d| {
                if d.status != DeliveryStatus::PickupPending {
                    return Ok(());
                }
                d.carrier_id = Some(proposer_id);
                if d.pickup_qr_token.as_deref().is_none_or(str::is_empty) {
                    d.pickup_qr_token = Some(generate_qr_token());
                }
                d.tracking_enabled = false;
                Ok(())
            })?;
        }
        Some(_) => {}
    }

    Ok(())
}
