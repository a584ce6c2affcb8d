use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{Mutex, MutexGuard, OwnedMutexGuard};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::delivery::Delivery;
use crate::models::listing::Listing;
use crate::models::message::Message;
use crate::models::offer::{Offer, OfferStatus};
use crate::models::user::User;

/// In-memory persistence port. The maps are the only shared mutable state;
/// the two lock families below define every critical section:
///
/// - `users_lock` plays the role of an exclusive table lock for sequential
///   public-id allocation (read max, compute next, write).
/// - `listing_locks` serializes offer submission and resolution per listing,
///   so a listing can never end up with two accepted offers or two
///   deliveries.
///
/// Individual delivery rows are mutated through [`Store::update_delivery`],
/// which applies the closure under the row's shard guard. Callers re-check
/// their status precondition inside the closure, which makes every
/// transition a compare-and-set.
pub struct Store {
    users: DashMap<Uuid, User>,
    listings: DashMap<Uuid, Listing>,
    offers: DashMap<Uuid, Offer>,
    deliveries: DashMap<Uuid, Delivery>,
    messages: DashMap<Uuid, Message>,
    users_lock: Mutex<()>,
    listing_locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl Store {
    pub fn new() -> Self {
        Self {
            users: DashMap::new(),
            listings: DashMap::new(),
            offers: DashMap::new(),
            deliveries: DashMap::new(),
            messages: DashMap::new(),
            users_lock: Mutex::new(()),
            listing_locks: DashMap::new(),
        }
    }

    // --- users ---

    pub fn insert_user(&self, user: User) {
        self.users.insert(user.id, user);
    }

    pub fn get_user(&self, id: &Uuid) -> Option<User> {
        self.users.get(id).map(|entry| entry.value().clone())
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    /// Exclusive users-table lock for public-id allocation. Held only across
    /// the read-max/compute/write section, never across I/O.
    pub async fn lock_users(&self) -> MutexGuard<'_, ()> {
        self.users_lock.lock().await
    }

    pub fn max_public_id(&self) -> u64 {
        self.users
            .iter()
            .filter_map(|entry| entry.value().public_id)
            .max()
            .unwrap_or(0)
    }

    pub fn set_public_id(&self, id: &Uuid, public_id: u64) -> Result<User, AppError> {
        let mut user = self
            .users
            .get_mut(id)
            .ok_or_else(|| AppError::NotFound(format!("user {id} not found")))?;

        user.public_id = Some(public_id);
        Ok(user.clone())
    }

    pub fn bump_delivered_count(&self, id: &Uuid) {
        if let Some(mut user) = self.users.get_mut(id) {
            user.delivered_count = user.delivered_count.saturating_add(1);
        }
    }

    // --- listings ---

    pub fn insert_listing(&self, listing: Listing) {
        self.listings.insert(listing.id, listing);
    }

    pub fn get_listing(&self, id: &Uuid) -> Option<Listing> {
        self.listings.get(id).map(|entry| entry.value().clone())
    }

    pub fn listing_count(&self) -> usize {
        self.listings.len()
    }

    pub fn listings_for_owner(&self, owner_id: &Uuid) -> Vec<Listing> {
        self.listings
            .iter()
            .filter(|entry| entry.value().owner_id == *owner_id)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Per-listing resolution lock: scope of atomicity for offer submission,
    /// acceptance and delivery reconciliation.
    pub async fn lock_listing(&self, listing_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = self
            .listing_locks
            .entry(listing_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    // --- offers ---

    pub fn insert_offer(&self, offer: Offer) {
        self.offers.insert(offer.id, offer);
    }

    pub fn get_offer(&self, id: &Uuid) -> Option<Offer> {
        self.offers.get(id).map(|entry| entry.value().clone())
    }

    pub fn offer_count(&self) -> usize {
        self.offers.len()
    }

    pub fn offers_for_listing(&self, listing_id: &Uuid) -> Vec<Offer> {
        self.offers
            .iter()
            .filter(|entry| entry.value().listing_id == *listing_id)
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn accepted_offer_for_listing(&self, listing_id: &Uuid) -> Option<Offer> {
        self.offers
            .iter()
            .find(|entry| {
                entry.value().listing_id == *listing_id
                    && entry.value().status == OfferStatus::Accepted
            })
            .map(|entry| entry.value().clone())
    }

    pub fn set_offer_status(&self, id: &Uuid, status: OfferStatus) -> Result<Offer, AppError> {
        let mut offer = self
            .offers
            .get_mut(id)
            .ok_or_else(|| AppError::NotFound(format!("offer {id} not found")))?;

        offer.status = status;
        offer.updated_at = Utc::now();
        Ok(offer.clone())
    }

    /// Flips the winner to accepted and every competing offer to rejected.
    /// Must run under the listing's resolution lock. The winner is written
    /// first so a concurrent reader can never observe the losers rejected
    /// while the winner is still pending.
    pub fn resolve_offers(&self, listing_id: &Uuid, winner_id: Uuid) -> Result<Offer, AppError> {
        let accepted = self.set_offer_status(&winner_id, OfferStatus::Accepted)?;

        for mut entry in self.offers.iter_mut() {
            let offer = entry.value_mut();
            if offer.listing_id == *listing_id
                && offer.id != winner_id
                && offer.status != OfferStatus::Rejected
            {
                offer.status = OfferStatus::Rejected;
                offer.updated_at = Utc::now();
            }
        }

        Ok(accepted)
    }

    // --- deliveries ---

    /// A listing carries at most one delivery; a second insert for the same
    /// listing is an integrity violation.
    pub fn insert_delivery(&self, delivery: Delivery) -> Result<(), AppError> {
        if self.delivery_for_listing(&delivery.listing_id).is_some() {
            return Err(AppError::Conflict(format!(
                "delivery already exists for listing {}",
                delivery.listing_id
            )));
        }
        self.deliveries.insert(delivery.id, delivery);
        Ok(())
    }

    pub fn get_delivery(&self, id: &Uuid) -> Option<Delivery> {
        self.deliveries.get(id).map(|entry| entry.value().clone())
    }

    pub fn delivery_count(&self) -> usize {
        self.deliveries.len()
    }

    pub fn delivery_for_listing(&self, listing_id: &Uuid) -> Option<Delivery> {
        self.deliveries
            .iter()
            .find(|entry| entry.value().listing_id == *listing_id)
            .map(|entry| entry.value().clone())
    }

    pub fn deliveries_for_carrier(&self, carrier_id: &Uuid) -> Vec<Delivery> {
        self.deliveries
            .iter()
            .filter(|entry| entry.value().carrier_id == Some(*carrier_id))
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Read-modify-write on a single delivery row under its shard guard.
    /// `apply` must validate its precondition before mutating: if it returns
    /// an error the row keeps its previous `updated_at` and the caller sees
    /// no partial change.
    pub fn update_delivery<F>(&self, id: &Uuid, apply: F) -> Result<Delivery, AppError>
    where
        F: FnOnce(&mut Delivery) -> Result<(), AppError>,
    {
        let mut delivery = self
            .deliveries
            .get_mut(id)
            .ok_or_else(|| AppError::NotFound(format!("delivery {id} not found")))?;

        apply(&mut delivery)?;
        delivery.updated_at = Utc::now();
        Ok(delivery.clone())
    }

    // --- messages ---

    pub fn insert_message(&self, message: Message) {
        self.messages.insert(message.id, message);
    }

    pub fn messages_for_listing(&self, listing_id: &Uuid) -> Vec<Message> {
        let mut messages: Vec<Message> = self
            .messages
            .iter()
            .filter(|entry| entry.value().listing_id == *listing_id)
            .map(|entry| entry.value().clone())
            .collect();
        messages.sort_by_key(|m| m.created_at);
        messages
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}
