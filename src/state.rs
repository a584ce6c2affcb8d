use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::config::Config;
use crate::media::{ObjectStore, PrefixedUrlStore};
use crate::notify::{BroadcastNotifier, Notification, Notifier};
use crate::observability::metrics::Metrics;
use crate::store::Store;
use crate::verify::{HmacTokenVerifier, IdentityVerifier};

pub struct AppState {
    pub store: Store,
    pub metrics: Metrics,
    pub notifier: Arc<dyn Notifier>,
    pub verifier: Arc<dyn IdentityVerifier>,
    pub media: Arc<dyn ObjectStore>,
    pub verify_timeout: Duration,
    pub events_tx: broadcast::Sender<Notification>,
}

impl AppState {
    pub fn new(config: &Config) -> Self {
        let (events_tx, _unused_rx) = broadcast::channel(config.event_buffer_size);

        Self {
            store: Store::new(),
            metrics: Metrics::new(),
            notifier: Arc::new(BroadcastNotifier::new(events_tx.clone())),
            verifier: Arc::new(HmacTokenVerifier::new(config.identity_secret.as_bytes().to_vec())),
            media: Arc::new(PrefixedUrlStore::new(config.media_base_url.clone())),
            verify_timeout: Duration::from_millis(config.verify_timeout_ms),
            events_tx,
        }
    }
}
