use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::user::{Role, User};
use crate::state::AppState;

/// Creates an account and assigns its sequential public id in the same
/// critical section, so ids stay unique and strictly increasing under
/// concurrent registrations.
pub async fn register_user(
    state: &AppState,
    role: Role,
    full_name: String,
    phone: Option<String>,
) -> Result<User, AppError> {
    if full_name.trim().is_empty() {
        return Err(AppError::BadRequest("full_name cannot be empty".to_string()));
    }

    let _guard = state.store.lock_users().await;
    let next = state.store.max_public_id() + 1;

    let user = User {
        id: Uuid::new_v4(),
        role,
        full_name,
        phone,
        public_id: Some(next),
        delivered_count: 0,
        created_at: Utc::now(),
    };
    state.store.insert_user(user.clone());
    state.metrics.public_id_allocations_total.inc();

    info!(user_id = %user.id, public_id = next, "user registered");
    Ok(user)
}

/// Returns the user with a guaranteed public id. Rows that already carry one
/// return without touching the lock; everything else serializes on the
/// exclusive users lock, re-reads to detect a racer, and takes `max + 1`.
pub async fn ensure_public_id(state: &AppState, user_id: Uuid) -> Result<User, AppError> {
    let existing = state
        .store
        .get_user(&user_id)
        .ok_or_else(|| AppError::NotFound(format!("user {user_id} not found")))?;
    if existing.public_id.is_some() {
        return Ok(existing);
    }

    let _guard = state.store.lock_users().await;

    // Re-read under the lock: a racer may have assigned it first, or the row
    // may be gone entirely.
    let fresh = state
        .store
        .get_user(&user_id)
        .ok_or_else(|| AppError::NotFound(format!("user {user_id} not found")))?;
    if fresh.public_id.is_some() {
        return Ok(fresh);
    }

    let next = state.store.max_public_id() + 1;
    let updated = state.store.set_public_id(&user_id, next)?;
    state.metrics.public_id_allocations_total.inc();

    info!(user_id = %user_id, public_id = next, "public id assigned");
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use uuid::Uuid;

    use super::{ensure_public_id, register_user};
    use crate::config::Config;
    use crate::error::AppError;
    use crate::models::user::{Role, User};
    use crate::state::AppState;

    fn test_state() -> Arc<AppState> {
        let config = Config::from_env().expect("config from defaults");
        Arc::new(AppState::new(&config))
    }

    fn legacy_user(state: &AppState) -> Uuid {
        // Simulates a pre-allocator row: no public id yet.
        let user = User {
            id: Uuid::new_v4(),
            role: Role::Carrier,
            full_name: "legacy".to_string(),
            phone: None,
            public_id: None,
            delivered_count: 0,
            created_at: Utc::now(),
        };
        state.store.insert_user(user.clone());
        user.id
    }

    #[tokio::test]
    async fn register_assigns_sequential_public_ids() {
        let state = test_state();

        let first = register_user(&state, Role::Sender, "Ada".to_string(), None)
            .await
            .unwrap();
        let second = register_user(&state, Role::Carrier, "Ben".to_string(), None)
            .await
            .unwrap();

        assert_eq!(first.public_id, Some(1));
        assert_eq!(second.public_id, Some(2));
    }

    #[tokio::test]
    async fn register_rejects_blank_name() {
        let state = test_state();
        let err = register_user(&state, Role::Sender, "   ".to_string(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[tokio::test]
    async fn ensure_is_idempotent() {
        let state = test_state();
        let id = legacy_user(&state);

        let first = ensure_public_id(&state, id).await.unwrap();
        let second = ensure_public_id(&state, id).await.unwrap();

        assert!(first.public_id.is_some());
        assert_eq!(first.public_id, second.public_id);
    }

    #[tokio::test]
    async fn ensure_unknown_user_is_not_found() {
        let state = test_state();
        let err = ensure_public_id(&state, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_allocations_yield_distinct_sequential_ids() {
        let state = test_state();

        let ids: Vec<Uuid> = (0..16).map(|_| legacy_user(&state)).collect();

        let mut handles = Vec::new();
        for id in ids {
            let state = state.clone();
            handles.push(tokio::spawn(async move {
                ensure_public_id(&state, id).await.unwrap().public_id.unwrap()
            }));
        }

        let mut allocated = Vec::new();
        for handle in handles {
            allocated.push(handle.await.unwrap());
        }

        allocated.sort_unstable();
        let expected: Vec<u64> = (1..=16).collect();
        assert_eq!(allocated, expected, "no gaps, no duplicates");
    }
}
