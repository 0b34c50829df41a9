//! Bounded-use policy for visitors without an account.
//!
//! The counter lives in ephemeral client-side storage only. Clearing that
//! storage resets it, which is acceptable for a soft anti-abuse limit.

use crate::error::ChatError;
use crate::models::GuestQuotaState;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;

pub const MESSAGE_LIMIT: u32 = 10;
pub const QUOTA_WINDOW_HOURS: i64 = 2;

const STORAGE_KEY: &str = "guest_chat_quota";

/// Browser-local style key-value storage shared by every open view.
///
/// Writes are last-write-wins; no locking is attempted across views.
pub trait LocalStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: String);
    fn remove(&self, key: &str);
}

#[derive(Debug, Default)]
pub struct MemoryLocalStore {
    entries: DashMap<String, String>,
}

impl MemoryLocalStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocalStore for MemoryLocalStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    fn set(&self, key: &str, value: String) {
        self.entries.insert(key.to_string(), value);
    }

    fn remove(&self, key: &str) {
        self.entries.remove(key);
    }
}

#[derive(Clone)]
pub struct GuestQuotaTracker {
    store: Arc<dyn LocalStore>,
}

impl GuestQuotaTracker {
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self { store }
    }

    /// Reads the stored quota, starting a fresh window when it is missing,
    /// unreadable or expired.
    pub fn get_or_init(&self) -> GuestQuotaState {
        self.get_or_init_at(Utc::now())
    }

    fn get_or_init_at(&self, now: DateTime<Utc>) -> GuestQuotaState {
        let stored = self
            .store
            .get(STORAGE_KEY)
            .and_then(|raw| match serde_json::from_str::<GuestQuotaState>(&raw) {
                Ok(state) => Some(state),
                Err(e) => {
                    log::warn!("Discarding unreadable guest quota state: {}", e);
                    None
                }
            });

        match stored {
            Some(state) if now <= state.expires_at => state,
            Some(_) => {
                log::info!("Guest quota window expired, starting a new one");
                self.start_window(now)
            }
            None => self.start_window(now),
        }
    }

    fn start_window(&self, now: DateTime<Utc>) -> GuestQuotaState {
        let state = GuestQuotaState {
            message_count: 0,
            started_at: now,
            expires_at: now + Duration::hours(QUOTA_WINDOW_HOURS),
        };
        self.save(&state);
        state
    }

    fn save(&self, state: &GuestQuotaState) {
        match serde_json::to_string(state) {
            Ok(raw) => self.store.set(STORAGE_KEY, raw),
            Err(e) => log::error!("Failed to serialize guest quota state: {}", e),
        }
    }

    pub fn remaining(&self) -> u32 {
        MESSAGE_LIMIT.saturating_sub(self.get_or_init().message_count)
    }

    pub fn has_reached_limit(&self) -> bool {
        self.remaining() == 0
    }

    /// Counts one accepted send. Must run before the network call so that
    /// slow or crashed responses still count.
    pub fn consume_one(&self) -> Result<GuestQuotaState, ChatError> {
        let mut state = self.get_or_init();
        if state.message_count >= MESSAGE_LIMIT {
            log::warn!("Guest message limit of {} reached", MESSAGE_LIMIT);
            return Err(ChatError::GuestLimitReached);
        }
        state.message_count += 1;
        self.save(&state);
        log::debug!("Guest quota used: {}/{}", state.message_count, MESSAGE_LIMIT);
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> (GuestQuotaTracker, Arc<MemoryLocalStore>) {
        let store = Arc::new(MemoryLocalStore::new());
        (GuestQuotaTracker::new(store.clone()), store)
    }

    #[test]
    fn fresh_state_has_full_quota() {
        let (quota, _) = tracker();
        let state = quota.get_or_init();
        assert_eq!(state.message_count, 0);
        assert_eq!(state.expires_at - state.started_at, Duration::hours(2));
        assert_eq!(quota.remaining(), MESSAGE_LIMIT);
    }

    #[test]
    fn remaining_drops_by_one_per_send() {
        let (quota, _) = tracker();
        for k in 1..=MESSAGE_LIMIT {
            quota.consume_one().unwrap();
            assert_eq!(quota.remaining(), MESSAGE_LIMIT - k);
        }
        assert!(quota.has_reached_limit());

        assert!(matches!(quota.consume_one(), Err(ChatError::GuestLimitReached)));
        assert_eq!(quota.get_or_init().message_count, MESSAGE_LIMIT);
    }

    #[test]
    fn expired_window_resets_count() {
        let (quota, store) = tracker();
        let past = Utc::now() - Duration::hours(5);
        let stale = GuestQuotaState {
            message_count: 10,
            started_at: past,
            expires_at: past + Duration::hours(2),
        };
        store.set(STORAGE_KEY, serde_json::to_string(&stale).unwrap());

        let state = quota.get_or_init();
        assert_eq!(state.message_count, 0);
        assert!(state.expires_at > Utc::now());
        assert_eq!(quota.remaining(), MESSAGE_LIMIT);
    }

    #[test]
    fn window_expires_exactly_after_two_hours() {
        let (quota, _) = tracker();
        let start = quota.get_or_init_at(Utc::now());
        quota.consume_one().unwrap();

        let at_expiry = quota.get_or_init_at(start.expires_at);
        assert_eq!(at_expiry.message_count, 1);

        let after = quota.get_or_init_at(start.expires_at + Duration::seconds(1));
        assert_eq!(after.message_count, 0);
    }

    #[test]
    fn corrupted_state_is_replaced() {
        let (quota, store) = tracker();
        store.set(STORAGE_KEY, "{not json".to_string());
        assert_eq!(quota.get_or_init().message_count, 0);
        assert!(store.get(STORAGE_KEY).unwrap().contains("messageCount"));
    }

    #[test]
    fn clearing_local_storage_resets_quota() {
        let (quota, store) = tracker();
        quota.consume_one().unwrap();
        store.remove(STORAGE_KEY);
        assert_eq!(quota.remaining(), MESSAGE_LIMIT);
    }

    #[test]
    fn views_sharing_a_store_share_the_counter() {
        let store: Arc<dyn LocalStore> = Arc::new(MemoryLocalStore::new());
        let first = GuestQuotaTracker::new(store.clone());
        let second = GuestQuotaTracker::new(store);
        first.consume_one().unwrap();
        second.consume_one().unwrap();
        assert_eq!(first.remaining(), MESSAGE_LIMIT - 2);
    }
}
