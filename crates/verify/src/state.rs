use chrono::{DateTime, Duration, Utc};
use meter_core::{Kwh, Provider, ReadingKind};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

/// Where a user's verification currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    AwaitingPhoto,
    AwaitingConfirmation,
    ManualEntryRequired,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::AwaitingPhoto => write!(f, "awaiting_photo"),
            Phase::AwaitingConfirmation => write!(f, "awaiting_confirmation"),
            Phase::ManualEntryRequired => write!(f, "manual_entry_required"),
        }
    }
}

/// One user's in-progress verification of a start or end reading.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerificationState {
    /// Generation token: a fresh value for every started verification.
    pub id: Uuid,
    pub user_id: String,
    pub session_id: String,
    pub kind: ReadingKind,
    pub phase: Phase,
    /// Photo and manual submissions so far.
    pub attempt_count: u32,
    /// Candidate waiting for confirmation.
    pub last_reading: Option<Kwh>,
    pub last_confidence: Option<f64>,
    pub provider: Provider,
    pub created_at: DateTime<Utc>,
}

impl VerificationState {
    pub fn new(user_id: &str, session_id: &str, kind: ReadingKind, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            session_id: session_id.to_string(),
            kind,
            phase: Phase::AwaitingPhoto,
            attempt_count: 0,
            last_reading: None,
            last_confidence: None,
            provider: Provider::Vision,
            created_at: now,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now - self.created_at > ttl
    }
}

/// Per-user verification states. Every method holds the map lock only for
/// the duration of the call, so nothing here can be held across an await.
#[derive(Debug, Default)]
pub struct StateStore {
    states: Mutex<HashMap<String, VerificationState>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert, replacing any state the user already had.
    pub fn insert(&self, state: VerificationState) -> Option<VerificationState> {
        self.lock().insert(state.user_id.clone(), state)
    }

    pub fn get(&self, user_id: &str) -> Option<VerificationState> {
        self.lock().get(user_id).cloned()
    }

    /// Atomic read-modify-write of one user's entry.
    pub fn update<T>(
        &self,
        user_id: &str,
        f: impl FnOnce(&mut VerificationState) -> T,
    ) -> Option<T> {
        self.lock().get_mut(user_id).map(f)
    }

    pub fn remove(&self, user_id: &str) -> Option<VerificationState> {
        self.lock().remove(user_id)
    }

    /// Remove the entry only while it is still the given generation.
    pub fn remove_generation(&self, user_id: &str, id: Uuid) -> Option<VerificationState> {
        let mut guard = self.lock();
        match guard.get(user_id) {
            Some(s) if s.id == id => guard.remove(user_id),
            _ => None,
        }
    }

    /// Drop every expired entry; returns how many were removed. Safe to run
    /// repeatedly and alongside inserts.
    pub fn remove_expired(&self, now: DateTime<Utc>, ttl: Duration) -> usize {
        let mut guard = self.lock();
        let before = guard.len();
        guard.retain(|_, state| !state.is_expired(now, ttl));
        before - guard.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, VerificationState>> {
        self.states.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(user: &str, age_minutes: i64) -> VerificationState {
        let created = Utc::now() - Duration::minutes(age_minutes);
        VerificationState::new(user, "sess-1", ReadingKind::Start, created)
    }

    #[test]
    fn new_state_awaits_photo() {
        let s = state("u1", 0);
        assert_eq!(s.phase, Phase::AwaitingPhoto);
        assert_eq!(s.attempt_count, 0);
        assert!(s.last_reading.is_none());
        assert_ne!(s.id, state("u1", 0).id);
    }

    #[test]
    fn insert_replaces_previous_state() {
        let store = StateStore::new();
        let first = state("u1", 0);
        let second = state("u1", 0);
        assert!(store.insert(first.clone()).is_none());
        let replaced = store.insert(second.clone()).unwrap();
        assert_eq!(replaced.id, first.id);
        assert_eq!(store.get("u1").unwrap().id, second.id);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn update_is_applied_in_place() {
        let store = StateStore::new();
        store.insert(state("u1", 0));
        let count = store.update("u1", |s| {
            s.attempt_count += 1;
            s.attempt_count
        });
        assert_eq!(count, Some(1));
        assert_eq!(store.get("u1").unwrap().attempt_count, 1);
        assert_eq!(store.update("ghost", |s| s.attempt_count), None);
    }

    #[test]
    fn remove_generation_ignores_replaced_entries() {
        let store = StateStore::new();
        let old = state("u1", 0);
        store.insert(old.clone());
        store.insert(state("u1", 0));
        assert!(store.remove_generation("u1", old.id).is_none());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn sweep_removes_only_expired() {
        let store = StateStore::new();
        store.insert(state("old", 45));
        store.insert(state("fresh", 5));
        let ttl = Duration::minutes(30);
        assert_eq!(store.remove_expired(Utc::now(), ttl), 1);
        assert!(store.get("old").is_none());
        assert!(store.get("fresh").is_some());
        // Idempotent.
        assert_eq!(store.remove_expired(Utc::now(), ttl), 0);
    }

    #[test]
    fn expiry_is_strictly_older_than_ttl() {
        let now = Utc::now();
        let s = VerificationState::new("u", "s", ReadingKind::End, now - Duration::minutes(30));
        assert!(!s.is_expired(now, Duration::minutes(30)));
        assert!(s.is_expired(now + Duration::seconds(1), Duration::minutes(30)));
    }
}
