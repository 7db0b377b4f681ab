//! Session registry.
//!
//! The sole authority on which relay sessions exist. At most one record
//! per user; starting a new session replaces the old record, and the
//! displaced relay loop notices its record is gone and stops on its own.
//! There is no direct kill path, removal IS the cancellation signal.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

/// Captured login state, enough to restore an authenticated page.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthArtifacts {
    pub cookies: Vec<Value>,
    pub local_storage: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub user_id: String,
    /// Monotonic per-user generation; lets a relay loop tell "my record
    /// was removed" from "my record was replaced by a newer session".
    pub generation: u64,
    pub artifacts: AuthArtifacts,
}

#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<Mutex<RegistryState>>,
}

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<String, SessionRecord>,
    next_generation: u64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session for `user_id`, replacing any existing record.
    /// Returns the generation token the new relay loop must watch.
    pub async fn register(&self, user_id: &str, artifacts: AuthArtifacts) -> u64 {
        let mut state = self.inner.lock().await;
        state.next_generation += 1;
        let generation = state.next_generation;
        let replaced = state
            .sessions
            .insert(
                user_id.to_string(),
                SessionRecord {
                    user_id: user_id.to_string(),
                    generation,
                    artifacts,
                },
            )
            .is_some();
        debug!(user_id, generation, replaced, "session registered");
        generation
    }

    /// Remove the user's session record. The running relay loop observes
    /// the removal at its next checkpoint and winds down.
    pub async fn remove(&self, user_id: &str) -> bool {
        let removed = self.inner.lock().await.sessions.remove(user_id).is_some();
        if removed {
            debug!(user_id, "session removed");
        }
        removed
    }

    /// Whether the record for `user_id` still belongs to `generation`.
    pub async fn is_active(&self, user_id: &str, generation: u64) -> bool {
        self.inner
            .lock()
            .await
            .sessions
            .get(user_id)
            .map(|r| r.generation == generation)
            .unwrap_or(false)
    }

    pub async fn get(&self, user_id: &str) -> Option<SessionRecord> {
        self.inner.lock().await.sessions.get(user_id).cloned()
    }

    pub async fn artifacts(&self, user_id: &str) -> Option<AuthArtifacts> {
        self.inner
            .lock()
            .await
            .sessions
            .get(user_id)
            .map(|r| r.artifacts.clone())
    }

    pub async fn has_session(&self, user_id: &str) -> bool {
        self.inner.lock().await.sessions.contains_key(user_id)
    }

    pub async fn active_users(&self) -> Vec<String> {
        self.inner.lock().await.sessions.keys().cloned().collect()
    }

    /// Remove the record only if it still carries `generation`. Used by a
    /// relay loop cleaning up after itself without clobbering a successor.
    pub async fn remove_if_generation(&self, user_id: &str, generation: u64) -> bool {
        let mut state = self.inner.lock().await;
        match state.sessions.get(user_id) {
            Some(r) if r.generation == generation => {
                state.sessions.remove(user_id);
                debug!(user_id, generation, "session record cleaned up");
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_is_single_per_user() {
        let registry = SessionRegistry::new();
        let g1 = registry.register("u1", AuthArtifacts::default()).await;
        let g2 = registry.register("u1", AuthArtifacts::default()).await;
        assert!(g2 > g1);
        assert_eq!(registry.active_users().await, vec!["u1".to_string()]);
        assert!(!registry.is_active("u1", g1).await);
        assert!(registry.is_active("u1", g2).await);
    }

    #[tokio::test]
    async fn test_remove_cancels_loop_view() {
        let registry = SessionRegistry::new();
        let generation = registry.register("u1", AuthArtifacts::default()).await;
        assert!(registry.is_active("u1", generation).await);
        assert!(registry.remove("u1").await);
        assert!(!registry.is_active("u1", generation).await);
        assert!(!registry.remove("u1").await);
    }

    #[tokio::test]
    async fn test_remove_if_generation_skips_successor() {
        let registry = SessionRegistry::new();
        let old = registry.register("u1", AuthArtifacts::default()).await;
        let new = registry.register("u1", AuthArtifacts::default()).await;
        assert!(!registry.remove_if_generation("u1", old).await);
        assert!(registry.has_session("u1").await);
        assert!(registry.remove_if_generation("u1", new).await);
        assert!(!registry.has_session("u1").await);
    }

    #[tokio::test]
    async fn test_artifacts_round_trip() {
        let registry = SessionRegistry::new();
        let mut artifacts = AuthArtifacts::default();
        artifacts
            .local_storage
            .insert("token".to_string(), "abc".to_string());
        registry.register("u1", artifacts).await;
        let got = registry.artifacts("u1").await.unwrap();
        assert_eq!(got.local_storage.get("token").map(String::as_str), Some("abc"));
        assert!(registry.artifacts("u2").await.is_none());
    }
}
