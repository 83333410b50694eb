use std::sync::Arc;

use api_types::protocol::UserProfile;
use tokio::sync::{watch, Mutex};
use tracing::info;

/// The access/refresh token pair for the authenticated session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTokens {
    pub access_token: String,
    pub refresh_token: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub tokens: SessionTokens,
    pub user: UserProfile,
    pub version: u64,
}

#[derive(Debug)]
struct ActiveSession {
    tokens: SessionTokens,
    user: UserProfile,
    version: u64,
}

/// Single source of truth for the current session.
///
/// The token pair is mutated only by login (`install`), a successful refresh
/// (`rotate`), and logout (`clear`); each mutation is one atomic replace that
/// bumps a monotonic version published on the `watch` channel. Version 0 means
/// no session is active.
pub struct SessionStore {
    inner: Mutex<SessionSlot>,
    versions: watch::Sender<u64>,
}

#[derive(Default)]
struct SessionSlot {
    active: Option<ActiveSession>,
    last_version: u64,
}

impl SessionStore {
    pub fn new() -> Arc<Self> {
        let (versions, _) = watch::channel(0);
        Arc::new(Self {
            inner: Mutex::new(SessionSlot::default()),
            versions,
        })
    }

    pub async fn install(&self, tokens: SessionTokens, user: UserProfile) -> u64 {
        let mut slot = self.inner.lock().await;
        slot.last_version += 1;
        let version = slot.last_version;
        slot.active = Some(ActiveSession {
            tokens,
            user,
            version,
        });
        drop(slot);
        self.versions.send_replace(version);
        info!(version, "session: installed");
        version
    }

    /// Replaces the token pair after a successful refresh. Returns the new
    /// version, or `None` when no session is active (e.g. a logout raced the
    /// refresh response).
    pub async fn rotate(&self, tokens: SessionTokens) -> Option<u64> {
        let mut slot = self.inner.lock().await;
        let slot = &mut *slot;
        let active = slot.active.as_mut()?;
        slot.last_version += 1;
        let version = slot.last_version;
        active.tokens = tokens;
        active.version = version;
        self.versions.send_replace(version);
        info!(version, "session: tokens rotated");
        Some(version)
    }

    pub async fn clear(&self) {
        let mut slot = self.inner.lock().await;
        if slot.active.take().is_none() {
            return;
        }
        drop(slot);
        self.versions.send_replace(0);
        info!("session: cleared");
    }

    pub async fn current(&self) -> Option<SessionSnapshot> {
        let slot = self.inner.lock().await;
        slot.active.as_ref().map(|active| SessionSnapshot {
            tokens: active.tokens.clone(),
            user: active.user.clone(),
            version: active.version,
        })
    }

    pub async fn access_token(&self) -> Option<String> {
        let slot = self.inner.lock().await;
        slot.active
            .as_ref()
            .map(|active| active.tokens.access_token.clone())
    }

    pub async fn refresh_token(&self) -> Option<String> {
        let slot = self.inner.lock().await;
        slot.active
            .as_ref()
            .map(|active| active.tokens.refresh_token.clone())
    }

    pub fn subscribe_versions(&self) -> watch::Receiver<u64> {
        self.versions.subscribe()
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
