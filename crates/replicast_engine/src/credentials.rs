//! Credential state shared by the lifecycle coordinator.

use crate::auth::SessionAuthenticator;
use crate::error::{EngineError, EngineResult};
use parking_lot::RwLock;
use replicast_protocol::{AccessToken, SessionToken};
use tracing::{debug, warn};

/// Holds the session token and the current access token.
///
/// The session token is set exactly once per process. The access token is
/// replaced on every refresh and forgotten on disconnect.
#[derive(Debug, Default)]
pub struct CredentialStore {
    session: RwLock<Option<SessionToken>>,
    access: RwLock<Option<AccessToken>>,
    refreshes: RwLock<RefreshStats>,
}

/// Counters for access token refreshes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshStats {
    /// Refreshes that produced a token.
    pub succeeded: u64,
    /// Refreshes that completed without a token.
    pub absent: u64,
    /// Refreshes that failed in transport.
    pub failed: u64,
}

impl CredentialStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the session token.
    ///
    /// Fails with [`EngineError::SessionAlreadySet`] on a second call.
    pub fn set_session(&self, session: SessionToken) -> EngineResult<()> {
        let mut slot = self.session.write();
        if slot.is_some() {
            return Err(EngineError::SessionAlreadySet);
        }
        *slot = Some(session);
        Ok(())
    }

    /// Returns the session token, if login has happened.
    pub fn session(&self) -> Option<SessionToken> {
        self.session.read().clone()
    }

    /// Returns the current access token.
    pub fn access_token(&self) -> Option<AccessToken> {
        self.access.read().clone()
    }

    /// Forgets the access token.
    pub fn invalidate_access(&self) {
        if self.access.write().take().is_some() {
            debug!("access token invalidated");
        }
    }

    /// Returns refresh counters.
    pub fn refresh_stats(&self) -> RefreshStats {
        self.refreshes.read().clone()
    }

    /// Mints a new access token from the session and stores it.
    ///
    /// An absent result clears the stored token so a stale one is never
    /// applied after a reconnect.
    pub async fn refresh(
        &self,
        authenticator: &dyn SessionAuthenticator,
    ) -> EngineResult<Option<AccessToken>> {
        let session = self
            .session()
            .ok_or_else(|| EngineError::RefreshFailure("no session established".into()))?;

        match authenticator.refresh_access_token(&session).await {
            Ok(token) => {
                let mut stats = self.refreshes.write();
                if token.is_some() {
                    stats.succeeded += 1;
                } else {
                    stats.absent += 1;
                }
                *self.access.write() = token.clone();
                Ok(token)
            }
            Err(e) => {
                warn!(error = %e, "access token refresh failed");
                self.refreshes.write().failed += 1;
                self.access.write().take();
                Err(e)
            }
        }
    }
}
