//! Scoped ownership of a session reference
//!
//! A [`ScopeLease`] ties a scope's session reference to a value. Releasing
//! the lease (or dropping it) removes the reference exactly once and disposes
//! the scope, so a cancelled request or task cannot leak a reference.

use crate::scope::{ScopeContainer, ScopeId};
use crate::session::registry::{EndOutcome, SessionRegistry};
use crate::session::types::SessionId;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, warn};

/// A scope's reference to a session, released exactly once
#[must_use = "dropping a lease releases its session reference"]
pub struct ScopeLease {
    registry: Arc<SessionRegistry>,
    scope: Arc<ScopeContainer>,
    session_id: SessionId,
    released: bool,
}

impl ScopeLease {
    pub(crate) fn new(
        registry: Arc<SessionRegistry>,
        scope: Arc<ScopeContainer>,
        session_id: SessionId,
    ) -> Self {
        Self {
            registry,
            scope,
            session_id,
            released: false,
        }
    }

    /// The leased scope
    pub fn scope(&self) -> &Arc<ScopeContainer> {
        &self.scope
    }

    /// Id of the leased scope
    pub fn scope_id(&self) -> ScopeId {
        self.scope.id()
    }

    /// Session the scope references
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Remove the reference, end the session if it became reclaimable, and
    /// dispose the scope
    ///
    /// Returns the end outcome, or `None` if the reference was already gone.
    pub async fn release(mut self) -> Option<EndOutcome> {
        self.released = true;
        let outcome = self.registry.release_scope(&self.scope.id()).await;
        self.scope.dispose();
        debug!(
            scope.id = %self.scope.id(),
            session.id = %self.session_id,
            ?outcome,
            "Scope lease released"
        );
        outcome
    }
}

impl Drop for ScopeLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let session = self.registry.remove_scope_ref(&self.scope.id());
        self.scope.dispose();
        debug!(
            scope.id = %self.scope.id(),
            session.id = %self.session_id,
            "Scope lease dropped without release"
        );

        let Some(session) = session else {
            return;
        };
        if !session.is_reclaimable_at(Utc::now()) {
            return;
        }

        // Ending runs hooks, which are async; outside a runtime the sweeper
        // picks the session up on its next tick.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let registry = Arc::clone(&self.registry);
            let session_id = session.id();
            handle.spawn(async move {
                if let Err(e) = registry.reclaim_session(&session_id).await {
                    warn!(session.id = %session_id, error = %e, "Session cleanup failed after lease drop");
                }
            });
        }
    }
}

impl std::fmt::Debug for ScopeLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopeLease")
            .field("scope_id", &self.scope.id())
            .field("session_id", &self.session_id)
            .field("released", &self.released)
            .finish()
    }
}
