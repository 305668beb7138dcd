//! Process-wide session registry
//!
//! The registry maps session ids to shared [`Session`]s and keeps two reverse
//! indexes: scope id to session id (so a scope can be released without the
//! caller knowing its session) and order job id to session id.
//!
//! # Concurrency
//!
//! Each session's reference set and its "ended" flag share one lock. Adding a
//! reference fails once the flag is set, and ending re-reads the reference
//! set under that lock before setting the flag, so a session with a live
//! reference is never destroyed. Lock order is: order index entry, then the
//! session's reference lock, then the scope index. DashMap guards are never
//! held across an `.await`.

use crate::config::SessionConfig;
use crate::error::{CoreResult, ScopekeeperError};
use crate::scope::{ScopeContainer, ScopeFactory, ScopeId};
use crate::session::lease::ScopeLease;
use crate::session::metrics;
use crate::session::order::Order;
use crate::session::types::{Session, SessionId};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Hook run after a session has been removed from the registry
///
/// Used for end-of-life disposal the session cannot do itself, such as
/// persisting order state. A failing hook never keeps a session registered.
#[async_trait]
pub trait SessionEndHook: Send + Sync {
    /// Called once per ended session
    async fn on_session_ended(&self, session: &Session) -> anyhow::Result<()>;
}

/// Result of an attempt to end a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndOutcome {
    /// The session was removed by this call
    Ended,
    /// The session was not registered (never existed or already ended)
    AlreadyEnded,
    /// The session still has scope references and was kept
    InUse,
    /// The session is unreferenced but neither expired nor immediate-expiry
    NotEligible,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EndReason {
    Explicit,
    Reclaimed,
}

impl EndReason {
    fn as_str(self) -> &'static str {
        match self {
            Self::Explicit => "explicit",
            Self::Reclaimed => "reclaimed",
        }
    }
}

/// Registry of live sessions
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<Session>>,
    scope_index: DashMap<ScopeId, SessionId>,
    order_index: DashMap<String, SessionId>,
    scopes: Arc<ScopeFactory>,
    default_duration: Duration,
    end_hooks: Vec<Arc<dyn SessionEndHook>>,
}

impl SessionRegistry {
    /// Create a registry whose sessions live for `default_duration` after
    /// their last lookup
    pub fn new(scopes: Arc<ScopeFactory>, default_duration: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            scope_index: DashMap::new(),
            order_index: DashMap::new(),
            scopes,
            default_duration,
            end_hooks: Vec::new(),
        }
    }

    /// Create a registry from session configuration
    pub fn from_config(scopes: Arc<ScopeFactory>, config: &SessionConfig) -> Self {
        Self::new(scopes, config.default_duration())
    }

    /// Add a hook run after every ended session
    ///
    /// # Returns
    ///
    /// Returns self for method chaining
    pub fn with_end_hook(mut self, hook: Arc<dyn SessionEndHook>) -> Self {
        self.end_hooks.push(hook);
        self
    }

    /// The factory used for fan-out item scopes
    pub fn scope_factory(&self) -> &Arc<ScopeFactory> {
        &self.scopes
    }

    /// Default time-to-live for new sessions
    pub fn default_duration(&self) -> Duration {
        self.default_duration
    }

    /// Number of registered sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Check if no sessions are registered
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Check whether a session is registered, without touching it
    pub fn contains(&self, session_id: &SessionId) -> bool {
        self.sessions.contains_key(session_id)
    }

    /// Ids of every registered session
    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|entry| *entry.key()).collect()
    }

    /// Create and register a session referenced by `initial_scope_id`
    ///
    /// The reference is added before the session becomes visible, so no
    /// sweep can observe it unreferenced.
    ///
    /// # Arguments
    ///
    /// * `initial_scope_id` - Scope that holds the first reference
    ///
    /// # Returns
    ///
    /// The registered session, expiring after the default duration
    ///
    /// # Errors
    ///
    /// Returns `ScopekeeperError::ScopeAlreadyBound` if the scope already
    /// references another session.
    pub fn create_session(&self, initial_scope_id: ScopeId) -> CoreResult<Arc<Session>> {
        let session = Arc::new(Session::new(self.default_duration, Utc::now()));
        self.add_scope_ref(&session, initial_scope_id)?;
        self.sessions.insert(session.id(), Arc::clone(&session));
        metrics::session_created();

        info!(
            session.id = %session.id(),
            scope.id = %initial_scope_id,
            session.expires_at = %session.expires_at(),
            "Session created"
        );
        Ok(session)
    }

    /// Look up a live session and refresh its expiry
    ///
    /// # Errors
    ///
    /// Returns `ScopekeeperError::SessionNotFound` if the session is unknown,
    /// ended, or expired with no scope referencing it.
    pub fn get_session(&self, session_id: &SessionId) -> CoreResult<Arc<Session>> {
        let now = Utc::now();
        let session = self.live_session(session_id, now)?;
        session.touch(now);
        debug!(session.id = %session_id, "Session resolved");
        Ok(session)
    }

    /// Find the session holding order `job_id` and reference it from
    /// `requesting_scope_id`
    ///
    /// The lookup and the new reference happen together: if the session is
    /// reclaimed in between, the call fails instead of referencing an ended
    /// session.
    ///
    /// # Arguments
    ///
    /// * `job_id` - Job id of the attached order
    /// * `requesting_scope_id` - Scope that will reference the session
    ///
    /// # Errors
    ///
    /// Returns `ScopekeeperError::SessionNotFound` if no live session holds
    /// the order.
    pub fn get_session_by_order(
        &self,
        job_id: &str,
        requesting_scope_id: ScopeId,
    ) -> CoreResult<Arc<Session>> {
        let not_found = || ScopekeeperError::SessionNotFound(format!("no session holds order {}", job_id));

        let session_id = self
            .order_index
            .get(job_id)
            .map(|entry| *entry.value())
            .ok_or_else(not_found)?;

        let now = Utc::now();
        let session = self
            .live_session(&session_id, now)
            .map_err(|_| not_found())?;

        self.add_scope_ref(&session, requesting_scope_id)
            .map_err(|e| if e.is_not_found() { not_found() } else { e })?;
        session.touch(now);

        debug!(
            session.id = %session_id,
            order.job_id = job_id,
            scope.id = %requesting_scope_id,
            "Session resolved by order"
        );
        Ok(session)
    }

    /// Attach `order` to the session referenced by `scope_id`
    ///
    /// # Errors
    ///
    /// Returns `ScopekeeperError::ScopeNotBound` if the scope references no
    /// session, and `ScopekeeperError::OrderAlreadyAttached` if the session
    /// already has an order or the job id is held by another session.
    pub fn add_order(&self, scope_id: ScopeId, order: Order) -> CoreResult<Arc<Order>> {
        let session = self
            .session_for_scope(&scope_id)
            .ok_or(ScopekeeperError::ScopeNotBound(scope_id))?;
        let order = Arc::new(order);
        let job_id = order.job_id().to_string();
        let rejected = || ScopekeeperError::OrderAlreadyAttached {
            session_id: session.id(),
            job_id: job_id.clone(),
        };

        match self.order_index.entry(job_id.clone()) {
            Entry::Occupied(_) => return Err(rejected()),
            Entry::Vacant(vacant) => {
                {
                    let refs = session.lock_refs();
                    if refs.is_ended() {
                        return Err(ScopekeeperError::SessionNotFound(session.id().to_string()));
                    }
                    session
                        .attach_order(Arc::clone(&order))
                        .map_err(|_| rejected())?;
                }
                vacant.insert(session.id());
            }
        }

        info!(
            session.id = %session.id(),
            order.job_id = %job_id,
            order.items = order.items().len(),
            "Order attached"
        );
        Ok(order)
    }

    /// Record that `scope_id` references `session`
    ///
    /// References are counted: a scope id added twice must be removed twice.
    ///
    /// # Errors
    ///
    /// Returns `ScopekeeperError::SessionNotFound` if the session has ended,
    /// and `ScopekeeperError::ScopeAlreadyBound` if the scope references a
    /// different session.
    pub fn add_scope_ref(&self, session: &Session, scope_id: ScopeId) -> CoreResult<()> {
        let mut refs = session.lock_refs();
        if refs.is_ended() {
            return Err(ScopekeeperError::SessionNotFound(session.id().to_string()));
        }

        match self.scope_index.entry(scope_id) {
            Entry::Occupied(occupied) if *occupied.get() != session.id() => {
                return Err(ScopekeeperError::ScopeAlreadyBound {
                    scope_id,
                    session_id: *occupied.get(),
                });
            }
            Entry::Occupied(_) => {}
            Entry::Vacant(vacant) => {
                vacant.insert(session.id());
            }
        }

        refs.add(scope_id);
        debug!(
            session.id = %session.id(),
            scope.id = %scope_id,
            session.scope_count = refs.total(),
            "Scope reference added"
        );
        Ok(())
    }

    /// Drop one reference held by `scope_id`
    ///
    /// Returns the session the scope referenced, or `None` if the scope
    /// referenced nothing. Removing an unknown scope is a no-op.
    pub fn remove_scope_ref(&self, scope_id: &ScopeId) -> Option<Arc<Session>> {
        let session_id = match self.scope_index.get(scope_id).map(|entry| *entry.value()) {
            Some(session_id) => session_id,
            None => {
                debug!(scope.id = %scope_id, "Scope holds no session reference");
                return None;
            }
        };

        let session = match self.sessions.get(&session_id).map(|e| Arc::clone(e.value())) {
            Some(session) => session,
            None => {
                self.scope_index.remove_if(scope_id, |_, sid| *sid == session_id);
                return None;
            }
        };

        let mut refs = session.lock_refs();
        match refs.remove(scope_id) {
            Some(0) | None => {
                self.scope_index.remove_if(scope_id, |_, sid| *sid == session_id);
            }
            Some(_) => {}
        }
        debug!(
            session.id = %session_id,
            scope.id = %scope_id,
            session.scope_count = refs.total(),
            "Scope reference removed"
        );
        drop(refs);

        Some(session)
    }

    /// The session `scope_id` currently references
    pub fn session_for_scope(&self, scope_id: &ScopeId) -> Option<Arc<Session>> {
        let session_id = self.scope_index.get(scope_id).map(|entry| *entry.value())?;
        self.sessions
            .get(&session_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Reference `session` from `scope` and hand back a lease that releases
    /// the reference exactly once
    ///
    /// # Arguments
    ///
    /// * `scope` - Scope to bind; it must be unbound or already bound to
    ///   `session`
    /// * `session` - Live session to reference
    ///
    /// # Returns
    ///
    /// A [`ScopeLease`] that must be released when the scope's work is done
    ///
    /// # Errors
    ///
    /// Returns `ScopekeeperError::SessionNotFound` if the session has ended
    /// and `ScopekeeperError::ScopeAlreadyBound` if the scope is linked to a
    /// different session.
    pub fn attach_scope(
        self: &Arc<Self>,
        scope: Arc<ScopeContainer>,
        session: &Session,
    ) -> CoreResult<ScopeLease> {
        if let Some(bound) = scope.session_id() {
            if bound != session.id() {
                return Err(ScopekeeperError::ScopeAlreadyBound {
                    scope_id: scope.id(),
                    session_id: bound,
                });
            }
        }

        self.add_scope_ref(session, scope.id())?;
        if let Err(e) = scope.bind_session(session.id()) {
            self.remove_scope_ref(&scope.id());
            return Err(e);
        }
        Ok(ScopeLease::new(Arc::clone(self), scope, session.id()))
    }

    /// Create a session referenced by `scope` and hand back its lease
    ///
    /// # Errors
    ///
    /// Returns `ScopekeeperError::ScopeAlreadyBound` if the scope is already
    /// linked to a session.
    pub fn attach_new_session(
        self: &Arc<Self>,
        scope: Arc<ScopeContainer>,
    ) -> CoreResult<(Arc<Session>, ScopeLease)> {
        if let Some(bound) = scope.session_id() {
            return Err(ScopekeeperError::ScopeAlreadyBound {
                scope_id: scope.id(),
                session_id: bound,
            });
        }

        let session = self.create_session(scope.id())?;
        if let Err(e) = scope.bind_session(session.id()) {
            self.remove_scope_ref(&scope.id());
            return Err(e);
        }
        let lease = ScopeLease::new(Arc::clone(self), scope, session.id());
        Ok((session, lease))
    }

    /// Resolve the session holding order `job_id`, reference it from `scope`
    /// and hand back its lease
    ///
    /// # Errors
    ///
    /// Returns `ScopekeeperError::SessionNotFound` if no live session holds
    /// the order, and `ScopekeeperError::ScopeAlreadyBound` if the scope is
    /// linked to a different session.
    pub fn attach_by_order(
        self: &Arc<Self>,
        job_id: &str,
        scope: Arc<ScopeContainer>,
    ) -> CoreResult<(Arc<Session>, ScopeLease)> {
        let session = self.get_session_by_order(job_id, scope.id())?;
        if let Err(e) = scope.bind_session(session.id()) {
            self.remove_scope_ref(&scope.id());
            return Err(e);
        }
        let lease = ScopeLease::new(Arc::clone(self), scope, session.id());
        Ok((session, lease))
    }

    /// Drop the reference held by `scope_id` and end the session if that
    /// made it reclaimable
    ///
    /// Returns `None` if the scope referenced nothing. Cleanup failures are
    /// logged; the session is removed regardless.
    pub async fn release_scope(&self, scope_id: &ScopeId) -> Option<EndOutcome> {
        let session = self.remove_scope_ref(scope_id)?;
        match self.reclaim_session(&session.id()).await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                warn!(
                    session.id = %session.id(),
                    scope.id = %scope_id,
                    error = %e,
                    "Session cleanup failed after scope release"
                );
                Some(EndOutcome::Ended)
            }
        }
    }

    /// End a session
    ///
    /// Idempotent: ending an unknown or already ended session returns
    /// `EndOutcome::AlreadyEnded`. A session with live references is kept
    /// and `EndOutcome::InUse` is returned.
    ///
    /// # Errors
    ///
    /// Returns `ScopekeeperError::CleanupFailure` if an end hook failed; the
    /// session has been removed in that case.
    pub async fn end_session(&self, session_id: &SessionId) -> CoreResult<EndOutcome> {
        self.end_with(session_id, EndReason::Explicit, Utc::now())
            .await
    }

    /// End a session only if it is reclaimable right now
    ///
    /// Eligibility is re-validated under the session's reference lock, so a
    /// reference added after a sweep snapshot keeps the session alive.
    ///
    /// # Errors
    ///
    /// Returns `ScopekeeperError::CleanupFailure` if an end hook failed.
    pub async fn reclaim_session(&self, session_id: &SessionId) -> CoreResult<EndOutcome> {
        self.end_with(session_id, EndReason::Reclaimed, Utc::now())
            .await
    }

    /// Ids of sessions reclaimable at `now`
    pub fn reclaimable_sessions(&self, now: DateTime<Utc>) -> Vec<SessionId> {
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        sessions
            .into_iter()
            .filter(|session| session.is_reclaimable_at(now))
            .map(|session| session.id())
            .collect()
    }

    /// End every unreferenced session
    ///
    /// Sessions still referenced are logged and kept. Returns the number of
    /// sessions ended.
    pub async fn shutdown(&self) -> usize {
        let mut ended = 0;
        for session_id in self.session_ids() {
            match self.end_session(&session_id).await {
                Ok(EndOutcome::Ended) => ended += 1,
                Ok(EndOutcome::InUse) => {
                    warn!(session.id = %session_id, "Session still referenced at shutdown")
                }
                Ok(_) => {}
                Err(e) => {
                    ended += 1;
                    warn!(session.id = %session_id, error = %e, "Session cleanup failed at shutdown");
                }
            }
        }
        info!(sessions.ended = ended, sessions.remaining = self.len(), "Registry shut down");
        ended
    }

    fn live_session(&self, session_id: &SessionId, now: DateTime<Utc>) -> CoreResult<Arc<Session>> {
        let session = self
            .sessions
            .get(session_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ScopekeeperError::SessionNotFound(session_id.to_string()))?;

        let dead = {
            let refs = session.lock_refs();
            refs.is_ended() || (refs.total() == 0 && session.is_expired_at(now))
        };
        if dead {
            return Err(ScopekeeperError::SessionNotFound(session_id.to_string()));
        }
        Ok(session)
    }

    async fn end_with(
        &self,
        session_id: &SessionId,
        reason: EndReason,
        now: DateTime<Utc>,
    ) -> CoreResult<EndOutcome> {
        let session = match self.sessions.get(session_id).map(|e| Arc::clone(e.value())) {
            Some(session) => session,
            None => return Ok(EndOutcome::AlreadyEnded),
        };

        {
            let mut refs = session.lock_refs();
            if refs.is_ended() {
                return Ok(EndOutcome::AlreadyEnded);
            }
            if refs.total() > 0 {
                debug!(
                    session.id = %session_id,
                    session.scope_count = refs.total(),
                    "Session still referenced, not ending"
                );
                return Ok(EndOutcome::InUse);
            }
            if reason == EndReason::Reclaimed && !session.is_eligible_unreferenced(now) {
                return Ok(EndOutcome::NotEligible);
            }
            refs.mark_ended();
        }

        self.sessions
            .remove_if(session_id, |_, registered| Arc::ptr_eq(registered, &session));
        if let Some(order) = session.order() {
            self.order_index
                .remove_if(order.job_id(), |_, holder| holder == session_id);
        }
        session.release_resources();
        metrics::session_ended(reason.as_str());

        info!(
            session.id = %session_id,
            session.end_reason = reason.as_str(),
            "Session ended"
        );

        self.run_end_hooks(&session).await
    }

    async fn run_end_hooks(&self, session: &Session) -> CoreResult<EndOutcome> {
        let mut failures = Vec::new();
        for hook in &self.end_hooks {
            if let Err(e) = hook.on_session_ended(session).await {
                failures.push(format!("{:#}", e));
            }
        }

        if failures.is_empty() {
            return Ok(EndOutcome::Ended);
        }

        metrics::cleanup_failed();
        Err(ScopekeeperError::CleanupFailure {
            session_id: session.id(),
            message: failures.join("; "),
        })
    }
}
