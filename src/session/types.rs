//! Session data model
//!
//! A [`Session`] is shared between every scope that references it, so all of
//! its mutable state sits behind interior mutability. The registry is the only
//! component that changes the reference set; everything else on the session
//! may be updated by any holder.

use crate::scope::ScopeId;
use crate::session::order::Order;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, RwLock};
use uuid::Uuid;

/// Opaque session identifier, carried in the `X-Session-Id` header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generate a new random session id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// Identity associated with a session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionIdentity {
    /// Authenticated user, if any
    pub user_id: Option<String>,
    /// API key the session was opened with, if any
    pub api_key_value: Option<String>,
}

/// One entry of a conversation attached to a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationMessage {
    /// Speaker role ("user", "assistant", ...)
    pub role: String,
    /// Message body
    pub content: String,
    /// When the message was appended
    pub at: DateTime<Utc>,
}

/// Counted reference set plus the end-of-life flag
///
/// Both live under one lock so that "add a reference" and "decide to end"
/// are linearizable.
#[derive(Debug, Default)]
pub(crate) struct ScopeRefs {
    counts: HashMap<ScopeId, usize>,
    total: usize,
    ended: bool,
}

impl ScopeRefs {
    pub(crate) fn add(&mut self, scope_id: ScopeId) {
        *self.counts.entry(scope_id).or_insert(0) += 1;
        self.total += 1;
    }

    /// Drop one reference held by `scope_id`, returning the count it still holds
    pub(crate) fn remove(&mut self, scope_id: &ScopeId) -> Option<usize> {
        let count = self.counts.get_mut(scope_id)?;
        *count -= 1;
        self.total -= 1;
        let remaining = *count;
        if remaining == 0 {
            self.counts.remove(scope_id);
        }
        Some(remaining)
    }

    pub(crate) fn total(&self) -> usize {
        self.total
    }

    pub(crate) fn is_ended(&self) -> bool {
        self.ended
    }

    pub(crate) fn mark_ended(&mut self) {
        self.ended = true;
    }
}

#[derive(Debug, Clone, Copy)]
struct SessionTiming {
    last_accessed_at: DateTime<Utc>,
    duration: Option<Duration>,
    default_duration: Duration,
    expires_at: DateTime<Utc>,
}

impl SessionTiming {
    fn recompute(&mut self) {
        let ttl = self.duration.unwrap_or(self.default_duration);
        self.expires_at = expiry_after(self.last_accessed_at, ttl);
    }
}

/// `from + ttl`, saturating at the latest representable instant
fn expiry_after(from: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    from.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// A reference-counted unit of server-side state spanning requests and tasks
pub struct Session {
    id: SessionId,
    created_at: DateTime<Utc>,
    refs: Mutex<ScopeRefs>,
    identity: RwLock<SessionIdentity>,
    timing: Mutex<SessionTiming>,
    expires_immediately: AtomicBool,
    order: OnceLock<Arc<Order>>,
    conversations: DashMap<String, Vec<ConversationMessage>>,
}

impl Session {
    pub(crate) fn new(default_duration: Duration, now: DateTime<Utc>) -> Self {
        Self {
            id: SessionId::new(),
            created_at: now,
            refs: Mutex::new(ScopeRefs::default()),
            identity: RwLock::new(SessionIdentity::default()),
            timing: Mutex::new(SessionTiming {
                last_accessed_at: now,
                duration: None,
                default_duration,
                expires_at: expiry_after(now, default_duration),
            }),
            expires_immediately: AtomicBool::new(false),
            order: OnceLock::new(),
            conversations: DashMap::new(),
        }
    }

    /// Session id, fixed at creation
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Creation time, fixed at creation
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Time of the last successful lookup
    pub fn last_accessed_at(&self) -> DateTime<Utc> {
        lock(&self.timing).last_accessed_at
    }

    /// Absolute expiry instant
    pub fn expires_at(&self) -> DateTime<Utc> {
        lock(&self.timing).expires_at
    }

    /// Per-session time-to-live override
    pub fn duration(&self) -> Option<Duration> {
        lock(&self.timing).duration
    }

    /// Override the time-to-live; `None` restores the registry default
    ///
    /// The expiry is recomputed from the last access time.
    pub fn set_duration(&self, duration: Option<Duration>) {
        let mut timing = lock(&self.timing);
        timing.duration = duration;
        timing.recompute();
    }

    pub(crate) fn touch(&self, now: DateTime<Utc>) {
        let mut timing = lock(&self.timing);
        if now > timing.last_accessed_at {
            timing.last_accessed_at = now;
        }
        timing.recompute();
    }

    /// Whether the session is reclaimed as soon as it is unreferenced
    pub fn expires_immediately(&self) -> bool {
        self.expires_immediately.load(Ordering::Acquire)
    }

    /// Mark the session for reclamation once its last scope releases it
    pub fn set_expires_immediately(&self, value: bool) {
        self.expires_immediately.store(value, Ordering::Release);
    }

    /// Snapshot of the identity association
    pub fn identity(&self) -> SessionIdentity {
        self.identity
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Associate an authenticated user
    pub fn set_user_id(&self, user_id: Option<String>) {
        self.identity
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .user_id = user_id;
    }

    /// Associate an API key
    pub fn set_api_key_value(&self, api_key_value: Option<String>) {
        self.identity
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .api_key_value = api_key_value;
    }

    /// Number of live scope references
    pub fn scope_count(&self) -> usize {
        self.lock_refs().total()
    }

    /// Check whether `scope_id` currently references this session
    pub fn has_scope(&self, scope_id: &ScopeId) -> bool {
        self.lock_refs().counts.contains_key(scope_id)
    }

    /// Distinct scope ids currently referencing this session
    pub fn scope_ids(&self) -> Vec<ScopeId> {
        self.lock_refs().counts.keys().copied().collect()
    }

    /// True once the registry has ended this session
    pub fn is_ended(&self) -> bool {
        self.lock_refs().is_ended()
    }

    /// True when the absolute expiry lies before `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at() < now
    }

    /// Reclamation predicate
    ///
    /// A session is reclaimable when no scope references it and it is either
    /// flagged to expire immediately or past its expiry.
    pub fn is_reclaimable_at(&self, now: DateTime<Utc>) -> bool {
        let refs = self.lock_refs();
        !refs.is_ended() && refs.total() == 0 && self.is_eligible_unreferenced(now)
    }

    pub(crate) fn is_eligible_unreferenced(&self, now: DateTime<Utc>) -> bool {
        self.expires_immediately() || self.is_expired_at(now)
    }

    /// The attached order, if any
    pub fn order(&self) -> Option<Arc<Order>> {
        self.order.get().cloned()
    }

    pub(crate) fn attach_order(&self, order: Arc<Order>) -> Result<(), Arc<Order>> {
        self.order.set(order)
    }

    /// Append a message to a conversation, creating it if needed
    ///
    /// Returns the conversation length after the append.
    pub fn append_message(
        &self,
        conversation_id: &str,
        role: impl Into<String>,
        content: impl Into<String>,
    ) -> usize {
        let mut messages = self
            .conversations
            .entry(conversation_id.to_string())
            .or_default();
        messages.push(ConversationMessage {
            role: role.into(),
            content: content.into(),
            at: Utc::now(),
        });
        messages.len()
    }

    /// Snapshot of a conversation
    pub fn conversation(&self, conversation_id: &str) -> Option<Vec<ConversationMessage>> {
        self.conversations
            .get(conversation_id)
            .map(|messages| messages.clone())
    }

    /// Ids of every conversation held by this session
    pub fn conversation_ids(&self) -> Vec<String> {
        self.conversations
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Serializable view of the session
    pub fn snapshot(&self) -> SessionSnapshot {
        let timing = *lock(&self.timing);
        SessionSnapshot {
            id: self.id,
            created_at: self.created_at,
            last_accessed_at: timing.last_accessed_at,
            expires_at: timing.expires_at,
            expires_immediately: self.expires_immediately(),
            scope_count: self.scope_count(),
            identity: self.identity(),
            order_job_id: self.order().map(|o| o.job_id().to_string()),
            conversation_ids: self.conversation_ids(),
        }
    }

    pub(crate) fn lock_refs(&self) -> MutexGuard<'_, ScopeRefs> {
        lock(&self.refs)
    }

    pub(crate) fn release_resources(&self) {
        self.conversations.clear();
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .field("expires_at", &self.expires_at())
            .field("scope_count", &self.scope_count())
            .field("expires_immediately", &self.expires_immediately())
            .finish()
    }
}

/// Serializable view of a [`Session`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Session id
    pub id: SessionId,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last successful lookup
    pub last_accessed_at: DateTime<Utc>,
    /// Absolute expiry
    pub expires_at: DateTime<Utc>,
    /// Reclaim once unreferenced
    pub expires_immediately: bool,
    /// Live scope references
    pub scope_count: usize,
    /// Identity association
    pub identity: SessionIdentity,
    /// Job id of the attached order
    pub order_job_id: Option<String>,
    /// Conversation ids
    pub conversation_ids: Vec<String>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
