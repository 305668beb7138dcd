//! Error types for Scopekeeper
//!
//! This module defines the error taxonomy for the session and scope
//! lifecycle, using `thiserror` for ergonomic error handling.

use crate::scope::ScopeId;
use crate::session::SessionId;
use thiserror::Error;

/// Main error type for Scopekeeper operations
///
/// Lifecycle operations return this type directly (see [`CoreResult`]) so
/// callers can match on `SessionNotFound` and recover. Application-level code
/// wraps it in `anyhow::Error` through [`Result`].
#[derive(Error, Debug)]
pub enum ScopekeeperError {
    /// A session was requested (by id or by attached order) that does not
    /// exist or has already been reclaimed
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// A requested dependency type is not registered with the provider
    #[error("Scope resolution error: no service registered for {type_name}")]
    ScopeResolution {
        /// Fully qualified name of the requested type
        type_name: &'static str,
    },

    /// The scope has already been disposed
    #[error("Scope disposed: {0}")]
    ScopeDisposed(ScopeId),

    /// The scope is not referencing any session
    #[error("Scope is not bound to a session: {0}")]
    ScopeNotBound(ScopeId),

    /// The scope already references a different session
    #[error("Scope {scope_id} is already bound to session {session_id}")]
    ScopeAlreadyBound {
        /// The scope being bound
        scope_id: ScopeId,
        /// The session the scope currently references
        session_id: SessionId,
    },

    /// The session already holds an order, or the job id is held elsewhere
    #[error("Order {job_id} cannot be attached to session {session_id}: an order is already attached")]
    OrderAlreadyAttached {
        /// Session the order was attached to
        session_id: SessionId,
        /// Job id of the rejected order
        job_id: String,
    },

    /// End-of-life disposal of a session failed; the session is still removed
    #[error("Cleanup failure for session {session_id}: {message}")]
    CleanupFailure {
        /// The session being ended
        session_id: SessionId,
        /// Joined messages from the failing end hooks
        message: String,
    },

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl ScopekeeperError {
    /// Returns true for `SessionNotFound`
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::SessionNotFound(_))
    }
}

/// Result type for lifecycle operations that callers need to match on
pub type CoreResult<T> = std::result::Result<T, ScopekeeperError>;

/// Result type alias for application-level operations
///
/// This is a convenience alias that uses `anyhow::Error` as the error type,
/// allowing for rich error context and easy error propagation.
pub type Result<T> = anyhow::Result<T>;
