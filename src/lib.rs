//! Scopekeeper - reference-counted session and scope lifecycle manager
//!
//! This library binds every unit of work (an HTTP request, or one item of a
//! parallel fan-out) to a shared, reference-counted session and an isolated
//! dependency scope, and reclaims sessions safely under concurrent access,
//! background expiration sweeps, and mid-flight cancellation.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//!
//! - `scope`: Per-unit-of-work dependency containers and the service provider
//! - `session`: Sessions, the registry, scope leases, fan-out and the sweeper
//! - `server`: Axum binding middleware, handlers and the serve loop
//! - `config`: Configuration management and validation
//! - `logging`: Tracing subscriber setup
//! - `error`: Error types and result aliases
//! - `cli`: Command-line interface definition
//!
//! # Example
//!
//! ```
//! use scopekeeper::scope::{ScopeFactory, ServiceCollection};
//! use scopekeeper::session::SessionRegistry;
//! use std::sync::Arc;
//!
//! let scopes = Arc::new(ScopeFactory::new(ServiceCollection::new().build()));
//! let registry = Arc::new(SessionRegistry::new(scopes, chrono::Duration::minutes(30)));
//!
//! let scope = registry.scope_factory().create_scope(None);
//! let session = registry.create_session(scope.id()).unwrap();
//! assert_eq!(registry.get_session(&session.id()).unwrap().id(), session.id());
//! ```

pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod scope;
pub mod server;
pub mod session;

// Re-export commonly used types
pub use config::Config;
pub use error::{CoreResult, Result, ScopekeeperError};
pub use scope::{ScopeContainer, ScopeFactory, ScopeId, ServiceCollection};
pub use session::{ExpirationSweeper, Session, SessionId, SessionRegistry};

#[cfg(test)]
pub mod test_utils;
