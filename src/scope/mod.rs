//! Scope module for Scopekeeper
//!
//! Scopes are per-unit-of-work dependency containers. This module holds the
//! container and factory as well as the service provider they resolve from.

pub mod container;
pub mod provider;

pub use container::{ScopeContainer, ScopeFactory, ScopeId, ScopeOrigin};
pub use provider::{ServiceCollection, ServiceLifetime, ServiceProvider, ServiceScope};
