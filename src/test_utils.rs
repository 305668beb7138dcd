//! Test utilities for Scopekeeper
//!
//! Shared builders for registries and scopes used by the unit tests.

use crate::scope::{ScopeFactory, ServiceCollection};
use crate::session::SessionRegistry;
use std::sync::Arc;

/// Registry over an empty service collection with a 30 minute default TTL
pub fn test_registry() -> Arc<SessionRegistry> {
    test_registry_with(ServiceCollection::new())
}

/// Registry resolving from `services` with a 30 minute default TTL
pub fn test_registry_with(services: ServiceCollection) -> Arc<SessionRegistry> {
    let scopes = Arc::new(ScopeFactory::new(services.build()));
    Arc::new(SessionRegistry::new(scopes, chrono::Duration::minutes(30)))
}

/// Poll `condition` until it holds, yielding to the runtime between checks
///
/// Returns whether the condition held within `attempts` polls of 10ms.
pub async fn eventually(attempts: usize, condition: impl Fn() -> bool) -> bool {
    for _ in 0..attempts {
        if condition() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    condition()
}
