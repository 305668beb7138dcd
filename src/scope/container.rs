//! Scope containers and the factory that creates them
//!
//! A [`ScopeContainer`] is the isolated dependency context of one unit of
//! work: one inbound request, or one fan-out work item. Child containers
//! created for sub-tasks keep their parent's id and session link so log lines
//! correlate, but resolve through their own service scope.

use crate::error::{CoreResult, ScopekeeperError};
use crate::scope::provider::{ServiceProvider, ServiceScope};
use crate::session::SessionId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{debug, trace};
use uuid::Uuid;

/// Identifier of a unit of work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScopeId(Uuid);

impl ScopeId {
    /// Generate a new random scope id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ScopeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ScopeId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// Where a container's identity came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeOrigin {
    /// A standalone scope with a freshly minted id
    Root,
    /// A nested scope reusing its parent's id
    Child {
        /// Nesting level, 1 for a direct child of a root scope
        depth: usize,
    },
}

/// An isolated dependency-resolution context for one unit of work
pub struct ScopeContainer {
    id: ScopeId,
    origin: ScopeOrigin,
    session_id: OnceLock<SessionId>,
    services: Arc<ServiceScope>,
    /// Whether dispose releases `services`; false for views over a scope
    /// somebody else releases.
    owns_services: bool,
    disposed: AtomicBool,
}

impl ScopeContainer {
    fn new(
        id: ScopeId,
        origin: ScopeOrigin,
        session_id: Option<SessionId>,
        services: Arc<ServiceScope>,
        owns_services: bool,
    ) -> Self {
        let cell = OnceLock::new();
        if let Some(session_id) = session_id {
            let _ = cell.set(session_id);
        }
        Self {
            id,
            origin,
            session_id: cell,
            services,
            owns_services,
            disposed: AtomicBool::new(false),
        }
    }

    /// The scope id, shared with the parent for child scopes
    pub fn id(&self) -> ScopeId {
        self.id
    }

    /// How this container was created
    pub fn origin(&self) -> ScopeOrigin {
        self.origin
    }

    /// True when this container reuses a parent's identity
    pub fn is_child(&self) -> bool {
        matches!(self.origin, ScopeOrigin::Child { .. })
    }

    /// True when disposing this container releases its service scope
    pub fn owns_services(&self) -> bool {
        self.owns_services
    }

    /// The session this scope is linked to, if any
    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id.get().copied()
    }

    /// Link this scope to a session
    ///
    /// Binding the same session again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `ScopekeeperError::ScopeAlreadyBound` if the scope is already
    /// linked to a different session.
    pub fn bind_session(&self, session_id: SessionId) -> CoreResult<()> {
        let bound = *self.session_id.get_or_init(|| session_id);
        if bound != session_id {
            return Err(ScopekeeperError::ScopeAlreadyBound {
                scope_id: self.id,
                session_id: bound,
            });
        }
        Ok(())
    }

    /// Resolve a service from this container's own service scope
    ///
    /// # Errors
    ///
    /// Returns `ScopekeeperError::ScopeDisposed` after [`ScopeContainer::dispose`]
    /// and `ScopekeeperError::ScopeResolution` for unregistered types.
    pub fn get_service<T>(&self) -> CoreResult<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        if self.is_disposed() {
            return Err(ScopekeeperError::ScopeDisposed(self.id));
        }
        self.services.get_service::<T>()
    }

    /// Check whether the container has been disposed
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Dispose the container, releasing its service scope if it owns one
    ///
    /// Safe to call any number of times; returns true only for the call that
    /// performed the disposal.
    pub fn dispose(&self) -> bool {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return false;
        }
        if self.owns_services {
            self.services.release();
        }
        trace!(scope.id = %self.id, scope.owns_services = self.owns_services, "Scope disposed");
        true
    }
}

impl Drop for ScopeContainer {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for ScopeContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeContainer")
            .field("id", &self.id)
            .field("origin", &self.origin)
            .field("session_id", &self.session_id())
            .field("owns_services", &self.owns_services)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Creates [`ScopeContainer`]s over a shared [`ServiceProvider`]
pub struct ScopeFactory {
    provider: Arc<ServiceProvider>,
    root: Arc<ServiceScope>,
}

impl ScopeFactory {
    /// Create a factory resolving from `provider`
    pub fn new(provider: Arc<ServiceProvider>) -> Self {
        let root = Arc::new(provider.create_scope());
        Self { provider, root }
    }

    /// The provider every scope resolves from
    pub fn provider(&self) -> &Arc<ServiceProvider> {
        &self.provider
    }

    /// Create a scope, optionally nested under `parent`
    ///
    /// Without a parent the scope gets a fresh id and its own service scope.
    /// With a parent it reuses the parent's id and session link and derives
    /// its own service scope from the parent's; disposing it never touches the
    /// parent.
    pub fn create_scope(&self, parent: Option<&ScopeContainer>) -> Arc<ScopeContainer> {
        let container = match parent {
            None => ScopeContainer::new(
                ScopeId::new(),
                ScopeOrigin::Root,
                None,
                Arc::new(self.provider.create_scope()),
                true,
            ),
            Some(parent) => {
                let depth = match parent.origin {
                    ScopeOrigin::Root => 1,
                    ScopeOrigin::Child { depth } => depth + 1,
                };
                ScopeContainer::new(
                    parent.id,
                    ScopeOrigin::Child { depth },
                    parent.session_id(),
                    Arc::new(parent.services.create_child()),
                    true,
                )
            }
        };

        debug!(
            scope.id = %container.id,
            scope.origin = ?container.origin,
            "Scope created"
        );
        Arc::new(container)
    }

    /// A container over the factory's long-lived root scope
    ///
    /// Used by background work that is not tied to a request. Disposing it
    /// leaves the root scope intact.
    pub fn root_container(&self) -> Arc<ScopeContainer> {
        Arc::new(ScopeContainer::new(
            ScopeId::new(),
            ScopeOrigin::Root,
            None,
            Arc::clone(&self.root),
            false,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::ServiceCollection;
    use std::sync::atomic::AtomicUsize;

    struct Scoped;

    struct DropProbe(Arc<AtomicUsize>);

    impl Drop for DropProbe {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn factory() -> ScopeFactory {
        ScopeFactory::new(ServiceCollection::new().add_scoped(|_| Ok(Scoped)).build())
    }

    #[test]
    fn test_root_scope_gets_fresh_id() {
        let factory = factory();
        let a = factory.create_scope(None);
        let b = factory.create_scope(None);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.origin(), ScopeOrigin::Root);
        assert!(a.session_id().is_none());
        assert!(a.owns_services());
    }

    #[test]
    fn test_child_scope_inherits_identity_and_session() {
        let factory = factory();
        let parent = factory.create_scope(None);
        let session_id = SessionId::new();
        parent.bind_session(session_id).unwrap();

        let child = factory.create_scope(Some(&parent));
        let grandchild = factory.create_scope(Some(&child));

        assert_eq!(child.id(), parent.id());
        assert_eq!(child.session_id(), Some(session_id));
        assert_eq!(child.origin(), ScopeOrigin::Child { depth: 1 });
        assert_eq!(grandchild.origin(), ScopeOrigin::Child { depth: 2 });
        assert!(child.is_child());
    }

    #[test]
    fn test_child_scope_resolves_own_scoped_instances() {
        let factory = factory();
        let parent = factory.create_scope(None);
        let child = factory.create_scope(Some(&parent));

        let from_parent = parent.get_service::<Scoped>().unwrap();
        let from_child = child.get_service::<Scoped>().unwrap();
        assert!(!Arc::ptr_eq(&from_parent, &from_child));
    }

    #[test]
    fn test_dispose_is_idempotent_and_releases_once() {
        let dropped = Arc::new(AtomicUsize::new(0));
        let d = Arc::clone(&dropped);
        let factory = ScopeFactory::new(
            ServiceCollection::new()
                .add_scoped(move |_| Ok(DropProbe(Arc::clone(&d))))
                .build(),
        );

        let scope = factory.create_scope(None);
        drop(scope.get_service::<DropProbe>().unwrap());

        assert!(scope.dispose());
        assert!(!scope.dispose());
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
        assert!(matches!(
            scope.get_service::<DropProbe>(),
            Err(ScopekeeperError::ScopeDisposed(_))
        ));
    }

    #[test]
    fn test_disposing_child_leaves_parent_usable() {
        let factory = factory();
        let parent = factory.create_scope(None);
        let child = factory.create_scope(Some(&parent));

        assert!(child.dispose());
        assert!(!parent.is_disposed());
        assert!(parent.get_service::<Scoped>().is_ok());
    }

    #[test]
    fn test_root_container_does_not_release_shared_scope() {
        let factory = factory();
        let first = factory.root_container();
        let instance = first.get_service::<Scoped>().unwrap();
        assert!(!first.owns_services());
        assert!(first.dispose());

        let second = factory.root_container();
        let again = second.get_service::<Scoped>().unwrap();
        assert!(Arc::ptr_eq(&instance, &again));
    }

    #[test]
    fn test_bind_session_rejects_second_session() {
        let factory = factory();
        let scope = factory.create_scope(None);
        let first = SessionId::new();
        scope.bind_session(first).unwrap();
        scope.bind_session(first).unwrap();

        let err = scope.bind_session(SessionId::new()).unwrap_err();
        assert!(matches!(err, ScopekeeperError::ScopeAlreadyBound { .. }));
    }

    #[test]
    fn test_unregistered_service_is_error() {
        let factory = factory();
        let scope = factory.create_scope(None);
        assert!(matches!(
            scope.get_service::<String>(),
            Err(ScopekeeperError::ScopeResolution { .. })
        ));
    }

    #[test]
    fn test_scope_id_round_trips_through_string() {
        let id = ScopeId::new();
        let parsed: ScopeId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }
}
