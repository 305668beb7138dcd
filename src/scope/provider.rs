//! Dependency resolution for scopes
//!
//! A [`ServiceCollection`] records how to build each service type and with
//! which lifetime. Building it yields a shared [`ServiceProvider`] that caches
//! singletons; every unit of work then resolves through its own
//! [`ServiceScope`], which caches scoped instances until it is released.

use crate::error::{CoreResult, ScopekeeperError};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type Instance = Arc<dyn Any + Send + Sync>;
type Factory = Arc<dyn Fn(&ServiceScope) -> CoreResult<Instance> + Send + Sync>;

/// How long a resolved instance lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceLifetime {
    /// One instance per provider, shared by every scope
    Singleton,
    /// One instance per scope
    Scoped,
    /// A new instance on every resolution
    Transient,
}

struct Registration {
    lifetime: ServiceLifetime,
    type_name: &'static str,
    factory: Factory,
}

/// Builder for a [`ServiceProvider`]
///
/// # Examples
///
/// ```
/// use scopekeeper::scope::ServiceCollection;
///
/// struct Greeter(String);
///
/// let provider = ServiceCollection::new()
///     .add_singleton(|_| Ok(Greeter("hello".to_string())))
///     .build();
/// let scope = provider.create_scope();
/// let greeter = scope.get_service::<Greeter>().unwrap();
/// assert_eq!(greeter.0, "hello");
/// ```
#[derive(Default)]
pub struct ServiceCollection {
    registrations: HashMap<TypeId, Registration>,
}

impl ServiceCollection {
    /// Create an empty collection
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service built at most once per provider
    pub fn add_singleton<T, F>(self, factory: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn(&ServiceScope) -> CoreResult<T> + Send + Sync + 'static,
    {
        self.add(ServiceLifetime::Singleton, factory)
    }

    /// Register a service built at most once per scope
    pub fn add_scoped<T, F>(self, factory: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn(&ServiceScope) -> CoreResult<T> + Send + Sync + 'static,
    {
        self.add(ServiceLifetime::Scoped, factory)
    }

    /// Register a service built on every resolution
    pub fn add_transient<T, F>(self, factory: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn(&ServiceScope) -> CoreResult<T> + Send + Sync + 'static,
    {
        self.add(ServiceLifetime::Transient, factory)
    }

    /// Register an already constructed singleton instance
    pub fn add_instance<T>(mut self, instance: Arc<T>) -> Self
    where
        T: Send + Sync + 'static,
    {
        let instance: Instance = instance;
        self.registrations.insert(
            TypeId::of::<T>(),
            Registration {
                lifetime: ServiceLifetime::Singleton,
                type_name: std::any::type_name::<T>(),
                factory: Arc::new(move |_| Ok(Arc::clone(&instance))),
            },
        );
        self
    }

    fn add<T, F>(mut self, lifetime: ServiceLifetime, factory: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn(&ServiceScope) -> CoreResult<T> + Send + Sync + 'static,
    {
        self.registrations.insert(
            TypeId::of::<T>(),
            Registration {
                lifetime,
                type_name: std::any::type_name::<T>(),
                factory: Arc::new(move |scope| factory(scope).map(|t| Arc::new(t) as Instance)),
            },
        );
        self
    }

    /// Number of registered service types
    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    /// Check if no service types are registered
    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Freeze the registrations into a shareable provider
    pub fn build(self) -> Arc<ServiceProvider> {
        Arc::new(ServiceProvider {
            registrations: self.registrations,
            singletons: Mutex::new(HashMap::new()),
        })
    }
}

/// Process-wide provider holding registrations and singleton instances
pub struct ServiceProvider {
    registrations: HashMap<TypeId, Registration>,
    singletons: Mutex<HashMap<TypeId, Instance>>,
}

impl ServiceProvider {
    /// Create a fresh scope resolving from this provider
    pub fn create_scope(self: &Arc<Self>) -> ServiceScope {
        ServiceScope {
            provider: Arc::clone(self),
            scoped: Mutex::new(Some(HashMap::new())),
        }
    }

    /// Check whether a type is registered
    pub fn is_registered<T: 'static>(&self) -> bool {
        self.registrations.contains_key(&TypeId::of::<T>())
    }

    fn singleton(
        &self,
        key: TypeId,
        registration: &Registration,
        scope: &ServiceScope,
    ) -> CoreResult<Instance> {
        if let Some(existing) = lock(&self.singletons).get(&key) {
            return Ok(Arc::clone(existing));
        }
        // Built outside the lock so factories may resolve their own dependencies.
        let built = (registration.factory)(scope)?;
        Ok(Arc::clone(lock(&self.singletons).entry(key).or_insert(built)))
    }
}

/// A per-unit-of-work resolution context
///
/// Scoped instances live until [`ServiceScope::release`] is called; after that
/// resolving a scoped service fails.
pub struct ServiceScope {
    provider: Arc<ServiceProvider>,
    scoped: Mutex<Option<HashMap<TypeId, Instance>>>,
}

impl ServiceScope {
    /// Resolve a service of type `T`
    ///
    /// # Errors
    ///
    /// Returns `ScopekeeperError::ScopeResolution` if `T` was never registered,
    /// or if this scope has already been released.
    pub fn get_service<T>(&self) -> CoreResult<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        let key = TypeId::of::<T>();
        let type_name = std::any::type_name::<T>();
        let registration = self.provider.registrations.get(&key).ok_or_else(|| {
            tracing::error!(service.type_name = type_name, "Service is not registered");
            ScopekeeperError::ScopeResolution { type_name }
        })?;

        let instance = match registration.lifetime {
            ServiceLifetime::Singleton => self.provider.singleton(key, registration, self)?,
            ServiceLifetime::Transient => (registration.factory)(self)?,
            ServiceLifetime::Scoped => self.scoped_instance(key, registration)?,
        };

        instance
            .downcast::<T>()
            .map_err(|_| ScopekeeperError::ScopeResolution {
                type_name: registration.type_name,
            })
    }

    fn scoped_instance(&self, key: TypeId, registration: &Registration) -> CoreResult<Instance> {
        {
            let guard = lock(&self.scoped);
            let cache = guard.as_ref().ok_or(ScopekeeperError::ScopeResolution {
                type_name: registration.type_name,
            })?;
            if let Some(existing) = cache.get(&key) {
                return Ok(Arc::clone(existing));
            }
        }

        let built = (registration.factory)(self)?;

        let mut guard = lock(&self.scoped);
        match guard.as_mut() {
            Some(cache) => Ok(Arc::clone(cache.entry(key).or_insert(built))),
            None => Err(ScopekeeperError::ScopeResolution {
                type_name: registration.type_name,
            }),
        }
    }

    /// Derive a sibling scope sharing this scope's provider
    pub fn create_child(&self) -> ServiceScope {
        self.provider.create_scope()
    }

    /// Drop every scoped instance held by this scope
    ///
    /// Returns true the first time, false on every later call.
    pub fn release(&self) -> bool {
        let released = lock(&self.scoped).take();
        match released {
            Some(instances) => {
                tracing::trace!(service.count = instances.len(), "Released scoped services");
                drop(instances);
                true
            }
            None => false,
        }
    }

    /// Check whether [`ServiceScope::release`] has run
    pub fn is_released(&self) -> bool {
        lock(&self.scoped).is_none()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct Counter(usize);

    struct DropProbe(Arc<AtomicUsize>);

    impl Drop for DropProbe {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counting_provider(lifetime: ServiceLifetime) -> (Arc<ServiceProvider>, Arc<AtomicUsize>) {
        let built = Arc::new(AtomicUsize::new(0));
        let b = Arc::clone(&built);
        let factory = move |_: &ServiceScope| -> CoreResult<Counter> {
            Ok(Counter(b.fetch_add(1, Ordering::SeqCst)))
        };
        let collection = match lifetime {
            ServiceLifetime::Singleton => ServiceCollection::new().add_singleton(factory),
            ServiceLifetime::Scoped => ServiceCollection::new().add_scoped(factory),
            ServiceLifetime::Transient => ServiceCollection::new().add_transient(factory),
        };
        (collection.build(), built)
    }

    #[test]
    fn test_singleton_shared_across_scopes() {
        let (provider, built) = counting_provider(ServiceLifetime::Singleton);
        let a = provider.create_scope().get_service::<Counter>().unwrap();
        let b = provider.create_scope().get_service::<Counter>().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(built.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_scoped_cached_within_scope_only() {
        let (provider, built) = counting_provider(ServiceLifetime::Scoped);
        let scope = provider.create_scope();
        let a = scope.get_service::<Counter>().unwrap();
        let b = scope.get_service::<Counter>().unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let other = provider.create_scope().get_service::<Counter>().unwrap();
        assert!(!Arc::ptr_eq(&a, &other));
        assert_eq!(built.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_transient_built_every_time() {
        let (provider, built) = counting_provider(ServiceLifetime::Transient);
        let scope = provider.create_scope();
        let a = scope.get_service::<Counter>().unwrap();
        let b = scope.get_service::<Counter>().unwrap();
        assert_ne!(a.0, b.0);
        assert_eq!(built.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unregistered_type_fails_loudly() {
        let provider = ServiceCollection::new().build();
        let err = provider.create_scope().get_service::<Counter>().unwrap_err();
        assert!(matches!(err, ScopekeeperError::ScopeResolution { .. }));
        assert!(err.to_string().contains("Counter"));
    }

    #[test]
    fn test_factory_resolves_dependencies() {
        struct Name(String);
        struct Greeting(String);

        let provider = ServiceCollection::new()
            .add_singleton(|_| Ok(Name("chef".to_string())))
            .add_scoped(|scope| {
                let name = scope.get_service::<Name>()?;
                Ok(Greeting(format!("hello {}", name.0)))
            })
            .build();

        let greeting = provider.create_scope().get_service::<Greeting>().unwrap();
        assert_eq!(greeting.0, "hello chef");
    }

    #[test]
    fn test_release_drops_scoped_instances_once() {
        let dropped = Arc::new(AtomicUsize::new(0));
        let d = Arc::clone(&dropped);
        let provider = ServiceCollection::new()
            .add_scoped(move |_| Ok(DropProbe(Arc::clone(&d))))
            .build();

        let scope = provider.create_scope();
        drop(scope.get_service::<DropProbe>().unwrap());
        assert_eq!(dropped.load(Ordering::SeqCst), 0);

        assert!(scope.release());
        assert!(!scope.release());
        assert!(scope.is_released());
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
        assert!(scope.get_service::<DropProbe>().is_err());
    }

    #[test]
    fn test_add_instance_registers_singleton() {
        let provider = ServiceCollection::new()
            .add_instance(Arc::new(Counter(7)))
            .build();
        assert!(provider.is_registered::<Counter>());
        assert_eq!(provider.create_scope().get_service::<Counter>().unwrap().0, 7);
    }
}
