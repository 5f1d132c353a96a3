//! Dependency Container
//!
//! Explicitly owned service registry used to wire the security components
//! without process-wide globals. Tests substitute fakes by registering a
//! different factory under the same key.
//!
//! - Factories are registered per key as `Singleton` or `Transient`
//! - Singletons are created lazily on first resolution, exactly once
//! - Concurrent first resolutions of a singleton serialize on a per-key
//!   lock, so the factory never runs twice
//!
//! A factory that (directly or through other factories) resolves the key
//! being created on the same thread fails with [`ContainerError::Cycle`].

use parking_lot::{Mutex, RwLock};
use std::any::{type_name, Any};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Boxed error returned by fallible factories
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

type Instance = Arc<dyn Any + Send + Sync>;
type Factory =
    Box<dyn Fn(&DependencyContainer) -> std::result::Result<Instance, BoxError> + Send + Sync>;

/// Container errors
#[derive(Error, Debug)]
pub enum ContainerError {
    #[error("Service not registered: {0}")]
    Unregistered(String),

    #[error("Service {key} is registered as {registered}, requested as {requested}")]
    TypeMismatch {
        key: String,
        registered: &'static str,
        requested: &'static str,
    },

    #[error("Factory for {key} failed: {source}")]
    Factory {
        key: String,
        #[source]
        source: BoxError,
    },

    #[error("Circular dependency: {0}")]
    Cycle(String),
}

pub type Result<T> = std::result::Result<T, ContainerError>;

/// Instance lifetime of a registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifetime {
    /// One shared instance for the container's lifetime
    Singleton,

    /// Fresh instance on every resolution
    Transient,
}

struct Registration {
    factory: Factory,
    lifetime: Lifetime,
    type_name: &'static str,
    instance: Mutex<Option<Instance>>,
}

impl Registration {
    fn instance(&self, container: &DependencyContainer, key: &str) -> Result<Instance> {
        let create = || {
            (self.factory)(container).map_err(|source| match source.downcast::<ContainerError>() {
                // Surface the cycle itself rather than one wrapper per hop
                Ok(inner) if matches!(*inner, ContainerError::Cycle(_)) => *inner,
                Ok(inner) => ContainerError::Factory {
                    key: key.to_string(),
                    source: inner,
                },
                Err(source) => ContainerError::Factory {
                    key: key.to_string(),
                    source,
                },
            })
        };

        match self.lifetime {
            Lifetime::Transient => create(),
            Lifetime::Singleton => {
                // Held across creation: racing resolvers wait for the first instance
                let mut slot = self.instance.lock();
                if let Some(existing) = slot.as_ref() {
                    return Ok(existing.clone());
                }

                let created = create()?;
                *slot = Some(created.clone());
                debug!(key, service = self.type_name, "Singleton created");
                Ok(created)
            }
        }
    }
}

thread_local! {
    /// (container, key) pairs being resolved on this thread, outermost first
    static RESOLVING: RefCell<Vec<(usize, String)>> = RefCell::new(Vec::new());
}

/// Marks `key` as in resolution on this thread until dropped
struct ResolutionGuard;

impl ResolutionGuard {
    fn enter(container: &DependencyContainer, key: &str) -> Result<Self> {
        let id = container as *const DependencyContainer as usize;
        RESOLVING.with(|stack| {
            let mut stack = stack.borrow_mut();
            if stack.iter().any(|(c, k)| *c == id && k == key) {
                let path: Vec<&str> = stack
                    .iter()
                    .filter(|(c, _)| *c == id)
                    .map(|(_, k)| k.as_str())
                    .skip_while(|k| *k != key)
                    .chain(std::iter::once(key))
                    .collect();
                return Err(ContainerError::Cycle(path.join(" -> ")));
            }
            stack.push((id, key.to_string()));
            Ok(ResolutionGuard)
        })
    }
}

impl Drop for ResolutionGuard {
    fn drop(&mut self) {
        RESOLVING.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

/// Service container
#[derive(Default)]
pub struct DependencyContainer {
    registrations: RwLock<HashMap<String, Arc<Registration>>>,
}

impl DependencyContainer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an infallible factory. Replaces any previous registration
    /// under `key`, including its cached instance.
    pub fn register<T, F>(&self, key: impl Into<String>, factory: F, lifetime: Lifetime)
    where
        T: Send + Sync + 'static,
        F: Fn(&DependencyContainer) -> T + Send + Sync + 'static,
    {
        self.insert::<T>(
            key.into(),
            Box::new(
                move |container: &DependencyContainer| -> std::result::Result<Instance, BoxError> {
                    Ok(Arc::new(factory(container)))
                },
            ),
            lifetime,
        );
    }

    /// Register a factory that can fail; failures surface from `resolve` as
    /// [`ContainerError::Factory`]
    pub fn try_register<T, E, F>(&self, key: impl Into<String>, factory: F, lifetime: Lifetime)
    where
        T: Send + Sync + 'static,
        E: Into<BoxError>,
        F: Fn(&DependencyContainer) -> std::result::Result<T, E> + Send + Sync + 'static,
    {
        self.insert::<T>(
            key.into(),
            Box::new(
                move |container: &DependencyContainer| -> std::result::Result<Instance, BoxError> {
                    match factory(container) {
                        Ok(service) => Ok(Arc::new(service)),
                        Err(error) => Err(error.into()),
                    }
                },
            ),
            lifetime,
        );
    }

    /// Register an already-built singleton
    pub fn register_instance<T>(&self, key: impl Into<String>, instance: Arc<T>)
    where
        T: Send + Sync + 'static,
    {
        let key = key.into();
        let erased: Instance = instance;
        let shared = erased.clone();
        let factory: Factory = Box::new(move |_: &DependencyContainer| Ok(shared.clone()));
        let registration = Registration {
            factory,
            lifetime: Lifetime::Singleton,
            type_name: type_name::<T>(),
            instance: Mutex::new(Some(erased)),
        };

        debug!(key = %key, service = type_name::<T>(), "Instance registered");
        self.registrations
            .write()
            .insert(key, Arc::new(registration));
    }

    fn insert<T: 'static>(&self, key: String, factory: Factory, lifetime: Lifetime) {
        let registration = Registration {
            factory,
            lifetime,
            type_name: type_name::<T>(),
            instance: Mutex::new(None),
        };

        debug!(key = %key, service = type_name::<T>(), ?lifetime, "Service registered");
        if self
            .registrations
            .write()
            .insert(key.clone(), Arc::new(registration))
            .is_some()
        {
            debug!(key = %key, "Previous registration replaced");
        }
    }

    /// Resolve `key` as `T`. Unknown keys fail fast.
    pub fn resolve<T>(&self, key: &str) -> Result<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        // Lock released before the factory runs so factories can resolve
        // their own dependencies
        let registration = self
            .registrations
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| ContainerError::Unregistered(key.to_string()))?;

        let instance = {
            let _guard = ResolutionGuard::enter(self, key)?;
            registration.instance(self, key)?
        };

        instance
            .downcast::<T>()
            .map_err(|_| ContainerError::TypeMismatch {
                key: key.to_string(),
                registered: registration.type_name,
                requested: type_name::<T>(),
            })
    }

    pub fn is_registered(&self, key: &str) -> bool {
        self.registrations.read().contains_key(key)
    }

    /// Registered keys, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.registrations.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.registrations.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.read().is_empty()
    }

    /// Drop every registration and cached instance
    pub fn clear(&self) {
        let mut registrations = self.registrations.write();
        let count = registrations.len();
        registrations.clear();
        debug!(count, "Container cleared");
    }
}

impl fmt::Debug for DependencyContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DependencyContainer")
            .field("keys", &self.keys())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct Counter {
        id: usize,
    }

    #[test]
    fn test_singleton_identity() {
        let container = DependencyContainer::new();
        container.register("svc", |_| Counter { id: 1 }, Lifetime::Singleton);

        let a = container.resolve::<Counter>("svc").unwrap();
        let b = container.resolve::<Counter>("svc").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.id, 1);
    }

    #[test]
    fn test_transient_creates_fresh_instances() {
        let container = DependencyContainer::new();
        let created = Arc::new(AtomicUsize::new(0));

        let counter = created.clone();
        container.register(
            "svc",
            move |_| Counter {
                id: counter.fetch_add(1, Ordering::SeqCst),
            },
            Lifetime::Transient,
        );

        let a = container.resolve::<Counter>("svc").unwrap();
        let b = container.resolve::<Counter>("svc").unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(created.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unregistered_and_clear() {
        let container = DependencyContainer::new();
        assert!(matches!(
            container.resolve::<Counter>("svc"),
            Err(ContainerError::Unregistered(_))
        ));

        container.register("svc", |_| Counter { id: 1 }, Lifetime::Singleton);
        assert!(container.resolve::<Counter>("svc").is_ok());

        container.clear();
        assert!(container.is_empty());
        assert!(matches!(
            container.resolve::<Counter>("svc"),
            Err(ContainerError::Unregistered(_))
        ));
    }

    #[test]
    fn test_type_mismatch() {
        let container = DependencyContainer::new();
        container.register("svc", |_| Counter { id: 1 }, Lifetime::Singleton);

        let result = container.resolve::<String>("svc");
        assert!(matches!(result, Err(ContainerError::TypeMismatch { .. })));
    }

    #[test]
    fn test_factory_error_surfaces() {
        let container = DependencyContainer::new();
        container.try_register(
            "svc",
            |_| -> std::result::Result<Counter, String> { Err("no config".to_string()) },
            Lifetime::Singleton,
        );

        let error = container.resolve::<Counter>("svc").unwrap_err();
        assert!(matches!(error, ContainerError::Factory { .. }));
        assert!(error.to_string().contains("no config"));
    }

    #[test]
    fn test_factories_resolve_dependencies() {
        struct Consumer {
            dependency: Arc<Counter>,
        }

        let container = DependencyContainer::new();
        container.register("counter", |_| Counter { id: 7 }, Lifetime::Singleton);
        container.try_register(
            "consumer",
            |c| -> Result<Consumer> {
                Ok(Consumer {
                    dependency: c.resolve::<Counter>("counter")?,
                })
            },
            Lifetime::Singleton,
        );

        let consumer = container.resolve::<Consumer>("consumer").unwrap();
        let counter = container.resolve::<Counter>("counter").unwrap();
        assert!(Arc::ptr_eq(&consumer.dependency, &counter));
    }

    #[test]
    fn test_register_instance_and_override() {
        let container = DependencyContainer::new();
        let fake = Arc::new(Counter { id: 99 });
        container.register_instance("svc", fake.clone());

        let resolved = container.resolve::<Counter>("svc").unwrap();
        assert!(Arc::ptr_eq(&resolved, &fake));

        // Re-registering replaces the cached instance
        container.register("svc", |_| Counter { id: 1 }, Lifetime::Singleton);
        assert_eq!(container.resolve::<Counter>("svc").unwrap().id, 1);
    }

    #[test]
    fn test_concurrent_singleton_creation_runs_factory_once() {
        let container = Arc::new(DependencyContainer::new());
        let created = Arc::new(AtomicUsize::new(0));

        let counter = created.clone();
        container.register(
            "svc",
            move |_| {
                std::thread::sleep(std::time::Duration::from_millis(20));
                Counter {
                    id: counter.fetch_add(1, Ordering::SeqCst),
                }
            },
            Lifetime::Singleton,
        );

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let container = container.clone();
                std::thread::spawn(move || container.resolve::<Counter>("svc").unwrap())
            })
            .collect();

        let instances: Vec<Arc<Counter>> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert!(instances.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    fn register_link(container: &DependencyContainer, key: &'static str, next: &'static str) {
        container.try_register(
            key,
            move |c| -> Result<u8> { Ok(*c.resolve::<u8>(next)?) },
            Lifetime::Singleton,
        );
    }

    #[test]
    fn test_cyclic_singletons_fail_fast() {
        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let container = DependencyContainer::new();
            register_link(&container, "a", "b");
            register_link(&container, "b", "a");

            let first = container.resolve::<u8>("a").map(|_| ()).map_err(|e| e.to_string());
            let again = container.resolve::<u8>("b").map(|_| ()).map_err(|e| e.to_string());
            let _ = tx.send((first, again));
        });

        let (first, again) = rx
            .recv_timeout(std::time::Duration::from_secs(5))
            .expect("cyclic resolution did not return");
        assert_eq!(first.unwrap_err(), "Circular dependency: a -> b -> a");
        assert_eq!(again.unwrap_err(), "Circular dependency: b -> a -> b");
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let container = DependencyContainer::new();
        register_link(&container, "a", "a");

        assert!(matches!(
            container.resolve::<u8>("a"),
            Err(ContainerError::Cycle(path)) if path == "a -> a"
        ));

        // Resolution stack is unwound after the failure
        container.register_instance("a", Arc::new(7u8));
        assert_eq!(*container.resolve::<u8>("a").unwrap(), 7);
    }

    #[test]
    fn test_shared_dependency_is_not_a_cycle() {
        let container = DependencyContainer::new();
        container.register("base", |_| 1u8, Lifetime::Singleton);
        register_link(&container, "left", "base");
        container.try_register(
            "top",
            |c| -> Result<u8> {
                let left = c.resolve::<u8>("left")?;
                let base = c.resolve::<u8>("base")?;
                Ok(*left + *base)
            },
            Lifetime::Singleton,
        );

        assert_eq!(*container.resolve::<u8>("top").unwrap(), 2);
    }
}
