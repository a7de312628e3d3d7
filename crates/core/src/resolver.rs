//! Dependency resolver: maps a capability type to a concrete provider.
//!
//! Capabilities are usually trait objects (`dyn ContentSink`, `dyn FetchClient`).
//! Providers are stored as `Arc<T>` and handed out by clone, so whatever a unit
//! resolves at construction stays fixed for that unit's lifetime even if the
//! registry changes later. Once [`Resolver::seal`] is called, registration is
//! refused.

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use thiserror::Error;
use tracing::debug;

use crate::error::ErrorKind;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("unresolved dependency: no provider registered for {0}")]
    Unresolved(&'static str),

    #[error("resolver is sealed; cannot register {0}")]
    Sealed(&'static str),
}

impl ResolveError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ResolveError::Unresolved(_) => ErrorKind::Unresolved,
            ResolveError::Sealed(_) => ErrorKind::Config,
        }
    }
}

type Provider = Box<dyn Any + Send + Sync>;
type DefaultFactory = Arc<dyn Fn() -> Provider + Send + Sync>;

/// Capability registry, populated lazily from defaults on first resolve.
#[derive(Default)]
pub struct Resolver {
    providers: RwLock<HashMap<TypeId, Provider>>,
    defaults: RwLock<HashMap<TypeId, DefaultFactory>>,
    sealed: AtomicBool,
}

impl Resolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `capability` to `provider`, replacing any previous binding.
    pub fn register<T>(&self, provider: Arc<T>) -> Result<(), ResolveError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        if self.is_sealed() {
            return Err(ResolveError::Sealed(type_name::<T>()));
        }
        let mut providers = self.providers.write().unwrap_or_else(|p| p.into_inner());
        providers.insert(TypeId::of::<T>(), Box::new(provider));
        debug!(capability = type_name::<T>(), "registered provider");
        Ok(())
    }

    /// Register a factory used only when `resolve` finds no explicit provider.
    pub fn register_default<T, F>(&self, factory: F) -> Result<(), ResolveError>
    where
        T: ?Sized + Send + Sync + 'static,
        F: Fn() -> Arc<T> + Send + Sync + 'static,
    {
        if self.is_sealed() {
            return Err(ResolveError::Sealed(type_name::<T>()));
        }
        let factory: DefaultFactory = Arc::new(move || Box::new(factory()) as Provider);
        let mut defaults = self.defaults.write().unwrap_or_else(|p| p.into_inner());
        defaults.insert(TypeId::of::<T>(), factory);
        Ok(())
    }

    /// Resolve the provider bound to `T`.
    ///
    /// Falls back to a registered default, which is instantiated once and cached.
    pub fn resolve<T>(&self) -> Result<Arc<T>, ResolveError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        let id = TypeId::of::<T>();
        {
            let providers = self.providers.read().unwrap_or_else(|p| p.into_inner());
            if let Some(found) = providers.get(&id).and_then(|p| p.downcast_ref::<Arc<T>>()) {
                return Ok(Arc::clone(found));
            }
        }

        let factory = {
            let defaults = self.defaults.read().unwrap_or_else(|p| p.into_inner());
            defaults.get(&id).cloned()
        };
        let factory = factory.ok_or(ResolveError::Unresolved(type_name::<T>()))?;

        let mut providers = self.providers.write().unwrap_or_else(|p| p.into_inner());
        // Another thread may have instantiated the default meanwhile.
        let entry = providers.entry(id).or_insert_with(|| factory());
        entry
            .downcast_ref::<Arc<T>>()
            .map(Arc::clone)
            .ok_or(ResolveError::Unresolved(type_name::<T>()))
    }

    pub fn contains<T>(&self) -> bool
    where
        T: ?Sized + Send + Sync + 'static,
    {
        let id = TypeId::of::<T>();
        let explicit = self
            .providers
            .read()
            .map(|p| p.contains_key(&id))
            .unwrap_or(false);
        explicit || self.defaults.read().map(|d| d.contains_key(&id)).unwrap_or(false)
    }

    /// Refuse further registrations.
    pub fn seal(&self) {
        self.sealed.store(true, Ordering::Release);
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    trait Greeter: Send + Sync {
        fn greet(&self) -> String;
    }

    struct English;
    impl Greeter for English {
        fn greet(&self) -> String {
            "hello".into()
        }
    }

    struct French;
    impl Greeter for French {
        fn greet(&self) -> String {
            "bonjour".into()
        }
    }

    #[test]
    fn resolve_registered_trait_object() {
        let resolver = Resolver::new();
        resolver.register::<dyn Greeter>(Arc::new(English)).unwrap();

        let greeter = resolver.resolve::<dyn Greeter>().unwrap();
        assert_eq!(greeter.greet(), "hello");
    }

    #[test]
    fn missing_capability_is_unresolved() {
        let resolver = Resolver::new();
        let err = resolver.resolve::<dyn Greeter>().err().unwrap();
        assert!(matches!(err, ResolveError::Unresolved(_)));
        assert_eq!(err.kind(), ErrorKind::Unresolved);
    }

    #[test]
    fn default_is_instantiated_once() {
        let resolver = Resolver::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        resolver
            .register_default::<dyn Greeter, _>(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Arc::new(French) as Arc<dyn Greeter>
            })
            .unwrap();

        assert_eq!(resolver.resolve::<dyn Greeter>().unwrap().greet(), "bonjour");
        assert_eq!(resolver.resolve::<dyn Greeter>().unwrap().greet(), "bonjour");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn explicit_provider_wins_over_default() {
        let resolver = Resolver::new();
        resolver
            .register_default::<dyn Greeter, _>(|| Arc::new(French) as Arc<dyn Greeter>)
            .unwrap();
        resolver.register::<dyn Greeter>(Arc::new(English)).unwrap();
        assert_eq!(resolver.resolve::<dyn Greeter>().unwrap().greet(), "hello");
    }

    #[test]
    fn resolved_provider_survives_rebinding() {
        let resolver = Resolver::new();
        resolver.register::<dyn Greeter>(Arc::new(English)).unwrap();
        let held = resolver.resolve::<dyn Greeter>().unwrap();

        resolver.register::<dyn Greeter>(Arc::new(French)).unwrap();
        assert_eq!(held.greet(), "hello");
        assert_eq!(resolver.resolve::<dyn Greeter>().unwrap().greet(), "bonjour");
    }

    #[test]
    fn sealed_resolver_rejects_registration() {
        let resolver = Resolver::new();
        resolver.register::<dyn Greeter>(Arc::new(English)).unwrap();
        resolver.seal();

        let err = resolver.register::<dyn Greeter>(Arc::new(French)).unwrap_err();
        assert!(matches!(err, ResolveError::Sealed(_)));
        assert!(resolver.contains::<dyn Greeter>());
    }

    #[test]
    fn concrete_types_work_too() {
        let resolver = Resolver::new();
        resolver.register(Arc::new(42u64)).unwrap();
        assert_eq!(*resolver.resolve::<u64>().unwrap(), 42);
        assert!(!resolver.contains::<u32>());
    }
}
