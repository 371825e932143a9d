//! Service registry with lifecycle-aware default proxies.
//!
//! The registry keeps per-service-type bindings, each holding ordered named
//! registrations plus a designated default. It is the single point of
//! indirection every other component uses to locate its collaborators, and
//! the runtime plug-in mechanism: modules register alternative
//! implementations and mark them default to swap behavior at runtime.
//!
//! # Example
//!
//! ```ignore
//! let registry = ServiceRegistry::new();
//! registry.register::<dyn TemplateStorage>("local", Arc::new(LocalTemplateStorage::new(dir)));
//!
//! let storage = registry
//!     .default_registration::<dyn TemplateStorage>()?
//!     .instance()?
//!     .current()?;
//! ```

mod binding;
mod discovery;
mod error;
mod registration;

pub use discovery::{discover_from, AutoServiceMapping, ServiceInstaller};
pub use error::RegistryError;
pub use registration::{DefaultRegistration, ProxiedInstance, Registration, ServiceInstance};

use binding::{AnyBinding, Binding};
use registration::Provider;
use std::any::TypeId;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Identifies the module or plug-in a registration belongs to.
///
/// Used by [`ServiceRegistry::unregister_all_by_owner`] when a plug-in is
/// unloaded to drop exactly the registrations it contributed.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct OwnerId(String);

impl OwnerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Owner for registrations made by the node core itself.
    pub fn core() -> Self {
        Self("armada:core".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for OwnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Name-to-implementation registry keyed by service type.
///
/// Service types are trait objects (`dyn Trait`), which makes the "must be
/// an abstract contract" rule structural: a concrete struct cannot be used
/// as the registry key for anything but itself.
#[derive(Default)]
pub struct ServiceRegistry {
    bindings: RwLock<HashMap<TypeId, Box<dyn AnyBinding>>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn binding_of<S: ?Sized + Send + Sync + 'static>(&self) -> Option<Arc<Binding<S>>> {
        let bindings = self.bindings.read().unwrap_or_else(|e| e.into_inner());
        bindings
            .get(&TypeId::of::<S>())
            .and_then(|b| b.as_any().downcast_ref::<Arc<Binding<S>>>())
            .cloned()
    }

    /// Returns the live binding for `S`, creating or replacing it as needed.
    fn binding_or_insert<S: ?Sized + Send + Sync + 'static>(&self) -> Arc<Binding<S>> {
        let mut bindings = self.bindings.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = bindings
            .get(&TypeId::of::<S>())
            .filter(|b| !b.is_empty())
            .and_then(|b| b.as_any().downcast_ref::<Arc<Binding<S>>>())
        {
            return Arc::clone(existing);
        }
        let binding = Binding::<S>::new();
        bindings.insert(TypeId::of::<S>(), Box::new(Arc::clone(&binding)));
        binding
    }

    /// Registers a singleton-style implementation of `S` under `name`.
    ///
    /// Idempotent by `(S, name)`: re-registering an existing name returns the
    /// existing registration. The first registration of a service type
    /// becomes its default.
    pub fn register<S: ?Sized + Send + Sync + 'static>(
        &self,
        name: &str,
        instance: Arc<S>,
    ) -> Result<Arc<Registration<S>>, RegistryError> {
        self.register_for_owner(OwnerId::core(), name, instance)
    }

    /// [`Self::register`] with an explicit owning module.
    pub fn register_for_owner<S: ?Sized + Send + Sync + 'static>(
        &self,
        owner: OwnerId,
        name: &str,
        instance: Arc<S>,
    ) -> Result<Arc<Registration<S>>, RegistryError> {
        if name.trim().is_empty() {
            return Err(RegistryError::BlankServiceName);
        }
        loop {
            let binding = self.binding_or_insert::<S>();
            let provider = Provider::Singleton(Arc::clone(&instance));
            if let Some(registration) = binding.register(name, owner.clone(), provider) {
                return Ok(registration);
            }
            // The binding raced with its own removal; retry on a fresh one.
        }
    }

    /// Registers a constructing-style implementation: every instance
    /// retrieval runs `ctor` and returns the freshly built value.
    pub fn register_constructing<S, F>(
        &self,
        name: &str,
        ctor: F,
    ) -> Result<Arc<Registration<S>>, RegistryError>
    where
        S: ?Sized + Send + Sync + 'static,
        F: Fn() -> Arc<S> + Send + Sync + 'static,
    {
        self.register_constructing_for_owner(OwnerId::core(), name, ctor)
    }

    /// [`Self::register_constructing`] with an explicit owning module.
    pub fn register_constructing_for_owner<S, F>(
        &self,
        owner: OwnerId,
        name: &str,
        ctor: F,
    ) -> Result<Arc<Registration<S>>, RegistryError>
    where
        S: ?Sized + Send + Sync + 'static,
        F: Fn() -> Arc<S> + Send + Sync + 'static,
    {
        if name.trim().is_empty() {
            return Err(RegistryError::BlankServiceName);
        }
        let ctor = Arc::new(ctor);
        loop {
            let binding = self.binding_or_insert::<S>();
            let ctor = Arc::clone(&ctor);
            let provider = Provider::Constructing(Box::new(move || ctor()));
            if let Some(registration) = binding.register(name, owner.clone(), provider) {
                return Ok(registration);
            }
        }
    }

    /// Looks up a registration of `S` by name.
    pub fn registration<S: ?Sized + Send + Sync + 'static>(
        &self,
        name: &str,
    ) -> Option<Arc<Registration<S>>> {
        self.binding_of::<S>()?.find_by_name(name)
    }

    /// Returns the stable default-registration facade for `S`, or `None` if
    /// nothing was ever registered for the type.
    pub fn default_registration<S: ?Sized + Send + Sync + 'static>(
        &self,
    ) -> Option<DefaultRegistration<S>> {
        let binding = self.binding_of::<S>()?;
        if binding.is_empty() {
            return None;
        }
        Some(binding.default_facade())
    }

    /// Convenience: resolve the current default instance of `S` directly.
    pub fn default_instance<S: ?Sized + Send + Sync + 'static>(
        &self,
    ) -> Result<Arc<S>, RegistryError> {
        let facade = self
            .default_registration::<S>()
            .ok_or(RegistryError::NoRegistration(std::any::type_name::<S>()))?;
        facade.instance()?.current()
    }

    /// All registrations of `S` in registration order.
    pub fn registrations<S: ?Sized + Send + Sync + 'static>(&self) -> Vec<Arc<Registration<S>>> {
        self.binding_of::<S>()
            .map(|binding| binding.registrations())
            .unwrap_or_default()
    }

    /// Removes every registration contributed by `owner`, across all service
    /// types. Bindings left empty are pruned.
    pub fn unregister_all_by_owner(&self, owner: &OwnerId) {
        let mut bindings = self.bindings.write().unwrap_or_else(|e| e.into_inner());
        bindings.retain(|_, binding| {
            binding.unregister_all_by_owner(owner);
            !binding.is_empty()
        });
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self
            .bindings
            .read()
            .map(|b| b.len())
            .unwrap_or_default();
        f.debug_struct("ServiceRegistry")
            .field("service_types", &count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    trait Greeter: Send + Sync {
        fn greet(&self) -> String;
    }

    struct Fixed(&'static str);

    impl Greeter for Fixed {
        fn greet(&self) -> String {
            self.0.to_string()
        }
    }

    struct Counting(AtomicUsize);

    impl Greeter for Counting {
        fn greet(&self) -> String {
            format!("call-{}", self.0.fetch_add(1, Ordering::SeqCst))
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = ServiceRegistry::new();
        registry
            .register::<dyn Greeter>("en", Arc::new(Fixed("hello")))
            .unwrap();

        let registration = registry.registration::<dyn Greeter>("en").unwrap();
        assert_eq!(registration.instance().greet(), "hello");
        assert_eq!(registry.registrations::<dyn Greeter>().len(), 1);
    }

    #[test]
    fn test_register_is_idempotent_by_name() {
        let registry = ServiceRegistry::new();
        let first = registry
            .register::<dyn Greeter>("en", Arc::new(Fixed("hello")))
            .unwrap();
        let second = registry
            .register::<dyn Greeter>("en", Arc::new(Fixed("other")))
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.instance().greet(), "hello");
        assert_eq!(registry.registrations::<dyn Greeter>().len(), 1);
    }

    #[test]
    fn test_blank_name_rejected() {
        let registry = ServiceRegistry::new();
        let result = registry.register::<dyn Greeter>("  ", Arc::new(Fixed("x")));
        assert!(matches!(result, Err(RegistryError::BlankServiceName)));
    }

    #[test]
    fn test_first_registration_is_default_until_marked() {
        let registry = ServiceRegistry::new();
        let first = registry
            .register::<dyn Greeter>("en", Arc::new(Fixed("hello")))
            .unwrap();
        let second = registry
            .register::<dyn Greeter>("de", Arc::new(Fixed("hallo")))
            .unwrap();

        assert!(first.is_default());
        assert!(!second.is_default());

        second.mark_as_default().unwrap();
        assert!(!first.is_default());
        assert!(second.is_default());
    }

    #[test]
    fn test_default_proxy_observes_default_swap() {
        let registry = ServiceRegistry::new();
        registry
            .register::<dyn Greeter>("en", Arc::new(Fixed("hello")))
            .unwrap();
        let de = registry
            .register::<dyn Greeter>("de", Arc::new(Fixed("hallo")))
            .unwrap();

        let facade = registry.default_registration::<dyn Greeter>().unwrap();
        let proxy = facade.instance().unwrap();
        assert_eq!(proxy.current().unwrap().greet(), "hello");

        de.mark_as_default().unwrap();
        // Same handle, new default observed.
        assert_eq!(proxy.current().unwrap().greet(), "hallo");
    }

    #[test]
    fn test_constructing_default_returns_fresh_instances() {
        let registry = ServiceRegistry::new();
        registry
            .register_constructing::<dyn Greeter, _>("counting", || {
                Arc::new(Counting(AtomicUsize::new(0)))
            })
            .unwrap();

        let facade = registry.default_registration::<dyn Greeter>().unwrap();
        let first = facade.instance().unwrap();
        let second = facade.instance().unwrap();

        // Each resolution constructed a fresh counter.
        assert_eq!(first.current().unwrap().greet(), "call-0");
        assert_eq!(second.current().unwrap().greet(), "call-0");
    }

    #[test]
    fn test_proxy_fails_loudly_after_swap_to_constructing() {
        let registry = ServiceRegistry::new();
        registry
            .register::<dyn Greeter>("fixed", Arc::new(Fixed("hello")))
            .unwrap();
        let constructing = registry
            .register_constructing::<dyn Greeter, _>("fresh", || Arc::new(Fixed("fresh")))
            .unwrap();

        let proxy = registry
            .default_registration::<dyn Greeter>()
            .unwrap()
            .instance()
            .unwrap();
        assert!(proxy.current().is_ok());

        constructing.mark_as_default().unwrap();
        assert!(matches!(
            proxy.current(),
            Err(RegistryError::DefaultBecameConstructing(_))
        ));
    }

    #[test]
    fn test_unregister_promotes_next_default() {
        let registry = ServiceRegistry::new();
        let first = registry
            .register::<dyn Greeter>("en", Arc::new(Fixed("hello")))
            .unwrap();
        registry
            .register::<dyn Greeter>("de", Arc::new(Fixed("hallo")))
            .unwrap();

        assert!(first.unregister());
        let facade = registry.default_registration::<dyn Greeter>().unwrap();
        assert_eq!(facade.name().as_deref(), Some("de"));
    }

    #[test]
    fn test_unregister_last_prunes_type() {
        let registry = ServiceRegistry::new();
        let only = registry
            .register::<dyn Greeter>("en", Arc::new(Fixed("hello")))
            .unwrap();
        assert!(only.unregister());

        assert!(registry.default_registration::<dyn Greeter>().is_none());
        assert!(registry.registrations::<dyn Greeter>().is_empty());

        // Registering again works against a fresh binding.
        registry
            .register::<dyn Greeter>("en", Arc::new(Fixed("again")))
            .unwrap();
        assert_eq!(
            registry.default_instance::<dyn Greeter>().unwrap().greet(),
            "again"
        );
    }

    #[test]
    fn test_unregister_all_by_owner_removes_exactly_owned() {
        let registry = ServiceRegistry::new();
        let plugin = OwnerId::new("plugin:mapgen");
        registry
            .register::<dyn Greeter>("core", Arc::new(Fixed("core")))
            .unwrap();
        registry
            .register_for_owner::<dyn Greeter>(plugin.clone(), "plugged", Arc::new(Fixed("plug")))
            .unwrap();

        registry.unregister_all_by_owner(&plugin);

        assert!(registry.registration::<dyn Greeter>("plugged").is_none());
        assert!(registry.registration::<dyn Greeter>("core").is_some());
    }
}
