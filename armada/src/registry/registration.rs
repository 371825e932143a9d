//! Service registrations and the default-registration facade.

use super::binding::Binding;
use super::error::RegistryError;
use super::OwnerId;
use std::sync::Arc;

/// How a registration produces instances of its service type.
pub(crate) enum Provider<S: ?Sized> {
    /// One shared instance for the registry lifetime.
    Singleton(Arc<S>),
    /// A new instance is constructed on every retrieval.
    Constructing(Box<dyn Fn() -> Arc<S> + Send + Sync>),
}

impl<S: ?Sized> Provider<S> {
    pub(crate) fn is_singleton(&self) -> bool {
        matches!(self, Provider::Singleton(_))
    }
}

/// A single named registration of a service implementation.
///
/// Obtained from [`crate::registry::ServiceRegistry::register`] and friends.
/// The registration stays linked to its binding, so [`Self::mark_as_default`]
/// and [`Self::unregister`] act on the live registry state.
pub struct Registration<S: ?Sized> {
    name: String,
    owner: OwnerId,
    pub(crate) provider: Provider<S>,
    pub(crate) binding: std::sync::Weak<Binding<S>>,
}

impl<S: ?Sized + Send + Sync + 'static> Registration<S> {
    pub(crate) fn new(
        name: String,
        owner: OwnerId,
        provider: Provider<S>,
        binding: std::sync::Weak<Binding<S>>,
    ) -> Self {
        Self {
            name,
            owner,
            provider,
            binding,
        }
    }

    /// The name this registration was registered under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The owner that created this registration.
    pub fn owner(&self) -> &OwnerId {
        &self.owner
    }

    /// True if this registration serves one shared instance.
    pub fn singleton(&self) -> bool {
        self.provider.is_singleton()
    }

    /// Returns an instance of the registered service.
    ///
    /// For singleton registrations this is the shared instance; constructing
    /// registrations build a fresh value on every call. No binding lock is
    /// held while a constructor runs.
    pub fn instance(&self) -> Arc<S> {
        match &self.provider {
            Provider::Singleton(instance) => Arc::clone(instance),
            Provider::Constructing(ctor) => ctor(),
        }
    }

    /// True if this registration is currently the default for its service type.
    pub fn is_default(self: &Arc<Self>) -> bool {
        self.binding
            .upgrade()
            .is_some_and(|binding| binding.registration_is_default(self))
    }

    /// Marks this registration as the default for its service type.
    pub fn mark_as_default(self: &Arc<Self>) -> Result<(), RegistryError> {
        let binding = self
            .binding
            .upgrade()
            .ok_or_else(|| RegistryError::RegistrationObsolete(self.name.clone()))?;
        binding.mark_as_default(self)
    }

    /// Removes this registration from the registry.
    ///
    /// If it was the default, the first remaining registration is promoted.
    pub fn unregister(self: &Arc<Self>) -> bool {
        self.binding
            .upgrade()
            .is_some_and(|binding| binding.unregister(self))
    }
}

impl<S: ?Sized> std::fmt::Debug for Registration<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("name", &self.name)
            .field("owner", &self.owner)
            .field("singleton", &self.provider.is_singleton())
            .finish()
    }
}

/// Stable facade over the current default registration of a service type.
///
/// The facade itself never goes stale: every call resolves against the
/// binding's *current* default. See [`Self::instance`] for the proxy rules.
pub struct DefaultRegistration<S: ?Sized> {
    pub(crate) binding: Arc<Binding<S>>,
}

impl<S: ?Sized + Send + Sync + 'static> DefaultRegistration<S> {
    /// Name of the current default registration, if one exists.
    pub fn name(&self) -> Option<String> {
        self.binding.default_name()
    }

    /// Resolves an instance according to the default-proxy rules.
    ///
    /// If the current default is singleton-style, the returned value is a
    /// transparent proxy: each [`ServiceInstance::current`] call re-resolves
    /// the binding's default, so a later default swap is observed through the
    /// same handle. If the current default is constructing-style, a fresh
    /// instance is returned directly and no proxying happens - wrapping a
    /// stateful new-each-time value would hide state behind the proxy.
    pub fn instance(&self) -> Result<ServiceInstance<S>, RegistryError> {
        self.binding.default_instance()
    }
}

impl<S: ?Sized> Clone for DefaultRegistration<S> {
    fn clone(&self) -> Self {
        Self {
            binding: Arc::clone(&self.binding),
        }
    }
}

/// An instance resolved through the default-registration facade.
pub enum ServiceInstance<S: ?Sized> {
    /// Proxy over the current singleton-style default.
    Proxied(ProxiedInstance<S>),
    /// A value freshly built by a constructing-style default.
    Owned(Arc<S>),
}

impl<S: ?Sized + Send + Sync + 'static> ServiceInstance<S> {
    /// Resolves the service value to call.
    ///
    /// Proxied instances dispatch to whatever the default is *now*; they fail
    /// with [`RegistryError::DefaultBecameConstructing`] once the default has
    /// been swapped to a constructing-style registration. Owned instances
    /// always return the value built at resolution time.
    pub fn current(&self) -> Result<Arc<S>, RegistryError> {
        match self {
            ServiceInstance::Proxied(proxy) => proxy.current(),
            ServiceInstance::Owned(instance) => Ok(Arc::clone(instance)),
        }
    }
}

/// Proxy handle that dispatches every call to the current singleton default.
pub struct ProxiedInstance<S: ?Sized> {
    pub(crate) binding: Arc<Binding<S>>,
}

impl<S: ?Sized + Send + Sync + 'static> ProxiedInstance<S> {
    /// Resolves the current default's singleton instance.
    pub fn current(&self) -> Result<Arc<S>, RegistryError> {
        self.binding.current_singleton_default()
    }
}

impl<S: ?Sized> Clone for ProxiedInstance<S> {
    fn clone(&self) -> Self {
        Self {
            binding: Arc::clone(&self.binding),
        }
    }
}
