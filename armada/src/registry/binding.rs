//! Per-service-type registration bindings.
//!
//! Every read goes through the binding's read lock, every mutation through
//! the write lock, so many concurrent lookups can proceed while registration
//! changes stay exclusive. User code (constructing providers) never runs
//! while a lock is held: the binding computes a decision, drops the lock,
//! then calls out.

use super::error::RegistryError;
use super::registration::{
    DefaultRegistration, Provider, ProxiedInstance, Registration, ServiceInstance,
};
use super::OwnerId;
use std::any::Any;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub(crate) struct BindingState<S: ?Sized> {
    obsolete: bool,
    default: Option<Arc<Registration<S>>>,
    /// Registrations in registration order; names are unique.
    registrations: Vec<Arc<Registration<S>>>,
}

/// Binding of all registrations for a single service type.
pub(crate) struct Binding<S: ?Sized> {
    type_name: &'static str,
    state: RwLock<BindingState<S>>,
}

impl<S: ?Sized + Send + Sync + 'static> Binding<S> {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            type_name: std::any::type_name::<S>(),
            state: RwLock::new(BindingState {
                obsolete: false,
                default: None,
                registrations: Vec::new(),
            }),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, BindingState<S>> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BindingState<S>> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers a provider under the given name. Idempotent by name: an
    /// existing registration with the same name is returned unchanged. The
    /// first registration becomes the default.
    ///
    /// Returns `None` if this binding raced with its own removal and became
    /// obsolete; the registry retries against a fresh binding in that case.
    pub(crate) fn register(
        self: &Arc<Self>,
        name: &str,
        owner: OwnerId,
        provider: Provider<S>,
    ) -> Option<Arc<Registration<S>>> {
        let mut state = self.write();
        if state.obsolete {
            return None;
        }

        if let Some(existing) = state.registrations.iter().find(|r| r.name() == name) {
            return Some(Arc::clone(existing));
        }

        let registration = Arc::new(Registration::new(
            name.to_string(),
            owner,
            provider,
            Arc::downgrade(self),
        ));
        state.registrations.push(Arc::clone(&registration));
        if state.default.is_none() {
            state.default = Some(Arc::clone(&registration));
        }
        Some(registration)
    }

    pub(crate) fn find_by_name(&self, name: &str) -> Option<Arc<Registration<S>>> {
        let state = self.read();
        state
            .registrations
            .iter()
            .find(|r| r.name() == name)
            .cloned()
    }

    pub(crate) fn registrations(&self) -> Vec<Arc<Registration<S>>> {
        self.read().registrations.clone()
    }

    pub(crate) fn default_name(&self) -> Option<String> {
        self.read().default.as_ref().map(|r| r.name().to_string())
    }

    pub(crate) fn is_empty(&self) -> bool {
        let state = self.read();
        state.obsolete || state.registrations.is_empty()
    }

    pub(crate) fn registration_is_default(&self, registration: &Arc<Registration<S>>) -> bool {
        let state = self.read();
        !state.obsolete
            && state
                .default
                .as_ref()
                .is_some_and(|default| Arc::ptr_eq(default, registration))
    }

    pub(crate) fn mark_as_default(
        &self,
        registration: &Arc<Registration<S>>,
    ) -> Result<(), RegistryError> {
        let mut state = self.write();
        let valid = state
            .registrations
            .iter()
            .any(|r| Arc::ptr_eq(r, registration));
        if state.obsolete || !valid {
            return Err(RegistryError::RegistrationObsolete(
                registration.name().to_string(),
            ));
        }
        state.default = Some(Arc::clone(registration));
        Ok(())
    }

    /// Removes the registration. If it was the default, the first remaining
    /// registration is promoted; an empty binding becomes obsolete and is
    /// pruned from the registry on the next access.
    pub(crate) fn unregister(&self, registration: &Arc<Registration<S>>) -> bool {
        let mut state = self.write();
        let before = state.registrations.len();
        state.registrations.retain(|r| !Arc::ptr_eq(r, registration));
        let removed = state.registrations.len() != before;
        if removed {
            if state.registrations.is_empty() {
                state.obsolete = true;
                state.default = None;
            } else if state
                .default
                .as_ref()
                .is_some_and(|default| Arc::ptr_eq(default, registration))
            {
                state.default = Some(Arc::clone(&state.registrations[0]));
            }
        }
        removed
    }

    pub(crate) fn unregister_all_by_owner(&self, owner: &OwnerId) {
        let mut state = self.write();
        state.registrations.retain(|r| r.owner() != owner);
        if state.registrations.is_empty() {
            state.obsolete = true;
            state.default = None;
        } else if state
            .default
            .as_ref()
            .is_some_and(|default| default.owner() == owner)
        {
            state.default = Some(Arc::clone(&state.registrations[0]));
        }
    }

    pub(crate) fn default_facade(self: &Arc<Self>) -> DefaultRegistration<S> {
        DefaultRegistration {
            binding: Arc::clone(self),
        }
    }

    /// Resolves an instance through the default facade. The decision (which
    /// provider kind is default) is taken under the read lock; a constructing
    /// provider runs after the lock is dropped.
    pub(crate) fn default_instance(
        self: &Arc<Self>,
    ) -> Result<ServiceInstance<S>, RegistryError> {
        let proxied = {
            let state = self.read();
            let default = state
                .default
                .as_ref()
                .ok_or(RegistryError::NoRegistration(self.type_name))?;
            default.provider.is_singleton()
        };

        if proxied {
            Ok(ServiceInstance::Proxied(ProxiedInstance {
                binding: Arc::clone(self),
            }))
        } else {
            // Re-resolve outside the lock so the constructor runs lock-free.
            let default = self
                .read()
                .default
                .clone()
                .ok_or(RegistryError::NoRegistration(self.type_name))?;
            Ok(ServiceInstance::Owned(default.instance()))
        }
    }

    /// Resolves the current default for a proxied handle.
    pub(crate) fn current_singleton_default(&self) -> Result<Arc<S>, RegistryError> {
        let state = self.read();
        let default = state
            .default
            .as_ref()
            .ok_or(RegistryError::NoRegistration(self.type_name))?;
        match &default.provider {
            Provider::Singleton(instance) => Ok(Arc::clone(instance)),
            Provider::Constructing(_) => {
                Err(RegistryError::DefaultBecameConstructing(self.type_name))
            }
        }
    }
}

/// Type-erased view of a binding, used for registry-wide sweeps.
pub(crate) trait AnyBinding: Send + Sync {
    fn unregister_all_by_owner(&self, owner: &OwnerId);
    fn is_empty(&self) -> bool;
    fn as_any(&self) -> &dyn Any;
}

impl<S: ?Sized + Send + Sync + 'static> AnyBinding for Arc<Binding<S>> {
    fn unregister_all_by_owner(&self, owner: &OwnerId) {
        Binding::unregister_all_by_owner(self, owner)
    }

    fn is_empty(&self) -> bool {
        Binding::is_empty(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
