//! Service registry error types.

use thiserror::Error;

/// Errors that can occur during registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A registration name was empty or whitespace-only.
    #[error("service name cannot be blank")]
    BlankServiceName,

    /// No registration exists for the requested service type.
    #[error("no registration present for service type {0}")]
    NoRegistration(&'static str),

    /// A proxied default instance was resolved after the default registration
    /// was swapped from a singleton-style to a constructing-style registration.
    ///
    /// A proxy over a constructing registration would silently create hidden
    /// state per call, so the resolution fails loudly instead.
    #[error("default registration for {0} changed to a constructing provider; re-fetch the instance")]
    DefaultBecameConstructing(&'static str),

    /// The registration was removed from its binding and can no longer be used.
    #[error("registration {0} is no longer valid")]
    RegistrationObsolete(String),

    /// An auto-service mapping file could not be decoded.
    #[error("unable to decode auto service mapping: {0}")]
    MalformedMapping(String),

    /// An auto-service mapping referenced a type the owner did not provide
    /// an installer entry for.
    #[error("no installer for auto service mapping {service_type} -> {implementation_type}")]
    UnknownMapping {
        service_type: String,
        implementation_type: String,
    },

    /// I/O error while walking an owner's resource tree.
    #[error("I/O error during service discovery: {0}")]
    Io(#[from] std::io::Error),
}
