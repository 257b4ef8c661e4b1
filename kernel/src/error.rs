// kernel/src/error.rs

use crate::identity::Identity;
use crate::store::Coerce;
use thiserror::Error;

/// The error type user code hands back from constructors, factories, methods,
/// listeners and lifecycle hooks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The main error type for `fibre_kernel` resolution and wiring.
#[derive(Debug, Error)]
pub enum Error {
  #[error("Cannot register or resolve an empty declaration")]
  NullDeclaration,

  #[error("'{0}' is not callable")]
  NotAFunction(String),

  #[error("Cannot swap '{identity}' to '{implementation}': the singleton has already started")]
  ImmutableRegistration {
    identity: Identity,
    implementation: Identity,
  },

  #[error("Missing required env '{0}'")]
  MissingEnv(String),

  #[error("'{identity}' does not resolve to a {expected}")]
  TypeMismatch {
    identity: Identity,
    expected: &'static str,
  },

  #[error("Circular construction detected while resolving '{0}'")]
  CircularResolution(Identity),

  #[error("Failed to construct '{identity}': {source}")]
  Construction {
    identity: Identity,
    #[source]
    source: BoxError,
  },

  #[error("Argument {index} of '{owner}' is missing or is not a {expected}")]
  Argument {
    owner: Identity,
    index: usize,
    expected: &'static str,
  },

  #[error("Cannot coerce '{key}' to {target}: {reason}")]
  Coerce {
    key: String,
    target: Coerce,
    reason: String,
  },

  #[error("Cannot decode '{key}': {reason}")]
  Decode { key: String, reason: String },

  #[error("Field '{0}' was never wired by a container")]
  Unbound(&'static str),

  #[error("The owning container has been dropped")]
  ContainerDropped,
}

/// A specialized `Result` type for `fibre_kernel` operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The error recorded in place of a listener's result when it fails.
///
/// Listener failures never reach the emitter; they show up as the matching
/// entry of the results vector instead.
#[derive(Debug, Error)]
pub enum ListenerError {
  #[error("{0}")]
  Failed(BoxError),

  #[error("listener panicked: {0}")]
  Panicked(String),

  #[error("listener is bound to a declaration but its container no longer exists")]
  Detached,
}

impl ListenerError {
  /// Returns the underlying error if it is of type `E`.
  pub fn downcast_ref<E: std::error::Error + 'static>(&self) -> Option<&E> {
    match self {
      ListenerError::Failed(err) => err.downcast_ref::<E>(),
      _ => None,
    }
  }
}
