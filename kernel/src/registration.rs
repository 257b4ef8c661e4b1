//! Per-container registration records.

use crate::core::Instance;
use crate::identity::Identity;

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// One entry of a container: an identity, the implementation that backs it
/// and its caching/lifecycle state.
#[derive(Clone)]
pub struct Registration {
  pub(crate) identity: Identity,
  pub(crate) implementation: Identity,
  pub(crate) singleton: bool,
  pub(crate) instance: Option<Instance>,
  pub(crate) started: bool,
  pub(crate) children: Vec<Identity>,
  pub(crate) pinned: bool,
}

impl Registration {
  pub(crate) fn new(identity: Identity, implementation: Identity, singleton: bool, children: Vec<Identity>) -> Self {
    Self {
      identity,
      implementation,
      singleton,
      instance: None,
      started: false,
      children,
      pinned: false,
    }
  }

  pub fn identity(&self) -> &Identity {
    &self.identity
  }

  pub fn implementation(&self) -> &Identity {
    &self.implementation
  }

  pub fn is_singleton(&self) -> bool {
    self.singleton
  }

  pub fn is_started(&self) -> bool {
    self.started
  }

  /// Identities this registration's property injections point at. Used for
  /// lifecycle ordering only.
  pub fn children(&self) -> &[Identity] {
    &self.children
  }

  pub fn instance(&self) -> Option<&Instance> {
    self.instance.as_ref()
  }

  pub fn instance_as<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
    self.instance.clone().and_then(|i| i.downcast::<T>().ok())
  }

  pub(crate) fn matches(&self, identity: &Identity) -> bool {
    &self.identity == identity || &self.implementation == identity
  }
}

impl fmt::Debug for Registration {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Registration")
      .field("identity", &self.identity)
      .field("implementation", &self.implementation)
      .field("singleton", &self.singleton)
      .field("instantiated", &self.instance.is_some())
      .field("started", &self.started)
      .field("children", &self.children)
      .finish()
  }
}

/// A definition handed to [`Container::with`](crate::Container::with).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provide {
  pub(crate) identity: Identity,
  pub(crate) implementation: Option<Identity>,
  pub(crate) singleton: Option<bool>,
}

impl Provide {
  /// Registers `identity` with its own declaration.
  pub fn new(identity: impl Into<Identity>) -> Self {
    Self {
      identity: identity.into(),
      implementation: None,
      singleton: None,
    }
  }

  /// Registers `identity` backed by the declaration `implementation`.
  pub fn swap(identity: impl Into<Identity>, implementation: impl Into<Identity>) -> Self {
    Self {
      identity: identity.into(),
      implementation: Some(implementation.into()),
      singleton: None,
    }
  }

  /// Overrides the declaration's own singleton setting.
  pub fn singleton(mut self, singleton: bool) -> Self {
    self.singleton = Some(singleton);
    self
  }
}

impl From<Identity> for Provide {
  fn from(value: Identity) -> Self {
    Provide::new(value)
  }
}

impl From<&Identity> for Provide {
  fn from(value: &Identity) -> Self {
    Provide::new(value.clone())
  }
}

impl From<&str> for Provide {
  fn from(value: &str) -> Self {
    Provide::new(value)
  }
}
