// kernel/src/inject.rs

//! Field handles a container wires into freshly built instances.
//!
//! A declared struct holds `Inject<T>`, `State` and `Env` fields in their
//! default, unbound state. Resolution binds them once; after that they behave
//! like lazy accessors.

use crate::container::{Container, Inner, ResolveOptions};
use crate::core::Instance;
use crate::error::{Error, Result};
use crate::identity::{Identity, InjectTarget};
use crate::store::{Coerce, Settled, Store};

use std::any::{type_name, Any};
use std::fmt;
use std::sync::{Arc, Weak};

use once_cell::sync::OnceCell;
use serde::de::DeserializeOwned;
use serde_json::Value;

pub(crate) struct Link {
  pub(crate) container: Weak<Inner>,
  pub(crate) target: InjectTarget,
  pub(crate) owner: Identity,
  pub(crate) requester: Option<Identity>,
}

/// A lazily resolved dependency.
///
/// Singleton targets are re-resolved on every [`get`](Inject::get), so a swap
/// made before start is picked up. Non-singleton targets are resolved once
/// and the value is kept, giving the field a stable identity.
pub struct Inject<T> {
  link: OnceCell<Link>,
  captured: OnceCell<Arc<T>>,
}

impl<T> Default for Inject<T> {
  fn default() -> Self {
    Self {
      link: OnceCell::new(),
      captured: OnceCell::new(),
    }
  }
}

impl<T> fmt::Debug for Inject<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Inject")
      .field("type", &type_name::<T>())
      .field("target", &self.link.get().map(|l| &l.target))
      .field("captured", &self.captured.get().is_some())
      .finish()
  }
}

impl<T: Any + Send + Sync> Inject<T> {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn is_bound(&self) -> bool {
    self.link.get().is_some()
  }

  pub fn target(&self) -> Option<&InjectTarget> {
    self.link.get().map(|l| &l.target)
  }

  pub(crate) fn bind(&self, link: Link) -> bool {
    self.link.set(link).is_ok()
  }

  /// Resolves the dependency.
  pub fn get(&self) -> Result<Arc<T>> {
    if let Some(captured) = self.captured.get() {
      return Ok(Arc::clone(captured));
    }
    let link = self.link.get().ok_or(Error::Unbound(type_name::<T>()))?;
    let container = Container::upgrade(&link.container).ok_or(Error::ContainerDropped)?;

    let (instance, identity, capture): (Instance, Identity, bool) = match &link.target {
      InjectTarget::Container => (Arc::new(container.clone()) as Instance, Identity::new(container.id()), false),
      InjectTarget::Requester => {
        let requester = link.requester.clone().unwrap_or_else(|| link.owner.clone());
        (Arc::new(requester.clone()) as Instance, requester, false)
      }
      InjectTarget::Identity(id) => {
        let options = ResolveOptions::default().requested_by(link.owner.clone());
        let resolved = container.resolve_entry(id, options)?;
        (resolved.instance, id.clone(), !resolved.singleton)
      }
    };

    let typed = instance.downcast::<T>().map_err(|_| Error::TypeMismatch {
      identity,
      expected: type_name::<T>(),
    })?;
    if capture {
      return Ok(Arc::clone(self.captured.get_or_init(|| typed)));
    }
    Ok(typed)
  }
}

#[derive(Clone)]
pub(crate) struct StoreLink {
  pub(crate) store: Store,
  pub(crate) key: String,
  pub(crate) coerce: Option<Coerce>,
}

/// A mutable value backed by the container's store.
#[derive(Default)]
pub struct State {
  link: OnceCell<StoreLink>,
}

impl fmt::Debug for State {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("State").field("key", &self.key()).finish()
  }
}

impl State {
  pub fn new() -> Self {
    Self::default()
  }

  pub(crate) fn bind(&self, link: StoreLink) -> bool {
    self.link.set(link).is_ok()
  }

  pub fn key(&self) -> Option<&str> {
    self.link.get().map(|l| l.key.as_str())
  }

  pub fn get(&self) -> Option<Value> {
    self.link.get().and_then(|l| l.store.get(&l.key))
  }

  /// Reads the value and deserializes it; `None` when absent or not a `V`.
  pub fn get_as<V: DeserializeOwned>(&self) -> Option<V> {
    self.get().and_then(|v| serde_json::from_value(v).ok())
  }

  pub fn set(&self, value: impl Into<Value>) -> Result<Settled> {
    let link = self.link.get().ok_or(Error::Unbound("State"))?;
    Ok(link.store.set(&link.key, Some(value.into())))
  }

  pub fn unset(&self) -> Result<Settled> {
    let link = self.link.get().ok_or(Error::Unbound("State"))?;
    Ok(link.store.unset(&link.key))
  }
}

/// A read-only, optionally coerced value backed by the container's store.
#[derive(Default)]
pub struct Env {
  link: OnceCell<StoreLink>,
}

impl fmt::Debug for Env {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Env")
      .field("key", &self.key())
      .field("coerce", &self.link.get().and_then(|l| l.coerce))
      .finish()
  }
}

impl Env {
  pub fn new() -> Self {
    Self::default()
  }

  pub(crate) fn bind(&self, link: StoreLink) -> bool {
    self.link.set(link).is_ok()
  }

  pub fn key(&self) -> Option<&str> {
    self.link.get().map(|l| l.key.as_str())
  }

  pub fn get(&self) -> Result<Option<Value>> {
    let link = self.link.get().ok_or(Error::Unbound("Env"))?;
    link.store.env(&link.key, link.coerce)
  }

  pub fn get_as<V: DeserializeOwned>(&self) -> Result<Option<V>> {
    let Some(value) = self.get()? else {
      return Ok(None);
    };
    serde_json::from_value(value).map(Some).map_err(|e| Error::Decode {
      key: self.key().unwrap_or_default().to_owned(),
      reason: e.to_string(),
    })
  }
}
