//! Core, non-public data structures shared by the registry and the container.

use crate::error::{Error, Result};
use crate::identity::Identity;

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashSet;
use std::sync::Arc;

/// A type-erased, shared instance produced by a declaration.
pub type Instance = Arc<dyn Any + Send + Sync>;

/// Maps a derived instance to the base instance it embeds.
pub type Projection = Arc<dyn Fn(&Instance) -> Option<Instance> + Send + Sync>;

thread_local! {
  // The (container, identity) pairs currently under construction on this
  // thread. Re-entering one of them means a constructor cycle.
  static CONSTRUCTING: RefCell<HashSet<(Arc<str>, Identity)>> = RefCell::new(HashSet::new());
}

/// An RAII guard that detects constructor cycles.
///
/// Creating the guard records the pair on the thread-local stack and fails if
/// it is already there. Dropping it removes the pair again.
pub(crate) struct ResolutionGuard {
  key: (Arc<str>, Identity),
}

impl ResolutionGuard {
  pub(crate) fn new(container: Arc<str>, identity: &Identity) -> Result<Self> {
    let key = (container, identity.clone());
    let fresh = CONSTRUCTING.with(|stack| stack.borrow_mut().insert(key.clone()));
    if !fresh {
      return Err(Error::CircularResolution(identity.clone()));
    }
    Ok(Self { key })
  }
}

impl Drop for ResolutionGuard {
  fn drop(&mut self) {
    CONSTRUCTING.with(|stack| {
      stack.borrow_mut().remove(&self.key);
    });
  }
}

/// Composes projections in walking order: `first` then `then`.
pub(crate) fn compose(first: Option<Projection>, then: Option<Projection>) -> Option<Projection> {
  match (first, then) {
    (None, p) | (p, None) => p,
    (Some(a), Some(b)) => Some(Arc::new(move |instance: &Instance| a(instance).and_then(|base| b(&base)))),
  }
}

/// Stable address of a shared instance, used to key per-instance bookkeeping.
pub(crate) fn address(instance: &Instance) -> usize {
  Arc::as_ptr(instance) as *const () as usize
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn guard_rejects_reentry_until_dropped() {
    let id = Identity::new("Loop");
    let container: Arc<str> = Arc::from("k");
    let guard = ResolutionGuard::new(container.clone(), &id).unwrap();
    assert!(matches!(
      ResolutionGuard::new(container.clone(), &id),
      Err(Error::CircularResolution(_))
    ));
    assert!(ResolutionGuard::new(Arc::from("other"), &id).is_ok());
    drop(guard);
    assert!(ResolutionGuard::new(container, &id).is_ok());
  }
}
