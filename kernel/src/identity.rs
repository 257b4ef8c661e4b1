//! Declaration identities and the naming convention for implicit topics.

use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

/// The stable key a declaration is registered and resolved by.
///
/// Identities are assigned explicitly when a type is declared, so two types
/// that happen to share a Rust name never collide. Cloning is a reference
/// count bump.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity(Arc<str>);

impl Identity {
  pub fn new(name: impl AsRef<str>) -> Self {
    Self(Arc::from(name.as_ref()))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  /// An empty identity stands in for "no declaration at all".
  pub fn is_empty(&self) -> bool {
    self.0.trim().is_empty()
  }
}

impl fmt::Debug for Identity {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "Identity({})", self.0)
  }
}

impl fmt::Display for Identity {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<&str> for Identity {
  fn from(value: &str) -> Self {
    Self::new(value)
  }
}

impl From<String> for Identity {
  fn from(value: String) -> Self {
    Self(Arc::from(value))
  }
}

impl From<&Identity> for Identity {
  fn from(value: &Identity) -> Self {
    value.clone()
  }
}

impl Borrow<str> for Identity {
  fn borrow(&self) -> &str {
    &self.0
  }
}

/// What an `Inject<T>` field is wired to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum InjectTarget {
  /// Resolve the declaration registered under this identity.
  Identity(Identity),
  /// The container performing the wiring.
  Container,
  /// The identity that asked for the owning instance, if any.
  Requester,
}

impl InjectTarget {
  pub(crate) fn identity(&self) -> Option<&Identity> {
    match self {
      InjectTarget::Identity(id) => Some(id),
      _ => None,
    }
  }
}

impl From<Identity> for InjectTarget {
  fn from(value: Identity) -> Self {
    InjectTarget::Identity(value)
  }
}

impl From<&Identity> for InjectTarget {
  fn from(value: &Identity) -> Self {
    InjectTarget::Identity(value.clone())
  }
}

impl From<&str> for InjectTarget {
  fn from(value: &str) -> Self {
    InjectTarget::Identity(Identity::new(value))
  }
}

/// Builds the topic an implicitly wired member listens on: `Owner.member`.
pub fn topic_name(owner: &str, member: &str) -> String {
  let mut topic = String::with_capacity(owner.len() + member.len() + 1);
  topic.push_str(owner);
  topic.push('.');
  topic.push_str(member);
  topic
}
