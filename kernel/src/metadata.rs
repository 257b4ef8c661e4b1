// kernel/src/metadata.rs

//! The side table holding everything a declaration says about itself.
//!
//! Entries are keyed by `(kind, identity, slot)`. Inheritance is explicit:
//! [`MetadataRegistry::extend`] records a parent together with a projection
//! from the derived instance to the base it embeds, and [`MetadataRegistry::deep`]
//! folds the chain from the farthest ancestor down to the target.

use crate::core::{compose, Instance, Projection};
use crate::identity::Identity;

use std::any::{Any, TypeId};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;

/// Kind under which declarations store their target-level definition.
pub const DEFINITION: &str = "definition";
/// Kind under which declarations store property, state and event bindings.
pub const BINDINGS: &str = "bindings";
/// Kind under which declarations store argument resolvers.
pub const PARAMS: &str = "params";

/// Where on a declaration a piece of metadata lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Slot {
  Type,
  Constructor,
  Member(Arc<str>),
}

impl Slot {
  pub fn member(name: &str) -> Self {
    Slot::Member(Arc::from(name))
  }
}

/// Metadata that can be combined along an inheritance chain.
pub trait Merge: Clone + Send + Sync + 'static {
  /// Combines an ancestor's data with the data of a more derived declaration.
  fn merge(parent: Self, child: Self) -> Self;

  /// Rewrites ancestor data so it applies to a derived instance.
  fn lift(self, _projection: &Projection) -> Self {
    self
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MetaKey {
  kind: &'static str,
  target: Identity,
  slot: Slot,
}

#[derive(Clone)]
struct Parent {
  identity: Identity,
  projection: Option<Projection>,
}

/// Storage for declarative bindings.
#[derive(Default)]
pub struct MetadataRegistry {
  entries: DashMap<MetaKey, Arc<dyn Any + Send + Sync>>,
  parents: DashMap<Identity, Parent>,
  types: DashMap<TypeId, Identity>,
}

impl fmt::Debug for MetadataRegistry {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MetadataRegistry")
      .field("entries", &self.entries.len())
      .field("parents", &self.parents.len())
      .field("types", &self.types.len())
      .finish()
  }
}

impl MetadataRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Stores `data`, replacing whatever was there.
  pub fn set<D: Any + Send + Sync>(&self, kind: &'static str, target: &Identity, slot: Slot, data: D) {
    let key = MetaKey {
      kind,
      target: target.clone(),
      slot,
    };
    self.entries.insert(key, Arc::new(data));
  }

  /// Returns the data stored exactly at this key, ignoring ancestors.
  pub fn get<D: Any + Send + Sync + Clone>(&self, kind: &'static str, target: &Identity, slot: &Slot) -> Option<D> {
    let key = MetaKey {
      kind,
      target: target.clone(),
      slot: slot.clone(),
    };
    self
      .entries
      .get(&key)
      .and_then(|entry| entry.value().downcast_ref::<D>().cloned())
  }

  pub fn has(&self, kind: &'static str, target: &Identity, slot: &Slot) -> bool {
    let key = MetaKey {
      kind,
      target: target.clone(),
      slot: slot.clone(),
    };
    self.entries.contains_key(&key)
  }

  /// Records `parent` as the direct ancestor of `child`.
  ///
  /// `projection` extracts the embedded base from a derived instance; without
  /// one, ancestor bindings are applied to the derived instance as-is.
  pub fn extend(&self, child: &Identity, parent: &Identity, projection: Option<Projection>) {
    self.parents.insert(
      child.clone(),
      Parent {
        identity: parent.clone(),
        projection,
      },
    );
  }

  /// Ancestors of `target`, nearest first.
  pub fn ancestors(&self, target: &Identity) -> Vec<Identity> {
    self.lineage(target).into_iter().skip(1).map(|(id, _)| id).collect()
  }

  // The target followed by its ancestors, each paired with the projection
  // from a target instance to that ancestor.
  fn lineage(&self, target: &Identity) -> Vec<(Identity, Option<Projection>)> {
    let mut seen = HashSet::new();
    let mut chain = vec![(target.clone(), None)];
    seen.insert(target.clone());

    let mut current = target.clone();
    let mut projection: Option<Projection> = None;
    while let Some(parent) = self.parents.get(&current).map(|p| p.value().clone()) {
      if !seen.insert(parent.identity.clone()) {
        tracing::warn!(target = %target, ancestor = %parent.identity, "inheritance cycle ignored");
        break;
      }
      projection = compose(projection, parent.projection);
      chain.push((parent.identity.clone(), projection.clone()));
      current = parent.identity;
    }
    chain
  }

  /// Folds the data stored for `target` and all of its ancestors.
  ///
  /// The walk starts at the farthest ancestor; each nearer level is merged on
  /// top of the accumulated value, so the most derived declaration wins.
  pub fn deep<D: Merge>(&self, kind: &'static str, target: &Identity, slot: &Slot) -> Option<D> {
    let mut merged: Option<D> = None;
    for (identity, projection) in self.lineage(target).into_iter().rev() {
      let Some(data) = self.get::<D>(kind, &identity, slot) else {
        continue;
      };
      let data = match &projection {
        Some(projection) => data.lift(projection),
        None => data,
      };
      merged = Some(match merged {
        Some(parent) => D::merge(parent, data),
        None => data,
      });
    }
    merged
  }

  /// Associates a concrete Rust type with the declaration that produces it.
  pub fn index_type(&self, type_id: TypeId, identity: &Identity) {
    self.types.insert(type_id, identity.clone());
  }

  /// The declaration registered for the concrete type `type_id`.
  pub fn identify(&self, type_id: TypeId) -> Option<Identity> {
    self.types.get(&type_id).map(|entry| entry.value().clone())
  }

  /// The declaration registered for the concrete type behind `instance`.
  pub fn identify_instance(&self, instance: &Instance) -> Option<Identity> {
    self.identify((**instance).type_id())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[derive(Debug, Clone, PartialEq)]
  struct Tags(Vec<&'static str>);

  impl Merge for Tags {
    fn merge(parent: Self, child: Self) -> Self {
      let mut tags = parent.0;
      for tag in child.0 {
        if !tags.contains(&tag) {
          tags.push(tag);
        }
      }
      Tags(tags)
    }
  }

  #[test]
  fn shallow_get_ignores_ancestors() {
    let registry = MetadataRegistry::new();
    let base = Identity::new("Base");
    let derived = Identity::new("Derived");
    registry.set("tags", &base, Slot::Type, Tags(vec!["a"]));
    registry.extend(&derived, &base, None);

    assert!(registry.has("tags", &base, &Slot::Type));
    assert!(!registry.has("tags", &derived, &Slot::Type));
    assert_eq!(registry.get::<Tags>("tags", &derived, &Slot::Type), None);
    assert_eq!(registry.get::<u32>("tags", &base, &Slot::Type), None);
  }

  #[test]
  fn deep_merges_from_farthest_ancestor() {
    let registry = MetadataRegistry::new();
    let (a, b, c) = (Identity::new("A"), Identity::new("B"), Identity::new("C"));
    registry.extend(&c, &b, None);
    registry.extend(&b, &a, None);
    registry.set("tags", &a, Slot::member("m"), Tags(vec!["a", "shared"]));
    registry.set("tags", &c, Slot::member("m"), Tags(vec!["shared", "c"]));

    assert_eq!(registry.ancestors(&c), vec![b.clone(), a.clone()]);
    assert_eq!(
      registry.deep::<Tags>("tags", &c, &Slot::member("m")),
      Some(Tags(vec!["a", "shared", "c"]))
    );
    assert_eq!(registry.deep::<Tags>("tags", &c, &Slot::member("other")), None);
  }

  #[test]
  fn inheritance_cycles_terminate() {
    let registry = MetadataRegistry::new();
    let (a, b) = (Identity::new("A"), Identity::new("B"));
    registry.extend(&a, &b, None);
    registry.extend(&b, &a, None);
    registry.set("tags", &b, Slot::Type, Tags(vec!["b"]));

    assert_eq!(registry.ancestors(&a), vec![b.clone()]);
    assert_eq!(registry.deep::<Tags>("tags", &a, &Slot::Type), Some(Tags(vec!["b"])));
  }

  #[test]
  fn types_map_back_to_declarations() {
    struct Probe;
    let registry = MetadataRegistry::new();
    registry.index_type(TypeId::of::<Probe>(), &Identity::new("Probe"));
    let instance: Instance = Arc::new(Probe);
    assert_eq!(registry.identify_instance(&instance), Some(Identity::new("Probe")));
  }
}
