// kernel/src/declare.rs

//! Declarations: how a type is built and wired.
//!
//! A [`Declare`] builder collects, in ordinary code, everything the container
//! needs to know about a type: how to construct it, which fields to inject,
//! which store keys back which fields, which members are invocable and which
//! events they listen to. `register` writes the result into a
//! [`MetadataRegistry`].

use crate::container::{Container, ResolveOptions};
use crate::core::{Instance, Projection};
use crate::error::{BoxError, Error, Result};
use crate::event::HandlerResult;
use crate::global::global_registry;
use crate::identity::{Identity, InjectTarget};
use crate::inject::{Env, Inject, Link, State, StoreLink};
use crate::lifecycle::Lifecycle;
use crate::metadata::{Merge, MetadataRegistry, Slot, BINDINGS, DEFINITION, PARAMS};
use crate::store::Coerce;

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use futures_util::future::{self, BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use serde_json::Value;

/// A single argument handed to a constructor or method.
#[derive(Clone)]
pub enum Arg {
  Value(Value),
  Instance(Instance),
}

impl Arg {
  /// Wraps a plain Rust value as an instance argument.
  pub fn instance<U: Any + Send + Sync>(value: U) -> Self {
    Arg::Instance(Arc::new(value))
  }

  pub fn as_value(&self) -> Option<&Value> {
    match self {
      Arg::Value(v) => Some(v),
      Arg::Instance(_) => None,
    }
  }

  pub fn downcast<U: Any + Send + Sync>(&self) -> Option<Arc<U>> {
    match self {
      Arg::Instance(i) => Arc::clone(i).downcast::<U>().ok(),
      Arg::Value(_) => None,
    }
  }
}

impl fmt::Debug for Arg {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Arg::Value(v) => f.debug_tuple("Value").field(v).finish(),
      Arg::Instance(_) => f.write_str("Instance(..)"),
    }
  }
}

impl From<Value> for Arg {
  fn from(value: Value) -> Self {
    Arg::Value(value)
  }
}

/// Positional arguments resolved for a constructor or method call.
#[derive(Debug, Clone)]
pub struct Args {
  owner: Identity,
  items: Vec<Arg>,
}

impl Args {
  pub(crate) fn new(owner: Identity, items: Vec<Arg>) -> Self {
    Self { owner, items }
  }

  /// The declaration the arguments were resolved for.
  pub fn owner(&self) -> &Identity {
    &self.owner
  }

  pub fn len(&self) -> usize {
    self.items.len()
  }

  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  pub fn get(&self, index: usize) -> Option<&Arg> {
    self.items.get(index)
  }

  pub fn iter(&self) -> std::slice::Iter<'_, Arg> {
    self.items.iter()
  }

  pub fn into_vec(self) -> Vec<Arg> {
    self.items
  }

  fn missing(&self, index: usize, expected: &'static str) -> Error {
    Error::Argument {
      owner: self.owner.clone(),
      index,
      expected,
    }
  }

  pub fn instance<U: Any + Send + Sync>(&self, index: usize) -> Result<Arc<U>> {
    self
      .get(index)
      .and_then(Arg::downcast::<U>)
      .ok_or_else(|| self.missing(index, type_name::<U>()))
  }

  pub fn value(&self, index: usize) -> Result<&Value> {
    self
      .get(index)
      .and_then(Arg::as_value)
      .ok_or_else(|| self.missing(index, "value"))
  }

  pub fn value_as<V: DeserializeOwned>(&self, index: usize) -> Result<V> {
    let value = self.value(index)?.clone();
    serde_json::from_value(value).map_err(|_| self.missing(index, type_name::<V>()))
  }
}

type ResolveFn = dyn Fn(&Container, &[Arg]) -> Result<Arg> + Send + Sync;

/// Computes one argument from the container and the caller's extra arguments.
#[derive(Clone)]
pub struct ArgResolver(Arc<ResolveFn>);

impl fmt::Debug for ArgResolver {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str("ArgResolver(..)")
  }
}

impl ArgResolver {
  pub fn new<F>(resolve: F) -> Self
  where
    F: Fn(&Container, &[Arg]) -> Result<Arg> + Send + Sync + 'static,
  {
    Self(Arc::new(resolve))
  }

  /// The instance registered under `identity`.
  pub fn inject(identity: impl Into<Identity>) -> Self {
    let identity = identity.into();
    Self::new(move |container, _| {
      container
        .inject(&identity, ResolveOptions::default())
        .map(Arg::Instance)
    })
  }

  /// The container doing the resolution.
  pub fn container() -> Self {
    Self::new(|container, _| Ok(Arg::Instance(Arc::new(container.clone()))))
  }

  /// The current store value of `key`, `null` when absent.
  pub fn state(key: impl Into<String>) -> Self {
    let key = key.into();
    Self::new(move |container, _| Ok(Arg::Value(container.state(&key).unwrap_or(Value::Null))))
  }

  /// A required env value; resolution fails with `MissingEnv` when absent.
  pub fn env(key: impl Into<String>, coerce: Option<Coerce>) -> Self {
    let key = key.into();
    Self::new(move |container, _| match container.env(&key, coerce)? {
      Some(value) => Ok(Arg::Value(value)),
      None => Err(Error::MissingEnv(key.clone())),
    })
  }

  /// An optional env value, `null` when absent.
  pub fn optional_env(key: impl Into<String>, coerce: Option<Coerce>) -> Self {
    let key = key.into();
    Self::new(move |container, _| Ok(Arg::Value(container.env(&key, coerce)?.unwrap_or(Value::Null))))
  }

  /// The caller's extra argument at `index`, `null` when not supplied.
  pub fn extra(index: usize) -> Self {
    Self::new(move |_, extra| Ok(extra.get(index).cloned().unwrap_or(Arg::Value(Value::Null))))
  }

  /// A constant.
  pub fn value(value: impl Into<Value>) -> Self {
    let value = value.into();
    Self::new(move |_, _| Ok(Arg::Value(value.clone())))
  }

  pub fn resolve(&self, container: &Container, extra: &[Arg]) -> Result<Arg> {
    (self.0)(container, extra)
  }
}

/// Argument resolvers for one constructor or member; more derived
/// declarations override per position.
#[derive(Debug, Clone, Default)]
pub(crate) struct Params(pub(crate) Vec<ArgResolver>);

impl Merge for Params {
  fn merge(parent: Self, child: Self) -> Self {
    let mut merged = parent.0;
    for (index, resolver) in child.0.into_iter().enumerate() {
      match merged.get_mut(index) {
        Some(slot) => *slot = resolver,
        None => merged.push(resolver),
      }
    }
    Params(merged)
  }
}

pub(crate) type Method = Arc<dyn Fn(Instance, Args) -> BoxFuture<'static, Result<Value, BoxError>> + Send + Sync>;
pub(crate) type LifecycleCast = Arc<dyn Fn(&Instance) -> Option<Arc<dyn Lifecycle>> + Send + Sync>;
type ClassFn = dyn Fn(Args) -> Result<Instance, BoxError> + Send + Sync;
type FactoryFn = dyn Fn(&Container, Option<&Identity>) -> Result<Instance, BoxError> + Send + Sync;

#[derive(Clone)]
pub(crate) enum Constructor {
  Class(Arc<ClassFn>),
  Factory(Arc<FactoryFn>),
  Abstract,
}

/// The target-level half of a declaration.
#[derive(Clone)]
pub struct Definition {
  pub(crate) identity: Identity,
  pub(crate) type_name: &'static str,
  pub(crate) constructor: Constructor,
  pub(crate) singleton: bool,
  pub(crate) provide_as: Option<Identity>,
  pub(crate) lifecycle: Option<LifecycleCast>,
  pub(crate) methods: HashMap<Arc<str>, Method>,
}

impl fmt::Debug for Definition {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let kind = match self.constructor {
      Constructor::Class(_) => "class",
      Constructor::Factory(_) => "factory",
      Constructor::Abstract => "abstract",
    };
    let mut methods: Vec<&str> = self.methods.keys().map(|m| m.as_ref()).collect();
    methods.sort_unstable();
    f.debug_struct("Definition")
      .field("identity", &self.identity)
      .field("type", &self.type_name)
      .field("constructor", &kind)
      .field("singleton", &self.singleton)
      .field("provide_as", &self.provide_as)
      .field("lifecycle", &self.lifecycle.is_some())
      .field("methods", &methods)
      .finish()
  }
}

impl Definition {
  pub fn identity(&self) -> &Identity {
    &self.identity
  }

  pub fn type_name(&self) -> &'static str {
    self.type_name
  }

  pub fn is_singleton(&self) -> bool {
    self.singleton
  }

  pub fn is_factory(&self) -> bool {
    matches!(self.constructor, Constructor::Factory(_))
  }

  pub fn provides_as(&self) -> Option<&Identity> {
    self.provide_as.as_ref()
  }

  pub fn has_method(&self, member: &str) -> bool {
    self.methods.contains_key(member)
  }
}

impl Merge for Definition {
  fn merge(parent: Self, child: Self) -> Self {
    let mut methods = parent.methods;
    methods.extend(child.methods);
    Definition {
      methods,
      lifecycle: child.lifecycle.or(parent.lifecycle),
      ..child
    }
  }

  fn lift(self, projection: &Projection) -> Self {
    let methods = self
      .methods
      .into_iter()
      .map(|(member, method)| {
        let projection = Arc::clone(projection);
        let owner = self.identity.clone();
        let lifted: Method = Arc::new(move |instance: Instance, args: Args| match projection(&instance) {
          Some(base) => method(base, args),
          None => future::ready(Err(Box::new(Error::TypeMismatch {
            identity: owner.clone(),
            expected: "projectable instance",
          }) as BoxError))
          .boxed(),
        });
        (member, lifted)
      })
      .collect();
    let lifecycle = self.lifecycle.map(|cast| {
      let projection = Arc::clone(projection);
      Arc::new(move |instance: &Instance| projection(instance).and_then(|base| cast(&base))) as LifecycleCast
    });
    Definition {
      methods,
      lifecycle,
      ..self
    }
  }
}

type PropertyBinder = Arc<dyn Fn(&Instance, Link) -> bool + Send + Sync>;
type StoreBinder = Arc<dyn Fn(&Instance, StoreLink) -> bool + Send + Sync>;

#[derive(Clone)]
pub(crate) struct PropertyBinding {
  pub(crate) member: Arc<str>,
  pub(crate) target: InjectTarget,
  pub(crate) bind: PropertyBinder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StateMode {
  Mutable,
  Env { coerce: Option<Coerce>, required: bool },
}

#[derive(Clone)]
pub(crate) struct StateBinding {
  pub(crate) member: Arc<str>,
  pub(crate) key: String,
  pub(crate) mode: StateMode,
  pub(crate) bind: StoreBinder,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct EventBinding {
  pub(crate) member: Arc<str>,
  pub(crate) topic: Option<String>,
}

/// Property, state and event bindings of one declaration.
#[derive(Clone, Default)]
pub(crate) struct Bindings {
  pub(crate) properties: Vec<PropertyBinding>,
  pub(crate) states: Vec<StateBinding>,
  pub(crate) events: Vec<EventBinding>,
}

impl Bindings {
  /// Identities the property injections point at.
  pub(crate) fn children(&self) -> Vec<Identity> {
    let mut children: Vec<Identity> = Vec::new();
    for property in &self.properties {
      if let Some(id) = property.target.identity() {
        if !children.contains(id) {
          children.push(id.clone());
        }
      }
    }
    children
  }
}

fn union_by<T>(parent: Vec<T>, child: Vec<T>, same: impl Fn(&T, &T) -> bool) -> Vec<T> {
  let mut merged: Vec<T> = parent.into_iter().filter(|p| !child.iter().any(|c| same(p, c))).collect();
  merged.extend(child);
  merged
}

impl Merge for Bindings {
  fn merge(parent: Self, child: Self) -> Self {
    Bindings {
      properties: union_by(parent.properties, child.properties, |a, b| a.member == b.member),
      states: union_by(parent.states, child.states, |a, b| a.member == b.member),
      events: union_by(parent.events, child.events, |a, b| a == b),
    }
  }

  fn lift(self, projection: &Projection) -> Self {
    let properties = self
      .properties
      .into_iter()
      .map(|p| {
        let (projection, bind) = (Arc::clone(projection), p.bind);
        PropertyBinding {
          bind: Arc::new(move |instance: &Instance, link: Link| {
            projection(instance).is_some_and(|base| bind(&base, link))
          }),
          ..p
        }
      })
      .collect();
    let states = self
      .states
      .into_iter()
      .map(|s| {
        let (projection, bind) = (Arc::clone(projection), s.bind);
        StateBinding {
          bind: Arc::new(move |instance: &Instance, link: StoreLink| {
            projection(instance).is_some_and(|base| bind(&base, link))
          }),
          ..s
        }
      })
      .collect();
    Bindings {
      properties,
      states,
      events: self.events,
    }
  }
}

/// Builder describing how the container builds and wires a `T`.
///
/// ```
/// use fibre_kernel::{Container, Declare, Inject, MetadataRegistry};
/// use std::sync::Arc;
///
/// struct Database;
/// #[derive(Default)]
/// struct Users {
///   db: Inject<Database>,
/// }
///
/// let registry = Arc::new(MetadataRegistry::new());
/// Declare::<Database>::new("Database").construct(|_| Ok(Database)).register_in(&registry);
/// Declare::<Users>::new("Users")
///   .default_construct()
///   .inject("db", "Database", |u: &Users| &u.db)
///   .register_in(&registry);
///
/// let container = Container::builder().registry(registry).build();
/// let users = container.resolve::<Users>("Users").unwrap();
/// assert!(users.db.get().is_ok());
/// ```
pub struct Declare<T> {
  identity: Identity,
  constructor: Constructor,
  singleton: bool,
  provide_as: Option<Identity>,
  lifecycle: Option<LifecycleCast>,
  methods: HashMap<Arc<str>, Method>,
  params: Vec<ArgResolver>,
  method_params: HashMap<Arc<str>, Vec<ArgResolver>>,
  bindings: Bindings,
  parent: Option<(Identity, Option<Projection>)>,
  _marker: PhantomData<fn() -> T>,
}

impl<T> fmt::Debug for Declare<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Declare")
      .field("identity", &self.identity)
      .field("type", &type_name::<T>())
      .field("singleton", &self.singleton)
      .field("properties", &self.bindings.properties.len())
      .field("states", &self.bindings.states.len())
      .field("events", &self.bindings.events)
      .finish_non_exhaustive()
  }
}

impl<T: Any + Send + Sync> Declare<T> {
  pub fn new(identity: impl Into<Identity>) -> Self {
    Self {
      identity: identity.into(),
      constructor: Constructor::Abstract,
      singleton: true,
      provide_as: None,
      lifecycle: None,
      methods: HashMap::new(),
      params: Vec::new(),
      method_params: HashMap::new(),
      bindings: Bindings::default(),
      parent: None,
      _marker: PhantomData,
    }
  }

  pub fn identity(&self) -> &Identity {
    &self.identity
  }

  // --- Construction ---

  /// Appends a constructor argument resolver.
  pub fn param(mut self, resolver: ArgResolver) -> Self {
    self.params.push(resolver);
    self
  }

  /// Builds `T` from the resolved constructor arguments.
  pub fn construct<F>(mut self, build: F) -> Self
  where
    F: Fn(Args) -> Result<T, BoxError> + Send + Sync + 'static,
  {
    self.constructor = Constructor::Class(Arc::new(move |args| build(args).map(|t| Arc::new(t) as Instance)));
    self
  }

  /// Obtains `T` from a factory called with the container and the identity
  /// that asked for it.
  pub fn factory<F>(mut self, factory: F) -> Self
  where
    F: Fn(&Container, Option<&Identity>) -> Result<T, BoxError> + Send + Sync + 'static,
  {
    self.constructor = Constructor::Factory(Arc::new(move |container, requester| {
      factory(container, requester).map(|t| Arc::new(t) as Instance)
    }));
    self
  }

  /// A fresh instance on every resolve.
  pub fn transient(mut self) -> Self {
    self.singleton = false;
    self
  }

  pub fn singleton(mut self, singleton: bool) -> Self {
    self.singleton = singleton;
    self
  }

  /// Always resolve `identity` whenever this declaration is asked for.
  pub fn provide_as(mut self, identity: impl Into<Identity>) -> Self {
    self.provide_as = Some(identity.into());
    self
  }

  /// Inherits the bindings of `parent`, applied to the base `project` returns.
  pub fn extends<B, F>(mut self, parent: impl Into<Identity>, project: F) -> Self
  where
    B: Any + Send + Sync,
    F: Fn(&T) -> Arc<B> + Send + Sync + 'static,
  {
    let projection: Projection =
      Arc::new(move |instance: &Instance| instance.downcast_ref::<T>().map(|t| project(t) as Instance));
    self.parent = Some((parent.into(), Some(projection)));
    self
  }

  // --- Wiring ---

  /// Wires the `Inject<U>` field returned by `accessor` to `target`.
  pub fn inject<U, F>(mut self, member: &str, target: impl Into<InjectTarget>, accessor: F) -> Self
  where
    U: Any + Send + Sync,
    F: Fn(&T) -> &Inject<U> + Send + Sync + 'static,
  {
    self.bindings.properties.push(PropertyBinding {
      member: Arc::from(member),
      target: target.into(),
      bind: Arc::new(move |instance: &Instance, link: Link| match instance.downcast_ref::<T>() {
        Some(this) => accessor(this).bind(link),
        None => false,
      }),
    });
    self
  }

  /// Backs the `State` field returned by `accessor` with store key `key`.
  pub fn state<F>(mut self, member: &str, key: impl Into<String>, accessor: F) -> Self
  where
    F: Fn(&T) -> &State + Send + Sync + 'static,
  {
    self.bindings.states.push(StateBinding {
      member: Arc::from(member),
      key: key.into(),
      mode: StateMode::Mutable,
      bind: Arc::new(move |instance: &Instance, link: StoreLink| match instance.downcast_ref::<T>() {
        Some(this) => accessor(this).bind(link),
        None => false,
      }),
    });
    self
  }

  /// Backs the read-only `Env` field returned by `accessor` with `key`.
  /// Resolution fails with `MissingEnv` if `key` has no value anywhere in
  /// the store chain.
  pub fn env<F>(self, member: &str, key: impl Into<String>, coerce: Option<Coerce>, accessor: F) -> Self
  where
    F: Fn(&T) -> &Env + Send + Sync + 'static,
  {
    self.env_binding(member, key.into(), coerce, true, accessor)
  }

  /// Like [`env`](Declare::env) but tolerates an absent key.
  pub fn optional_env<F>(self, member: &str, key: impl Into<String>, coerce: Option<Coerce>, accessor: F) -> Self
  where
    F: Fn(&T) -> &Env + Send + Sync + 'static,
  {
    self.env_binding(member, key.into(), coerce, false, accessor)
  }

  fn env_binding<F>(mut self, member: &str, key: String, coerce: Option<Coerce>, required: bool, accessor: F) -> Self
  where
    F: Fn(&T) -> &Env + Send + Sync + 'static,
  {
    self.bindings.states.push(StateBinding {
      member: Arc::from(member),
      key,
      mode: StateMode::Env { coerce, required },
      bind: Arc::new(move |instance: &Instance, link: StoreLink| match instance.downcast_ref::<T>() {
        Some(this) => accessor(this).bind(link),
        None => false,
      }),
    });
    self
  }

  // --- Members & events ---

  /// Declares an invocable member.
  pub fn method<F, Fut>(mut self, member: &str, body: F) -> Self
  where
    F: Fn(Arc<T>, Args) -> Fut + Send + Sync + 'static,
    Fut: Future + Send + 'static,
    Fut::Output: HandlerResult,
  {
    let owner = self.identity.clone();
    let method: Method = Arc::new(move |instance: Instance, args: Args| match instance.downcast::<T>() {
      Ok(this) => body(this, args).map(HandlerResult::into_result).boxed(),
      Err(_) => future::ready(Err(Box::new(Error::TypeMismatch {
        identity: owner.clone(),
        expected: type_name::<T>(),
      }) as BoxError))
      .boxed(),
    });
    self.methods.insert(Arc::from(member), method);
    self
  }

  /// Appends an argument resolver for `member`; resolved arguments come
  /// before the caller's extra arguments.
  pub fn method_param(mut self, member: &str, resolver: ArgResolver) -> Self {
    self.method_params.entry(Arc::from(member)).or_default().push(resolver);
    self
  }

  /// Subscribes `member` to the topic `Identity.member`.
  pub fn listen(mut self, member: &str) -> Self {
    self.bindings.events.push(EventBinding {
      member: Arc::from(member),
      topic: None,
    });
    self
  }

  /// Subscribes `member` to `topic`.
  pub fn listen_on(mut self, topic: impl Into<String>, member: &str) -> Self {
    self.bindings.events.push(EventBinding {
      member: Arc::from(member),
      topic: Some(topic.into()),
    });
    self
  }

  // --- Registration ---

  /// Registers into the global registry.
  pub fn register(self) -> Identity {
    self.register_in(global_registry())
  }

  pub fn register_in(self, registry: &MetadataRegistry) -> Identity {
    let identity = self.identity.clone();
    let definition = Definition {
      identity: identity.clone(),
      type_name: type_name::<T>(),
      constructor: self.constructor,
      singleton: self.singleton,
      provide_as: self.provide_as,
      lifecycle: self.lifecycle,
      methods: self.methods,
    };

    registry.set(DEFINITION, &identity, Slot::Type, definition);
    registry.set(BINDINGS, &identity, Slot::Type, self.bindings);
    if !self.params.is_empty() {
      registry.set(PARAMS, &identity, Slot::Constructor, Params(self.params));
    }
    for (member, params) in self.method_params {
      registry.set(PARAMS, &identity, Slot::Member(member), Params(params));
    }
    if let Some((parent, projection)) = self.parent {
      registry.extend(&identity, &parent, projection);
    }
    registry.index_type(TypeId::of::<T>(), &identity);

    tracing::debug!(identity = %identity, r#type = type_name::<T>(), "declared");
    identity
  }
}

impl<T: Any + Send + Sync + Default> Declare<T> {
  /// Builds `T` with `T::default()`.
  pub fn default_construct(self) -> Self {
    self.construct(|_| Ok(T::default()))
  }
}

impl<T: Lifecycle + Any> Declare<T> {
  /// Opts `T` into the container's lifecycle hooks.
  pub fn lifecycle(mut self) -> Self {
    self.lifecycle = Some(Arc::new(|instance: &Instance| {
      Arc::clone(instance)
        .downcast::<T>()
        .ok()
        .map(|this| this as Arc<dyn Lifecycle>)
    }));
    self
  }
}
