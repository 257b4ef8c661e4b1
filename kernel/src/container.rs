// kernel/src/container.rs

//! The `Container`: resolution, wiring, lifecycle and forking.

use crate::core::{address, Instance, ResolutionGuard};
use crate::declare::{Arg, Args, Bindings, Constructor, Definition, Params, StateMode};
use crate::error::{BoxError, Error, Result};
use crate::event::{handler, Action, Dispatch, EmitOptions, Emission, EventBus, HandlerResult, Observer};
use crate::global::global_registry;
use crate::graph;
use crate::identity::{topic_name, Identity};
use crate::inject::{Link, StoreLink};
use crate::lifecycle::Lifecycle;
use crate::metadata::{MetadataRegistry, Slot, BINDINGS, DEFINITION, PARAMS};
use crate::registration::{Provide, Registration};
use crate::store::{Coerce, Settled, Store};

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use futures_util::future::{self, BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde_json::Value;

// Bound on chained `provide_as` redirects.
const MAX_REDIRECTS: usize = 32;

static NEXT_CONTAINER: AtomicUsize = AtomicUsize::new(1);

/// The pending result of [`Container::invoke`].
pub type Invocation = BoxFuture<'static, Result<Value, BoxError>>;

/// What [`Container::invoke`] calls a member on.
#[derive(Clone)]
pub enum Target {
  /// Resolve the identity first.
  Identity(Identity),
  /// An existing instance; its declaration is found through its type.
  Instance(Instance),
}

impl fmt::Debug for Target {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Target::Identity(id) => f.debug_tuple("Identity").field(id).finish(),
      Target::Instance(_) => f.write_str("Instance(..)"),
    }
  }
}

impl From<Identity> for Target {
  fn from(value: Identity) -> Self {
    Target::Identity(value)
  }
}

impl From<&Identity> for Target {
  fn from(value: &Identity) -> Self {
    Target::Identity(value.clone())
  }
}

impl From<&str> for Target {
  fn from(value: &str) -> Self {
    Target::Identity(Identity::new(value))
  }
}

impl From<Instance> for Target {
  fn from(value: Instance) -> Self {
    Target::Instance(value)
  }
}

/// Options for [`Container::resolve_with`].
#[derive(Clone, Default)]
pub struct ResolveOptions {
  instance: Option<Instance>,
  unregistered: bool,
  singleton: Option<bool>,
  implementation: Option<Identity>,
  requested_by: Option<Identity>,
}

impl fmt::Debug for ResolveOptions {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ResolveOptions")
      .field("instance", &self.instance.is_some())
      .field("register", &!self.unregistered)
      .field("singleton", &self.singleton)
      .field("implementation", &self.implementation)
      .field("requested_by", &self.requested_by)
      .finish()
  }
}

impl ResolveOptions {
  /// Wire an already built instance instead of constructing one. Implies no
  /// registration.
  pub fn instance(mut self, instance: Instance) -> Self {
    self.instance = Some(instance);
    self
  }

  /// `false` builds and wires a fresh instance without touching the
  /// container's registrations.
  pub fn register(mut self, register: bool) -> Self {
    self.unregistered = !register;
    self
  }

  /// Overrides the declaration's singleton setting for a new registration.
  pub fn singleton(mut self, singleton: bool) -> Self {
    self.singleton = Some(singleton);
    self
  }

  /// Backs the identity with another declaration (a swap).
  pub fn implementation(mut self, implementation: impl Into<Identity>) -> Self {
    self.implementation = Some(implementation.into());
    self
  }

  /// The identity asking for this resolution; what a `Requester` injection
  /// sees.
  pub fn requested_by(mut self, requester: impl Into<Identity>) -> Self {
    self.requested_by = Some(requester.into());
    self
  }
}

pub(crate) struct Resolved {
  pub(crate) instance: Instance,
  pub(crate) implementation: Identity,
  pub(crate) singleton: bool,
}

pub(crate) struct Inner {
  id: Arc<str>,
  registry: Arc<MetadataRegistry>,
  registrations: Mutex<Vec<Registration>>,
  store: Store,
  bus: EventBus,
  started: AtomicBool,
  forks: AtomicUsize,
  subscriptions: Mutex<HashMap<usize, Vec<Observer>>>,
}

impl Dispatch for Inner {
  fn dispatch(
    self: Arc<Self>,
    identity: &Identity,
    member: &str,
    data: Value,
    fork: bool,
  ) -> BoxFuture<'static, Result<Value, BoxError>> {
    let container = Container { inner: self };
    let scope = if fork { container.fork() } else { container };
    match scope.invoke(identity, member, vec![Arg::Value(data)]) {
      // The scope must outlive the call when it is a throwaway fork.
      Ok(pending) => async move {
        let _scope = scope;
        pending.await
      }
      .boxed(),
      Err(err) => future::ready(Err::<Value, BoxError>(err.into())).boxed(),
    }
  }
}

/// The dependency-resolution and lifecycle container.
///
/// A `Container` is a cheap handle; clones share the same registrations,
/// store and bus.
#[derive(Clone)]
pub struct Container {
  pub(crate) inner: Arc<Inner>,
}

impl fmt::Debug for Container {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Container")
      .field("id", &self.inner.id)
      .field("started", &self.is_started())
      .field("registrations", &self.inner.registrations.lock().len())
      .field("store", &self.inner.store)
      .finish()
  }
}

impl Default for Container {
  fn default() -> Self {
    Self::new()
  }
}

/// Builder for a root [`Container`].
#[derive(Default)]
pub struct ContainerBuilder {
  id: Option<String>,
  registry: Option<Arc<MetadataRegistry>>,
  state: HashMap<String, Value>,
}

impl fmt::Debug for ContainerBuilder {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ContainerBuilder")
      .field("id", &self.id)
      .field("custom_registry", &self.registry.is_some())
      .field("state", &self.state.len())
      .finish()
  }
}

impl ContainerBuilder {
  pub fn id(mut self, id: impl Into<String>) -> Self {
    self.id = Some(id.into());
    self
  }

  /// Uses `registry` instead of the global one.
  pub fn registry(mut self, registry: Arc<MetadataRegistry>) -> Self {
    self.registry = Some(registry);
    self
  }

  pub fn state(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
    self.state.insert(key.into(), value.into());
    self
  }

  pub fn states<K, V>(mut self, entries: impl IntoIterator<Item = (K, V)>) -> Self
  where
    K: Into<String>,
    V: Into<Value>,
  {
    self
      .state
      .extend(entries.into_iter().map(|(k, v)| (k.into(), v.into())));
    self
  }

  /// Seeds the store with the process environment. Entries added explicitly
  /// take precedence.
  pub fn from_env(mut self) -> Self {
    for (key, value) in std::env::vars() {
      self.state.entry(key).or_insert(Value::String(value));
    }
    self
  }

  pub fn build(self) -> Container {
    let id: Arc<str> = match self.id {
      Some(id) => Arc::from(id),
      None => Arc::from(format!("kernel-{}", NEXT_CONTAINER.fetch_add(1, Ordering::Relaxed))),
    };
    let registry = self.registry.unwrap_or_else(|| Arc::clone(global_registry()));
    tracing::debug!(container = %id, state = self.state.len(), "container created");
    Container::assemble(id, registry, Vec::new(), |id, bus| Store::root(id, bus, self.state))
  }
}

impl Container {
  /// Creates an empty container on the global registry.
  pub fn new() -> Self {
    Self::builder().build()
  }

  /// Creates a container whose store starts with `entries`.
  pub fn with_state<K, V>(entries: impl IntoIterator<Item = (K, V)>) -> Self
  where
    K: Into<String>,
    V: Into<Value>,
  {
    Self::builder().states(entries).build()
  }

  pub fn builder() -> ContainerBuilder {
    ContainerBuilder::default()
  }

  fn assemble(
    id: Arc<str>,
    registry: Arc<MetadataRegistry>,
    registrations: Vec<Registration>,
    store: impl FnOnce(Arc<str>, EventBus) -> Store,
  ) -> Self {
    let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
      let host: Weak<dyn Dispatch> = weak.clone();
      let bus = EventBus::hosted(host);
      Inner {
        store: store(Arc::clone(&id), bus.clone()),
        id,
        registry,
        registrations: Mutex::new(registrations),
        bus,
        started: AtomicBool::new(false),
        forks: AtomicUsize::new(0),
        subscriptions: Mutex::new(HashMap::new()),
      }
    });
    Self { inner }
  }

  pub(crate) fn upgrade(inner: &Weak<Inner>) -> Option<Container> {
    inner.upgrade().map(|inner| Container { inner })
  }

  pub fn id(&self) -> &str {
    &self.inner.id
  }

  pub fn registry(&self) -> &Arc<MetadataRegistry> {
    &self.inner.registry
  }

  pub fn store(&self) -> &Store {
    &self.inner.store
  }

  pub fn bus(&self) -> &EventBus {
    &self.inner.bus
  }

  pub fn is_started(&self) -> bool {
    self.inner.started.load(Ordering::Acquire)
  }

  /// A copy of the registrations in registration order.
  pub fn registrations(&self) -> Vec<Registration> {
    self.inner.registrations.lock().clone()
  }

  /// Applies a setup function and hands the container back for chaining.
  pub fn configure(self, setup: impl FnOnce(&Container)) -> Self {
    setup(&self);
    self
  }

  // --- Registration ---

  /// Registers definitions without building them.
  ///
  /// Definitions registered here survive the removal of registrations that
  /// depend on them.
  pub fn with<P: Into<Provide>>(&self, definitions: impl IntoIterator<Item = P>) -> Result<&Self> {
    for definition in definitions {
      let Provide {
        identity,
        implementation,
        singleton,
      } = definition.into();
      self.register(&identity, implementation.as_ref(), singleton, true)?;
    }
    Ok(self)
  }

  fn definition(&self, identity: &Identity) -> Option<Definition> {
    self.inner.registry.deep::<Definition>(DEFINITION, identity, &Slot::Type)
  }

  fn bindings(&self, identity: &Identity) -> Bindings {
    self
      .inner
      .registry
      .deep::<Bindings>(BINDINGS, identity, &Slot::Type)
      .unwrap_or_default()
  }

  // Follows "always provide as" redirects.
  fn redirect(&self, identity: &Identity) -> Identity {
    let mut current = identity.clone();
    for _ in 0..MAX_REDIRECTS {
      match self.definition(&current).and_then(|d| d.provide_as) {
        Some(next) if next != current => {
          tracing::trace!(from = %current, to = %next, "provide_as redirect");
          current = next;
        }
        _ => return current,
      }
    }
    tracing::warn!(identity = %identity, stopped_at = %current, "provide_as chain too long");
    current
  }

  // Finds or creates the registration for `identity`, swapping its
  // implementation when an explicit one differs. Returns the identity the
  // registration is stored under.
  fn register(
    &self,
    identity: &Identity,
    implementation: Option<&Identity>,
    singleton: Option<bool>,
    pin: bool,
  ) -> Result<Identity> {
    if identity.is_empty() || implementation.is_some_and(Identity::is_empty) {
      return Err(Error::NullDeclaration);
    }
    let identity = self.redirect(identity);
    let explicit = implementation.map(|i| self.redirect(i));
    let implementation = explicit.clone().unwrap_or_else(|| identity.clone());

    let removed = {
      let mut registrations = self.inner.registrations.lock();
      let found = registrations
        .iter()
        .position(|r| r.matches(&identity) || r.matches(&implementation));

      let stale_index = match found {
        Some(index) => {
          let existing = &mut registrations[index];
          if explicit.is_none() || existing.implementation == implementation {
            existing.pinned |= pin;
            return Ok(existing.identity.clone());
          }
          if existing.singleton && (existing.started || self.is_started()) {
            return Err(Error::ImmutableRegistration {
              identity: existing.identity.clone(),
              implementation,
            });
          }
          Some(index)
        }
        None => None,
      };

      let definition = self
        .definition(&implementation)
        .ok_or_else(|| Error::NotAFunction(implementation.to_string()))?;
      let stale = stale_index.map(|index| {
        let stale = registrations.remove(index);
        tracing::debug!(
          identity = %identity,
          from = %stale.implementation,
          to = %implementation,
          "swapping implementation"
        );
        stale
      });

      let mut registration = Registration::new(
        identity.clone(),
        implementation.clone(),
        singleton.unwrap_or(definition.singleton),
        self.bindings(&implementation).children(),
      );
      registration.pinned = pin;
      tracing::debug!(identity = %identity, implementation = %implementation, "registered");
      registrations.push(registration);

      match stale {
        Some(stale) => prune(&mut registrations, stale),
        None => Vec::new(),
      }
    };

    for registration in removed {
      if let Some(instance) = &registration.instance {
        self.free_all(instance);
      }
    }
    Ok(identity)
  }

  // --- Resolution ---

  /// Resolves `identity` and downcasts the instance to `T`.
  pub fn resolve<T: Any + Send + Sync>(&self, identity: impl Into<Identity>) -> Result<Arc<T>> {
    self.resolve_with(identity, ResolveOptions::default())
  }

  pub fn resolve_with<T: Any + Send + Sync>(
    &self,
    identity: impl Into<Identity>,
    options: ResolveOptions,
  ) -> Result<Arc<T>> {
    let identity = identity.into();
    let resolved = self.resolve_entry(&identity, options)?;
    resolved.instance.downcast::<T>().map_err(|_| Error::TypeMismatch {
      identity,
      expected: type_name::<T>(),
    })
  }

  /// Resolves the declaration registered for the Rust type `T`.
  pub fn get<T: Any + Send + Sync>(&self) -> Result<Arc<T>> {
    let identity = self
      .inner
      .registry
      .identify(TypeId::of::<T>())
      .ok_or_else(|| Error::NotAFunction(type_name::<T>().to_owned()))?;
    self.resolve(identity)
  }

  /// Resolves `identity` to an untyped instance.
  pub fn inject(&self, identity: impl Into<Identity>, options: ResolveOptions) -> Result<Instance> {
    self.resolve_entry(&identity.into(), options).map(|r| r.instance)
  }

  pub(crate) fn resolve_entry(&self, identity: &Identity, options: ResolveOptions) -> Result<Resolved> {
    if identity.is_empty() {
      return Err(Error::NullDeclaration);
    }
    if options.instance.is_some() || options.unregistered {
      return self.resolve_detached(identity, options);
    }

    let requester = options.requested_by;
    let identity = self.register(identity, options.implementation.as_ref(), options.singleton, false)?;
    let (implementation, singleton, cached) = {
      let registrations = self.inner.registrations.lock();
      let registration = registrations
        .iter()
        .find(|r| r.identity == identity)
        .ok_or_else(|| Error::NotAFunction(identity.to_string()))?;
      (
        registration.implementation.clone(),
        registration.singleton,
        registration.instance.clone(),
      )
    };

    if let (true, Some(instance)) = (singleton, cached) {
      tracing::trace!(identity = %identity, "resolved cached singleton");
      return Ok(Resolved {
        instance,
        implementation,
        singleton,
      });
    }

    let instance = self.construct(&identity, &implementation, requester.as_ref())?;
    if !singleton {
      return Ok(Resolved {
        instance,
        implementation,
        singleton,
      });
    }

    let winner = {
      let mut registrations = self.inner.registrations.lock();
      match registrations.iter_mut().find(|r| r.identity == identity) {
        Some(registration) => match &registration.instance {
          // Another caller finished first; keep its instance.
          Some(existing) => Some(Arc::clone(existing)),
          None => {
            registration.instance = Some(Arc::clone(&instance));
            None
          }
        },
        None => None,
      }
    };
    let instance = match winner {
      Some(existing) => {
        self.free_all(&instance);
        existing
      }
      None => instance,
    };
    Ok(Resolved {
      instance,
      implementation,
      singleton,
    })
  }

  fn resolve_detached(&self, identity: &Identity, options: ResolveOptions) -> Result<Resolved> {
    let identity = self.redirect(identity);
    let implementation = match &options.implementation {
      Some(implementation) => self.redirect(implementation),
      None => identity.clone(),
    };
    let requester = options.requested_by.as_ref();
    let definition = self.definition(&implementation);

    let instance = match options.instance {
      Some(instance) => {
        self.wire(&implementation, &identity, &instance, requester)?;
        instance
      }
      None => {
        if definition.is_none() {
          return Err(Error::NotAFunction(implementation.to_string()));
        }
        self.construct(&identity, &implementation, requester)?
      }
    };
    let singleton = options
      .singleton
      .or(definition.map(|d| d.singleton))
      .unwrap_or(true);
    Ok(Resolved {
      instance,
      implementation,
      singleton,
    })
  }

  fn construct(&self, identity: &Identity, implementation: &Identity, requester: Option<&Identity>) -> Result<Instance> {
    let _guard = ResolutionGuard::new(Arc::clone(&self.inner.id), identity)?;
    let definition = self
      .definition(implementation)
      .ok_or_else(|| Error::NotAFunction(implementation.to_string()))?;
    tracing::trace!(identity = %identity, implementation = %implementation, "constructing");

    let (instance, target) = match &definition.constructor {
      Constructor::Abstract => return Err(Error::NotAFunction(implementation.to_string())),
      Constructor::Class(build) => {
        let params = self
          .inner
          .registry
          .deep::<Params>(PARAMS, implementation, &Slot::Constructor)
          .unwrap_or_default();
        let items = params
          .0
          .iter()
          .map(|resolver| resolver.resolve(self, &[]))
          .collect::<Result<Vec<_>>>()?;
        let instance = build(Args::new(implementation.clone(), items)).map_err(|e| construction_failed(identity, e))?;
        (instance, implementation.clone())
      }
      Constructor::Factory(factory) => {
        let instance = factory(self, requester).map_err(|e| construction_failed(identity, e))?;
        // Wire the product by its own declaration when its type has one.
        let target = self
          .inner
          .registry
          .identify_instance(&instance)
          .unwrap_or_else(|| implementation.clone());
        (instance, target)
      }
    };

    self.wire(&target, identity, &instance, requester)?;
    Ok(instance)
  }

  // Applies the property, state and event bindings of `declaration`.
  fn wire(&self, declaration: &Identity, owner: &Identity, instance: &Instance, requester: Option<&Identity>) -> Result<()> {
    let bindings = self.bindings(declaration);

    for property in &bindings.properties {
      let link = Link {
        container: Arc::downgrade(&self.inner),
        target: property.target.clone(),
        owner: owner.clone(),
        requester: requester.cloned(),
      };
      if !(property.bind)(instance, link) {
        tracing::trace!(owner = %owner, member = %property.member, "property already bound");
      }
    }

    for state in &bindings.states {
      let coerce = match state.mode {
        StateMode::Mutable => None,
        StateMode::Env { coerce, required } => {
          if required && self.inner.store.get(&state.key).is_none() {
            return Err(Error::MissingEnv(state.key.clone()));
          }
          coerce
        }
      };
      let link = StoreLink {
        store: self.inner.store.clone(),
        key: state.key.clone(),
        coerce,
      };
      (state.bind)(instance, link);
    }

    if !bindings.events.is_empty() {
      let mut observers = Vec::with_capacity(bindings.events.len());
      for event in &bindings.events {
        let topic = event
          .topic
          .clone()
          .unwrap_or_else(|| topic_name(declaration.as_str(), &event.member));
        let weak = Arc::downgrade(&self.inner);
        let declaration = declaration.clone();
        let member = Arc::clone(&event.member);
        let target = Arc::clone(instance);
        let action = handler(move |data: Value| {
          let call = match Container::upgrade(&weak) {
            Some(container) => container
              .invoke_on(&declaration, Arc::clone(&target), &member, vec![Arg::Value(data)])
              .map_err(BoxError::from),
            None => Err(Box::new(Error::ContainerDropped) as BoxError),
          };
          async move {
            match call {
              Ok(pending) => pending.await,
              Err(err) => Err(err),
            }
          }
        });
        tracing::trace!(owner = %owner, topic = %topic, "listening");
        observers.push(self.inner.bus.subscribe(topic, Action::Handler(action), false));
      }
      self
        .inner
        .subscriptions
        .lock()
        .entry(address(instance))
        .or_default()
        .extend(observers);
    }
    Ok(())
  }

  /// Frees every event subscription made while wiring `instance`. Returns how
  /// many were freed.
  pub fn free_all(&self, instance: &Instance) -> usize {
    let observers = self.inner.subscriptions.lock().remove(&address(instance));
    let observers = observers.unwrap_or_default();
    for observer in &observers {
      observer.free();
    }
    observers.len()
  }

  // --- Invocation ---

  /// Calls `member` on `target` with its declared argument handlers'
  /// results followed by `extra`.
  pub fn invoke(&self, target: impl Into<Target>, member: &str, extra: Vec<Arg>) -> Result<Invocation> {
    match target.into() {
      Target::Identity(identity) => {
        let resolved = self.resolve_entry(&identity, ResolveOptions::default())?;
        let declaration = match self.definition(&resolved.implementation) {
          Some(definition) if definition.has_method(member) => resolved.implementation,
          _ => self
            .inner
            .registry
            .identify_instance(&resolved.instance)
            .unwrap_or(resolved.implementation),
        };
        self.invoke_on(&declaration, resolved.instance, member, extra)
      }
      Target::Instance(instance) => {
        let declaration = self
          .inner
          .registry
          .identify_instance(&instance)
          .ok_or_else(|| Error::NotAFunction(member.to_owned()))?;
        self.invoke_on(&declaration, instance, member, extra)
      }
    }
  }

  fn invoke_on(&self, declaration: &Identity, instance: Instance, member: &str, extra: Vec<Arg>) -> Result<Invocation> {
    let not_callable = || Error::NotAFunction(topic_name(declaration.as_str(), member));
    let definition = self.definition(declaration).ok_or_else(not_callable)?;
    let method = definition.methods.get(member).cloned().ok_or_else(not_callable)?;

    let params = self
      .inner
      .registry
      .deep::<Params>(PARAMS, declaration, &Slot::member(member))
      .unwrap_or_default();
    let mut items = params
      .0
      .iter()
      .map(|resolver| resolver.resolve(self, &extra))
      .collect::<Result<Vec<_>>>()?;
    items.extend(extra);

    tracing::trace!(declaration = %declaration, member, args = items.len(), "invoke");
    Ok(method(instance, Args::new(declaration.clone(), items)))
  }

  // --- Lifecycle ---

  fn ordered(&self) -> Vec<Registration> {
    graph::sort(self.registrations())
  }

  fn lifecycle_of(&self, registration: &Registration) -> Option<Arc<dyn Lifecycle>> {
    let instance = registration.instance.as_ref()?;
    let cast = self
      .definition(&registration.implementation)
      .and_then(|d| d.lifecycle)
      .or_else(|| {
        let declaration = self.inner.registry.identify_instance(instance)?;
        self.definition(&declaration).and_then(|d| d.lifecycle)
      })?;
    cast(instance)
  }

  fn mark_started(&self, identity: &Identity, started: bool) {
    if let Some(registration) = self
      .inner
      .registrations
      .lock()
      .iter_mut()
      .find(|r| &r.identity == identity)
    {
      registration.started = started;
    }
  }

  /// Builds pending singletons, then runs `on_configure` and `on_start` on
  /// every unstarted registration in dependency order.
  ///
  /// If an `on_start` fails, everything that did start is stopped again and
  /// the original error is returned.
  pub async fn start(&self) -> Result<(), BoxError> {
    let pending: Vec<Identity> = self
      .inner
      .registrations
      .lock()
      .iter()
      .filter(|r| r.singleton && r.instance.is_none() && !r.started)
      .map(|r| r.identity.clone())
      .collect();
    for identity in pending {
      self.resolve_entry(&identity, ResolveOptions::default())?;
    }

    let ordered = self.ordered();
    tracing::debug!(container = %self.inner.id, registrations = ordered.len(), "starting");

    for registration in ordered.iter().filter(|r| !r.started) {
      if let Some(hooks) = self.lifecycle_of(registration) {
        if let Err(err) = hooks.on_configure(&ordered).await {
          tracing::error!(identity = %registration.identity, error = %err, "on_configure failed");
          return Err(err);
        }
      }
    }

    for registration in ordered.iter().filter(|r| !r.started) {
      if registration.instance.is_none() {
        continue;
      }
      if let Some(hooks) = self.lifecycle_of(registration) {
        if let Err(err) = hooks.on_start(&ordered).await {
          tracing::error!(identity = %registration.identity, error = %err, "on_start failed; rolling back");
          if let Err(rollback) = self.stop().await {
            tracing::error!(error = %rollback, "rollback stop failed");
          }
          return Err(err);
        }
      }
      self.mark_started(&registration.identity, true);
    }

    self.inner.started.store(true, Ordering::Release);
    tracing::debug!(container = %self.inner.id, "started");
    Ok(())
  }

  /// Runs `on_stop` on every started registration in reverse dependency
  /// order. A failing hook does not stop the others; the first error is
  /// returned once all have run.
  pub async fn stop(&self) -> Result<(), BoxError> {
    let ordered = self.ordered();
    let mut first: Option<BoxError> = None;

    for registration in ordered.iter().rev().filter(|r| r.started) {
      if let Some(hooks) = self.lifecycle_of(registration) {
        if let Err(err) = hooks.on_stop(&ordered).await {
          tracing::error!(identity = %registration.identity, error = %err, "on_stop failed");
          first.get_or_insert(err);
        }
      }
      self.mark_started(&registration.identity, false);
    }

    self.inner.started.store(false, Ordering::Release);
    tracing::debug!(container = %self.inner.id, "stopped");
    first.map_or(Ok(()), Err)
  }

  // --- Forking ---

  /// A child container: registrations copied without instances, a store
  /// level chained to this one, and an empty bus.
  pub fn fork(&self) -> Container {
    self.fork_with(std::iter::empty::<(String, Value)>())
  }

  /// Like [`fork`](Container::fork), with `initial` written onto the
  /// child's own store level.
  pub fn fork_with<K, V>(&self, initial: impl IntoIterator<Item = (K, V)>) -> Container
  where
    K: Into<String>,
    V: Into<Value>,
  {
    let n = self.inner.forks.fetch_add(1, Ordering::Relaxed) + 1;
    let id: Arc<str> = Arc::from(format!("{}.{}", self.inner.id, n));
    let registrations = self
      .inner
      .registrations
      .lock()
      .iter()
      .map(|r| Registration {
        instance: None,
        ..r.clone()
      })
      .collect();

    let parent = self.inner.store.clone();
    let child = Container::assemble(id, Arc::clone(&self.inner.registry), registrations, |id, bus| {
      Store::child(id, bus, parent)
    });
    for (key, value) in initial {
      let key: String = key.into();
      child.inner.store.seed(&key, value.into());
    }
    tracing::debug!(parent = %self.inner.id, fork = %child.inner.id, "forked");
    child
  }

  // --- State ---

  pub fn state(&self, key: &str) -> Option<Value> {
    self.inner.store.get(key)
  }

  pub fn set_state(&self, key: &str, value: impl Into<Value>) -> Settled {
    self.inner.store.set(key, Some(value.into()))
  }

  pub fn unset_state(&self, key: &str) -> Settled {
    self.inner.store.unset(key)
  }

  /// Reads `key` with `${other}` substitution and optional coercion.
  pub fn env(&self, key: &str, coerce: Option<Coerce>) -> Result<Option<Value>> {
    self.inner.store.env(key, coerce)
  }

  // --- Events ---

  pub fn on<F, Fut>(&self, topic: impl Into<String>, action: F) -> Observer
  where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future + Send + 'static,
    Fut::Output: HandlerResult,
  {
    self.inner.bus.on(topic, action)
  }

  pub fn once<F, Fut>(&self, topic: impl Into<String>, action: F) -> Observer
  where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future + Send + 'static,
    Fut::Output: HandlerResult,
  {
    self.inner.bus.once(topic, action)
  }

  /// Listens on `topic` by resolving `identity` and invoking `member` per
  /// emission.
  pub fn on_declared(&self, topic: impl Into<String>, identity: impl Into<Identity>, member: &str) -> Observer {
    self.inner.bus.on_declared(topic, identity, member)
  }

  pub fn emit(&self, topic: &str, data: Value) -> Emission {
    self.inner.bus.emit(topic, data)
  }

  pub fn emit_with(&self, topic: &str, data: Value, options: EmitOptions) -> Emission {
    self.inner.bus.emit_with(topic, data, options)
  }
}

// Errors raised by the kernel itself pass through user code unchanged.
fn construction_failed(identity: &Identity, source: BoxError) -> Error {
  match source.downcast::<Error>() {
    Ok(err) => *err,
    Err(source) => Error::Construction {
      identity: identity.clone(),
      source,
    },
  }
}

// Removes `stale` and, transitively, the children nothing else refers to
// unless they were registered explicitly or have started.
fn prune(registrations: &mut Vec<Registration>, stale: Registration) -> Vec<Registration> {
  let mut queue = vec![stale];
  let mut removed = Vec::new();
  while let Some(registration) = queue.pop() {
    for child in &registration.children {
      if registrations.iter().any(|r| r.children.contains(child)) {
        continue;
      }
      if let Some(index) = registrations
        .iter()
        .position(|r| &r.identity == child && !r.pinned && !r.started)
      {
        tracing::debug!(identity = %child, "removing orphaned registration");
        queue.push(registrations.remove(index));
      }
    }
    removed.push(registration);
  }
  removed
}
