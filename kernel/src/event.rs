// kernel/src/event.rs

//! The topic-keyed event bus owned by every container.
//!
//! Listeners are matched by exact topic. Emission snapshots the matching
//! listeners first, so one-shot listeners leave the bus before any action
//! runs and cannot fire twice even when an action re-enters `emit`.
//!
//! Inside a tokio runtime the listeners are driven by a spawned task, so an
//! emission whose [`Emission`] is dropped still reaches every listener.

use crate::error::{BoxError, ListenerError};
use crate::identity::Identity;

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures_util::future::{self, BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::oneshot;

/// What a single listener produced: its value, or the error it raised.
pub type Outcome = Result<Value, ListenerError>;

/// The pending result of an emission. Results come back in listener
/// registration order.
pub type Emission = BoxFuture<'static, Vec<Outcome>>;

pub(crate) type Handler =
  Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, BoxError>> + Send + Sync>;

/// Return types accepted from listener and method bodies.
pub trait HandlerResult {
  fn into_result(self) -> Result<Value, BoxError>;
}

impl HandlerResult for Value {
  fn into_result(self) -> Result<Value, BoxError> {
    Ok(self)
  }
}

impl HandlerResult for () {
  fn into_result(self) -> Result<Value, BoxError> {
    Ok(Value::Null)
  }
}

impl<V, E> HandlerResult for Result<V, E>
where
  V: Into<Value>,
  E: Into<BoxError>,
{
  fn into_result(self) -> Result<Value, BoxError> {
    self.map(Into::into).map_err(Into::into)
  }
}

pub(crate) fn handler<F, Fut>(action: F) -> Handler
where
  F: Fn(Value) -> Fut + Send + Sync + 'static,
  Fut: Future + Send + 'static,
  Fut::Output: HandlerResult,
{
  Arc::new(move |data| action(data).map(HandlerResult::into_result).boxed())
}

/// Runs listeners that are bound to a declaration rather than a closure.
pub(crate) trait Dispatch: Send + Sync {
  fn dispatch(
    self: Arc<Self>,
    identity: &Identity,
    member: &str,
    data: Value,
    fork: bool,
  ) -> BoxFuture<'static, Result<Value, BoxError>>;
}

pub(crate) enum Action {
  Handler(Handler),
  Declared { identity: Identity, member: Arc<str> },
}

struct Listener {
  id: u64,
  topic: String,
  action: Action,
  unique: bool,
  disabled: AtomicBool,
}

struct BusInner {
  listeners: Mutex<Vec<Arc<Listener>>>,
  next_id: AtomicU64,
  host: Option<Weak<dyn Dispatch>>,
}

/// Options for [`EventBus::emit_with`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmitOptions {
  /// Await listeners one after another instead of concurrently.
  pub sequential: bool,
  /// Resolve declaration-bound listeners inside a fresh fork of the container.
  pub fork: bool,
}

impl EmitOptions {
  pub fn sequential(mut self) -> Self {
    self.sequential = true;
    self
  }

  pub fn forked(mut self) -> Self {
    self.fork = true;
    self
  }
}

/// A topic-keyed publish/subscribe bus.
#[derive(Clone)]
pub struct EventBus {
  inner: Arc<BusInner>,
}

impl Default for EventBus {
  fn default() -> Self {
    Self::new()
  }
}

impl fmt::Debug for EventBus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("EventBus")
      .field("listeners", &self.inner.listeners.lock().len())
      .field("hosted", &self.inner.host.is_some())
      .finish()
  }
}

impl EventBus {
  /// Creates a bus that is not attached to any container. Declaration-bound
  /// listeners on such a bus always report [`ListenerError::Detached`].
  pub fn new() -> Self {
    Self::build(None)
  }

  pub(crate) fn hosted(host: Weak<dyn Dispatch>) -> Self {
    Self::build(Some(host))
  }

  fn build(host: Option<Weak<dyn Dispatch>>) -> Self {
    Self {
      inner: Arc::new(BusInner {
        listeners: Mutex::new(Vec::new()),
        next_id: AtomicU64::new(1),
        host,
      }),
    }
  }

  /// Registers `action` for every emission on `topic`.
  pub fn on<F, Fut>(&self, topic: impl Into<String>, action: F) -> Observer
  where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future + Send + 'static,
    Fut::Output: HandlerResult,
  {
    self.subscribe(topic, Action::Handler(handler(action)), false)
  }

  /// Registers `action` for the next emission on `topic` only.
  pub fn once<F, Fut>(&self, topic: impl Into<String>, action: F) -> Observer
  where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future + Send + 'static,
    Fut::Output: HandlerResult,
  {
    self.subscribe(topic, Action::Handler(handler(action)), true)
  }

  /// Registers a listener that resolves `identity` and invokes `member` with
  /// the event data on every emission.
  pub fn on_declared(
    &self,
    topic: impl Into<String>,
    identity: impl Into<Identity>,
    member: &str,
  ) -> Observer {
    let action = Action::Declared {
      identity: identity.into(),
      member: Arc::from(member),
    };
    self.subscribe(topic, action, false)
  }

  pub(crate) fn subscribe(&self, topic: impl Into<String>, action: Action, unique: bool) -> Observer {
    let listener = Arc::new(Listener {
      id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
      topic: topic.into(),
      action,
      unique,
      disabled: AtomicBool::new(false),
    });
    self.inner.listeners.lock().push(Arc::clone(&listener));
    Observer {
      bus: Arc::downgrade(&self.inner),
      listener,
    }
  }

  /// Number of active listeners on `topic`.
  pub fn listener_count(&self, topic: &str) -> usize {
    self
      .inner
      .listeners
      .lock()
      .iter()
      .filter(|l| l.topic == topic && !l.disabled.load(Ordering::Acquire))
      .count()
  }

  /// Emits `data` to every listener of `topic`, concurrently.
  pub fn emit(&self, topic: &str, data: Value) -> Emission {
    self.emit_with(topic, data, EmitOptions::default())
  }

  /// Emits `data` to every listener of `topic`.
  ///
  /// A failing or panicking listener contributes its error as its result
  /// entry; the emission itself never fails.
  pub fn emit_with(&self, topic: &str, data: Value, options: EmitOptions) -> Emission {
    let matched: Vec<Arc<Listener>> = {
      let mut listeners = self.inner.listeners.lock();
      let matched: Vec<Arc<Listener>> = listeners
        .iter()
        .filter(|l| l.topic == topic && !l.disabled.load(Ordering::Acquire))
        .cloned()
        .collect();
      listeners.retain(|l| !(l.unique && matched.iter().any(|m| m.id == l.id)));
      matched
    };
    for listener in matched.iter().filter(|l| l.unique) {
      listener.disabled.store(true, Ordering::Release);
    }

    tracing::trace!(topic, listeners = matched.len(), sequential = options.sequential, "emit");

    let host = self.inner.host.clone();
    let emission = if options.sequential {
      async move {
        let mut results = Vec::with_capacity(matched.len());
        for listener in &matched {
          results.push(run(listener, data.clone(), host.as_ref(), options.fork).await);
        }
        results
      }
      .boxed()
    } else {
      let pending: Vec<_> = matched
        .iter()
        .map(|listener| run(listener, data.clone(), host.as_ref(), options.fork))
        .collect();
      future::join_all(pending).boxed()
    };

    // Listeners run even if the caller drops the returned future. Outside a
    // runtime they run when it is first polled.
    match Handle::try_current() {
      Ok(runtime) => {
        let task = runtime.spawn(emission);
        let topic = topic.to_owned();
        async move {
          task.await.unwrap_or_else(|err| {
            tracing::warn!(topic = %topic, error = %err, "emission task did not complete");
            Vec::new()
          })
        }
        .boxed()
      }
      Err(_) => emission,
    }
  }
}

fn run(
  listener: &Listener,
  data: Value,
  host: Option<&Weak<dyn Dispatch>>,
  fork: bool,
) -> BoxFuture<'static, Outcome> {
  let topic = listener.topic.clone();
  let started = std::panic::catch_unwind(AssertUnwindSafe(|| match &listener.action {
    Action::Handler(handler) => Ok(handler(data)),
    Action::Declared { identity, member } => match host.and_then(Weak::upgrade) {
      Some(host) => Ok(host.dispatch(identity, member, data, fork)),
      None => Err(ListenerError::Detached),
    },
  }));

  let pending = match started {
    Ok(Ok(pending)) => pending,
    Ok(Err(err)) => return future::ready(Err(err)).boxed(),
    Err(payload) => {
      let err = ListenerError::Panicked(panic_message(payload.as_ref()));
      tracing::warn!(topic = %topic, error = %err, "listener failed");
      return future::ready(Err(err)).boxed();
    }
  };

  AssertUnwindSafe(pending)
    .catch_unwind()
    .map(move |settled| {
      let outcome = match settled {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(ListenerError::Failed(err)),
        Err(payload) => Err(ListenerError::Panicked(panic_message(payload.as_ref()))),
      };
      if let Err(err) = &outcome {
        tracing::warn!(topic = %topic, error = %err, "listener failed");
      }
      outcome
    })
    .boxed()
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
  if let Some(msg) = payload.downcast_ref::<&str>() {
    (*msg).to_owned()
  } else if let Some(msg) = payload.downcast_ref::<String>() {
    msg.clone()
  } else {
    "non-string panic payload".to_owned()
  }
}

/// Handle to one listener registration.
pub struct Observer {
  bus: Weak<BusInner>,
  listener: Arc<Listener>,
}

impl fmt::Debug for Observer {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Observer")
      .field("topic", &self.listener.topic)
      .field("unique", &self.listener.unique)
      .field("active", &self.is_active())
      .finish()
  }
}

impl Observer {
  pub fn topic(&self) -> &str {
    &self.listener.topic
  }

  pub fn is_active(&self) -> bool {
    !self.listener.disabled.load(Ordering::Acquire)
  }

  /// Disables the listener and removes it from its bus. Freeing twice is a no-op.
  pub fn free(&self) {
    if self.listener.disabled.swap(true, Ordering::AcqRel) {
      return;
    }
    if let Some(bus) = self.bus.upgrade() {
      let id = self.listener.id;
      bus.listeners.lock().retain(|l| l.id != id);
    }
  }

  /// Replaces this registration with a one-shot one and resolves with the
  /// data of the next emission on the same topic.
  ///
  /// Resolves to `None` if the bus goes away before anything is emitted.
  pub fn wait(self) -> impl Future<Output = Option<Value>> + Send + 'static {
    self.free();
    let (tx, rx) = oneshot::channel::<Value>();
    if let Some(inner) = self.bus.upgrade() {
      let slot = Mutex::new(Some(tx));
      let deliver: Handler = Arc::new(move |data: Value| {
        if let Some(tx) = slot.lock().take() {
          let _ = tx.send(data.clone());
        }
        future::ready(Ok(data)).boxed()
      });
      EventBus { inner }.subscribe(self.listener.topic.clone(), Action::Handler(deliver), true);
    }
    async move { rx.await.ok() }
  }
}
