// kernel/src/store.rs

//! The hierarchical key/value state shared by a container and its forks.
//!
//! Every container owns one `Store` level. Reads fall through to the parent
//! chain. Writes to a key some ancestor already holds go to that ancestor, so
//! each key has a single source of truth across the chain.

use crate::error::{Error, Result};
use crate::event::{EventBus, Outcome};

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use chrono::{DateTime, NaiveDate, Utc};
use futures_util::future::BoxFuture;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Topic every level emits on when one of its values changes.
pub const STATE_MUTATE: &str = "StateMutate";

const ID_KEY: &str = "ID";

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$\{([^}]+)\}").expect("valid placeholder pattern"));

/// Payload of a [`STATE_MUTATE`] emission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateMutation {
  pub key: String,
  pub old_value: Option<Value>,
  pub new_value: Option<Value>,
}

/// Normalizes a state key so that `a.b`, `A_B`, `a-b` and `aB` all collide.
pub fn normalize_key(key: &str) -> String {
  let mut out = String::with_capacity(key.len() + 4);
  let mut prev: Option<char> = None;
  for ch in key.trim().chars() {
    if ch == '.' || ch == '-' || ch == '_' || ch.is_whitespace() {
      if !out.is_empty() && !out.ends_with('_') {
        out.push('_');
      }
    } else {
      let boundary = ch.is_uppercase() && prev.is_some_and(|p| p.is_lowercase() || p.is_ascii_digit());
      if boundary && !out.ends_with('_') {
        out.push('_');
      }
      out.extend(ch.to_uppercase());
    }
    prev = Some(ch);
  }
  while out.ends_with('_') {
    out.pop();
  }
  out
}

/// Target types for [`Store::env`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Coerce {
  String,
  Number,
  Boolean,
  Array,
  Object,
  Date,
}

impl fmt::Display for Coerce {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Coerce::String => "string",
      Coerce::Number => "number",
      Coerce::Boolean => "boolean",
      Coerce::Array => "array",
      Coerce::Object => "object",
      Coerce::Date => "date",
    };
    f.write_str(name)
  }
}

fn text_of(value: &Value) -> String {
  match value {
    Value::String(s) => s.clone(),
    Value::Null => String::new(),
    other => other.to_string(),
  }
}

/// Converts `value` to the shape `to` describes.
pub fn coerce(key: &str, value: Value, to: Coerce) -> Result<Value> {
  let fail = |reason: String| Error::Coerce {
    key: key.to_owned(),
    target: to,
    reason,
  };

  match to {
    Coerce::String => Ok(Value::String(text_of(&value))),
    Coerce::Number => match value {
      Value::Number(_) => Ok(value),
      Value::Bool(b) => Ok(Value::from(u8::from(b))),
      other => {
        let text = text_of(&other);
        let trimmed = text.trim();
        if let Ok(int) = trimmed.parse::<i64>() {
          return Ok(Value::from(int));
        }
        trimmed
          .parse::<f64>()
          .ok()
          .and_then(serde_json::Number::from_f64)
          .map(Value::Number)
          .ok_or_else(|| fail(format!("'{}' is not a number", text)))
      }
    },
    Coerce::Boolean => match value {
      Value::Bool(_) => Ok(value),
      Value::Null => Ok(Value::Bool(false)),
      Value::Number(n) => Ok(Value::Bool(n.as_f64().is_some_and(|f| f != 0.0))),
      other => match text_of(&other).trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(Value::Bool(true)),
        "false" | "0" | "no" | "off" | "" => Ok(Value::Bool(false)),
        unknown => Err(fail(format!("'{}' is not a boolean", unknown))),
      },
    },
    Coerce::Array => match value {
      Value::Array(_) => Ok(value),
      Value::Null => Ok(Value::Array(Vec::new())),
      other => {
        let text = text_of(&other);
        let trimmed = text.trim();
        if trimmed.starts_with('[') {
          return serde_json::from_str::<Value>(trimmed).map_err(|e| fail(e.to_string()));
        }
        Ok(Value::Array(
          trimmed
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| Value::String(s.to_owned()))
            .collect(),
        ))
      }
    },
    Coerce::Object => match value {
      Value::Object(_) => Ok(value),
      other => match serde_json::from_str::<Value>(text_of(&other).trim()) {
        Ok(parsed @ Value::Object(_)) => Ok(parsed),
        Ok(_) => Err(fail("not a JSON object".to_owned())),
        Err(e) => Err(fail(e.to_string())),
      },
    },
    Coerce::Date => {
      let text = text_of(&value);
      let trimmed = text.trim();
      if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(Value::String(parsed.with_timezone(&Utc).to_rfc3339()));
      }
      if let Ok(day) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        if let Some(midnight) = day.and_hms_opt(0, 0, 0) {
          return Ok(Value::String(midnight.and_utc().to_rfc3339()));
        }
      }
      if let Value::Number(n) = &value {
        if let Some(stamp) = n.as_i64().and_then(DateTime::from_timestamp_millis) {
          return Ok(Value::String(stamp.to_rfc3339()));
        }
      }
      Err(fail(format!("'{}' is not a date", text)))
    }
  }
}

/// Replaces every `${key}` in `text` with the matching entry of `snapshot`.
/// Single pass: substituted text is not scanned again. Unknown keys stay as
/// written.
pub fn substitute(text: &str, snapshot: &HashMap<String, Value>) -> String {
  PLACEHOLDER
    .replace_all(text, |caps: &Captures<'_>| match snapshot.get(&normalize_key(&caps[1])) {
      Some(value) => text_of(value),
      None => caps[0].to_owned(),
    })
    .into_owned()
}

/// The completion of a state write.
///
/// Resolves with the outcomes of the `StateMutate` listeners once they have
/// settled. Writes that change nothing resolve immediately with no outcomes.
/// The write itself has already happened when this value is returned, and
/// inside a tokio runtime the listeners run whether or not it is awaited.
#[must_use = "await Settled to observe the mutation listeners' outcomes"]
pub struct Settled {
  changed: bool,
  pending: Option<BoxFuture<'static, Vec<Outcome>>>,
}

impl Settled {
  pub(crate) fn unchanged() -> Self {
    Self {
      changed: false,
      pending: None,
    }
  }

  /// Whether the write produced a mutation.
  pub fn changed(&self) -> bool {
    self.changed
  }
}

impl fmt::Debug for Settled {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Settled")
      .field("changed", &self.changed)
      .field("pending", &self.pending.is_some())
      .finish()
  }
}

impl Future for Settled {
  type Output = Vec<Outcome>;

  fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    match self.pending.as_mut() {
      Some(pending) => {
        let outcomes = std::task::ready!(pending.as_mut().poll(cx));
        self.pending = None;
        Poll::Ready(outcomes)
      }
      None => Poll::Ready(Vec::new()),
    }
  }
}

struct Level {
  id: Arc<str>,
  values: RwLock<HashMap<String, Value>>,
  parent: Option<Store>,
  bus: EventBus,
}

/// One level of the hierarchical state store.
#[derive(Clone)]
pub struct Store {
  level: Arc<Level>,
}

impl fmt::Debug for Store {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Store")
      .field("id", &self.level.id)
      .field("keys", &self.level.values.read().len())
      .field("parent", &self.level.parent.as_ref().map(|p| p.id().to_owned()))
      .finish()
  }
}

impl Store {
  pub(crate) fn root(id: Arc<str>, bus: EventBus, initial: HashMap<String, Value>) -> Self {
    let values = initial
      .into_iter()
      .map(|(key, value)| (normalize_key(&key), value))
      .collect();
    Self::build(id, bus, values, None)
  }

  pub(crate) fn child(id: Arc<str>, bus: EventBus, parent: Store) -> Self {
    Self::build(id, bus, HashMap::new(), Some(parent))
  }

  fn build(id: Arc<str>, bus: EventBus, values: HashMap<String, Value>, parent: Option<Store>) -> Self {
    Self {
      level: Arc::new(Level {
        id,
        values: RwLock::new(values),
        parent,
        bus,
      }),
    }
  }

  /// Identifier of the container owning this level.
  pub fn id(&self) -> &str {
    &self.level.id
  }

  pub fn parent(&self) -> Option<&Store> {
    self.level.parent.as_ref()
  }

  pub fn bus(&self) -> &EventBus {
    &self.level.bus
  }

  /// Reads `key` from this level or the nearest ancestor holding it.
  /// The reserved key `id` always yields the owning container's identifier.
  pub fn get(&self, key: &str) -> Option<Value> {
    let key = normalize_key(key);
    if key == ID_KEY {
      return Some(Value::String(self.level.id.to_string()));
    }
    self.lookup(&key)
  }

  fn lookup(&self, normalized: &str) -> Option<Value> {
    if let Some(value) = self.level.values.read().get(normalized) {
      return Some(value.clone());
    }
    self.level.parent.as_ref().and_then(|p| p.lookup(normalized))
  }

  /// Whether `key` holds a value anywhere in the chain.
  pub fn contains(&self, key: &str) -> bool {
    self.holds(&normalize_key(key))
  }

  fn holds(&self, normalized: &str) -> bool {
    self.level.values.read().contains_key(normalized)
      || self.level.parent.as_ref().is_some_and(|p| p.holds(normalized))
  }

  /// Writes `value` under `key`; `None` removes the entry.
  ///
  /// If an ancestor already holds `key` the write goes there instead of
  /// shadowing it locally. A write that changes the stored value emits
  /// [`STATE_MUTATE`] on the bus of the level that stored it.
  pub fn set(&self, key: &str, value: Option<Value>) -> Settled {
    self.write(normalize_key(key), value)
  }

  /// Removes `key`, emitting a mutation if it held a value.
  pub fn unset(&self, key: &str) -> Settled {
    self.set(key, None)
  }

  fn write(&self, key: String, value: Option<Value>) -> Settled {
    if let Some(parent) = &self.level.parent {
      if parent.holds(&key) {
        return parent.write(key, value);
      }
    }

    let old = {
      let mut values = self.level.values.write();
      match &value {
        Some(v) => values.insert(key.clone(), v.clone()),
        None => values.remove(&key),
      }
    };

    if old == value {
      return Settled::unchanged();
    }

    tracing::trace!(store = %self.level.id, key = %key, "state mutated");
    let mutation = StateMutation {
      key,
      old_value: old,
      new_value: value,
    };
    let payload = serde_json::to_value(&mutation).unwrap_or(Value::Null);
    Settled {
      changed: true,
      pending: Some(self.level.bus.emit(STATE_MUTATE, payload)),
    }
  }

  /// Writes directly onto this level without delegating or emitting.
  pub(crate) fn seed(&self, key: &str, value: Value) {
    self.level.values.write().insert(normalize_key(key), value);
  }

  /// Merged view of the whole chain; nearer levels win.
  pub fn snapshot(&self) -> HashMap<String, Value> {
    let mut merged = match &self.level.parent {
      Some(parent) => parent.snapshot(),
      None => HashMap::new(),
    };
    for (key, value) in self.level.values.read().iter() {
      merged.insert(key.clone(), value.clone());
    }
    merged.insert(ID_KEY.to_owned(), Value::String(self.level.id.to_string()));
    merged
  }

  /// Reads `key`, expands `${other}` placeholders against the chain and
  /// optionally coerces the result.
  pub fn env(&self, key: &str, coerce_to: Option<Coerce>) -> Result<Option<Value>> {
    let Some(value) = self.get(key) else {
      return Ok(None);
    };
    let value = match value {
      Value::String(text) if text.contains("${") => Value::String(substitute(&text, &self.snapshot())),
      other => other,
    };
    match coerce_to {
      Some(to) => coerce(key, value, to).map(Some),
      None => Ok(Some(value)),
    }
  }
}
