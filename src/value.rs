//! Dynamic argument and result values.
//!
//! Everything that flows through a mailbox or across the wire is a sequence
//! of [`Value`]s. The encoding is self-describing: each variant tags itself,
//! and [`Value::Named`] payloads additionally carry a registered type name,
//! so a peer can decode an argument vector without compile-time knowledge of
//! the caller's types.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::director::Pid;

/// Names of payload types allowed inside [`Value::Named`].
static NAMED_TYPES: Lazy<RwLock<HashSet<&'static str>>> = Lazy::new(|| RwLock::new(HashSet::new()));

/// Registers `name` as a payload type for [`Value::named`].
///
/// Non-primitive arguments and results must be registered, under the same
/// name, by every process that sends or receives them. Identifiers are part
/// of the value model itself and need no registration.
pub fn register_type(name: &'static str) {
  NAMED_TYPES.write().insert(name);
}

pub(crate) fn type_registered(name: &str) -> bool {
  NAMED_TYPES.read().contains(name)
}

/// Returns the name of the first unregistered named payload in `values`,
/// descending into sequences.
pub(crate) fn first_unregistered(values: &[Value]) -> Option<String> {
  for value in values {
    match value {
      Value::Named { type_name, .. } if !type_registered(type_name) => {
        return Some(type_name.clone());
      }
      Value::Seq(items) => {
        if let Some(name) = first_unregistered(items) {
          return Some(name);
        }
      }
      _ => {}
    }
  }
  None
}

/// A single dynamic argument or result value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Value {
  Null,
  Bool(bool),
  Int(i64),
  Float(f64),
  Str(String),
  Seq(Vec<Value>),
  Pid(Pid),
  /// A registered payload type, carried as self-describing JSON.
  Named {
    type_name: String,
    data: serde_json::Value,
  },
  /// Deadline token for call-with-deadline dispatch. Always reconstructed on
  /// the owning node; never encoded.
  #[serde(skip)]
  Context(CallContext),
}

impl Value {
  /// Wraps a registered payload type.
  ///
  /// Panics if `type_name` was never passed to [`register_type`]: an
  /// unregistered payload is a programmer bug that would otherwise only
  /// surface on the decoding side of a remote call.
  pub fn named<T: Serialize>(type_name: &'static str, data: &T) -> Value {
    if !type_registered(type_name) {
      panic!("type {type_name:?} used as a named value but never registered; call register_type first");
    }
    let data = serde_json::to_value(data)
      .unwrap_or_else(|e| panic!("named value of type {type_name:?} does not serialize: {e}"));
    Value::Named {
      type_name: type_name.to_string(),
      data,
    }
  }

  /// Decodes a [`Value::Named`] payload back into `T`.
  pub fn decode<T: DeserializeOwned>(&self) -> Option<T> {
    match self {
      Value::Named { data, .. } => serde_json::from_value(data.clone()).ok(),
      _ => None,
    }
  }

  pub fn as_bool(&self) -> Option<bool> {
    match self {
      Value::Bool(b) => Some(*b),
      _ => None,
    }
  }

  pub fn as_int(&self) -> Option<i64> {
    match self {
      Value::Int(n) => Some(*n),
      _ => None,
    }
  }

  pub fn as_float(&self) -> Option<f64> {
    match self {
      Value::Float(x) => Some(*x),
      _ => None,
    }
  }

  pub fn as_str(&self) -> Option<&str> {
    match self {
      Value::Str(s) => Some(s),
      _ => None,
    }
  }

  pub fn as_seq(&self) -> Option<&[Value]> {
    match self {
      Value::Seq(items) => Some(items),
      _ => None,
    }
  }

  pub fn as_pid(&self) -> Option<&Pid> {
    match self {
      Value::Pid(pid) => Some(pid),
      _ => None,
    }
  }

  pub fn as_context(&self) -> Option<&CallContext> {
    match self {
      Value::Context(ctx) => Some(ctx),
      _ => None,
    }
  }

  /// Short description of the value's kind, for diagnostics.
  pub fn describe(&self) -> String {
    match self {
      Value::Null => "null".to_string(),
      Value::Bool(_) => "bool".to_string(),
      Value::Int(_) => "int".to_string(),
      Value::Float(_) => "float".to_string(),
      Value::Str(_) => "str".to_string(),
      Value::Seq(_) => "seq".to_string(),
      Value::Pid(_) => "pid".to_string(),
      Value::Named { type_name, .. } => format!("named<{type_name}>"),
      Value::Context(_) => "context".to_string(),
    }
  }
}

impl PartialEq for Value {
  fn eq(&self, other: &Value) -> bool {
    match (self, other) {
      (Value::Null, Value::Null) => true,
      (Value::Bool(a), Value::Bool(b)) => a == b,
      (Value::Int(a), Value::Int(b)) => a == b,
      (Value::Float(a), Value::Float(b)) => a == b,
      (Value::Str(a), Value::Str(b)) => a == b,
      (Value::Seq(a), Value::Seq(b)) => a == b,
      (Value::Pid(a), Value::Pid(b)) => a == b,
      (
        Value::Named { type_name: an, data: ad },
        Value::Named { type_name: bn, data: bd },
      ) => an == bn && ad == bd,
      // Deadline tokens are identities, not data.
      _ => false,
    }
  }
}

/// The verification-level type tag for declared method parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
  /// Accepts any value.
  Any,
  Null,
  Bool,
  Int,
  Float,
  Str,
  Seq,
  Pid,
  /// A registered payload type with the given name.
  Named(&'static str),
  /// The deadline token prepended by call-with-deadline dispatch.
  Context,
}

impl ValueKind {
  /// Whether `value` is assignable to a parameter declared with this kind.
  pub(crate) fn admits(&self, value: &Value) -> bool {
    match (self, value) {
      (ValueKind::Any, _) => true,
      (ValueKind::Null, Value::Null) => true,
      (ValueKind::Bool, Value::Bool(_)) => true,
      (ValueKind::Int, Value::Int(_)) => true,
      (ValueKind::Float, Value::Float(_)) => true,
      (ValueKind::Str, Value::Str(_)) => true,
      (ValueKind::Seq, Value::Seq(_)) => true,
      (ValueKind::Pid, Value::Pid(_)) => true,
      (ValueKind::Named(want), Value::Named { type_name, .. }) => want == type_name,
      (ValueKind::Context, Value::Context(_)) => true,
      _ => false,
    }
  }

  pub(crate) fn describe(&self) -> String {
    match self {
      ValueKind::Any => "any".to_string(),
      ValueKind::Null => "null".to_string(),
      ValueKind::Bool => "bool".to_string(),
      ValueKind::Int => "int".to_string(),
      ValueKind::Float => "float".to_string(),
      ValueKind::Str => "str".to_string(),
      ValueKind::Seq => "seq".to_string(),
      ValueKind::Pid => "pid".to_string(),
      ValueKind::Named(name) => format!("named<{name}>"),
      ValueKind::Context => "context".to_string(),
    }
  }
}

/// Deadline handed to a method dispatched through call-with-deadline.
///
/// The runtime only unblocks the caller when the deadline elapses; a
/// long-running method must poll [`CallContext::expired`] itself if it wants
/// to stop early.
#[derive(Debug, Clone)]
pub struct CallContext {
  deadline: Instant,
}

impl CallContext {
  pub(crate) fn with_timeout(timeout: Duration) -> Self {
    Self {
      deadline: Instant::now() + timeout,
    }
  }

  pub fn deadline(&self) -> Instant {
    self.deadline
  }

  /// Time left before the deadline, zero once it has passed.
  pub fn remaining(&self) -> Duration {
    self.deadline.saturating_duration_since(Instant::now())
  }

  pub fn expired(&self) -> bool {
    Instant::now() >= self.deadline
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn kinds_admit_matching_values() {
    assert!(ValueKind::Int.admits(&Value::Int(4)));
    assert!(!ValueKind::Int.admits(&Value::Str("4".into())));
    assert!(ValueKind::Any.admits(&Value::Null));
    assert!(ValueKind::Seq.admits(&Value::Seq(vec![Value::Int(1)])));
  }

  #[test]
  fn named_values_require_registration() {
    register_type("test.Registered");
    let v = Value::named("test.Registered", &vec![1, 2, 3]);
    assert!(ValueKind::Named("test.Registered").admits(&v));
    assert!(!ValueKind::Named("test.Other").admits(&v));
    assert_eq!(v.decode::<Vec<i32>>(), Some(vec![1, 2, 3]));
  }

  #[test]
  #[should_panic(expected = "never registered")]
  fn unregistered_named_value_panics() {
    let _ = Value::named("test.NeverRegistered", &7);
  }

  #[test]
  fn wire_roundtrip_is_lossless() {
    let values = vec![
      Value::Null,
      Value::Bool(true),
      Value::Int(-3),
      Value::Float(1.5),
      Value::Str("jane".into()),
      Value::Seq(vec![Value::Int(1), Value::Int(2)]),
      Value::Pid(Pid { node: "127.0.0.1:9000".into(), serial: 7 }),
    ];
    let encoded = serde_json::to_vec(&values).unwrap();
    let decoded: Vec<Value> = serde_json::from_slice(&encoded).unwrap();
    assert_eq!(values, decoded);
  }

  #[test]
  fn context_reports_expiry() {
    let ctx = CallContext::with_timeout(Duration::from_secs(60));
    assert!(!ctx.expired());
    assert!(ctx.remaining() > Duration::from_secs(59));
    let past = CallContext::with_timeout(Duration::ZERO);
    assert!(past.expired());
    assert_eq!(past.remaining(), Duration::ZERO);
  }
}
