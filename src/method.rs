//! First-class method handles and per-type dispatch tables.
//!
//! Methods are dispatched dynamically: a handle carries the declared
//! parameter kinds, the variadic flag, and the qualified name, and the wire
//! carries only the short name, which the receiving node resolves against
//! the target's [`MethodTable`]. Handles therefore cross a dynamic boundary,
//! and the type is deliberately loose: a handle may be nil, or wrap a value
//! that is not a method at all. Signature verification is the single
//! chokepoint that rejects such handles, and it fails fast: local misuse is
//! a programmer bug and panics with the diagnostic text.

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use thiserror::Error;

use crate::error::StopReason;
use crate::value::{Value, ValueKind};

pub(crate) type InvokeFn = Arc<dyn Fn(&mut dyn Any, Vec<Value>) -> Vec<Value> + Send + Sync>;

/// A user object that can be driven by an actor executor.
pub trait Performer: Any + Send {
  /// The table of methods invokable on this type by name.
  fn methods(&self) -> &'static MethodTable;

  /// Termination hook. Invoked exactly once, on the executor, when the
  /// actor transitions to DEAD. The hook may observe the object's state but
  /// must not attempt further invocations on the actor.
  fn terminate(&mut self, reason: &StopReason);
}

/// Identifies a receiver type at the dynamic boundary.
#[derive(Debug, Clone, Copy)]
pub struct TypeToken {
  id: TypeId,
  name: &'static str,
}

impl TypeToken {
  pub(crate) fn of<T: Any>() -> Self {
    Self {
      id: TypeId::of::<T>(),
      name: type_name::<T>(),
    }
  }
}

impl PartialEq for TypeToken {
  fn eq(&self, other: &TypeToken) -> bool {
    self.id == other.id
  }
}

impl Eq for TypeToken {}

/// A first-class reference to something a caller wants invoked.
#[derive(Clone)]
pub struct Method {
  repr: Repr,
}

#[derive(Clone)]
enum Repr {
  Nil,
  Value(&'static str),
  Func(Arc<MethodSpec>),
}

impl Method {
  /// The nil handle. Always fails signature verification.
  pub fn nil() -> Method {
    Method { repr: Repr::Nil }
  }

  /// Wraps a value that is not a method. Such a handle always fails
  /// signature verification; it exists so dynamically produced handles can
  /// be represented before verification rejects them.
  pub fn value<T: Any>() -> Method {
    Method {
      repr: Repr::Value(type_name::<T>()),
    }
  }

  /// A handle to a free function with no receiver. Free functions cannot be
  /// dispatched on an actor; verification rejects them.
  pub fn function(name: &'static str, params: &'static [ValueKind]) -> Method {
    Method {
      repr: Repr::Func(Arc::new(MethodSpec {
        name,
        type_path: "",
        receiver: None,
        params,
        variadic: false,
        invoke: None,
      })),
    }
  }

  pub(crate) fn from_spec(spec: MethodSpec) -> Method {
    Method {
      repr: Repr::Func(Arc::new(spec)),
    }
  }

  pub(crate) fn spec(&self) -> Option<&MethodSpec> {
    match &self.repr {
      Repr::Func(spec) => Some(&**spec),
      _ => None,
    }
  }

  /// The terminal segment of the qualified name; this is what travels on
  /// the wire. Overloading by short name is not supported.
  pub fn short_name(&self) -> Option<&'static str> {
    self.spec().map(|spec| spec.name)
  }

  /// Fully qualified name, `Type::method`.
  pub fn qualified_name(&self) -> Option<String> {
    self.spec().map(MethodSpec::qualified_name)
  }

  /// Declared parameter kinds, excluding the receiver.
  pub fn params(&self) -> Option<&'static [ValueKind]> {
    self.spec().map(|spec| spec.params)
  }

  /// Whether the final parameter absorbs any number of trailing values.
  pub fn variadic(&self) -> Option<bool> {
    self.spec().map(|spec| spec.variadic)
  }
}

impl fmt::Debug for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &self.repr {
      Repr::Nil => write!(f, "Method(nil)"),
      Repr::Value(ty) => write!(f, "Method(value {ty})"),
      Repr::Func(spec) => write!(f, "Method({})", spec.qualified_name()),
    }
  }
}

pub(crate) struct MethodSpec {
  pub(crate) name: &'static str,
  pub(crate) type_path: &'static str,
  pub(crate) receiver: Option<TypeToken>,
  pub(crate) params: &'static [ValueKind],
  pub(crate) variadic: bool,
  pub(crate) invoke: Option<InvokeFn>,
}

impl MethodSpec {
  fn qualified_name(&self) -> String {
    if self.type_path.is_empty() {
      self.name.to_string()
    } else {
      format!("{}::{}", self.type_path, self.name)
    }
  }
}

/// Name → method map for one user type, built once and shared by every
/// actor of that type. The RPC endpoint resolves wire short names here.
pub struct MethodTable {
  receiver: TypeToken,
  type_path: &'static str,
  methods: HashMap<&'static str, Method>,
}

impl MethodTable {
  /// Starts a table for receiver type `T`. `type_path` becomes the prefix
  /// of every qualified method name.
  pub fn for_type<T: Any>(type_path: &'static str) -> MethodTableBuilder<T> {
    MethodTableBuilder {
      table: MethodTable {
        receiver: TypeToken::of::<T>(),
        type_path,
        methods: HashMap::new(),
      },
      _receiver: PhantomData,
    }
  }

  /// Looks a method up by short name.
  pub fn get(&self, name: &str) -> Option<Method> {
    self.methods.get(name).cloned()
  }

  pub(crate) fn receiver(&self) -> TypeToken {
    self.receiver
  }
}

impl fmt::Debug for MethodTable {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MethodTable")
      .field("type_path", &self.type_path)
      .field("methods", &self.methods.len())
      .finish()
  }
}

pub struct MethodTableBuilder<T> {
  table: MethodTable,
  _receiver: PhantomData<fn(T)>,
}

impl<T: Any> MethodTableBuilder<T> {
  /// Registers a fixed-arity method.
  pub fn method<F>(self, name: &'static str, params: &'static [ValueKind], f: F) -> Self
  where
    F: Fn(&mut T, Vec<Value>) -> Vec<Value> + Send + Sync + 'static,
  {
    self.insert(name, params, false, f)
  }

  /// Registers a variadic method: the last declared kind is the element
  /// kind of the tail.
  pub fn variadic_method<F>(self, name: &'static str, params: &'static [ValueKind], f: F) -> Self
  where
    F: Fn(&mut T, Vec<Value>) -> Vec<Value> + Send + Sync + 'static,
  {
    assert!(!params.is_empty(), "a variadic method declares at least the tail parameter");
    self.insert(name, params, true, f)
  }

  fn insert<F>(mut self, name: &'static str, params: &'static [ValueKind], variadic: bool, f: F) -> Self
  where
    F: Fn(&mut T, Vec<Value>) -> Vec<Value> + Send + Sync + 'static,
  {
    let invoke: InvokeFn = Arc::new(move |receiver: &mut dyn Any, args: Vec<Value>| {
      let receiver = receiver
        .downcast_mut::<T>()
        .expect("receiver type is verified before dispatch");
      f(receiver, args)
    });
    let spec = MethodSpec {
      name,
      type_path: self.table.type_path,
      receiver: Some(self.table.receiver),
      params,
      variadic,
      invoke: Some(invoke),
    };
    let previous = self.table.methods.insert(name, Method::from_spec(spec));
    assert!(previous.is_none(), "method {name:?} registered twice");
    self
  }

  pub fn build(self) -> MethodTable {
    self.table
  }
}

/// A rejected call signature. The diagnostic text is stable: callers match
/// on its prefix.
#[derive(Debug, Error)]
pub enum SignatureError {
  #[error("method handle is nil")]
  NilHandle,

  #[error("handle is not a method (got {0})")]
  NotAMethod(&'static str),

  #[error("method has no receiver ({0})")]
  NoReceiver(&'static str),

  #[error("cannot assign receiver ({actor} to {declared})")]
  ReceiverMismatch {
    actor: &'static str,
    declared: &'static str,
  },

  #[error("not enough arguments (needed {needed}, got {got})")]
  NotEnoughArgs { needed: usize, got: usize },

  #[error("too many arguments for non-variadic method (needed {needed}, got {got})")]
  TooManyArgs { needed: usize, got: usize },

  #[error("cannot assign argument {index} ({got} to {want})")]
  ArgMismatch {
    index: usize,
    got: String,
    want: String,
  },
}

/// Checks that `method` is callable on a receiver of type `actor` with the
/// given argument vector.
///
/// The RPC endpoint uses this directly so a remote caller's bug cannot
/// crash the serving node; the local call path unwraps failures into a
/// panic via [`verify_call_signature`].
pub(crate) fn check_call_signature(
  actor: TypeToken,
  method: &Method,
  args: &[Value],
) -> Result<(), SignatureError> {
  let spec = match &method.repr {
    Repr::Nil => return Err(SignatureError::NilHandle),
    Repr::Value(ty) => return Err(SignatureError::NotAMethod(*ty)),
    Repr::Func(spec) => spec.as_ref(),
  };
  let receiver = spec.receiver.ok_or(SignatureError::NoReceiver(spec.name))?;
  if receiver != actor {
    return Err(SignatureError::ReceiverMismatch {
      actor: actor.name,
      declared: receiver.name,
    });
  }

  let fixed = if spec.variadic { spec.params.len() - 1 } else { spec.params.len() };
  if args.len() < fixed {
    return Err(SignatureError::NotEnoughArgs {
      needed: fixed,
      got: args.len(),
    });
  }
  if !spec.variadic && args.len() > spec.params.len() {
    return Err(SignatureError::TooManyArgs {
      needed: spec.params.len(),
      got: args.len(),
    });
  }

  for (index, (param, arg)) in spec.params.iter().zip(args.iter()).enumerate().take(fixed) {
    if !param.admits(arg) {
      return Err(SignatureError::ArgMismatch {
        index,
        got: arg.describe(),
        want: param.describe(),
      });
    }
  }

  if spec.variadic {
    let tail_kind = spec.params[spec.params.len() - 1];
    let tail = &args[fixed..];
    // A single sequence is accepted as the packed form of the tail.
    let packed = tail.len() == 1 && matches!(tail[0], Value::Seq(_)) && tail_kind != ValueKind::Seq;
    if !packed {
      for (offset, arg) in tail.iter().enumerate() {
        if !tail_kind.admits(arg) {
          return Err(SignatureError::ArgMismatch {
            index: fixed + offset,
            got: arg.describe(),
            want: tail_kind.describe(),
          });
        }
      }
    }
  }

  Ok(())
}

/// Panicking face of [`check_call_signature`], used on the local call path
/// where a bad signature is an unrecoverable programmer bug.
pub(crate) fn verify_call_signature(actor: TypeToken, method: &Method, args: &[Value]) {
  if let Err(e) = check_call_signature(actor, method, args) {
    panic!("{e}");
  }
}
