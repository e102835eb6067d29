//! troupe: an in-process actor runtime with transparent remote dispatch.
//!
//! User-defined stateful objects (actors) run under a single-owner executor
//! that serializes every interaction with their private state. Each actor is
//! addressed by a location-independent [`Pid`] and offers four operations:
//! synchronous [`call`], fire-and-forget [`cast`], deadline-bounded
//! [`call_with_context`], and [`stop`]. A per-node [`Director`] allocates
//! identifiers, keeps the registry, and serves the same operations to peer
//! nodes over a length-delimited TCP protocol, so a caller never needs to
//! know where an actor lives.
//!
//! ```no_run
//! use once_cell::sync::Lazy;
//! use troupe::{Director, MethodTable, Performer, StopReason, Value, ValueKind};
//!
//! struct Phonebook {
//!   book: std::collections::HashMap<String, i64>,
//! }
//!
//! static PHONEBOOK_METHODS: Lazy<MethodTable> = Lazy::new(|| {
//!   MethodTable::for_type::<Phonebook>("Phonebook")
//!     .method("add", &[ValueKind::Str, ValueKind::Int], |b, args| {
//!       let name = args[0].as_str().unwrap().to_string();
//!       b.book.insert(name, args[1].as_int().unwrap());
//!       vec![]
//!     })
//!     .method("lookup", &[ValueKind::Str], |b, args| {
//!       match b.book.get(args[0].as_str().unwrap()) {
//!         Some(n) => vec![Value::Int(*n), Value::Bool(true)],
//!         None => vec![Value::Int(0), Value::Bool(false)],
//!       }
//!     })
//!     .build()
//! });
//!
//! impl Performer for Phonebook {
//!   fn methods(&self) -> &'static MethodTable {
//!     &PHONEBOOK_METHODS
//!   }
//!   fn terminate(&mut self, reason: &StopReason) {
//!     println!("phonebook terminated: {reason}");
//!   }
//! }
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let director = Director::bind("127.0.0.1:9000").await?;
//! let pid = director.register(Phonebook { book: Default::default() });
//! let add = PHONEBOOK_METHODS.get("add").unwrap();
//! director.cast(&pid, None, add, vec![Value::Str("jane".into()), Value::Int(1234)]).await;
//! let lookup = PHONEBOOK_METHODS.get("lookup").unwrap();
//! let ret = director.call(&pid, lookup, vec![Value::Str("jane".into())]).await?;
//! assert_eq!(ret, vec![Value::Int(1234), Value::Bool(true)]);
//! # Ok(())
//! # }
//! ```

mod actor;
mod call;
mod director;
mod error;
mod mailbox;
mod method;
mod value;

use std::io;
use std::time::Duration;

use once_cell::sync::OnceCell;
use tracing::warn;

pub use call::{done_channel, DoneReceiver, DoneSender};
pub use director::{free_local_node, Director, Pid};
pub use error::{DirectorError, PanicCause, StopReason};
pub use mailbox::DEFAULT_MAILBOX_LIMIT;
pub use method::{Method, MethodTable, MethodTableBuilder, Performer};
pub use value::{register_type, CallContext, Value, ValueKind};

/// The process-default director installed by [`init`].
static DEFAULT_DIRECTOR: OnceCell<Director> = OnceCell::new();

/// Installs the process-default director on `node` and binds its endpoint.
///
/// The first call wins; later calls are a no-op with a warning. Use
/// [`Director::bind`] directly to run several runtimes in one process.
pub async fn init(node: impl Into<String>) -> io::Result<()> {
  let node = node.into();
  if DEFAULT_DIRECTOR.get().is_some() {
    warn!(node = %node, "default director already initialized, ignoring init");
    return Ok(());
  }
  let director = Director::bind(node).await?;
  if DEFAULT_DIRECTOR.set(director).is_err() {
    warn!("default director already initialized, ignoring init");
  }
  Ok(())
}

fn default_director() -> &'static Director {
  DEFAULT_DIRECTOR
    .get()
    .expect("default director not initialized; call troupe::init first")
}

/// Registers `user` with the process-default director. See
/// [`Director::register`].
pub fn register(user: impl Performer) -> Pid {
  default_director().register(user)
}

/// Synchronous request through the process-default director. See
/// [`Director::call`].
pub async fn call(pid: &Pid, method: Method, args: Vec<Value>) -> Result<Vec<Value>, DirectorError> {
  default_director().call(pid, method, args).await
}

/// Fire-and-forget request through the process-default director. See
/// [`Director::cast`].
pub async fn cast(pid: &Pid, done: Option<DoneSender>, method: Method, args: Vec<Value>) {
  default_director().cast(pid, done, method, args).await;
}

/// Deadline-bounded call through the process-default director. See
/// [`Director::call_with_context`].
pub async fn call_with_context(
  pid: &Pid,
  method: Method,
  timeout: Duration,
  args: Vec<Value>,
) -> Result<Vec<Value>, DirectorError> {
  default_director().call_with_context(pid, method, timeout, args).await
}

/// Stops an actor through the process-default director. See
/// [`Director::stop`].
pub async fn stop(pid: &Pid) -> Result<(), DirectorError> {
  default_director().stop(pid).await
}
