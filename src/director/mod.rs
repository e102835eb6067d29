//! The per-node registry and remote gateway.
//!
//! A director owns every local actor it registered, allocates their
//! identifiers, and routes each invocation either to the local actor core
//! or to a remote stub backed by a cached RPC client. On construction it
//! also binds the node's inbound RPC endpoint, so the same four operations
//! are reachable from peer nodes.

mod client;
mod remote;
mod server;
mod wire;

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::actor::{self, ActorHandle};
use crate::call::DoneSender;
use crate::director::client::RpcClient;
use crate::director::remote::RemoteActor;
use crate::error::DirectorError;
use crate::method::{Method, Performer};
use crate::value::Value;

/// Location-independent actor identifier: the owning node's listen address
/// plus a serial unique within that node for the director's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pid {
  pub node: String,
  pub serial: u64,
}

impl fmt::Display for Pid {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "<{},{}>", self.node, self.serial)
  }
}

/// The invocation surface shared by local actor cores and remote stubs.
#[async_trait]
pub(crate) trait Addressable: Send + Sync {
  async fn call(&self, method: Method, args: Vec<Value>) -> Result<Vec<Value>, DirectorError>;

  async fn cast(&self, done: Option<DoneSender>, method: Method, args: Vec<Value>);

  async fn call_with_context(
    &self,
    method: Method,
    timeout: Duration,
    args: Vec<Value>,
  ) -> Result<Vec<Value>, DirectorError>;

  async fn stop(&self) -> Result<(), DirectorError>;
}

#[async_trait]
impl Addressable for ActorHandle {
  async fn call(&self, method: Method, args: Vec<Value>) -> Result<Vec<Value>, DirectorError> {
    ActorHandle::call(self, method, args).await
  }

  async fn cast(&self, done: Option<DoneSender>, method: Method, args: Vec<Value>) {
    ActorHandle::cast(self, done, method, args).await;
  }

  async fn call_with_context(
    &self,
    method: Method,
    timeout: Duration,
    args: Vec<Value>,
  ) -> Result<Vec<Value>, DirectorError> {
    ActorHandle::call_with_context(self, method, timeout, args).await
  }

  async fn stop(&self) -> Result<(), DirectorError> {
    ActorHandle::stop(self);
    Ok(())
  }
}

struct Registry {
  actors: HashMap<Pid, ActorHandle>,
  next_serial: u64,
}

pub(crate) struct DirectorInner {
  node: String,
  registry: RwLock<Registry>,
  /// Outbound RPC clients by peer node, dialed lazily with a once-cell per
  /// peer so concurrent dispatches share one dial.
  clients: Mutex<HashMap<String, Arc<OnceCell<Arc<RpcClient>>>>>,
}

/// A handle to one director. Cloneable; all clones share the registry and
/// the connection cache.
#[derive(Clone)]
pub struct Director {
  inner: Arc<DirectorInner>,
}

impl Director {
  /// Constructs a director for `node` (a `host:port` listen address) and
  /// binds its RPC endpoint. Returns once the listener is accepting.
  pub async fn bind(node: impl Into<String>) -> io::Result<Director> {
    let node = node.into();
    let inner = Arc::new(DirectorInner {
      node,
      registry: RwLock::new(Registry {
        actors: HashMap::new(),
        next_serial: 0,
      }),
      clients: Mutex::new(HashMap::new()),
    });
    server::serve(inner.clone()).await?;
    info!(node = %inner.node, "director listening");
    Ok(Director { inner })
  }

  /// The node address identifiers allocated here carry.
  pub fn node(&self) -> &str {
    &self.inner.node
  }

  /// Registers a user object: starts its mailbox and executor, assigns the
  /// next identifier, and records the actor in the registry.
  pub fn register(&self, user: impl Performer) -> Pid {
    self.inner.register(Box::new(user))
  }

  /// Synchronous request against the actor behind `pid`, local or remote.
  pub async fn call(&self, pid: &Pid, method: Method, args: Vec<Value>) -> Result<Vec<Value>, DirectorError> {
    let target = self.inner.resolve(pid).await?;
    target.call(method, args).await
  }

  /// Fire-and-forget request. Resolution failures and remote errors are
  /// swallowed; `done` is consumed either way.
  pub async fn cast(&self, pid: &Pid, done: Option<DoneSender>, method: Method, args: Vec<Value>) {
    match self.inner.resolve(pid).await {
      Ok(target) => target.cast(done, method, args).await,
      Err(_) => debug!(pid = %pid, "cast dropped, actor did not resolve"),
    }
  }

  /// Call racing a deadline; see [`DirectorError::Deadline`].
  pub async fn call_with_context(
    &self,
    pid: &Pid,
    method: Method,
    timeout: Duration,
    args: Vec<Value>,
  ) -> Result<Vec<Value>, DirectorError> {
    let target = self.inner.resolve(pid).await?;
    target.call_with_context(method, timeout, args).await
  }

  /// Stops the actor behind `pid`. Stopping an already-stopped local actor
  /// is a no-op.
  pub async fn stop(&self, pid: &Pid) -> Result<(), DirectorError> {
    let target = self.inner.resolve(pid).await?;
    target.stop().await
  }
}

impl fmt::Debug for Director {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Director").field("node", &self.inner.node).finish_non_exhaustive()
  }
}

impl DirectorInner {
  pub(crate) fn node(&self) -> &str {
    &self.node
  }

  fn register(self: &Arc<Self>, user: Box<dyn Performer>) -> Pid {
    let mut registry = self.registry.write();
    registry.next_serial += 1;
    let pid = Pid {
      node: self.node.clone(),
      serial: registry.next_serial,
    };
    let handle = actor::spawn(user, pid.clone(), Arc::downgrade(self));
    registry.actors.insert(pid.clone(), handle);
    debug!(pid = %pid, "actor registered");
    pid
  }

  /// Routes `pid` to its local actor core or to a remote stub.
  async fn resolve(self: &Arc<Self>, pid: &Pid) -> Result<Arc<dyn Addressable>, DirectorError> {
    if pid.node == self.node {
      let handle = self.local_actor(pid).ok_or(DirectorError::ActorNotFound)?;
      return Ok(Arc::new(handle));
    }
    let client = self.client_for(&pid.node).await?;
    Ok(Arc::new(RemoteActor::new(pid.clone(), client, Arc::downgrade(self))))
  }

  pub(crate) fn local_actor(&self, pid: &Pid) -> Option<ActorHandle> {
    if pid.node != self.node {
      return None;
    }
    self.registry.read().actors.get(pid).cloned()
  }

  /// Removes a terminated actor. Called by the executor through its weak
  /// back handle; a no-op once the actor is already gone.
  pub(crate) fn remove_actor(&self, pid: &Pid) {
    let mut registry = self.registry.write();
    if registry.actors.remove(pid).is_some() {
      debug!(pid = %pid, "actor deregistered");
    }
  }

  /// Returns the cached client for `node`, dialing on first use. A client
  /// observed closed is evicted and redialed once before giving up.
  async fn client_for(&self, node: &str) -> Result<Arc<RpcClient>, DirectorError> {
    for _ in 0..2 {
      let slot = {
        let mut clients = self.clients.lock();
        clients.entry(node.to_string()).or_insert_with(|| Arc::new(OnceCell::new())).clone()
      };
      // The dial runs outside the cache lock; the once-cell deduplicates
      // concurrent dials to the same peer.
      match slot.get_or_try_init(|| RpcClient::connect(node)).await {
        Ok(client) if !client.is_closed() => return Ok(client.clone()),
        Ok(_) => {
          debug!(node, "cached rpc client is closed, redialing");
          self.remove_client(node);
        }
        Err(e) => {
          warn!(node, error = %e, "dialing remote director failed");
          self.remove_client(node);
          return Err(DirectorError::ActorNotFound);
        }
      }
    }
    Err(DirectorError::ActorNotFound)
  }

  /// Evicts the cached client for `node`; the next dispatch redials.
  pub(crate) fn remove_client(&self, node: &str) {
    let mut clients = self.clients.lock();
    if clients.remove(node).is_some() {
      debug!(node, "rpc client evicted from cache");
    }
  }
}

/// Picks a free loopback node address for test isolation by binding
/// `127.0.0.1:0` and releasing the port before returning it.
pub fn free_local_node() -> io::Result<String> {
  let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
  let addr = listener.local_addr()?;
  Ok(format!("127.0.0.1:{}", addr.port()))
}

#[cfg(test)]
mod tests {
  use once_cell::sync::Lazy;

  use super::*;
  use crate::error::StopReason;
  use crate::method::MethodTable;
  use crate::value::ValueKind;

  struct Echo;

  static ECHO_METHODS: Lazy<MethodTable> = Lazy::new(|| {
    MethodTable::for_type::<Echo>("Echo")
      .method("echo", &[ValueKind::Any], |_, args| args)
      .build()
  });

  impl crate::method::Performer for Echo {
    fn methods(&self) -> &'static MethodTable {
      &ECHO_METHODS
    }

    fn terminate(&mut self, _reason: &StopReason) {}
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn identifiers_are_distinct_and_monotonic() {
    let director = Director::bind(free_local_node().unwrap()).await.unwrap();
    let mut serials = std::collections::HashSet::new();
    for _ in 0..32 {
      let pid = director.register(Echo);
      assert_eq!(pid.node, director.node());
      assert!(serials.insert(pid.serial), "serial {} reused", pid.serial);
    }
    assert_eq!(serials.iter().max(), Some(&32));
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn a_self_loop_call_matches_the_in_process_call() {
    let director = Director::bind(free_local_node().unwrap()).await.unwrap();
    let pid = director.register(Echo);
    let echo = ECHO_METHODS.get("echo").unwrap();
    let args = vec![Value::Str("jane".into())];
    let direct = director.call(&pid, echo.clone(), args.clone()).await.unwrap();

    // Loop the same call through this node's own RPC endpoint.
    let client = director.inner.client_for(director.node()).await.unwrap();
    let stub = RemoteActor::new(pid.clone(), client, Arc::downgrade(&director.inner));
    let looped = Addressable::call(&stub, echo, args).await.unwrap();
    assert_eq!(direct, looped);
    director.stop(&pid).await.unwrap();
  }
}
