//! Remote stub: the local invocation surface backed by a peer node.
//!
//! Each operation becomes one request on the owning node's cached RPC
//! client. Method identity travels by short name, so overloading across
//! types is resolved by the remote table, and overloads within a type by
//! distinct short name are unsupported. A transport or shutdown failure
//! collapses to `ActorNotFound` (the caller cannot distinguish a dead
//! actor from a dead link, and the remedy is the same) and evicts the
//! cached client so the next dispatch redials.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{trace, warn};

use crate::call::DoneSender;
use crate::director::client::RpcClient;
use crate::director::wire::{format_duration, RemoteOp, RemoteResponse};
use crate::director::{Addressable, DirectorInner, Pid};
use crate::error::DirectorError;
use crate::method::Method;
use crate::value::{first_unregistered, Value};

pub(crate) struct RemoteActor {
  pid: Pid,
  client: Arc<RpcClient>,
  director: Weak<DirectorInner>,
}

impl RemoteActor {
  pub(crate) fn new(pid: Pid, client: Arc<RpcClient>, director: Weak<DirectorInner>) -> Self {
    Self { pid, client, director }
  }

  fn short_name(method: &Method) -> &'static str {
    method
      .short_name()
      .expect("remote dispatch requires a method handle with a name")
  }

  async fn round_trip(
    &self,
    op: RemoteOp,
    method: &str,
    args: Vec<Value>,
    timeout_text: String,
  ) -> Result<RemoteResponse, DirectorError> {
    match self.client.request(op, &self.pid, method, args, timeout_text).await {
      Ok(response) => {
        if let Some(type_name) = first_unregistered(&response.ret) {
          panic!("result of unregistered type {type_name:?}; call register_type first");
        }
        Ok(response)
      }
      Err(e) => {
        warn!(pid = %self.pid, error = %e, "remote call failed, evicting cached client");
        if let Some(director) = self.director.upgrade() {
          director.remove_client(self.client.peer());
        }
        Err(DirectorError::ActorNotFound)
      }
    }
  }
}

#[async_trait]
impl Addressable for RemoteActor {
  async fn call(&self, method: Method, args: Vec<Value>) -> Result<Vec<Value>, DirectorError> {
    let name = Self::short_name(&method);
    let response = self.round_trip(RemoteOp::Call, name, args, String::new()).await?;
    match response.err {
      Some(err) => Err(err),
      None => Ok(response.ret),
    }
  }

  async fn cast(&self, done: Option<DoneSender>, method: Method, args: Vec<Value>) {
    let name = Self::short_name(&method);
    self.client.notify(RemoteOp::Cast, &self.pid, name, args).await;
    // A cast's remote outcome is lost; dropping the done-channel here keeps
    // the sender's wait bounded.
    if done.is_some() {
      trace!(pid = %self.pid, method = name, "done-channel dropped on remote cast");
    }
  }

  async fn call_with_context(
    &self,
    method: Method,
    timeout: Duration,
    args: Vec<Value>,
  ) -> Result<Vec<Value>, DirectorError> {
    let name = Self::short_name(&method);
    let round_trip = self.round_trip(
      RemoteOp::CallWithContext,
      name,
      args,
      format_duration(timeout),
    );
    tokio::pin!(round_trip);
    // The deadline also runs here: if the remote side finishes late, the
    // caller has already moved on and the result is discarded.
    let raced = tokio::select! {
      response = &mut round_trip => response,
      _ = tokio::time::sleep(timeout) => Err(DirectorError::Deadline),
    };
    match raced? {
      RemoteResponse { err: Some(err), .. } => Err(err),
      RemoteResponse { err: None, ret, .. } => Ok(ret),
    }
  }

  async fn stop(&self) -> Result<(), DirectorError> {
    let response = self.round_trip(RemoteOp::Stop, "", Vec::new(), String::new()).await?;
    match response.err {
      Some(err) => Err(err),
      None => Ok(()),
    }
  }
}
