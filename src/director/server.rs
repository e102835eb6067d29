//! Inbound RPC endpoint.
//!
//! The director binds one TCP listener for the life of the node. Each
//! connection gets a reader loop and a writer task; every request is
//! dispatched on its own task so a slow call cannot head-of-line block the
//! connection. Reads and writes are bounded by [`IO_TIMEOUT`], so idle
//! peers are shed and a stuck peer cannot pin a writer.

use std::io;
use std::sync::{Arc, Weak};

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::director::wire::{
  parse_duration, RemoteOp, RemoteRequest, RemoteResponse, WireCodec, IO_TIMEOUT,
};
use crate::director::DirectorInner;
use crate::error::DirectorError;
use crate::method::check_call_signature;
use crate::value::{first_unregistered, CallContext, Value};

type ServerFrames = Framed<TcpStream, WireCodec<RemoteResponse, RemoteRequest>>;

/// Binds the node's listener and spawns the accept loop. Returns once the
/// listener is accepting, so a registration racing construction cannot beat
/// the endpoint.
pub(crate) async fn serve(inner: Arc<DirectorInner>) -> io::Result<()> {
  let port = listen_port(inner.node())?;
  let listener = TcpListener::bind(("0.0.0.0", port)).await?;
  info!(node = %inner.node(), port, "rpc endpoint bound");
  tokio::spawn(accept_loop(listener, Arc::downgrade(&inner)));
  Ok(())
}

fn listen_port(node: &str) -> io::Result<u16> {
  let (_, port) = node
    .rsplit_once(':')
    .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, format!("node address {node:?} has no port")))?;
  port
    .parse()
    .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, format!("node address {node:?} has a bad port")))
}

async fn accept_loop(listener: TcpListener, inner: Weak<DirectorInner>) {
  loop {
    match listener.accept().await {
      Ok((stream, peer)) => {
        let Some(inner) = inner.upgrade() else {
          debug!("director gone, rpc endpoint shutting down");
          break;
        };
        debug!(%peer, "inbound rpc connection");
        tokio::spawn(handle_connection(stream, inner));
      }
      Err(e) => {
        warn!(error = %e, "accept failed");
      }
    }
  }
}

async fn handle_connection(stream: TcpStream, inner: Arc<DirectorInner>) {
  let framed: ServerFrames = Framed::new(stream, WireCodec::new());
  let (sink, mut frames) = framed.split();

  let (response_tx, response_rx) = mpsc::channel::<RemoteResponse>(16);
  tokio::spawn(write_loop(sink, response_rx));

  loop {
    let request = match timeout(IO_TIMEOUT, frames.next()).await {
      Err(_) => {
        debug!("rpc connection idle past the read timeout, closing");
        break;
      }
      Ok(None) => break,
      Ok(Some(Err(e))) => {
        warn!(error = %e, "rpc connection broke, closing");
        break;
      }
      Ok(Some(Ok(request))) => request,
    };

    // Casts are admitted inline so one sender's casts keep their issue
    // order relative to each other and to its later calls; admission
    // back-pressure propagates onto the connection. Everything else runs on
    // its own task so a slow call cannot block the reader.
    if request.op == RemoteOp::Cast {
      dispatch_request(inner.clone(), request).await;
      continue;
    }
    let inner = inner.clone();
    let response_tx = response_tx.clone();
    tokio::spawn(async move {
      if let Some(response) = dispatch_request(inner, request).await {
        let _ = response_tx.send(response).await;
      }
    });
  }
}

async fn write_loop(
  mut sink: SplitSink<ServerFrames, RemoteResponse>,
  mut response_rx: mpsc::Receiver<RemoteResponse>,
) {
  while let Some(response) = response_rx.recv().await {
    let sent = match timeout(IO_TIMEOUT, sink.send(response)).await {
      Ok(result) => result.map_err(|e| e.to_string()),
      Err(_) => Err("write timed out".to_string()),
    };
    if let Err(e) = sent {
      debug!(error = %e, "rpc response write failed, closing connection");
      break;
    }
  }
}

/// Resolves and executes one request. Returns `None` when no response frame
/// is owed (casts, whose remote outcome is lost by design).
async fn dispatch_request(inner: Arc<DirectorInner>, request: RemoteRequest) -> Option<RemoteResponse> {
  let RemoteRequest { id, op, pid, method, mut args, timeout: timeout_text } = request;
  let respond = |err: Option<DirectorError>, ret: Vec<Value>| Some(RemoteResponse { id, err, ret });
  let fail = |err: DirectorError| match op {
    RemoteOp::Cast => None,
    _ => Some(RemoteResponse { id, err: Some(err), ret: Vec::new() }),
  };

  let Some(handle) = inner.local_actor(&pid) else {
    return fail(DirectorError::ActorNotFound);
  };

  if op == RemoteOp::Stop {
    handle.stop();
    return respond(None, Vec::new());
  }

  let Some(method) = handle.table().get(&method) else {
    return fail(DirectorError::MethodNotFound);
  };

  // A remote caller's bugs must not crash this node: the checks that panic
  // on the local path are answered with a diagnostic here.
  if let Some(type_name) = first_unregistered(&args) {
    return fail(DirectorError::Panic(format!(
      "bad call signature: argument of unregistered type {type_name:?}"
    )));
  }

  let deadline = if op == RemoteOp::CallWithContext {
    match parse_duration(&timeout_text) {
      Ok(duration) => {
        args.insert(0, Value::Context(CallContext::with_timeout(duration)));
        Some(duration)
      }
      Err(e) => return fail(DirectorError::Panic(format!("bad call deadline: {e}"))),
    }
  } else {
    None
  };

  if let Err(e) = check_call_signature(handle.table().receiver(), &method, &args) {
    return fail(DirectorError::Panic(format!("bad call signature: {e}")));
  }

  match op {
    RemoteOp::Call => match handle.call(method, args).await {
      Ok(ret) => respond(None, ret),
      Err(e) => respond(Some(e), Vec::new()),
    },
    RemoteOp::CallWithContext => {
      let duration = deadline.expect("deadline parsed above");
      let call = handle.call(method, args);
      tokio::pin!(call);
      let raced = tokio::select! {
        ret = &mut call => ret,
        _ = tokio::time::sleep(duration) => Err(DirectorError::Deadline),
      };
      match raced {
        Ok(ret) => respond(None, ret),
        Err(e) => respond(Some(e), Vec::new()),
      }
    }
    RemoteOp::Cast => {
      handle.cast(None, method, args).await;
      None
    }
    RemoteOp::Stop => unreachable!("handled above"),
  }
}
