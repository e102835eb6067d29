//! Outbound RPC client for one peer node.
//!
//! A client owns one TCP connection, split into a writer task fed by a
//! channel and a reader task that matches response frames to pending
//! requests by correlation id. When the connection dies the reader drains
//! the pending map, which closes every waiter's reply channel; the client
//! is then permanently closed and the director's cache evicts it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, trace, warn};

use crate::director::wire::{RemoteOp, RemoteRequest, RemoteResponse, WireCodec, IO_TIMEOUT};
use crate::director::Pid;
use crate::error::WireError;
use crate::value::Value;

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<RemoteResponse>>>>;

pub(crate) struct RpcClient {
  peer: String,
  next_id: AtomicU64,
  pending: Pending,
  write_tx: mpsc::Sender<RemoteRequest>,
  closed: Arc<AtomicBool>,
}

impl RpcClient {
  /// Dials `peer` and starts the connection's reader and writer tasks.
  pub(crate) async fn connect(peer: &str) -> Result<Arc<RpcClient>, WireError> {
    let stream = timeout(IO_TIMEOUT, TcpStream::connect(peer))
      .await
      .map_err(|_| WireError::Timeout)??;
    let framed = Framed::new(stream, WireCodec::<RemoteRequest, RemoteResponse>::new());
    let (mut sink, mut frames) = framed.split();

    let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
    let closed = Arc::new(AtomicBool::new(false));
    let (write_tx, mut write_rx) = mpsc::channel::<RemoteRequest>(16);

    let writer_closed = closed.clone();
    let writer_peer = peer.to_string();
    tokio::spawn(async move {
      while let Some(request) = write_rx.recv().await {
        let sent = match timeout(IO_TIMEOUT, sink.send(request)).await {
          Ok(result) => result,
          Err(_) => Err(WireError::Timeout),
        };
        if let Err(e) = sent {
          debug!(peer = %writer_peer, error = %e, "rpc write failed, closing client");
          writer_closed.store(true, Ordering::Release);
          break;
        }
      }
    });

    let reader_pending = pending.clone();
    let reader_closed = closed.clone();
    let reader_peer = peer.to_string();
    tokio::spawn(async move {
      while let Some(frame) = frames.next().await {
        match frame {
          Ok(response) => {
            let waiter = reader_pending.lock().remove(&response.id);
            match waiter {
              Some(waiter) => {
                let _ = waiter.send(response);
              }
              None => trace!(peer = %reader_peer, id = response.id, "response with no waiter"),
            }
          }
          Err(e) => {
            debug!(peer = %reader_peer, error = %e, "rpc read failed, closing client");
            break;
          }
        }
      }
      reader_closed.store(true, Ordering::Release);
      // Dropping the waiters closes their channels; blocked callers observe
      // the shutdown instead of hanging.
      let abandoned = {
        let mut pending = reader_pending.lock();
        std::mem::take(&mut *pending)
      };
      if !abandoned.is_empty() {
        warn!(peer = %reader_peer, count = abandoned.len(), "connection died with calls in flight");
      }
    });

    debug!(peer, "rpc client connected");
    Ok(Arc::new(RpcClient {
      peer: peer.to_string(),
      next_id: AtomicU64::new(1),
      pending,
      write_tx,
      closed,
    }))
  }

  pub(crate) fn is_closed(&self) -> bool {
    self.closed.load(Ordering::Acquire)
  }

  /// Correlated round trip. Errors are shutdown-style: the caller should
  /// treat the peer as unreachable and let the cache evict this client.
  pub(crate) async fn request(
    &self,
    op: RemoteOp,
    pid: &Pid,
    method: &str,
    args: Vec<Value>,
    timeout_text: String,
  ) -> Result<RemoteResponse, WireError> {
    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    let (reply_tx, reply_rx) = oneshot::channel();
    self.pending.lock().insert(id, reply_tx);
    if self.is_closed() {
      // The reader may have drained the pending map before our insert; an
      // entry registered after that point would never be resolved.
      self.pending.lock().remove(&id);
      return Err(WireError::ConnectionClosed);
    }

    let request = RemoteRequest {
      id,
      op,
      pid: pid.clone(),
      method: method.to_string(),
      args,
      timeout: timeout_text,
    };
    if self.write_tx.send(request).await.is_err() {
      self.pending.lock().remove(&id);
      return Err(WireError::ConnectionClosed);
    }

    match reply_rx.await {
      Ok(response) => Ok(response),
      Err(_) => Err(WireError::ConnectionClosed),
    }
  }

  /// One-way request: fired at the peer without registering a waiter. Any
  /// remote outcome is lost, which is the cast contract.
  pub(crate) async fn notify(&self, op: RemoteOp, pid: &Pid, method: &str, args: Vec<Value>) {
    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    let request = RemoteRequest {
      id,
      op,
      pid: pid.clone(),
      method: method.to_string(),
      args,
      timeout: String::new(),
    };
    if self.write_tx.send(request).await.is_err() {
      trace!(peer = %self.peer, "cast dropped, rpc client closed");
    }
  }

  pub(crate) fn peer(&self) -> &str {
    &self.peer
  }
}
