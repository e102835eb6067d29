//! Bounded-admission mailbox between senders and one actor's executor.
//!
//! A single coordinator task owns an ordered buffer of call records and a
//! soft limit. Below the limit it accepts inbound records while offering the
//! head of the buffer to the executor; at the limit it stops accepting, so
//! senders block on push until the executor drains a record. The small
//! buffer lets a cast return before the executor wakes, which is what makes
//! cast throughput cheap.

use std::collections::VecDeque;

use tokio::sync::mpsc;
use tracing::trace;

use crate::call::ActorCall;

/// Default soft limit on buffered records per actor.
pub const DEFAULT_MAILBOX_LIMIT: usize = 1;

/// Endpoints of a running mailbox. `out_rx` is consumed by exactly one
/// executor; `in_tx` is shared by every sender; `stop_tx` is the idempotent
/// termination signal.
pub(crate) struct Mailbox {
  pub in_tx: mpsc::Sender<ActorCall>,
  pub out_rx: mpsc::Receiver<ActorCall>,
  pub stop_tx: mpsc::Sender<()>,
}

/// Starts the coordinator task and returns its endpoints.
pub(crate) fn spawn(limit: usize) -> Mailbox {
  let (in_tx, in_rx) = mpsc::channel(1);
  let (out_tx, out_rx) = mpsc::channel(1);
  let (stop_tx, stop_rx) = mpsc::channel(1);
  tokio::spawn(coordinate(in_rx, out_tx, stop_rx, limit.max(1)));
  Mailbox { in_tx, out_rx, stop_tx }
}

async fn coordinate(
  mut in_rx: mpsc::Receiver<ActorCall>,
  out_tx: mpsc::Sender<ActorCall>,
  mut stop_rx: mpsc::Receiver<()>,
  limit: usize,
) {
  let mut buffer: VecDeque<ActorCall> = VecDeque::new();

  loop {
    if buffer.is_empty() {
      tokio::select! {
        inbound = in_rx.recv() => match inbound {
          Some(call) => buffer.push_back(call),
          // Every sender is gone; nothing can arrive any more.
          None => break,
        },
        _ = stop_rx.recv() => break,
      }
    } else if buffer.len() < limit {
      tokio::select! {
        inbound = in_rx.recv() => match inbound {
          Some(call) => buffer.push_back(call),
          None => break,
        },
        // reserve() holds no record while pending, so losing the race to
        // another select arm cannot drop a call.
        permit = out_tx.reserve() => match permit {
          Ok(permit) => permit.send(buffer.pop_front().expect("buffer is non-empty")),
          // The executor is gone.
          Err(_) => break,
        },
        _ = stop_rx.recv() => break,
      }
    } else {
      tokio::select! {
        permit = out_tx.reserve() => match permit {
          Ok(permit) => permit.send(buffer.pop_front().expect("buffer is non-empty")),
          Err(_) => break,
        },
        _ = stop_rx.recv() => break,
      }
    }
  }

  // Drain phase. Dropping a record drops its reply sink, which the waiting
  // caller observes as channel-closed-without-value. Closing the in channel
  // first makes later senders observe "closed" instead of parking forever.
  in_rx.close();
  let pending = buffer.len();
  buffer.clear();
  let mut stragglers = 0usize;
  while let Ok(call) = in_rx.try_recv() {
    stragglers += 1;
    drop(call);
  }
  if pending > 0 || stragglers > 0 {
    trace!(pending, stragglers, "mailbox drained on stop");
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use once_cell::sync::Lazy;
  use tokio::sync::oneshot;
  use tokio::time::timeout;

  use super::*;
  use crate::method::MethodTable;
  use crate::value::Value;

  struct Probe;

  static PROBE_METHODS: Lazy<MethodTable> =
    Lazy::new(|| MethodTable::for_type::<Probe>("Probe").method("mark", &[], |_, _| vec![]).build());

  fn record(tag: i64) -> (ActorCall, oneshot::Receiver<Vec<Value>>) {
    let (done_tx, done_rx) = oneshot::channel();
    let call = ActorCall {
      method: PROBE_METHODS.get("mark").unwrap(),
      args: vec![Value::Int(tag)],
      done: Some(done_tx),
    };
    (call, done_rx)
  }

  #[tokio::test]
  async fn hands_records_off_in_fifo_order() {
    let mut mb = spawn(4);
    for tag in 0..4 {
      let (call, _rx) = record(tag);
      mb.in_tx.send(call).await.unwrap();
    }
    for tag in 0..4 {
      let call = mb.out_rx.recv().await.unwrap();
      assert_eq!(call.args, vec![Value::Int(tag)]);
    }
  }

  #[tokio::test]
  async fn push_blocks_at_the_soft_limit_until_one_record_drains() {
    let mut mb = spawn(1);
    // With limit 1 the in and out channels each add one in-flight slot, so
    // three pushes complete without the executor doing anything.
    for tag in 0..3 {
      let (call, _rx) = record(tag);
      timeout(Duration::from_secs(1), mb.in_tx.send(call))
        .await
        .expect("push below the blocking point must not block")
        .unwrap();
    }

    let (blocked, _rx) = record(3);
    let in_tx = mb.in_tx.clone();
    let push = tokio::spawn(async move { in_tx.send(blocked).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!push.is_finished(), "push past the soft limit must block");

    let drained = mb.out_rx.recv().await.unwrap();
    assert_eq!(drained.args, vec![Value::Int(0)]);
    timeout(Duration::from_secs(1), push)
      .await
      .expect("draining one record must unblock the pending push")
      .unwrap()
      .unwrap();
  }

  #[tokio::test]
  async fn stop_drains_and_closes_every_reply_sink() {
    let mut mb = spawn(1);
    let mut waiters = Vec::new();
    for tag in 0..3 {
      let (call, rx) = record(tag);
      mb.in_tx.send(call).await.unwrap();
      waiters.push(rx);
    }

    mb.stop_tx.send(()).await.unwrap();
    // The head record was already handed off before the stop; it belongs to
    // the executor, which a termination would drop unprocessed.
    let handed_off = mb.out_rx.recv().await.unwrap();
    assert_eq!(handed_off.args, vec![Value::Int(0)]);
    drop(handed_off);
    assert!(mb.out_rx.recv().await.is_none());

    for rx in waiters {
      timeout(Duration::from_secs(1), rx)
        .await
        .expect("drained sinks must close promptly")
        .expect_err("a drained sink closes without a value");
    }

    // Later senders observe the closed channel instead of blocking.
    let (late, late_rx) = record(9);
    assert!(mb.in_tx.send(late).await.is_err());
    late_rx.await.expect_err("unadmitted records close their sink");
  }

  #[tokio::test]
  async fn stop_is_observed_while_idle() {
    let mut mb = spawn(1);
    mb.stop_tx.send(()).await.unwrap();
    assert!(timeout(Duration::from_secs(1), mb.out_rx.recv()).await.unwrap().is_none());
  }
}
