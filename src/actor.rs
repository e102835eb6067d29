//! The actor core: one user object, one executor, one mailbox.
//!
//! While an actor is ALIVE the executor task is the sole owner of the user
//! object; ownership moves into the task at spawn, so nothing else can touch
//! the state. External control (call, cast, stop) goes through a cloneable
//! [`ActorHandle`] that only holds channels and the aliveness flag.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tracing::{debug, error, trace};

use crate::call::{ActorCall, DoneSender};
use crate::director::{DirectorInner, Pid};
use crate::error::{DirectorError, PanicCause, StopReason};
use crate::mailbox::{self, DEFAULT_MAILBOX_LIMIT};
use crate::method::{verify_call_signature, Method, MethodTable};
use crate::value::{CallContext, Value};

/// Handle to a running actor. Cloneable; every clone addresses the same
/// mailbox and aliveness state.
#[derive(Clone)]
pub(crate) struct ActorHandle {
  pid: Pid,
  table: &'static MethodTable,
  in_tx: mpsc::Sender<ActorCall>,
  shutdown_tx: mpsc::Sender<()>,
  alive: Arc<Mutex<bool>>,
}

/// Everything the executor needs to run the termination sequence.
struct Lifecycle {
  pid: Pid,
  director: Weak<DirectorInner>,
  alive: Arc<Mutex<bool>>,
  mailbox_stop: mpsc::Sender<()>,
}

/// Starts the mailbox coordinator and the executor for `user` and returns
/// the external handle. The actor is ALIVE once this returns.
pub(crate) fn spawn(
  user: Box<dyn crate::method::Performer>,
  pid: Pid,
  director: Weak<DirectorInner>,
) -> ActorHandle {
  let table = user.methods();
  let mb = mailbox::spawn(DEFAULT_MAILBOX_LIMIT);
  let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
  let alive = Arc::new(Mutex::new(true));

  let lifecycle = Lifecycle {
    pid: pid.clone(),
    director,
    alive: alive.clone(),
    mailbox_stop: mb.stop_tx,
  };
  tokio::spawn(run_executor(user, mb.out_rx, shutdown_rx, lifecycle));

  ActorHandle {
    pid,
    table,
    in_tx: mb.in_tx,
    shutdown_tx,
    alive,
  }
}

impl ActorHandle {
  pub(crate) fn table(&self) -> &'static MethodTable {
    self.table
  }

  /// Synchronous request: enqueues the call and blocks the caller on its
  /// reply channel.
  pub(crate) async fn call(&self, method: Method, args: Vec<Value>) -> Result<Vec<Value>, DirectorError> {
    if !*self.alive.lock() {
      return Err(DirectorError::ActorStop);
    }
    let (done_tx, done_rx) = oneshot::channel();
    self.enqueue(Some(done_tx), method, args).await;
    match done_rx.await {
      Ok(ret) => Ok(ret),
      Err(_) => Err(DirectorError::ActorDied),
    }
  }

  /// Call racing a deadline. The deadline token is prepended as the leading
  /// argument; on expiry the caller is unblocked with
  /// [`DirectorError::Deadline`] and the in-flight result is discarded.
  pub(crate) async fn call_with_context(
    &self,
    method: Method,
    timeout: Duration,
    mut args: Vec<Value>,
  ) -> Result<Vec<Value>, DirectorError> {
    let ctx = CallContext::with_timeout(timeout);
    args.insert(0, Value::Context(ctx));
    let call = self.call(method, args);
    tokio::pin!(call);
    tokio::select! {
      ret = &mut call => ret,
      _ = tokio::time::sleep(timeout) => Err(DirectorError::Deadline),
    }
  }

  /// Fire-and-forget: enqueues the call and returns once it is admitted.
  /// Silently dropped if the actor is stopped; dropping `done` then closes
  /// the sender's channel.
  pub(crate) async fn cast(&self, done: Option<DoneSender>, method: Method, args: Vec<Value>) {
    if !*self.alive.lock() {
      return;
    }
    self.enqueue(done, method, args).await;
  }

  async fn enqueue(&self, done: Option<DoneSender>, method: Method, args: Vec<Value>) {
    verify_call_signature(self.table.receiver(), &method, &args);
    let call = ActorCall { method, args, done };
    if self.in_tx.send(call).await.is_err() {
      // Mailbox already drained; the dropped record closes its reply sink.
      trace!(pid = %self.pid, "mailbox closed, dropping call record");
    }
  }

  /// Idempotent stop request. The aliveness mutex is the memory barrier
  /// between this control path and the executor.
  pub(crate) fn stop(&self) {
    let mut alive = self.alive.lock();
    if *alive {
      *alive = false;
      let _ = self.shutdown_tx.try_send(());
    }
  }
}

async fn run_executor(
  mut user: Box<dyn crate::method::Performer>,
  mut out_rx: mpsc::Receiver<ActorCall>,
  mut shutdown_rx: mpsc::Receiver<()>,
  lifecycle: Lifecycle,
) {
  debug!(pid = %lifecycle.pid, "actor executor started");
  loop {
    tokio::select! {
      maybe_call = out_rx.recv() => {
        let Some(call) = maybe_call else { break };
        let ActorCall { method, args, done } = call;
        let spec = method.spec().expect("only verified calls reach the executor");
        let invoke = spec.invoke.clone().expect("free functions never pass verification");
        let name = spec.name;

        let receiver: &mut dyn Any = &mut *user;
        match catch_unwind(AssertUnwindSafe(|| invoke(receiver, args))) {
          Ok(ret) => {
            if let Some(done) = done {
              if done.send(ret).is_err() {
                trace!(pid = %lifecycle.pid, method = name, "caller went away before the reply");
              }
            }
          }
          Err(payload) => {
            let cause = PanicCause::new(payload);
            error!(pid = %lifecycle.pid, method = name, cause = %cause.message(), "actor panicked");
            terminate(&mut user, StopReason::Panicked(cause), &lifecycle);
            // Only now close the in-flight reply sink: the caller observes
            // the death after the termination hook has run.
            drop(done);
            break;
          }
        }
      }
      _ = shutdown_rx.recv() => {
        terminate(&mut user, StopReason::Stopped, &lifecycle);
        break;
      }
    }
  }
  debug!(pid = %lifecycle.pid, "actor executor exited");
}

/// The termination sequence: deregister, mark DEAD and stop the mailbox
/// under the aliveness mutex, then run the user hook.
fn terminate(user: &mut Box<dyn crate::method::Performer>, reason: StopReason, lifecycle: &Lifecycle) {
  if let Some(director) = lifecycle.director.upgrade() {
    director.remove_actor(&lifecycle.pid);
  }
  {
    let mut alive = lifecycle.alive.lock();
    *alive = false;
    let _ = lifecycle.mailbox_stop.try_send(());
  }
  debug!(pid = %lifecycle.pid, reason = %reason, "actor terminated");
  user.terminate(&reason);
}

#[cfg(test)]
mod tests {
  use std::panic::panic_any;
  use std::time::Duration;

  use once_cell::sync::Lazy;
  use tokio::time::timeout;

  use super::*;
  use crate::method::{MethodTable, Performer};
  use crate::value::ValueKind;

  /// What the termination hook saw: `Ok(())` for a deliberate stop, or the
  /// downcast panic payload.
  type HookLog = Arc<Mutex<Vec<Result<(), Option<i64>>>>>;

  struct TestActor {
    x: i64,
    y: i64,
    hook: HookLog,
  }

  static TEST_ACTOR_METHODS: Lazy<MethodTable> = Lazy::new(|| {
    MethodTable::for_type::<TestActor>("TestActor")
      .method("add_x", &[ValueKind::Int], |a, args| {
        vec![Value::Int(a.x + args[0].as_int().expect("verified"))]
      })
      .method("do_panic", &[], |a, _| panic_any(a.y))
      .method("check_deadline", &[ValueKind::Context], |_, args| {
        let ctx = args[0].as_context().expect("verified");
        vec![Value::Bool(ctx.expired())]
      })
      .build()
  });

  impl Performer for TestActor {
    fn methods(&self) -> &'static MethodTable {
      &TEST_ACTOR_METHODS
    }

    fn terminate(&mut self, reason: &StopReason) {
      let entry = match reason {
        StopReason::Stopped => Ok(()),
        StopReason::Panicked(cause) => Err(cause.payload().downcast_ref::<i64>().copied()),
      };
      self.hook.lock().push(entry);
    }
  }

  fn test_actor(x: i64, y: i64) -> (ActorHandle, HookLog) {
    let hook: HookLog = Arc::new(Mutex::new(Vec::new()));
    let user = TestActor { x, y, hook: hook.clone() };
    let pid = Pid { node: "local".into(), serial: 1 };
    let handle = spawn(Box::new(user), pid, Weak::new());
    (handle, hook)
  }

  async fn wait_for_hook(hook: &HookLog) {
    timeout(Duration::from_secs(2), async {
      while hook.lock().is_empty() {
        tokio::time::sleep(Duration::from_millis(5)).await;
      }
    })
    .await
    .expect("termination hook never ran");
  }

  #[tokio::test]
  async fn call_runs_the_method_and_returns_its_results() {
    let (actor, _hook) = test_actor(2, 3);
    let add_x = TEST_ACTOR_METHODS.get("add_x").unwrap();
    let ret = actor.call(add_x, vec![Value::Int(4)]).await.unwrap();
    assert_eq!(ret, vec![Value::Int(6)]);
    actor.stop();
  }

  #[tokio::test]
  async fn call_after_stop_reports_actor_stop() {
    let (actor, hook) = test_actor(2, 3);
    actor.stop();
    let add_x = TEST_ACTOR_METHODS.get("add_x").unwrap();
    let err = actor.call(add_x.clone(), vec![Value::Int(4)]).await.unwrap_err();
    assert_eq!(err, DirectorError::ActorStop);

    // A cast against the stopped actor is silently dropped, closing the
    // done-channel without a value.
    let (done_tx, done_rx) = oneshot::channel();
    actor.cast(Some(done_tx), add_x, vec![Value::Int(4)]).await;
    done_rx.await.expect_err("done-channel closes on a stopped actor");

    wait_for_hook(&hook).await;
    assert_eq!(hook.lock().as_slice(), &[Ok(())]);
  }

  #[tokio::test]
  async fn stop_is_idempotent_and_the_hook_runs_once() {
    let (actor, hook) = test_actor(2, 3);
    actor.stop();
    actor.stop();
    wait_for_hook(&hook).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(hook.lock().len(), 1);
  }

  #[tokio::test]
  async fn panic_kills_the_actor_and_reaches_the_hook_with_the_cause() {
    let (actor, hook) = test_actor(2, 3);
    let do_panic = TEST_ACTOR_METHODS.get("do_panic").unwrap();
    let err = actor.call(do_panic, vec![]).await.unwrap_err();
    assert_eq!(err, DirectorError::ActorDied);

    // The caller is unblocked after the termination sequence, so the hook
    // has already observed the panic cause.
    assert_eq!(hook.lock().as_slice(), &[Err(Some(3))]);

    let add_x = TEST_ACTOR_METHODS.get("add_x").unwrap();
    let err = actor.call(add_x, vec![Value::Int(1)]).await.unwrap_err();
    assert!(matches!(err, DirectorError::ActorStop | DirectorError::ActorDied));
  }

  #[tokio::test]
  async fn casts_from_one_sender_run_in_issue_order() {
    let (actor, _hook) = test_actor(0, 0);
    let add_x = TEST_ACTOR_METHODS.get("add_x").unwrap();
    let mut receipts = Vec::new();
    for n in 0..16 {
      let (done_tx, done_rx) = oneshot::channel();
      actor.cast(Some(done_tx), add_x.clone(), vec![Value::Int(n)]).await;
      receipts.push(done_rx);
    }
    for (n, done_rx) in receipts.into_iter().enumerate() {
      let ret = done_rx.await.expect("cast executed");
      assert_eq!(ret, vec![Value::Int(n as i64)]);
    }
    actor.stop();
  }

  #[tokio::test]
  async fn deadline_token_is_visible_to_the_method() {
    let (actor, _hook) = test_actor(0, 0);
    let check = TEST_ACTOR_METHODS.get("check_deadline").unwrap();
    let ret = actor
      .call_with_context(check, Duration::from_secs(5), vec![])
      .await
      .unwrap();
    assert_eq!(ret, vec![Value::Bool(false)]);
    actor.stop();
  }

  #[tokio::test]
  #[should_panic(expected = "method handle is nil")]
  async fn calling_a_nil_handle_is_a_loud_programmer_bug() {
    let (actor, _hook) = test_actor(0, 0);
    let _ = actor.call(Method::nil(), vec![]).await;
  }
}
