use tokio::sync::oneshot;

use crate::method::Method;
use crate::value::Value;

/// Sending half of a done-channel: receives the result sequence when the
/// call completes, and closes without a value if the actor dies first.
pub type DoneSender = oneshot::Sender<Vec<Value>>;

/// Receiving half of a done-channel.
pub type DoneReceiver = oneshot::Receiver<Vec<Value>>;

/// Creates a done-channel for [`cast`](crate::cast).
///
/// The runtime always consumes the sender (on reply delivery, on admission
/// failure, or on actor death), so waiting on the receiver is bounded.
pub fn done_channel() -> (DoneSender, DoneReceiver) {
  oneshot::channel()
}

/// A request travelling through an actor's mailbox.
///
/// The done sender is the reply sink and the result slot in one: delivering
/// the result sequence populates the caller's slot, and dropping the sender
/// without sending closes the channel, which the caller observes as "actor
/// died mid-call". `None` for fire-and-forget.
pub(crate) struct ActorCall {
  pub method: Method,
  pub args: Vec<Value>,
  pub done: Option<DoneSender>,
}
