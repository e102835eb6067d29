use std::any::Any;
use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors visible at the invocation surface and on the wire.
///
/// Every internal failure collapses to one of these before it reaches a
/// caller; no panic escapes the runtime into the caller's task.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[non_exhaustive]
pub enum DirectorError {
  /// The target actor was already stopped when the call arrived.
  #[error("actor stop")]
  ActorStop,

  /// The reply channel closed without a value: the mailbox drained or the
  /// executor died while the call was in flight.
  #[error("actor died")]
  ActorDied,

  /// The identifier is not in the owning registry, or the remote node could
  /// not be reached. A dead actor and a dead link demand the same remedy
  /// (re-resolve the identifier), so transport failures map here too.
  #[error("actor not found")]
  ActorNotFound,

  /// A wire short name did not resolve on the target's method table.
  #[error("method not found")]
  MethodNotFound,

  /// A user method panicked. Callers observe [`ActorDied`]; this kind
  /// carries the rendered cause to the termination hook and across the wire.
  ///
  /// [`ActorDied`]: DirectorError::ActorDied
  #[error("actor panic: {0}")]
  Panic(String),

  /// A call-with-deadline elapsed before the reply arrived.
  #[error("context deadline exceeded")]
  Deadline,
}

/// Transport-level failures below the invocation surface.
///
/// These never escape the director: by the time an error reaches a caller it
/// has collapsed to [`DirectorError::ActorNotFound`].
#[derive(Debug, Error)]
pub(crate) enum WireError {
  #[error("i/o error: {0}")]
  Io(#[from] io::Error),

  #[error("frame of {0} bytes exceeds the frame size limit")]
  FrameTooLarge(usize),

  #[error("codec error: {0}")]
  Codec(#[from] serde_json::Error),

  #[error("invalid duration {0:?}")]
  InvalidDuration(String),

  #[error("connection closed")]
  ConnectionClosed,

  #[error("i/o timed out")]
  Timeout,
}

/// Why an actor transitioned to DEAD. Passed to the termination hook.
#[derive(Debug)]
pub enum StopReason {
  /// The actor was stopped deliberately.
  Stopped,

  /// A user method panicked; carries the original panic payload.
  Panicked(PanicCause),
}

impl StopReason {
  /// True for a deliberate stop, false for a panic.
  pub fn is_stop(&self) -> bool {
    matches!(self, StopReason::Stopped)
  }
}

impl fmt::Display for StopReason {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      StopReason::Stopped => write!(f, "actor stop"),
      StopReason::Panicked(cause) => write!(f, "actor panic: {}", cause.message()),
    }
  }
}

/// The payload a user method panicked with, preserved for the termination
/// hook.
pub struct PanicCause {
  payload: Box<dyn Any + Send>,
}

impl PanicCause {
  pub(crate) fn new(payload: Box<dyn Any + Send>) -> Self {
    Self { payload }
  }

  /// The original panic payload, downcastable to the value the method
  /// panicked with.
  pub fn payload(&self) -> &(dyn Any + Send) {
    &*self.payload
  }

  /// Best-effort rendering of the payload. String payloads render verbatim;
  /// anything else falls back to a placeholder. This is the text that ends
  /// up in [`DirectorError::Panic`] on the wire.
  pub fn message(&self) -> String {
    if let Some(s) = self.payload.downcast_ref::<&str>() {
      (*s).to_string()
    } else if let Some(s) = self.payload.downcast_ref::<String>() {
      s.clone()
    } else {
      "<non-string panic payload>".to_string()
    }
  }
}

impl fmt::Debug for PanicCause {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_tuple("PanicCause").field(&self.message()).finish()
  }
}
