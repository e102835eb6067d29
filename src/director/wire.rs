//! Wire protocol for cross-node dispatch.
//!
//! One length-delimited frame per message: a big-endian `u32` payload length
//! followed by a self-describing JSON payload. Oversize frames are a
//! protocol violation and close the connection.

use std::marker::PhantomData;
use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

use crate::director::Pid;
use crate::error::{DirectorError, WireError};
use crate::value::Value;

/// Hard cap on a single frame's payload.
pub(crate) const MAX_FRAME_BYTES: usize = 1 << 20;

/// Read and write timeout at the inbound endpoint.
pub(crate) const IO_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum RemoteOp {
  Call,
  Cast,
  Stop,
  CallWithContext,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct RemoteRequest {
  /// Correlation id, monotonic per client connection. Casts receive no
  /// response frame, so their ids are never answered.
  pub id: u64,
  pub op: RemoteOp,
  pub pid: Pid,
  /// Method short name, resolved against the target's method table.
  pub method: String,
  pub args: Vec<Value>,
  /// Empty for plain calls; duration text like `"1.5s"` or `"200ms"` for
  /// call-with-deadline.
  pub timeout: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct RemoteResponse {
  pub id: u64,
  pub err: Option<DirectorError>,
  pub ret: Vec<Value>,
}

/// Length-prefix JSON codec. `Tx` is what this side encodes, `Rx` what it
/// decodes; the endpoint and the client instantiate it mirrored.
pub(crate) struct WireCodec<Tx, Rx> {
  _marker: PhantomData<fn(Tx) -> Rx>,
}

impl<Tx, Rx> WireCodec<Tx, Rx> {
  pub(crate) fn new() -> Self {
    Self { _marker: PhantomData }
  }
}

impl<Tx: Serialize, Rx: DeserializeOwned> Encoder<Tx> for WireCodec<Tx, Rx> {
  type Error = WireError;

  fn encode(&mut self, item: Tx, dst: &mut BytesMut) -> Result<(), WireError> {
    let payload = serde_json::to_vec(&item)?;
    if payload.len() > MAX_FRAME_BYTES {
      return Err(WireError::FrameTooLarge(payload.len()));
    }
    dst.reserve(4 + payload.len());
    dst.put_u32(payload.len() as u32);
    dst.put_slice(&payload);
    Ok(())
  }
}

impl<Tx: Serialize, Rx: DeserializeOwned> Decoder for WireCodec<Tx, Rx> {
  type Item = Rx;
  type Error = WireError;

  fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Rx>, WireError> {
    if src.len() < 4 {
      return Ok(None);
    }
    let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
    if length > MAX_FRAME_BYTES {
      return Err(WireError::FrameTooLarge(length));
    }
    if src.len() < 4 + length {
      src.reserve(4 + length - src.len());
      return Ok(None);
    }
    src.advance(4);
    let payload = src.split_to(length);
    Ok(Some(serde_json::from_slice(&payload)?))
  }
}

/// Renders a duration as wire text the way callers write one: the largest
/// unit that keeps the value readable, fractions allowed.
pub(crate) fn format_duration(duration: Duration) -> String {
  let nanos = duration.as_nanos();
  if nanos == 0 {
    "0s".to_string()
  } else if nanos >= 1_000_000_000 {
    format!("{}s", duration.as_secs_f64())
  } else if nanos >= 1_000_000 {
    format!("{}ms", nanos as f64 / 1e6)
  } else if nanos >= 1_000 {
    format!("{}us", nanos as f64 / 1e3)
  } else {
    format!("{nanos}ns")
  }
}

/// Parses wire duration text: a non-negative decimal number with one of the
/// units `ns`, `us`, `ms`, `s`, `m`, `h`.
pub(crate) fn parse_duration(text: &str) -> Result<Duration, WireError> {
  const UNITS: [(&str, f64); 6] = [
    ("ns", 1.0),
    ("us", 1e3),
    ("ms", 1e6),
    ("s", 1e9),
    ("m", 60e9),
    ("h", 3600e9),
  ];
  let trimmed = text.trim();
  for (suffix, scale) in UNITS {
    if let Some(number) = trimmed.strip_suffix(suffix) {
      let value: f64 = number
        .parse()
        .map_err(|_| WireError::InvalidDuration(text.to_string()))?;
      if !value.is_finite() || value < 0.0 {
        return Err(WireError::InvalidDuration(text.to_string()));
      }
      return Ok(Duration::from_nanos((value * scale) as u64));
    }
  }
  Err(WireError::InvalidDuration(text.to_string()))
}
