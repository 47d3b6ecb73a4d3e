use crate::MIN_PAYLOAD_SIZE;
use bytes::{BufMut, Bytes, BytesMut};
use rand::RngCore;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PayloadError {
    #[error("Payload of {len} bytes is too short to carry a timestamp")]
    TooShort { len: usize },

    #[error("Send timestamp {sent} is ahead of receive time {received}")]
    ClockSkew { sent: u64, received: u64 },
}

/// Build a message of `size` bytes: little-endian send timestamp followed by random filler.
///
/// `size` is raised to [`MIN_PAYLOAD_SIZE`] if smaller.
pub fn encode<R: RngCore>(timestamp_nanos: u64, size: usize, rng: &mut R) -> Bytes {
    let size = size.max(MIN_PAYLOAD_SIZE);
    let mut filler = vec![0u8; size - MIN_PAYLOAD_SIZE];
    rng.fill_bytes(&mut filler);

    let mut buf = BytesMut::with_capacity(size);
    buf.put_u64_le(timestamp_nanos);
    buf.put_slice(&filler);
    buf.freeze()
}

pub fn decode_timestamp(payload: &[u8]) -> Result<u64, PayloadError> {
    let head: [u8; MIN_PAYLOAD_SIZE] = payload
        .get(..MIN_PAYLOAD_SIZE)
        .and_then(|head| head.try_into().ok())
        .ok_or(PayloadError::TooShort { len: payload.len() })?;
    Ok(u64::from_le_bytes(head))
}

/// Elapsed time between send and receipt, truncated to whole microseconds.
pub fn latency_since(sent_nanos: u64, received_nanos: u64) -> Result<Duration, PayloadError> {
    let nanos = received_nanos
        .checked_sub(sent_nanos)
        .ok_or(PayloadError::ClockSkew {
            sent: sent_nanos,
            received: received_nanos,
        })?;
    Ok(Duration::from_micros(nanos / 1_000))
}
