//! Binary encoding of counter values.
//!
//! Each stored counter carries its own absolute expiry so that any backend can
//! evaluate TTLs lazily against an injected clock. Layout (16 bytes):
//! little-endian `i64` count followed by little-endian `i64` expiry in epoch
//! milliseconds, where `0` means "never expires".

use thiserror::Error;

const ENCODED_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid counter value length: expected {ENCODED_LEN} bytes, got {0}")]
    Length(usize),
}

/// A counter as held by a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterValue {
    pub count: i64,
    pub expires_at_ms: Option<i64>,
}

impl CounterValue {
    pub fn new(count: i64, expires_at_ms: Option<i64>) -> Self {
        Self {
            count,
            expires_at_ms,
        }
    }

    /// Whether the value is still visible at `now_ms`.
    pub fn is_live(&self, now_ms: i64) -> bool {
        match self.expires_at_ms {
            Some(at) => at > now_ms,
            None => true,
        }
    }
}

pub fn encode_counter_value(value: &CounterValue) -> [u8; ENCODED_LEN] {
    let mut out = [0u8; ENCODED_LEN];
    out[..8].copy_from_slice(&value.count.to_le_bytes());
    out[8..].copy_from_slice(&value.expires_at_ms.unwrap_or(0).to_le_bytes());
    out
}

pub fn decode_counter_value(bytes: &[u8]) -> Result<CounterValue, CodecError> {
    let (Some(count), Some(expiry)) = (bytes.get(..8), bytes.get(8..ENCODED_LEN)) else {
        return Err(CodecError::Length(bytes.len()));
    };
    if bytes.len() != ENCODED_LEN {
        return Err(CodecError::Length(bytes.len()));
    }
    let mut count_buf = [0u8; 8];
    count_buf.copy_from_slice(count);
    let mut expiry_buf = [0u8; 8];
    expiry_buf.copy_from_slice(expiry);
    let expires_at_ms = match i64::from_le_bytes(expiry_buf) {
        0 => None,
        at => Some(at),
    };
    Ok(CounterValue {
        count: i64::from_le_bytes(count_buf),
        expires_at_ms,
    })
}
