//! Codec for encoding and decoding envelopes.
//!
//! Envelopes are plain JSON objects. On stream transports they are written
//! back to back with no delimiter, so the decoder reads one complete JSON
//! value at a time from an accumulating buffer.

use bytes::{Buf, Bytes, BytesMut};
use serde_json::Value;
use thiserror::Error;

use crate::envelope::Envelope;

/// Maximum envelope size (16 MiB).
pub const MAX_ENVELOPE_SIZE: usize = 16 * 1024 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Envelope exceeds maximum size.
    #[error("Envelope size {0} exceeds maximum {MAX_ENVELOPE_SIZE}")]
    EnvelopeTooLarge(usize),

    /// JSON encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[source] serde_json::Error),

    /// Malformed JSON on the wire.
    #[error("Decoding error: {0}")]
    Decode(#[source] serde_json::Error),

    /// Well-formed JSON that is not a valid envelope.
    #[error("Invalid envelope: {0}")]
    Invalid(String),
}

impl ProtocolError {
    /// Whether the stream can keep being decoded after this error.
    ///
    /// Invalid envelopes are skipped; malformed JSON leaves the stream in an
    /// unknown position.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ProtocolError::Invalid(_))
    }
}

/// Encode an envelope to bytes.
///
/// # Errors
///
/// Returns an error if the envelope is too large or encoding fails.
pub fn encode(envelope: &Envelope) -> Result<Bytes, ProtocolError> {
    let payload = serde_json::to_vec(envelope).map_err(ProtocolError::Encode)?;

    if payload.len() > MAX_ENVELOPE_SIZE {
        return Err(ProtocolError::EnvelopeTooLarge(payload.len()));
    }

    Ok(Bytes::from(payload))
}

/// Encode an envelope into an existing buffer.
///
/// # Errors
///
/// Returns an error if the envelope is too large or encoding fails.
pub fn encode_into(envelope: &Envelope, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let payload = encode(envelope)?;
    buf.extend_from_slice(&payload);
    Ok(())
}

/// Decode a single envelope from bytes.
///
/// # Errors
///
/// Returns an error if the data is not valid JSON or not a valid envelope.
pub fn decode(data: &[u8]) -> Result<Envelope, ProtocolError> {
    if data.len() > MAX_ENVELOPE_SIZE {
        return Err(ProtocolError::EnvelopeTooLarge(data.len()));
    }

    let value: Value = serde_json::from_slice(data).map_err(ProtocolError::Decode)?;
    Envelope::from_value(value)
}

/// Try to decode an envelope from a buffer, advancing it if successful.
///
/// Returns `Ok(Some(envelope))` if a complete envelope was decoded,
/// `Ok(None)` if more data is needed, or `Err` on protocol error.
///
/// An [`ProtocolError::Invalid`] envelope is consumed from the buffer, so the
/// caller may keep decoding. On malformed JSON the buffer is cleared.
///
/// # Errors
///
/// Returns an error if the data is malformed, too large, or not an envelope.
pub fn decode_from(buf: &mut BytesMut) -> Result<Option<Envelope>, ProtocolError> {
    let (next, consumed) = {
        let mut stream = serde_json::Deserializer::from_slice(&buf[..]).into_iter::<Value>();
        let next = stream.next();
        (next, stream.byte_offset())
    };

    match next {
        Some(Ok(value)) => {
            buf.advance(consumed);
            Envelope::from_value(value).map(Some)
        }
        Some(Err(e)) if e.is_eof() => {
            if buf.len() > MAX_ENVELOPE_SIZE {
                let len = buf.len();
                buf.clear();
                return Err(ProtocolError::EnvelopeTooLarge(len));
            }
            Ok(None)
        }
        Some(Err(e)) => {
            buf.clear();
            Err(ProtocolError::Decode(e))
        }
        None => {
            // Only whitespace left.
            buf.clear();
            Ok(None)
        }
    }
}
