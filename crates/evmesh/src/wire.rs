//! Event framing: a 16-byte little-endian header frame plus an optional
//! payload frame.
//!
//! The payload frame is present only when the payload is non-empty; the
//! transport's more-to-follow flag on the header frame signals it. A
//! header-only message is a valid event.

use thiserror::Error;

use crate::event::EventId;
use crate::transport::Message;

/// Size of the header frame carrying the event identifier.
pub const HEADER_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("message without a header frame")]
    MissingHeader,
    #[error("header frame must be {HEADER_LEN} bytes, got {0}")]
    BadHeaderLength(usize),
}

/// Build the frame sequence for one published event.
pub fn encode(event: EventId, payload: &[u8]) -> Vec<Vec<u8>> {
    let header = event.to_le_bytes().to_vec();
    if payload.is_empty() {
        vec![header]
    } else {
        vec![header, payload.to_vec()]
    }
}

/// Decode a received frame sequence back into `(event, payload)`.
///
/// Frames past the payload are ignored; the header length is enforced so a
/// stray message on the wrong port cannot masquerade as an event.
pub fn decode(message: &Message) -> Result<(EventId, Vec<u8>), WireError> {
    let header = message.frames.first().ok_or(WireError::MissingHeader)?;
    if header.len() != HEADER_LEN {
        return Err(WireError::BadHeaderLength(header.len()));
    }
    let mut bytes = [0u8; HEADER_LEN];
    bytes.copy_from_slice(header);
    let payload = message.frames.get(1).cloned().unwrap_or_default();
    Ok((EventId::from_le_bytes(bytes), payload))
}
