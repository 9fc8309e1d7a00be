//! 128-bit event identifiers.
//!
//! An `EventId` names a class of messages on the fabric. Its wire form is a
//! fixed 16-byte little-endian encoding, so identifiers published on one
//! host decode to the same value everywhere.

use std::fmt;

use uuid::Uuid;

/// Opaque 128-bit label distinguishing message classes.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId(u128);

impl EventId {
    pub const fn from_u128(value: u128) -> Self {
        Self(value)
    }

    /// A fresh random identifier, suitable for ad-hoc event types.
    pub fn random() -> Self {
        Self(Uuid::new_v4().as_u128())
    }

    pub const fn as_u128(self) -> u128 {
        self.0
    }

    /// The 16-byte wire encoding. Little-endian on every host; big-endian
    /// machines byte-swap symmetrically on encode and decode.
    pub const fn to_le_bytes(self) -> [u8; 16] {
        self.0.to_le_bytes()
    }

    pub const fn from_le_bytes(bytes: [u8; 16]) -> Self {
        Self(u128::from_le_bytes(bytes))
    }
}

impl From<u128> for EventId {
    fn from(value: u128) -> Self {
        Self(value)
    }
}

impl From<Uuid> for EventId {
    fn from(value: Uuid) -> Self {
        Self(value.as_u128())
    }
}

impl fmt::Debug for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventId({:032x})", self.0)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}
