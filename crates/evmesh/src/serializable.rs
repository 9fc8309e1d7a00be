//! Collaborator contract for typed payload objects.
//!
//! A serializable exposes a stable type identifier plus a binary form.
//! Publishers read `type_identifier` and `to_binary`; subscribers apply
//! incoming payloads with `from_binary` and are told about the change via
//! `notify_updated`.

use crate::event::EventId;

pub trait Serializable {
    /// Stable identifier for this payload type; doubles as the event id the
    /// object is published and subscribed under.
    fn type_identifier(&self) -> EventId;

    /// Serialize the current state.
    fn to_binary(&self) -> Vec<u8>;

    /// Apply a received payload. Returns false when the bytes could not be
    /// interpreted; the object is left unchanged in that case.
    fn from_binary(&mut self, data: &[u8]) -> bool;

    /// Called after every successful `from_binary` during dispatch.
    fn notify_updated(&mut self) {}
}
