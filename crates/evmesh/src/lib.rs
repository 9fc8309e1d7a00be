//! Session-scoped LAN event fabric.
//!
//! Publishers bind a broadcast socket and announce themselves over
//! zeroconf; subscribers browse for same-session peers and dispatch typed
//! events (a 128-bit identifier plus an optional binary payload) to
//! registered handlers. Reception runs through a shared [`ReceiverGroup`]:
//! one bounded `receive()` drives discovery updates and message dispatch
//! for every subscriber attached to it.
//!
//! ```no_run
//! use std::time::Duration;
//! use evmesh::{EventId, Publisher, ReceiverGroup, Subscriber, Uri};
//!
//! # fn main() -> evmesh::Result<()> {
//! let publisher = Publisher::new(Uri::new(), "lab42")?;
//!
//! let group = ReceiverGroup::new();
//! let subscriber = Subscriber::new(&group, "lab42")?;
//! let heartbeat = EventId::from_u128(0x4242);
//! subscriber.subscribe(heartbeat, || println!("beat"));
//!
//! publisher.publish(heartbeat);
//! while !group.receive(Some(Duration::from_millis(100)))? {}
//! # Ok(())
//! # }
//! ```
//!
//! Delivery is best-effort: subscribers that join late or fall behind miss
//! messages. Per publisher, a subscriber sees events in publish order; no
//! order is defined across publishers.

pub mod discovery;
pub mod error;
pub mod event;
pub mod publisher;
pub mod receiver;
pub mod serializable;
pub mod session;
pub mod subscriber;
pub mod transport;
pub mod uri;
pub mod wire;

pub use discovery::{
    Announcement, Discovery, MdnsDiscovery, MockDiscovery, ServiceChange, ServiceRecord,
    SERVICE_PUBLISHER,
};
pub use error::{Error, Result};
pub use event::EventId;
pub use publisher::Publisher;
pub use receiver::{Receiver, ReceiverGroup};
pub use serializable::Serializable;
pub use session::{ENV_SESSION, SESSION_DEFAULT, SESSION_NULL};
pub use subscriber::Subscriber;
pub use uri::Uri;
