//! Event publisher: one bound broadcast socket plus a zeroconf
//! announcement.
//!
//! Construction binds (OS-assigned port when the URI leaves it out), reads
//! the final endpoint back, and — unless the session is [`SESSION_NULL`] —
//! announces the instance so same-session subscribers can find it. Publish
//! failures are non-fatal: they are logged and reported as `false`.

use uuid::Uuid;

use tracing::warn;

use crate::discovery::{Announcement, Discovery, MdnsDiscovery};
use crate::error::{Error, Result};
use crate::event::EventId;
use crate::serializable::Serializable;
use crate::session::{self, SESSION_NULL};
use crate::transport::{Context, PubSocket};
use crate::uri::Uri;
use crate::wire;

pub struct Publisher {
    socket: PubSocket,
    uri: Uri,
    session: String,
    instance: Uuid,
    // Held for the lifetime of the announcement; dropping it retracts.
    _discovery: Option<Box<dyn Discovery>>,
}

impl Publisher {
    /// Publish on `uri` within `session`, announced over mDNS.
    pub fn new(uri: Uri, session: &str) -> Result<Self> {
        let adapter = if session == SESSION_NULL {
            None
        } else {
            let adapter = MdnsDiscovery::new()
                .map_err(|error| Error::DiscoveryUnavailable(error.to_string()))?;
            Some(Box::new(adapter) as Box<dyn Discovery>)
        };
        Self::build(uri, session, adapter)
    }

    /// Publish with a caller-supplied discovery adapter.
    pub fn with_discovery(uri: Uri, session: &str, adapter: Box<dyn Discovery>) -> Result<Self> {
        Self::build(uri, session, Some(adapter))
    }

    fn build(uri: Uri, session: &str, adapter: Option<Box<dyn Discovery>>) -> Result<Self> {
        if session.is_empty() {
            return Err(Error::InvalidSession);
        }
        let session = session::resolve_session(session);

        let context = Context::new();
        let bind_addr = uri.bind_address();
        let socket = PubSocket::bind(&context, &bind_addr).map_err(|source| Error::Bind {
            addr: bind_addr.clone(),
            source,
        })?;

        // The OS may have assigned the port; reflect the real endpoint so
        // callers can hand it out.
        let mut uri = uri;
        uri.set_port(socket.local_addr().port());

        let instance = Uuid::new_v4();

        let mut discovery = None;
        if session != SESSION_NULL {
            let mut adapter = adapter.ok_or_else(|| {
                Error::DiscoveryUnavailable("no adapter supplied".to_string())
            })?;
            if !adapter.is_available() {
                return Err(Error::DiscoveryUnavailable(
                    "adapter reports no usable implementation".to_string(),
                ));
            }

            let meta = Announcement {
                instance: instance.to_string(),
                user: session::user_name(),
                application: session::application_name(),
                session: session.clone(),
            };
            adapter
                .announce(uri.port(), uri.host().unwrap_or_default(), &meta)
                .map_err(|error| Error::Announce(error.to_string()))?;
            discovery = Some(adapter);
        }

        Ok(Self {
            socket,
            uri,
            session,
            instance,
            _discovery: discovery,
        })
    }

    /// Send a header-only event.
    pub fn publish(&self, event: EventId) -> bool {
        self.send(event, &[])
    }

    /// Send an event with a binary payload.
    pub fn publish_payload(&self, event: EventId, payload: &[u8]) -> bool {
        self.send(event, payload)
    }

    /// Publish a serializable under its own type identifier.
    pub fn publish_object(&self, object: &dyn Serializable) -> bool {
        self.send(object.type_identifier(), &object.to_binary())
    }

    fn send(&self, event: EventId, payload: &[u8]) -> bool {
        let frames = wire::encode(event, payload);
        match self.socket.send(&frames) {
            Ok(()) => true,
            Err(error) => {
                warn!(%event, %error, "cannot publish message");
                false
            }
        }
    }

    /// The bound endpoint, with the OS-assigned port filled in.
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// `host:port` of the bound endpoint.
    pub fn address(&self) -> String {
        self.socket.local_addr().to_string()
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn instance(&self) -> Uuid {
        self.instance
    }
}
