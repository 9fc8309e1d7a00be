//! Event subscriber: discovery-driven connections plus an event dispatch
//! table.
//!
//! A subscriber keeps one connected socket per discovered same-session
//! publisher (own announcements and foreign sessions are skipped) and a
//! table mapping event ids to handlers. It takes part in a receiver
//! group's poll loop: `update()` applies pending discovery changes,
//! `process()` decodes one message and dispatches it.

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::rc::Rc;

use uuid::Uuid;

use tracing::{debug, trace, warn};

use crate::discovery::{
    Discovery, MdnsDiscovery, ServiceChange, ServiceRecord, SERVICE_PUBLISHER,
};
use crate::error::{Error, Result};
use crate::event::EventId;
use crate::receiver::{Receiver, ReceiverGroup};
use crate::serializable::Serializable;
use crate::session;
use crate::transport::{Context, PollItem, SubSocket};
use crate::uri::Uri;
use crate::wire;

enum EventSink {
    Event(Box<dyn FnMut()>),
    Payload(Box<dyn FnMut(&[u8])>),
    Object(Rc<RefCell<dyn Serializable>>),
}

pub struct Subscriber {
    shared: Rc<SubscriberShared>,
    group: ReceiverGroup,
}

struct SubscriberShared {
    instance: Uuid,
    session: String,
    context: Context,
    hint: Option<Uri>,
    browser: RefCell<Option<Box<dyn Discovery>>>,
    connections: RefCell<HashMap<String, SubSocket>>,
    handlers: RefCell<HashMap<EventId, EventSink>>,
}

impl Subscriber {
    /// Subscribe to all publishers of `session`, discovered over mDNS.
    pub fn new(group: &ReceiverGroup, session: &str) -> Result<Self> {
        Self::with_discovery(group, None, session, Self::default_adapter()?)
    }

    /// Subscribe to the one publisher at a fully-qualified URI; no
    /// discovery involved.
    pub fn connect(group: &ReceiverGroup, uri: &Uri) -> Result<Self> {
        let addr = uri
            .connect_address()
            .ok_or_else(|| Error::UriNotQualified(uri.to_string()))?;

        let shared = Rc::new(SubscriberShared {
            instance: Uuid::new_v4(),
            session: String::new(),
            context: group.context(),
            hint: None,
            browser: RefCell::new(None),
            connections: RefCell::new(HashMap::new()),
            handlers: RefCell::new(HashMap::new()),
        });
        shared.connect_socket(&format!("uri:{addr}"), &addr)?;

        Ok(Self::attach(group, shared))
    }

    /// Browse for `session` publishers, additionally constrained by a
    /// partial URI; a fully-qualified URI short-circuits to a direct
    /// connection.
    pub fn with_hint(group: &ReceiverGroup, uri: &Uri, session: &str) -> Result<Self> {
        if uri.is_fully_qualified() {
            return Self::connect(group, uri);
        }
        Self::with_discovery(group, Some(uri.clone()), session, Self::default_adapter()?)
    }

    /// Browse with a caller-supplied discovery adapter. A fully-qualified
    /// `uri` connects directly and leaves the adapter unused.
    pub fn with_discovery(
        group: &ReceiverGroup,
        uri: Option<Uri>,
        session: &str,
        mut adapter: Box<dyn Discovery>,
    ) -> Result<Self> {
        if let Some(uri) = &uri {
            if uri.is_fully_qualified() {
                return Self::connect(group, uri);
            }
        }

        if session.is_empty() {
            return Err(Error::InvalidSession);
        }
        let session = session::resolve_session(session);

        if !adapter.is_available() {
            return Err(Error::DiscoveryUnavailable(
                "adapter reports no usable implementation".to_string(),
            ));
        }
        adapter
            .browse(SERVICE_PUBLISHER)
            .map_err(|error| Error::DiscoveryUnavailable(error.to_string()))?;

        let shared = Rc::new(SubscriberShared {
            instance: Uuid::new_v4(),
            session,
            context: group.context(),
            hint: uri,
            browser: RefCell::new(Some(adapter)),
            connections: RefCell::new(HashMap::new()),
            handlers: RefCell::new(HashMap::new()),
        });
        Ok(Self::attach(group, shared))
    }

    fn default_adapter() -> Result<Box<dyn Discovery>> {
        let adapter =
            MdnsDiscovery::new().map_err(|error| Error::DiscoveryUnavailable(error.to_string()))?;
        Ok(Box::new(adapter))
    }

    fn attach(group: &ReceiverGroup, shared: Rc<SubscriberShared>) -> Self {
        let dynamic: Rc<dyn Receiver> = shared.clone();
        group.attach(&dynamic);
        Self {
            shared,
            group: group.clone(),
        }
    }

    /// Register a header-only handler. Returns false when the event id is
    /// already taken.
    pub fn subscribe(&self, event: EventId, handler: impl FnMut() + 'static) -> bool {
        self.shared.insert(event, EventSink::Event(Box::new(handler)))
    }

    /// Register a handler receiving the payload bytes.
    pub fn subscribe_payload(&self, event: EventId, handler: impl FnMut(&[u8]) + 'static) -> bool {
        self.shared
            .insert(event, EventSink::Payload(Box::new(handler)))
    }

    /// Register a serializable sink under its type identifier. Incoming
    /// payloads are applied with `from_binary`, then `notify_updated` runs.
    pub fn subscribe_object(&self, object: Rc<RefCell<dyn Serializable>>) -> bool {
        let event = object.borrow().type_identifier();
        self.shared.insert(event, EventSink::Object(object))
    }

    /// Remove a registration. Returns false when none exists.
    pub fn unsubscribe(&self, event: EventId) -> bool {
        self.shared.handlers.borrow_mut().remove(&event).is_some()
    }

    pub fn unsubscribe_object(&self, object: &dyn Serializable) -> bool {
        self.unsubscribe(object.type_identifier())
    }

    /// Connect to a publisher regardless of discovery and session
    /// filtering. The connection is keyed so that no discovery removal can
    /// tear it down.
    pub fn add_connection(&self, uri: &Uri) -> Result<()> {
        let addr = uri
            .connect_address()
            .ok_or_else(|| Error::UriNotQualified(uri.to_string()))?;
        self.shared.connect_socket(&format!("uri:{addr}"), &addr)
    }

    /// The group whose `receive()` drives this subscriber.
    pub fn group(&self) -> &ReceiverGroup {
        &self.group
    }

    pub fn session(&self) -> &str {
        &self.shared.session
    }

    pub fn instance(&self) -> Uuid {
        self.shared.instance
    }

    pub fn connection_count(&self) -> usize {
        self.shared.connections.borrow().len()
    }
}

impl SubscriberShared {
    fn insert(&self, event: EventId, sink: EventSink) -> bool {
        let mut handlers = self.handlers.borrow_mut();
        if handlers.contains_key(&event) {
            return false;
        }
        handlers.insert(event, sink);
        true
    }

    fn connect_socket(&self, key: &str, addr: &str) -> Result<()> {
        let socket = SubSocket::connect(&self.context, addr).map_err(|source| Error::Connect {
            addr: addr.to_string(),
            source,
        })?;
        // Match-all transport filter; session scoping already happened at
        // discovery time.
        socket.subscribe(b"");
        self.connections.borrow_mut().insert(key.to_string(), socket);
        Ok(())
    }

    fn dispatch(&self, event: EventId, payload: &[u8]) {
        // The handler leaves the table while it runs, so a callback may
        // mutate subscriptions without tripping over the borrow.
        let sink = self.handlers.borrow_mut().remove(&event);
        let Some(mut sink) = sink else {
            trace!(%event, "dropping unhandled event");
            return;
        };

        match &mut sink {
            EventSink::Event(handler) => handler(),
            EventSink::Payload(handler) => handler(payload),
            EventSink::Object(object) => {
                if object.borrow_mut().from_binary(payload) {
                    object.borrow_mut().notify_updated();
                } else {
                    warn!(%event, "payload rejected by serializable");
                }
            }
        }

        // Keep whatever the callback may have installed in the meantime.
        self.handlers.borrow_mut().entry(event).or_insert(sink);
    }

    fn apply_change(&self, change: ServiceChange) {
        match change {
            ServiceChange::Added(record) => self.add_peer(record),
            ServiceChange::Removed(instance) => {
                if self.connections.borrow_mut().remove(&instance).is_some() {
                    debug!(%instance, "publisher disconnected");
                }
            }
        }
    }

    fn add_peer(&self, record: ServiceRecord) {
        if record.instance == self.instance.to_string() {
            trace!("ignoring own announcement");
            return;
        }
        if record.session != self.session {
            trace!(instance = %record.instance, session = %record.session,
                   "ignoring foreign session");
            return;
        }
        if !self.hint_matches(&record) {
            debug!(instance = %record.instance, "ignoring peer outside URI hint");
            return;
        }
        if self.connections.borrow().contains_key(&record.instance) {
            return;
        }

        let addr = peer_address(&record.host, record.port);
        match SubSocket::connect(&self.context, &addr) {
            Ok(socket) => {
                socket.subscribe(b"");
                debug!(instance = %record.instance, %addr, "connected to publisher");
                self.connections.borrow_mut().insert(record.instance, socket);
            }
            Err(error) => warn!(%addr, %error, "cannot connect to discovered publisher"),
        }
    }

    /// A partial URI supplied alongside discovery narrows which records
    /// may be connected.
    fn hint_matches(&self, record: &ServiceRecord) -> bool {
        let Some(hint) = &self.hint else {
            return true;
        };
        if let Some(host) = hint.host() {
            if host != record.host {
                return false;
            }
        }
        if hint.port() != 0 && hint.port() != record.port {
            return false;
        }
        true
    }
}

/// Connect string for a discovered endpoint. IPv6 literals need brackets
/// in `host:port` form; `SocketAddr`'s Display takes care of that. Host
/// names pass through unchanged.
fn peer_address(host: &str, port: u16) -> String {
    match host.parse::<IpAddr>() {
        Ok(ip) => SocketAddr::new(ip, port).to_string(),
        Err(_) => format!("{host}:{port}"),
    }
}

impl Receiver for SubscriberShared {
    fn add_sockets(&self, out: &mut Vec<PollItem>) {
        for socket in self.connections.borrow().values() {
            out.push(socket.poll_item());
        }
    }

    fn process(&self, item: &PollItem) -> bool {
        let Some(message) = item.recv_now() else {
            return false;
        };
        match wire::decode(&message) {
            Ok((event, payload)) => self.dispatch(event, &payload),
            Err(error) => warn!(%error, "dropping malformed message"),
        }
        true
    }

    fn update(&self) {
        let changes = {
            let mut browser = self.browser.borrow_mut();
            match browser.as_mut() {
                Some(adapter) => adapter.poll(),
                None => return,
            }
        };
        for change in changes {
            self.apply_change(change);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::time::Duration;

    use crate::discovery::MockDiscovery;
    use crate::serializable::testing::Counter;

    fn browse_subscriber(session: &str) -> (Subscriber, MockDiscovery, ReceiverGroup) {
        let group = ReceiverGroup::new();
        let mock = MockDiscovery::new();
        let handle = mock.clone();
        let subscriber =
            Subscriber::with_discovery(&group, None, session, Box::new(mock)).unwrap();
        (subscriber, handle, group)
    }

    fn record(instance: &str, session: &str, port: u16) -> ServiceRecord {
        ServiceRecord {
            instance: instance.to_string(),
            user: "someone".to_string(),
            application: "other-app".to_string(),
            session: session.to_string(),
            host: "127.0.0.1".to_string(),
            port,
        }
    }

    /// Run one update cycle without waiting for data.
    fn pump(group: &ReceiverGroup) {
        group.receive(Some(Duration::ZERO)).unwrap();
    }

    #[test]
    fn duplicate_subscribe_is_rejected() {
        let (subscriber, _mock, _group) = browse_subscriber("s1");
        let event = EventId::from_u128(7);

        assert!(subscriber.subscribe(event, || {}));
        assert!(!subscriber.subscribe(event, || {}));
        assert!(!subscriber.subscribe_payload(event, |_| {}));

        assert!(subscriber.unsubscribe(event));
        assert!(!subscriber.unsubscribe(event));
    }

    #[test]
    fn serializable_registration_uses_type_id() {
        let (subscriber, _mock, _group) = browse_subscriber("s1");
        let counter: Rc<RefCell<dyn Serializable>> = Rc::new(RefCell::new(Counter::new(0)));

        assert!(subscriber.subscribe_object(counter.clone()));
        assert!(!subscriber.subscribe(Counter::TYPE, || {}));
        assert!(subscriber.unsubscribe_object(&*counter.borrow()));
        assert!(!subscriber.unsubscribe(Counter::TYPE));
    }

    #[test]
    fn empty_session_is_rejected() {
        let group = ReceiverGroup::new();
        let result =
            Subscriber::with_discovery(&group, None, "", Box::new(MockDiscovery::new()));
        assert!(matches!(result, Err(Error::InvalidSession)));
    }

    #[test]
    fn unavailable_discovery_fails_construction() {
        let group = ReceiverGroup::new();
        let result =
            Subscriber::with_discovery(&group, None, "s1", Box::new(MockDiscovery::unavailable()));
        assert!(matches!(result, Err(Error::DiscoveryUnavailable(_))));
    }

    #[test]
    fn direct_connect_requires_qualified_uri() {
        let group = ReceiverGroup::new();
        let partial: Uri = "*:0".parse().unwrap();
        let result = Subscriber::connect(&group, &partial);
        assert!(matches!(result, Err(Error::UriNotQualified(_))));
    }

    #[test]
    fn browse_starts_on_the_publisher_service() {
        let (_subscriber, mock, _group) = browse_subscriber("s1");
        assert_eq!(mock.browsed_services(), vec![SERVICE_PUBLISHER.to_string()]);
    }

    #[test]
    fn same_session_peer_is_connected_and_removed() {
        let (subscriber, mock, group) = browse_subscriber("s1");

        mock.push(ServiceChange::Added(record("peer-1", "s1", 41000)));
        pump(&group);
        assert_eq!(subscriber.connection_count(), 1);

        // A second resolve of the same instance is a no-op.
        mock.push(ServiceChange::Added(record("peer-1", "s1", 41000)));
        pump(&group);
        assert_eq!(subscriber.connection_count(), 1);

        mock.push(ServiceChange::Removed("peer-1".to_string()));
        pump(&group);
        assert_eq!(subscriber.connection_count(), 0);
    }

    #[test]
    fn foreign_session_is_ignored() {
        let (subscriber, mock, group) = browse_subscriber("s1");
        mock.push(ServiceChange::Added(record("peer-2", "s2", 41001)));
        pump(&group);
        assert_eq!(subscriber.connection_count(), 0);
    }

    #[test]
    fn own_announcement_is_ignored() {
        let (subscriber, mock, group) = browse_subscriber("s1");
        let own = subscriber.instance().to_string();
        mock.push(ServiceChange::Added(record(&own, "s1", 41002)));
        pump(&group);
        assert_eq!(subscriber.connection_count(), 0);
    }

    #[test]
    fn uri_hint_filters_discovered_peers() {
        let group = ReceiverGroup::new();
        let mock = MockDiscovery::new();
        let handle = mock.clone();
        let hint: Uri = "10.9.8.7".parse().unwrap();
        let subscriber =
            Subscriber::with_discovery(&group, Some(hint), "s1", Box::new(mock)).unwrap();

        handle.push(ServiceChange::Added(record("peer-3", "s1", 41003)));
        pump(&group);
        assert_eq!(subscriber.connection_count(), 0);
    }

    #[test]
    fn explicit_connections_survive_discovery_removal() {
        let (subscriber, mock, group) = browse_subscriber("s1");
        let uri: Uri = "127.0.0.1:41004".parse().unwrap();
        subscriber.add_connection(&uri).unwrap();
        assert_eq!(subscriber.connection_count(), 1);

        mock.push(ServiceChange::Removed("uri-like".to_string()));
        pump(&group);
        assert_eq!(subscriber.connection_count(), 1);
    }

    #[test]
    fn ipv6_peers_get_bracketed_connect_addresses() {
        assert_eq!(peer_address("::1", 9000), "[::1]:9000");
        assert_eq!(peer_address("fe80::2", 41000), "[fe80::2]:41000");
        assert_eq!(peer_address("127.0.0.1", 9000), "127.0.0.1:9000");
        assert_eq!(peer_address("somehost", 9000), "somehost:9000");
    }

    #[test]
    fn ipv6_discovered_peer_is_connected() {
        let (subscriber, mock, group) = browse_subscriber("s1");
        let mut v6 = record("peer-v6", "s1", 41005);
        v6.host = "::1".to_string();
        mock.push(ServiceChange::Added(v6));
        pump(&group);
        assert_eq!(subscriber.connection_count(), 1);
    }

    #[test]
    fn dropping_the_subscriber_deregisters_it() {
        let (subscriber, _mock, group) = browse_subscriber("s1");
        assert_eq!(group.receiver_count(), 1);
        drop(subscriber);
        assert_eq!(group.receiver_count(), 0);
    }

    #[test]
    fn callbacks_may_mutate_the_dispatch_table() {
        let (subscriber, _mock, _group) = browse_subscriber("s1");

        let event = EventId::from_u128(0xfeed);
        let other = EventId::from_u128(0xbeef);
        let fired = Rc::new(Cell::new(false));

        let shared = subscriber.shared.clone();
        let fired_in_cb = fired.clone();
        subscriber.subscribe(event, move || {
            fired_in_cb.set(true);
            // Re-entering the table from a handler must not panic.
            shared.insert(other, EventSink::Event(Box::new(|| {})));
        });

        subscriber.shared.dispatch(event, &[]);
        assert!(fired.get());
        assert!(!subscriber.subscribe(other, || {}));
        // The original handler went back into the table.
        assert!(!subscriber.subscribe(event, || {}));
    }
}
