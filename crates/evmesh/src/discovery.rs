//! Zeroconf discovery adapter.
//!
//! Publishers register a service `_zeroeq_pub._tcp.local.` carrying their
//! instance UUID, user, application and session as TXT properties; browsing
//! subscribers turn resolve/remove notifications into [`ServiceChange`]
//! events drained by `poll()`. The adapter is pluggable: [`MdnsDiscovery`]
//! is the mdns-sd implementation, [`MockDiscovery`] a scriptable in-memory
//! double for tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use anyhow::{Context as _, Result};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tracing::{debug, info, warn};

/// Service name publishers announce on.
pub const SERVICE_PUBLISHER: &str = "_zeroeq_pub._tcp";

const MDNS_DOMAIN: &str = "local.";

pub const KEY_INSTANCE: &str = "instance";
pub const KEY_USER: &str = "user";
pub const KEY_APPLICATION: &str = "application";
pub const KEY_SESSION: &str = "session";

/// One discovered publisher instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceRecord {
    pub instance: String,
    pub user: String,
    pub application: String,
    pub session: String,
    pub host: String,
    pub port: u16,
}

/// Metadata attached to an announcement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Announcement {
    pub instance: String,
    pub user: String,
    pub application: String,
    pub session: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServiceChange {
    Added(ServiceRecord),
    Removed(String),
}

/// The discovery surface the fabric consumes.
pub trait Discovery {
    /// Whether a usable implementation is behind this adapter.
    fn is_available(&self) -> bool;

    /// Register this instance on `port`. `host` is a hint; empty means
    /// "derive the local host name".
    fn announce(&mut self, port: u16, host: &str, meta: &Announcement) -> Result<()>;

    /// Start browsing for `service` peers in the background.
    fn browse(&mut self, service: &str) -> Result<()>;

    /// Drain pending add/remove events without blocking.
    fn poll(&mut self) -> Vec<ServiceChange>;
}

/// mDNS/DNS-SD adapter over an mdns-sd `ServiceDaemon`.
pub struct MdnsDiscovery {
    daemon: ServiceDaemon,
    browser: Option<mdns_sd::Receiver<ServiceEvent>>,
    registered: Option<String>,
}

impl MdnsDiscovery {
    pub fn new() -> Result<Self> {
        let daemon = ServiceDaemon::new().context("create mDNS daemon")?;
        Ok(Self {
            daemon,
            browser: None,
            registered: None,
        })
    }

    fn record_from(info: &ServiceInfo) -> Option<ServiceRecord> {
        let prop = |key: &str| {
            info.get_properties()
                .get(key)
                .map(|v| v.val_str().to_string())
                .unwrap_or_default()
        };

        let instance = prop(KEY_INSTANCE);
        if instance.is_empty() {
            return None;
        }
        // Resolution may carry both A and AAAA records; prefer IPv4 so the
        // host string stays a plain dotted quad where one exists.
        let addresses = info.get_addresses();
        let host = addresses
            .iter()
            .find(|address| address.is_ipv4())
            .or_else(|| addresses.iter().next())?
            .to_string();

        Some(ServiceRecord {
            instance,
            user: prop(KEY_USER),
            application: prop(KEY_APPLICATION),
            session: prop(KEY_SESSION),
            host,
            port: info.get_port(),
        })
    }
}

impl Discovery for MdnsDiscovery {
    fn is_available(&self) -> bool {
        // Construction already stood the daemon up.
        true
    }

    fn announce(&mut self, port: u16, host: &str, meta: &Announcement) -> Result<()> {
        let host = if host.is_empty() {
            hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "evmesh-node".into())
        } else {
            host.to_string()
        };

        let properties = [
            (KEY_INSTANCE.to_string(), meta.instance.clone()),
            (KEY_USER.to_string(), meta.user.clone()),
            (KEY_APPLICATION.to_string(), meta.application.clone()),
            (KEY_SESSION.to_string(), meta.session.clone()),
        ];

        let service_type = format!("{SERVICE_PUBLISHER}.{MDNS_DOMAIN}");
        let service = ServiceInfo::new(
            &service_type,
            &meta.instance,
            &format!("{host}.{MDNS_DOMAIN}"),
            "",
            port,
            &properties[..],
        )
        .context("create mDNS service info")?
        .enable_addr_auto();

        let fullname = service.get_fullname().to_string();
        self.daemon
            .register(service)
            .context("register mDNS service")?;
        self.registered = Some(fullname);

        info!(instance = %meta.instance, session = %meta.session, port, "announced publisher");
        Ok(())
    }

    fn browse(&mut self, service: &str) -> Result<()> {
        let service_type = format!("{service}.{MDNS_DOMAIN}");
        self.browser = Some(
            self.daemon
                .browse(&service_type)
                .context("start mDNS browse")?,
        );
        Ok(())
    }

    fn poll(&mut self) -> Vec<ServiceChange> {
        let mut changes = Vec::new();
        let Some(receiver) = &self.browser else {
            return changes;
        };

        while let Ok(event) = receiver.try_recv() {
            match event {
                ServiceEvent::ServiceResolved(info) => match Self::record_from(&info) {
                    Some(record) => {
                        debug!(instance = %record.instance, host = %record.host,
                               port = record.port, "peer resolved");
                        changes.push(ServiceChange::Added(record));
                    }
                    None => debug!(fullname = %info.get_fullname(), "ignoring anonymous service"),
                },
                ServiceEvent::ServiceRemoved(service_type, fullname) => {
                    let instance = instance_from_fullname(&fullname, &service_type);
                    debug!(%instance, "peer removed");
                    changes.push(ServiceChange::Removed(instance));
                }
                ServiceEvent::SearchStarted(_) => {}
                _ => {}
            }
        }
        changes
    }
}

impl Drop for MdnsDiscovery {
    fn drop(&mut self) {
        if let Some(fullname) = self.registered.take() {
            if let Err(error) = self.daemon.unregister(&fullname) {
                warn!(%error, "failed to unregister announcement");
            }
        }
        self.daemon.shutdown().ok();
    }
}

/// The announced instance name is the fullname minus the service type
/// suffix.
fn instance_from_fullname(fullname: &str, service_type: &str) -> String {
    fullname
        .strip_suffix(service_type)
        .map(|name| name.trim_end_matches('.'))
        .unwrap_or(fullname)
        .to_string()
}

/// Scriptable adapter double. Clones share state, so a test keeps one
/// handle to inject service changes while the fabric owns the other.
#[derive(Clone, Default)]
pub struct MockDiscovery {
    state: Arc<Mutex<MockState>>,
    unavailable: bool,
    fail_announce: bool,
}

#[derive(Default)]
struct MockState {
    pending: VecDeque<ServiceChange>,
    announcements: Vec<(u16, String, Announcement)>,
    browsing: Vec<String>,
}

impl MockDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// An adapter that reports no usable discovery implementation.
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    /// An adapter whose `announce` fails.
    pub fn failing_announce() -> Self {
        Self {
            fail_announce: true,
            ..Self::default()
        }
    }

    pub fn push(&self, change: ServiceChange) {
        self.locked().pending.push_back(change);
    }

    pub fn announcements(&self) -> Vec<(u16, String, Announcement)> {
        self.locked().announcements.clone()
    }

    pub fn browsed_services(&self) -> Vec<String> {
        self.locked().browsing.clone()
    }

    fn locked(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().expect("mock discovery state poisoned")
    }
}

impl Discovery for MockDiscovery {
    fn is_available(&self) -> bool {
        !self.unavailable
    }

    fn announce(&mut self, port: u16, host: &str, meta: &Announcement) -> Result<()> {
        if self.fail_announce {
            anyhow::bail!("announce rejected by mock");
        }
        self.locked()
            .announcements
            .push((port, host.to_string(), meta.clone()));
        Ok(())
    }

    fn browse(&mut self, service: &str) -> Result<()> {
        self.locked().browsing.push(service.to_string());
        Ok(())
    }

    fn poll(&mut self) -> Vec<ServiceChange> {
        self.locked().pending.drain(..).collect()
    }
}
