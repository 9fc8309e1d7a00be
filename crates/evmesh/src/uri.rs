//! Endpoint descriptors: `[scheme://][*|host|IP|iface][:port]`.
//!
//! A URI with both a concrete host and a non-zero port is "fully qualified"
//! and can be connected directly; anything less needs discovery to resolve
//! peers. The wildcard host `*` and port 0 ask the OS for defaults on bind.

use std::fmt;
use std::str::FromStr;

use crate::error::Error;

pub const DEFAULT_SCHEME: &str = "tcp";
pub const WILDCARD_HOST: &str = "*";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Uri {
    scheme: Option<String>,
    host: Option<String>,
    port: Option<u16>,
}

impl Uri {
    /// An empty URI: wildcard bind, OS-assigned port, discovery required.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host_port(host: &str, port: u16) -> Self {
        Self {
            scheme: None,
            host: Some(host.to_string()),
            port: Some(port),
        }
    }

    pub fn scheme(&self) -> &str {
        self.scheme.as_deref().unwrap_or(DEFAULT_SCHEME)
    }

    /// The host part, if one was given and it is not the wildcard.
    pub fn host(&self) -> Option<&str> {
        match self.host.as_deref() {
            Some(WILDCARD_HOST) | None => None,
            other => other,
        }
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(0)
    }

    pub fn set_port(&mut self, port: u16) {
        self.port = Some(port);
    }

    /// Host and port both present and non-wildcard.
    pub fn is_fully_qualified(&self) -> bool {
        self.host().is_some() && self.port() != 0
    }

    /// The `host:port` string handed to the transport for binding. Missing
    /// or wildcard hosts bind all interfaces; a missing port requests an
    /// OS-assigned one.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host().unwrap_or("0.0.0.0"), self.port())
    }

    /// The `host:port` string for connecting; only fully-qualified URIs
    /// name a reachable peer.
    pub fn connect_address(&self) -> Option<String> {
        if !self.is_fully_qualified() {
            return None;
        }
        Some(format!("{}:{}", self.host().unwrap_or_default(), self.port()))
    }
}

impl FromStr for Uri {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let mut uri = Uri::new();
        let rest = match input.split_once("://") {
            Some((scheme, rest)) => {
                if scheme.is_empty() {
                    return Err(Error::InvalidUri(input.to_string()));
                }
                uri.scheme = Some(scheme.to_string());
                rest
            }
            None => input,
        };

        if rest.is_empty() {
            return Ok(uri);
        }

        match rest.rsplit_once(':') {
            Some((host, port)) => {
                let port: u16 = port
                    .parse()
                    .map_err(|_| Error::InvalidUri(input.to_string()))?;
                uri.port = Some(port);
                if !host.is_empty() {
                    uri.host = Some(host.to_string());
                }
            }
            None => uri.host = Some(rest.to_string()),
        }
        Ok(uri)
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://", self.scheme())?;
        write!(f, "{}", self.host.as_deref().unwrap_or(WILDCARD_HOST))?;
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        Ok(())
    }
}
