//! Fabric error type.

use thiserror::Error;

use crate::transport::PollError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot bind publisher socket '{addr}': {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot connect subscriber socket '{addr}': {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("service announcement failed: {0}")]
    Announce(String),
    #[error("empty session is not allowed")]
    InvalidSession,
    #[error("no discovery implementation available: {0}")]
    DiscoveryUnavailable(String),
    #[error("URI '{0}' is not fully qualified")]
    UriNotQualified(String),
    #[error("invalid URI '{0}'")]
    InvalidUri(String),
    #[error("poll failed: {0}")]
    Poll(#[from] PollError),
}

pub type Result<T> = std::result::Result<T, Error>;
