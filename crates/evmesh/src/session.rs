//! Session names and the identity probes used in announcements.
//!
//! Publishers and subscribers only pair when their session strings match.
//! Two spellings are reserved: [`SESSION_DEFAULT`] resolves at construction
//! to `$ZEROEQ_SESSION` or the OS user name, and [`SESSION_NULL`] disables
//! the publisher's discovery announcement.

use std::env;

/// Resolve from `$ZEROEQ_SESSION` or the user name at construction.
pub const SESSION_DEFAULT: &str = "__default__";

/// Publisher-only: bind and publish, but never announce.
pub const SESSION_NULL: &str = "__null_session__";

/// Environment override consulted by [`SESSION_DEFAULT`] resolution.
pub const ENV_SESSION: &str = "ZEROEQ_SESSION";

/// Replace the default-session sentinel; explicit names pass through.
pub fn resolve_session(session: &str) -> String {
    if session == SESSION_DEFAULT {
        default_session()
    } else {
        session.to_string()
    }
}

pub fn default_session() -> String {
    if let Ok(name) = env::var(ENV_SESSION) {
        if !name.is_empty() {
            return name;
        }
    }
    let user = user_name();
    if user.is_empty() {
        "unknown".to_string()
    } else {
        user
    }
}

/// The OS user name, for announcement metadata. May be empty; an
/// announcement still succeeds without it.
pub fn user_name() -> String {
    env::var("USER")
        .or_else(|_| env::var("USERNAME"))
        .unwrap_or_default()
}

/// Basename of the running executable, for announcement metadata. May be
/// empty on platforms where the path cannot be probed.
pub fn application_name() -> String {
    env::current_exe()
        .ok()
        .and_then(|path| path.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_default()
}
