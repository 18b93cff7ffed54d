//! Open-redirect protection for post-login targets.

use anyhow::{anyhow, Result};
use std::sync::RwLock;
use tracing::debug;
use url::Url;

/// Decides whether a post-login redirect target may be honored.
///
/// Relative targets are always allowed. Absolute and protocol-relative
/// targets must point at an allow-listed host or at the host and port of
/// the current request. Anything that is not a well-formed URI reference
/// is refused.
#[derive(Debug, Default)]
pub struct RedirectGuard {
    authorized_hosts: RwLock<Vec<String>>,
}

impl RedirectGuard {
    pub fn new(authorized_hosts: Vec<String>) -> Self {
        Self {
            authorized_hosts: RwLock::new(normalize_hosts(authorized_hosts)),
        }
    }

    /// Replace the allow-list.
    pub fn set_authorized_hosts(&self, hosts: Vec<String>) -> Result<()> {
        let mut guard = self
            .authorized_hosts
            .write()
            .map_err(|_| anyhow!("Redirect host list lock poisoned"))?;
        *guard = normalize_hosts(hosts);
        Ok(())
    }

    pub fn authorized_hosts(&self) -> Vec<String> {
        self.authorized_hosts
            .read()
            .map(|hosts| hosts.clone())
            .unwrap_or_default()
    }

    /// Check `candidate` against the request URL `current_url`.
    ///
    /// `allow_absent` is returned when there is no candidate at all.
    pub fn is_authorized(&self, current_url: &str, candidate: Option<&str>, allow_absent: bool) -> bool {
        let Some(candidate) = candidate else {
            return allow_absent;
        };

        if !is_uri_reference(candidate) {
            debug!(redirect = %candidate, "Redirect is not a valid URI reference");
            return false;
        }

        let protocol_relative = candidate.starts_with("//");
        if !protocol_relative && !has_scheme(candidate) {
            return true;
        }

        let target = if protocol_relative {
            Url::parse(&format!("http:{}", candidate))
        } else {
            Url::parse(candidate)
        };
        let Ok(target) = target else {
            return false;
        };
        let Some(target_host) = target.host_str() else {
            // javascript:, data: and friends
            return false;
        };

        let allowed = self
            .authorized_hosts
            .read()
            .map(|hosts| hosts.iter().any(|h| h.eq_ignore_ascii_case(target_host)))
            .unwrap_or(false);
        if allowed {
            return true;
        }

        let Ok(current) = Url::parse(current_url) else {
            return false;
        };
        let same_host = current
            .host_str()
            .is_some_and(|h| h.eq_ignore_ascii_case(target_host));
        let same_port = if protocol_relative {
            // Inherits the current scheme, so an explicit port must match it.
            target.port().map_or(true, |p| Some(p) == current.port_or_known_default())
        } else {
            target.port_or_known_default() == current.port_or_known_default()
        };
        same_host && same_port
    }
}

fn normalize_hosts(hosts: Vec<String>) -> Vec<String> {
    hosts
        .into_iter()
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .collect()
}

/// RFC 3986 scheme prefix: ALPHA *( ALPHA / DIGIT / "+" / "-" / "." ) ":"
fn has_scheme(candidate: &str) -> bool {
    let Some((scheme, _)) = candidate.split_once(':') else {
        return false;
    };
    let mut chars = scheme.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
}

/// Only unreserved, reserved and well-formed percent escapes are accepted.
fn is_uri_reference(candidate: &str) -> bool {
    let bytes = candidate.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if b == b'%' {
            let escape_ok = bytes.len() > i + 2
                && bytes[i + 1].is_ascii_hexdigit()
                && bytes[i + 2].is_ascii_hexdigit();
            if !escape_ok {
                return false;
            }
            i += 3;
            continue;
        }
        let allowed = b.is_ascii_alphanumeric()
            || matches!(
                b,
                b'-' | b'.' | b'_' | b'~' | b':' | b'/' | b'?' | b'#' | b'[' | b']' | b'@'
                    | b'!' | b'$' | b'&' | b'\'' | b'(' | b')' | b'*' | b'+' | b',' | b';' | b'='
            );
        if !allowed {
            return false;
        }
        i += 1;
    }
    true
}
