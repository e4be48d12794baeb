//! Host header parsing and domain validation

use regex_lite::Regex;
use std::sync::OnceLock;
use thiserror::Error;

/// A label of 1-63 characters followed by a 2-6 letter TLD, or by a second
/// label and a 2-3 letter TLD
const DOMAIN_PATTERN: &str = r"^(([a-zA-Z]{1})|([a-zA-Z]{1}[a-zA-Z]{1})|([a-zA-Z]{1}[0-9]{1})|([0-9]{1}[a-zA-Z]{1})|([a-zA-Z0-9][a-zA-Z0-9_-]{1,61}[a-zA-Z0-9]))\.([a-zA-Z]{2,6}|[a-zA-Z0-9-]{2,30}\.[a-zA-Z]{2,3})$";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HostError {
    #[error("Host header not found")]
    Missing,

    #[error("Malformed host header: {0}")]
    Malformed(String),

    #[error("Host {host} is not served under {root_domain}")]
    ForeignDomain { host: String, root_domain: String },
}

/// Whether `domain` is acceptable as the root domain tunnels are served under
pub fn is_valid_domain(domain: &str) -> bool {
    static DOMAIN_RE: OnceLock<Option<Regex>> = OnceLock::new();

    DOMAIN_RE
        .get_or_init(|| Regex::new(DOMAIN_PATTERN).ok())
        .as_ref()
        .is_some_and(|re| re.is_match(domain))
}

/// Whether `label` can be used as the leftmost part of a tunnel hostname
pub fn is_valid_label(label: &str) -> bool {
    let bytes = label.as_bytes();
    if bytes.is_empty() || bytes.len() > 63 {
        return false;
    }
    if bytes[0] == b'-' || bytes[bytes.len() - 1] == b'-' {
        return false;
    }
    bytes.iter().all(|b| b.is_ascii_alphanumeric() || *b == b'-')
}

/// Hostname a tunnel for `label` is reachable under
pub fn tunnel_host(label: &str, root_domain: &str) -> String {
    format!(
        "{}.{}",
        label.to_ascii_lowercase(),
        root_domain.trim_end_matches('.').to_ascii_lowercase()
    )
}

/// Resolve a raw `Host:` header value to the routing key for `root_domain`
///
/// Strips the port and a trailing dot and lowercases the name. Only hosts
/// exactly one label below the root domain are routable.
pub fn route_host(raw: Option<&str>, root_domain: &str) -> Result<String, HostError> {
    let raw = raw.map(str::trim).filter(|h| !h.is_empty()).ok_or(HostError::Missing)?;

    if raw.starts_with('[') {
        // IP literal, never one of our names
        return Err(HostError::Malformed(raw.to_string()));
    }

    let name = match raw.rsplit_once(':') {
        Some((name, port)) => {
            if port.parse::<u16>().is_err() {
                return Err(HostError::Malformed(raw.to_string()));
            }
            name
        }
        None => raw,
    };

    let host = name.trim_end_matches('.').to_ascii_lowercase();
    let root = root_domain.trim_end_matches('.').to_ascii_lowercase();

    let label = host
        .strip_suffix(&root)
        .and_then(|prefix| prefix.strip_suffix('.'))
        .ok_or_else(|| HostError::ForeignDomain {
            host: host.clone(),
            root_domain: root.clone(),
        })?;

    if !is_valid_label(label) {
        return Err(HostError::Malformed(raw.to_string()));
    }

    Ok(host)
}
