//! Validation and normalization of postMessage / CORS origins.
//!
//! An allowed origin is exactly `scheme://host[:port]`. HTTPS is required
//! except for `http://localhost` and `http://127.x.x.x`. Wildcards are never
//! accepted. All functions here are pure.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use url::{Host, Url};

/// Maximum number of origins a developer app may register.
pub const MAX_ALLOWED_ORIGINS: usize = 10;

pub const REASON_INVALID_URL: &str = "Invalid URL format";
pub const REASON_HTTP_LOCALHOST_ONLY: &str = "HTTP only allowed for localhost";
pub const REASON_SCHEME: &str = "Only HTTPS and localhost HTTP allowed";
pub const REASON_WILDCARD: &str = "Wildcards not allowed in origins";
pub const REASON_CREDENTIALS: &str = "Origin must not include credentials";
pub const REASON_PATH: &str = "Origin must not include a path, query, or fragment";
pub const REASON_DEFAULT_PORT: &str = "Default ports must not be specified";
pub const REASON_NOT_ARRAY: &str = "Origins must be an array";
pub const REASON_EMPTY_LIST: &str = "At least one origin is required";
pub const REASON_TOO_MANY: &str = "Maximum 10 origins allowed";
pub const REASON_NOT_STRING: &str = "Each origin must be a string";
pub const REASON_DUPLICATE: &str = "Duplicate origins not allowed";

/// Outcome of validating a single origin string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginCheck {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl OriginCheck {
    fn ok() -> Self {
        Self {
            valid: true,
            reason: None,
        }
    }

    fn reject(reason: &str) -> Self {
        Self {
            valid: false,
            reason: Some(reason.to_string()),
        }
    }
}

/// Outcome of validating an origin list. The first failure short-circuits
/// and echoes the offending value exactly as supplied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OriginListCheck {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failing_origin: Option<String>,
    #[serde(rename = "error", skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl OriginListCheck {
    fn ok() -> Self {
        Self {
            valid: true,
            failing_origin: None,
            reason: None,
        }
    }

    fn reject(failing: Option<&str>, reason: &str) -> Self {
        Self {
            valid: false,
            failing_origin: failing.map(str::to_string),
            reason: Some(reason.to_string()),
        }
    }
}

fn is_loopback_host(host: &Host<&str>) -> bool {
    match host {
        Host::Domain(d) => *d == "localhost",
        Host::Ipv4(ip) => ip.octets()[0] == 127,
        Host::Ipv6(_) => false,
    }
}

/// Authority section of the raw input (between `://` and the first `/?#`).
fn raw_authority(raw: &str) -> &str {
    let after_scheme = match raw.find("://") {
        Some(i) => &raw[i + 3..],
        None => raw,
    };
    let end = after_scheme
        .find(['/', '?', '#'])
        .unwrap_or(after_scheme.len());
    &after_scheme[..end]
}

/// Port written explicitly in the raw input. `Url` drops default ports while
/// parsing, so this is read from the source text.
fn explicit_port(raw: &str) -> Option<u16> {
    let authority = raw_authority(raw);
    let host_port = authority.rsplit('@').next().unwrap_or(authority);
    let port_part = if let Some(rest) = host_port.strip_prefix('[') {
        rest.split_once(']')?.1.strip_prefix(':')?
    } else {
        host_port.rsplit_once(':')?.1
    };
    port_part.parse().ok()
}

fn default_port(scheme: &str) -> Option<u16> {
    match scheme {
        "http" => Some(80),
        "https" => Some(443),
        _ => None,
    }
}

/// Validate a single origin string.
pub fn validate_origin(origin: &str) -> OriginCheck {
    let url = match Url::parse(origin) {
        Ok(u) => u,
        Err(_) if origin.contains("://") && raw_authority(origin).contains('*') => {
            return OriginCheck::reject(REASON_WILDCARD)
        }
        Err(_) => return OriginCheck::reject(REASON_INVALID_URL),
    };
    let host = match url.host() {
        Some(h) => h,
        None => return OriginCheck::reject(REASON_INVALID_URL),
    };

    match url.scheme() {
        "https" => {}
        "http" if is_loopback_host(&host) => {}
        "http" => return OriginCheck::reject(REASON_HTTP_LOCALHOST_ONLY),
        _ => return OriginCheck::reject(REASON_SCHEME),
    }

    if raw_authority(origin).contains('*') || host.to_string().contains('*') {
        return OriginCheck::reject(REASON_WILDCARD);
    }

    if !url.username().is_empty() || url.password().is_some() {
        return OriginCheck::reject(REASON_CREDENTIALS);
    }

    let path_ok = matches!(url.path(), "" | "/");
    if !path_ok || url.query().is_some() || url.fragment().is_some() {
        return OriginCheck::reject(REASON_PATH);
    }

    if let (Some(port), Some(default)) = (explicit_port(origin), default_port(url.scheme())) {
        if port == default {
            return OriginCheck::reject(REASON_DEFAULT_PORT);
        }
    }

    OriginCheck::ok()
}

/// Canonical `scheme://host[:port]` form: lowercased host, default port and
/// trailing slash removed. Unparseable input only has trailing slashes
/// stripped so that it still never compares equal to a valid origin.
pub fn normalize_origin(origin: &str) -> String {
    let trimmed = origin.trim();
    match Url::parse(trimmed) {
        Ok(url) => match url.host_str() {
            Some(host) => match url.port() {
                Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
                None => format!("{}://{}", url.scheme(), host),
            },
            None => trimmed.trim_end_matches('/').to_string(),
        },
        Err(_) => trimmed.trim_end_matches('/').to_string(),
    }
}

/// Validate a typed origin list (length bounds, per-entry rules, duplicates).
///
/// Duplicates are detected on normalized values, so `https://a.com` and
/// `https://A.com/` collide.
pub fn validate_origins<S: AsRef<str>>(origins: &[S]) -> OriginListCheck {
    if origins.is_empty() {
        return OriginListCheck::reject(None, REASON_EMPTY_LIST);
    }
    if origins.len() > MAX_ALLOWED_ORIGINS {
        return OriginListCheck::reject(None, REASON_TOO_MANY);
    }

    for origin in origins {
        let origin = origin.as_ref();
        let check = validate_origin(origin);
        if !check.valid {
            let reason = check.reason.unwrap_or_else(|| REASON_INVALID_URL.to_string());
            return OriginListCheck::reject(Some(origin), &reason);
        }
    }

    let mut seen = std::collections::HashSet::new();
    for origin in origins {
        let origin = origin.as_ref();
        if !seen.insert(normalize_origin(origin)) {
            return OriginListCheck::reject(Some(origin), REASON_DUPLICATE);
        }
    }

    OriginListCheck::ok()
}

/// Validate an untyped JSON value as an origin list, as received over HTTP.
pub fn validate_origins_value(value: &serde_json::Value) -> OriginListCheck {
    let items = match value.as_array() {
        Some(items) => items,
        None => return OriginListCheck::reject(None, REASON_NOT_ARRAY),
    };
    if items.is_empty() {
        return OriginListCheck::reject(None, REASON_EMPTY_LIST);
    }
    if items.len() > MAX_ALLOWED_ORIGINS {
        return OriginListCheck::reject(None, REASON_TOO_MANY);
    }
    let mut strings = Vec::with_capacity(items.len());
    for item in items {
        match item.as_str() {
            Some(s) => strings.push(s),
            None => return OriginListCheck::reject(Some(&item.to_string()), REASON_NOT_STRING),
        }
    }
    validate_origins(&strings)
}

// ---------------------------------------------------------------------------
// AllowedOrigin: a validated, normalized origin
// ---------------------------------------------------------------------------

/// An origin that passed [`validate_origin`], held in normalized form.
///
/// This is the only type accepted as a postMessage target, so a wildcard
/// target cannot be expressed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AllowedOrigin(String);

impl AllowedOrigin {
    pub fn parse(origin: &str) -> Result<Self, String> {
        let check = validate_origin(origin);
        if check.valid {
            Ok(Self(normalize_origin(origin)))
        } else {
            Err(check.reason.unwrap_or_else(|| REASON_INVALID_URL.to_string()))
        }
    }

    /// Origin of an arbitrary URL (e.g. a referrer with a path), if that
    /// origin is itself valid.
    pub fn from_url(raw: &str) -> Option<Self> {
        let url = Url::parse(raw).ok()?;
        let host = url.host_str()?;
        let origin = match url.port() {
            Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
            None => format!("{}://{}", url.scheme(), host),
        };
        Self::parse(&origin).ok()
    }

    /// True if `other`, once normalized, is exactly this origin.
    pub fn matches(&self, other: &str) -> bool {
        normalize_origin(other) == self.0
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_loopback(&self) -> bool {
        Url::parse(&self.0)
            .ok()
            .and_then(|u| u.host().map(|h| is_loopback_host(&h)))
            .unwrap_or(false)
    }
}

impl TryFrom<String> for AllowedOrigin {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        AllowedOrigin::parse(&value)
    }
}

impl From<AllowedOrigin> for String {
    fn from(o: AllowedOrigin) -> Self {
        o.0
    }
}

impl fmt::Display for AllowedOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// True for `localhost` and any `127.x.x.x` host.
pub fn is_loopback_hostname(host: &str) -> bool {
    host == "localhost"
        || host
            .parse::<Ipv4Addr>()
            .map(|ip| ip.octets()[0] == 127)
            .unwrap_or(false)
}
