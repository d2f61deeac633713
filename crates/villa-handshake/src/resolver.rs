//! Trusted target-origin resolution for the responder.
//!
//! Order: referrer origin, then the `origin` query parameter, then the local
//! fallback for loopback hosts. The first two only count if the origin is on
//! an allowlist; the caller-supplied value is never trusted on its own.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use villa_apps::AppRegistry;
use villa_core::{is_loopback_hostname, AllowedOrigin};

use crate::error::{HandshakeError, HandshakeResult};

pub const DEFAULT_VILLA_ORIGINS: &[&str] = &[
    "https://villa.cash",
    "https://www.villa.cash",
    "https://beta.villa.cash",
    "https://dev-1.villa.cash",
    "https://dev-2.villa.cash",
];

pub const DEFAULT_DEV_ORIGINS: &[&str] = &[
    "http://localhost:3000",
    "https://localhost:3000",
    "http://localhost:5173",
    "https://localhost:5173",
    "https://localhost",
];

pub const DEFAULT_LOCAL_FALLBACK: &str = "https://localhost";

/// Origins registered by third-party apps.
#[async_trait]
pub trait RegisteredOrigins: Send + Sync {
    async fn is_registered(&self, origin: &AllowedOrigin) -> HandshakeResult<bool>;
}

#[async_trait]
impl RegisteredOrigins for AppRegistry {
    async fn is_registered(&self, origin: &AllowedOrigin) -> HandshakeResult<bool> {
        self.is_registered_origin(origin.as_str())
            .await
            .map_err(|e| HandshakeError::Lookup(e.to_string()))
    }
}

/// A fixed set, for tests and deployments without an app registry.
#[derive(Debug, Clone, Default)]
pub struct StaticOrigins(pub Vec<AllowedOrigin>);

#[async_trait]
impl RegisteredOrigins for StaticOrigins {
    async fn is_registered(&self, origin: &AllowedOrigin) -> HandshakeResult<bool> {
        Ok(self.0.contains(origin))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OriginSource {
    Referrer,
    OriginParam,
    LocalFallback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub origin: AllowedOrigin,
    pub source: OriginSource,
}

/// What the responder page knows about how it was opened.
#[derive(Debug, Clone, Default)]
pub struct ResolveInput {
    pub referrer: Option<String>,
    pub origin_param: Option<String>,
    /// Host the responder itself is served from, with or without port.
    pub host: Option<String>,
}

pub struct OriginResolver {
    villa: Vec<AllowedOrigin>,
    dev: Vec<AllowedOrigin>,
    registered: Arc<dyn RegisteredOrigins>,
    local_fallback: AllowedOrigin,
}

fn parse_all<S: AsRef<str>>(origins: &[S]) -> HandshakeResult<Vec<AllowedOrigin>> {
    origins
        .iter()
        .map(|o| {
            AllowedOrigin::parse(o.as_ref())
                .map_err(|reason| HandshakeError::InvalidOrigin(format!("{}: {}", o.as_ref(), reason)))
        })
        .collect()
}

fn hostname_of(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    host.split(':').next().unwrap_or(host)
}

impl OriginResolver {
    pub fn new<S: AsRef<str>>(
        villa: &[S],
        dev: &[S],
        local_fallback: &str,
        registered: Arc<dyn RegisteredOrigins>,
    ) -> HandshakeResult<Self> {
        let local_fallback = AllowedOrigin::parse(local_fallback).map_err(|reason| {
            HandshakeError::InvalidOrigin(format!("{}: {}", local_fallback, reason))
        })?;
        Ok(Self {
            villa: parse_all(villa)?,
            dev: parse_all(dev)?,
            registered,
            local_fallback,
        })
    }

    /// Resolver with the built-in Villa and dev allowlists.
    pub fn with_defaults(registered: Arc<dyn RegisteredOrigins>) -> HandshakeResult<Self> {
        Self::new(
            DEFAULT_VILLA_ORIGINS,
            DEFAULT_DEV_ORIGINS,
            DEFAULT_LOCAL_FALLBACK,
            registered,
        )
    }

    /// True if `origin` is on the Villa, dev, or registered-apps allowlist.
    /// A failed registry lookup counts as not allowed.
    pub async fn is_allowed(&self, origin: &AllowedOrigin) -> bool {
        if self.villa.contains(origin) || self.dev.contains(origin) {
            return true;
        }
        match self.registered.is_registered(origin).await {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(origin = %origin, error = %e, "registered-origin lookup failed");
                false
            }
        }
    }

    pub async fn resolve(&self, input: &ResolveInput) -> Option<Resolution> {
        if let Some(origin) = input.referrer.as_deref().and_then(AllowedOrigin::from_url) {
            if self.is_allowed(&origin).await {
                return Some(Resolution {
                    origin,
                    source: OriginSource::Referrer,
                });
            }
            tracing::debug!(origin = %origin, "referrer origin not on any allowlist");
        }

        if let Some(raw) = input.origin_param.as_deref() {
            match AllowedOrigin::parse(raw) {
                Ok(origin) if self.is_allowed(&origin).await => {
                    return Some(Resolution {
                        origin,
                        source: OriginSource::OriginParam,
                    });
                }
                _ => tracing::debug!(origin = %raw, "origin parameter not trusted"),
            }
        }

        if input
            .host
            .as_deref()
            .is_some_and(|h| is_loopback_hostname(hostname_of(h)))
        {
            return Some(Resolution {
                origin: self.local_fallback.clone(),
                source: OriginSource::LocalFallback,
            });
        }

        None
    }
}
