use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{HandshakeError, HandshakeResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    #[default]
    Iframe,
    Popup,
}

impl TransportMode {
    /// Popup if the page has an opener or was asked for `mode=popup`.
    pub fn detect(has_opener: bool, requested: Option<TransportMode>) -> Self {
        if has_opener || requested == Some(TransportMode::Popup) {
            TransportMode::Popup
        } else {
            TransportMode::Iframe
        }
    }
}

/// Query parameters of the responder URL:
/// `?appId=..&scopes=a,b&origin=..&mode=popup`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponderParams {
    pub app_id: Option<String>,
    pub scopes: Vec<String>,
    pub origin: Option<String>,
    /// `Some(Popup)` only when `mode=popup` was present.
    pub mode: Option<TransportMode>,
}

impl ResponderParams {
    pub fn from_url(url: &Url) -> Self {
        let mut params = Self::default();
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "appId" => params.app_id = Some(value.into_owned()),
                "scopes" => {
                    params.scopes = value
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                }
                "origin" => params.origin = Some(value.into_owned()),
                "mode" if value == "popup" => params.mode = Some(TransportMode::Popup),
                _ => {}
            }
        }
        params
    }

    /// `base` with these parameters set as its query string.
    pub fn apply_to(&self, base: &str) -> HandshakeResult<Url> {
        let mut url = Url::parse(base)
            .map_err(|e| HandshakeError::InvalidParams(format!("responder url: {}", e)))?;
        {
            let mut query = url.query_pairs_mut();
            query.clear();
            if let Some(app_id) = &self.app_id {
                query.append_pair("appId", app_id);
            }
            if !self.scopes.is_empty() {
                query.append_pair("scopes", &self.scopes.join(","));
            }
            if let Some(origin) = &self.origin {
                query.append_pair("origin", origin);
            }
            if self.mode == Some(TransportMode::Popup) {
                query.append_pair("mode", "popup");
            }
        }
        if url.query() == Some("") {
            url.set_query(None);
        }
        Ok(url)
    }
}
