//! Upgrade request checks
//!
//! Runs inside the WebSocket handshake, before any connection adapter exists:
//! path routing, the same-origin check, and identity resolution from cookies.

use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request};
use tokio_tungstenite::tungstenite::http::{header, StatusCode};

use crate::config::{BrokerConfig, IdentitySection};

/// Decides whether an upgrade request may proceed and who is connecting
#[derive(Debug, Clone)]
pub struct HandshakePolicy {
    path: String,
    identity: IdentitySection,
}

impl HandshakePolicy {
    pub fn from_config(config: &BrokerConfig) -> Self {
        Self {
            path: config.server.path.clone(),
            identity: config.identity.clone(),
        }
    }

    /// Validate the request and resolve the display identity
    pub fn accept(&self, request: &Request) -> Result<String, ErrorResponse> {
        if request.uri().path() != self.path {
            return Err(reject(StatusCode::NOT_FOUND, "Not Found"));
        }

        if !self.origin_allowed(request) {
            return Err(reject(StatusCode::FORBIDDEN, "Origin not allowed"));
        }

        match self.resolve_identity(request) {
            Some(identity) => Ok(identity),
            None if self.identity.require_identity => {
                Err(reject(StatusCode::UNAUTHORIZED, "Identity required"))
            }
            None => Ok(self.identity.anonymous_name.clone()),
        }
    }

    fn resolve_identity(&self, request: &Request) -> Option<String> {
        self.identity
            .cookie_names
            .iter()
            .find_map(|name| cookie_value(request, name))
    }

    /// Browsers always send `Origin` on WebSocket upgrades; non-browser
    /// clients usually don't, and are let through.
    fn origin_allowed(&self, request: &Request) -> bool {
        let Some(origin) = header_str(request, header::ORIGIN) else {
            return true;
        };
        let origin_host = origin_host(origin);

        if let Some(host) = header_str(request, header::HOST) {
            if origin_host.eq_ignore_ascii_case(host) {
                return true;
            }
        }

        self.identity
            .allowed_origins
            .iter()
            .any(|allowed| {
                allowed.eq_ignore_ascii_case(origin) || allowed.eq_ignore_ascii_case(origin_host)
            })
    }
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}

fn header_str(request: &Request, name: header::HeaderName) -> Option<&str> {
    request.headers().get(name).and_then(|v| v.to_str().ok())
}

/// `https://chat.example.com:8443/path` -> `chat.example.com:8443`
fn origin_host(origin: &str) -> &str {
    let rest = origin
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(origin);
    rest.split('/').next().unwrap_or(rest)
}

fn cookie_value(request: &Request, name: &str) -> Option<String> {
    request
        .headers()
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|line| line.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, value)| *key == name && !value.trim().is_empty())
        .map(|(_, value)| value.trim().trim_matches('"').to_string())
}
