//! Connect-time authentication.
//!
//! Resolves the session cookie carried on the upgrade request to a user.
//! A connection without a usable cookie is admitted anonymously; only a
//! session-store failure aborts the connection attempt.

use crate::store::{SessionStore, User};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::SystemTime;
use tokio_tungstenite::tungstenite::http::header::COOKIE;
use tokio_tungstenite::tungstenite::http::HeaderMap;
use tracing::{debug, info};
use vernite_proto::VerniteResult;

/// What the gateway keeps from the HTTP upgrade request.
#[derive(Debug, Clone)]
pub struct HandshakeRequest {
    pub headers: HeaderMap,
    pub peer_addr: SocketAddr,
    pub path: String,
}

impl HandshakeRequest {
    pub fn new(headers: HeaderMap, peer_addr: SocketAddr, path: impl Into<String>) -> Self {
        Self {
            headers,
            peer_addr,
            path: path.into(),
        }
    }

    /// First entry of the forwarded-for header, if present and non-empty.
    pub fn forwarded_for(&self, header: &str) -> Option<&str> {
        let value = self.headers.get(header)?.to_str().ok()?;
        let first = value.split(',').next()?.trim();
        (!first.is_empty()).then_some(first)
    }

    /// Address recorded on the connection: forwarded value, else `ip:port`.
    pub fn remote_address(&self, forwarded_header: &str) -> String {
        self.forwarded_for(forwarded_header)
            .map(str::to_string)
            .unwrap_or_else(|| self.peer_addr.to_string())
    }

    /// IP recorded on the login session: forwarded value, else the peer IP.
    pub fn client_ip(&self, forwarded_header: &str) -> String {
        self.forwarded_for(forwarded_header)
            .map(str::to_string)
            .unwrap_or_else(|| self.peer_addr.ip().to_string())
    }
}

/// Split one cookie header value into `(name, value)` pairs.
///
/// Proxies sometimes fold several cookie headers into one with commas, so
/// both `;` and `,` separate pairs. Surrounding quotes on a value are dropped.
pub fn parse_cookies(raw: &str) -> Vec<(&str, &str)> {
    raw.split([';', ','])
        .filter_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(value);
            Some((name, value))
        })
        .collect()
}

pub struct HandshakeAuthenticator {
    store: Arc<dyn SessionStore>,
    cookie_name: String,
    forwarded_header: String,
}

impl HandshakeAuthenticator {
    pub fn new(
        store: Arc<dyn SessionStore>,
        cookie_name: impl Into<String>,
        forwarded_header: impl Into<String>,
    ) -> Self {
        Self {
            store,
            cookie_name: cookie_name.into(),
            forwarded_header: forwarded_header.into().to_ascii_lowercase(),
        }
    }

    pub fn forwarded_header(&self) -> &str {
        &self.forwarded_header
    }

    /// Resolve the request's session cookie to a user.
    ///
    /// Every `Cookie` header occurrence is scanned. Each resolved session is
    /// touched (last-used time and client IP) and saved; the first one whose
    /// user is not deleted wins. Unknown tokens are skipped.
    pub async fn authenticate(&self, request: &HandshakeRequest) -> VerniteResult<Option<User>> {
        for header in request.headers.get_all(COOKIE) {
            let Ok(raw) = header.to_str() else {
                debug!(peer = %request.peer_addr, "non-ASCII cookie header ignored");
                continue;
            };
            for (name, token) in parse_cookies(raw) {
                if name != self.cookie_name {
                    continue;
                }
                let Some(mut record) = self.store.lookup(token).await? else {
                    debug!(peer = %request.peer_addr, "unknown session token");
                    continue;
                };

                record.last_used = SystemTime::now();
                record.ip = Some(request.client_ip(&self.forwarded_header));
                self.store.save(&record).await?;

                if record.user.deleted {
                    info!(user = %record.user, "session belongs to a deleted user, not attached");
                    continue;
                }
                info!(
                    user = %record.user,
                    remote = %request.remote_address(&self.forwarded_header),
                    "connection authenticated"
                );
                return Ok(Some(record.user));
            }
        }
        Ok(None)
    }
}
