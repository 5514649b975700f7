use std::fmt;

use url::Url;

use crate::utils::error::{Error, Result};

/// Path segment a SockJS server exposes for plain websocket clients.
const SOCKJS_WEBSOCKET_PATH: &str = "websocket";

/// A resolved connection target.
///
/// Keeps the URL as it was configured next to the websocket URL actually
/// dialed, so callers can report the former while the transport uses the
/// latter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    configured: String,
    socket_url: Url,
}

impl Endpoint {
    /// Resolves a configured URL.
    ///
    /// `ws`/`wss` URLs are dialed as given. `http`/`https` URLs name a SockJS
    /// endpoint and are mapped to `ws`/`wss` with `/websocket` appended to the
    /// path.
    pub fn resolve(raw: &str) -> Result<Self> {
        let configured = raw.trim();
        let mut url = Url::parse(configured)?;

        match url.scheme() {
            "ws" | "wss" => {}
            "http" | "https" => {
                let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
                url.set_scheme(scheme)
                    .map_err(|_| Error::UnsupportedScheme(scheme.to_string()))?;
                let path = url.path().trim_end_matches('/').to_string();
                url.set_path(&format!("{path}/{SOCKJS_WEBSOCKET_PATH}"));
            }
            other => return Err(Error::UnsupportedScheme(other.to_string())),
        }

        if url.host_str().is_none() {
            return Err(Error::InvalidUrl(url::ParseError::EmptyHost));
        }

        Ok(Self {
            configured: configured.to_string(),
            socket_url: url,
        })
    }

    pub fn configured(&self) -> &str {
        &self.configured
    }

    pub fn socket_url(&self) -> &Url {
        &self.socket_url
    }

    /// Value for the `host` header of the STOMP `CONNECT` frame.
    pub fn host(&self) -> &str {
        self.socket_url.host_str().unwrap_or_default()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.configured)
    }
}
