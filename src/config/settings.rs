use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::realtime::{DEFAULT_ENDPOINT, DEFAULT_HEARTBEAT_MS, DEFAULT_RECONNECT_DELAY, SubscriberConfig};
use crate::stomp::Heartbeat;

/// Top-level configuration settings for the application.
///
/// Includes the HTTP API the front end talks to, the realtime websocket
/// endpoint and logging.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Settings {
    pub api: ApiSettings,
    pub websocket: WebSocketSettings,
    pub log: LogSettings,
}

/// Configuration for the HTTP API collaborator.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ApiSettings {
    pub base_url: String,
}

/// Configuration for the realtime connection.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct WebSocketSettings {
    pub url: String,
    pub reconnect_delay_ms: u64,
    pub heartbeat_outgoing_ms: u64,
    pub heartbeat_incoming_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Allows partial specification of settings. Missing optional values are
/// filled from defaults, missing required ones fail the load.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub api: Option<PartialApiSettings>,
    pub websocket: Option<PartialWebSocketSettings>,
    pub log: Option<PartialLogSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialApiSettings {
    pub base_url: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialWebSocketSettings {
    pub url: Option<String>,
    pub reconnect_delay_ms: Option<u64>,
    pub heartbeat_outgoing_ms: Option<u64>,
    pub heartbeat_incoming_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialLogSettings {
    pub level: Option<String>,
}

/// Provides default values for `Settings`.
///
/// `load_config` never falls back to the URL defaults; they serve callers that
/// build settings in code.
impl Default for Settings {
    fn default() -> Self {
        Self {
            api: ApiSettings {
                base_url: "http://localhost:8080/api".to_string(),
            },
            websocket: WebSocketSettings {
                url: DEFAULT_ENDPOINT.to_string(),
                reconnect_delay_ms: DEFAULT_RECONNECT_DELAY.as_millis() as u64,
                heartbeat_outgoing_ms: DEFAULT_HEARTBEAT_MS,
                heartbeat_incoming_ms: DEFAULT_HEARTBEAT_MS,
            },
            log: LogSettings {
                level: "info".to_string(),
            },
        }
    }
}

impl Settings {
    /// Subscriber settings derived from the websocket section.
    pub fn subscriber_config(&self) -> SubscriberConfig {
        SubscriberConfig {
            default_url: self.websocket.url.clone(),
            reconnect_delay: Duration::from_millis(self.websocket.reconnect_delay_ms),
            heartbeat: Heartbeat::from_millis(
                self.websocket.heartbeat_outgoing_ms,
                self.websocket.heartbeat_incoming_ms,
            ),
        }
    }
}
