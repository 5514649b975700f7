//! The `config` module loads the application settings.
//!
//! Sources are layered: an optional `config/default` file, then environment
//! variables prefixed with `GROUPFEED_` (nested keys joined by `__`, e.g.
//! `GROUPFEED_WEBSOCKET__URL`). The websocket URL and API base URL have no
//! defaults; loading fails if no source provides them.

mod settings;

use std::path::Path;

use config::{Config, Environment, File};

use crate::config::settings::PartialSettings;
use crate::utils::error::{Error, Result};

pub use settings::{ApiSettings, LogSettings, Settings, WebSocketSettings};

const DEFAULT_CONFIG_FILE: &str = "config/default";
const ENV_PREFIX: &str = "GROUPFEED";

/// Loads the configuration from the default file and environment variables.
pub fn load_config() -> Result<Settings> {
    load_config_from(Path::new(DEFAULT_CONFIG_FILE))
}

/// Loads the configuration using `file` (extension optional) as the file
/// source. A missing file is not an error.
pub fn load_config_from(file: &Path) -> Result<Settings> {
    let builder = Config::builder()
        .add_source(File::from(file).required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;
    let partial: PartialSettings = config.try_deserialize()?;
    merge(partial)
}

/// Merges partial settings with defaults, enforcing required keys.
fn merge(partial: PartialSettings) -> Result<Settings> {
    let default = Settings::default();
    let api = partial.api.unwrap_or_default();
    let websocket = partial.websocket.unwrap_or_default();
    let log = partial.log.unwrap_or_default();

    Ok(Settings {
        api: ApiSettings {
            base_url: required(api.base_url, "api.base_url")?,
        },
        websocket: WebSocketSettings {
            url: required(websocket.url, "websocket.url")?,
            reconnect_delay_ms: websocket
                .reconnect_delay_ms
                .unwrap_or(default.websocket.reconnect_delay_ms),
            heartbeat_outgoing_ms: websocket
                .heartbeat_outgoing_ms
                .unwrap_or(default.websocket.heartbeat_outgoing_ms),
            heartbeat_incoming_ms: websocket
                .heartbeat_incoming_ms
                .unwrap_or(default.websocket.heartbeat_incoming_ms),
        },
        log: LogSettings {
            level: log.level.unwrap_or(default.log.level),
        },
    })
}

fn required(value: Option<String>, key: &'static str) -> Result<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or(Error::MissingSetting(key))
}
