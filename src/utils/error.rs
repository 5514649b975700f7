//! The `error` module defines the error type used across `groupfeed`.
//!
//! Only configuration problems surface to callers. Everything that goes wrong
//! once a connection is running is logged by the worker and absorbed there.

use thiserror::Error;

use crate::stomp::FrameError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Configuration sources could not be read or deserialized.
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// A required configuration key has no value in any source.
    #[error("missing required setting `{0}`")]
    MissingSetting(&'static str),

    /// The endpoint URL could not be parsed.
    #[error("invalid endpoint url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// The endpoint URL uses a scheme no transport can serve.
    #[error("unsupported endpoint scheme `{0}`")]
    UnsupportedScheme(String),

    /// Websocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    /// A STOMP frame could not be decoded.
    #[error("stomp frame error: {0}")]
    Frame(#[from] FrameError),

    /// The broker answered with an `ERROR` frame.
    #[error("broker reported error: {message}")]
    Broker { message: String, details: String },

    /// The broker broke the expected connect/subscribe sequence.
    #[error("protocol error: {0}")]
    Protocol(String),
}
