//! The `transport` module is responsible for the network side of the
//! subscriber: turning a configured endpoint URL into a websocket target and
//! moving STOMP frames over that socket.
//!
//! SockJS endpoints are reached through their raw websocket entry point. The
//! HTTP polling fallbacks SockJS offers to browsers are not used.

pub mod endpoint;
pub mod websocket;

pub use endpoint::Endpoint;
pub use websocket::WsStream;
