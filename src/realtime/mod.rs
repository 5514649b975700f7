//! The `realtime` module is the subscriber itself.
//!
//! A [`RealtimeSubscriber`] opens a STOMP connection, subscribes to
//! [`GROUPS_TOPIC`] and hands every decoded payload to the caller, either
//! through a callback ([`RealtimeSubscriber::create_connection`]) or as a
//! stream ([`RealtimeSubscriber::subscribe`]).
//!
//! Each connection is driven by one background worker that owns the socket
//! and reconnects after a fixed delay when the link drops.

pub mod payload;
mod session;
pub mod subscriber;

pub use payload::{GroupChange, GroupChangeKind, decode_body, raw_payload};
pub use subscriber::{
    ConnectionHandle, ConnectionOptions, ConnectionState, DEFAULT_ENDPOINT,
    DEFAULT_HEARTBEAT_MS, DEFAULT_RECONNECT_DELAY, GROUPS_TOPIC, HandlerError, HandlerResult,
    RealtimeSubscriber, SubscriberConfig, Subscription,
};

#[cfg(test)]
mod tests;
