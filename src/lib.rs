//! # groupfeed
//!
//! `groupfeed` is a realtime subscriber for the study-group service. It keeps
//! a STOMP connection to the service's websocket endpoint, subscribes to the
//! `/topic/groups` broadcast and hands every decoded payload to the caller.
//!
//! ## Core Modules
//!
//! - `realtime`: The subscriber, its connection worker and payload decoding.
//! - `stomp`: STOMP frame model, text codec and heart-beat negotiation.
//! - `transport`: Endpoint resolution and websocket plumbing.
//! - `config`: Loads settings from files and environment variables.
//! - `utils`: Shared error type and logging setup.
//!
//! ## Example
//!
//! ```no_run
//! use groupfeed::{ConnectionOptions, RealtimeSubscriber, SubscriberConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), groupfeed::Error> {
//!     let subscriber = RealtimeSubscriber::new(SubscriberConfig::default());
//!     let handle = subscriber.create_connection(
//!         |payload| {
//!             println!("{payload}");
//!             Ok(())
//!         },
//!         ConnectionOptions::default(),
//!     )?;
//!
//!     tokio::signal::ctrl_c().await.ok();
//!     handle.deactivate().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod realtime;
pub mod stomp;
pub mod transport;
pub mod utils;

pub use realtime::{
    ConnectionHandle, ConnectionOptions, ConnectionState, GROUPS_TOPIC, GroupChange,
    GroupChangeKind, HandlerResult, RealtimeSubscriber, SubscriberConfig, Subscription,
};
pub use utils::error::{Error, Result};
