//! The `stomp` module implements the subset of STOMP 1.2 the subscriber
//! speaks over the websocket: the frame model, its text encoding and
//! heart-beat negotiation.
//!
//! Frames travel as websocket text messages. A single message may carry more
//! than one frame, and heart-beats arrive as bare end-of-line characters
//! between frames.

pub mod frame;
pub mod heartbeat;

pub use frame::{Command, Frame, FrameError, decode_frames};
pub use heartbeat::Heartbeat;
