//! Websocket plumbing for STOMP frames.
//!
//! Every outbound frame is one text message. Inbound text and binary messages
//! are both decoded as STOMP; control messages carry no frames.

use std::sync::Once;

use futures_util::SinkExt;
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::debug;
use tungstenite::protocol::Message as WsMessage;

use crate::stomp::{Frame, FrameError, decode_frames};
use crate::transport::Endpoint;
use crate::utils::error::Result;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens the websocket to `endpoint`.
///
/// `wss` endpoints go through rustls with the webpki root store.
pub async fn open(endpoint: &Endpoint) -> Result<WsStream> {
    install_crypto_provider();
    debug!("STOMP opening websocket to {}", endpoint.socket_url());
    let (socket, _response) = connect_async(endpoint.socket_url().as_str()).await?;
    Ok(socket)
}

/// rustls needs a process-wide provider before the first TLS handshake. An
/// application that installed its own keeps it.
fn install_crypto_provider() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

pub async fn send_frame(socket: &mut WsStream, frame: &Frame) -> Result<()> {
    debug!("STOMP >>> {}", frame.command);
    socket.send(WsMessage::Text(frame.encode().into())).await?;
    Ok(())
}

/// Sends a heart-beat, which in STOMP is a lone end-of-line.
pub async fn send_heartbeat(socket: &mut WsStream) -> Result<()> {
    debug!("STOMP >>> heart-beat");
    socket.send(WsMessage::Text("\n".into())).await?;
    Ok(())
}

/// Decodes the frames carried by an inbound message.
///
/// Returns `None` for messages that cannot carry frames (ping, pong, close).
/// Otherwise there is one entry per frame, malformed ones included.
pub fn frames_from(message: &WsMessage) -> Option<Vec<std::result::Result<Frame, FrameError>>> {
    let frames = match message {
        WsMessage::Text(text) => decode_frames(text.as_str()),
        WsMessage::Binary(data) => decode_frames(&String::from_utf8_lossy(data)),
        _ => return None,
    };
    for frame in frames.iter().flatten() {
        debug!("STOMP <<< {}", frame.command);
    }
    Some(frames)
}

/// Closes the session politely: `DISCONNECT`, then a websocket close.
///
/// Failures are ignored, the peer may already be gone.
pub async fn disconnect(socket: &mut WsStream) {
    let frame = Frame::new(crate::stomp::Command::Disconnect);
    let _ = send_frame(socket, &frame).await;
    let _ = socket.close(None).await;
}
