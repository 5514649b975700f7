//! Connection worker.
//!
//! Runs connect, subscribe and deliver in a loop until shutdown is requested.
//! Every failure is logged here and followed by a reconnect after the
//! configured delay; nothing escapes to the caller.

use std::time::Duration;

use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::realtime::payload::decode_body;
use crate::realtime::subscriber::{ConnectionState, GROUPS_TOPIC};
use crate::stomp::{Command, Frame, FrameError, Heartbeat};
use crate::transport::{Endpoint, WsStream, websocket};
use crate::utils::error::{Error, Result};

const ACCEPT_VERSION: &str = "1.2,1.1,1.0";

/// Tick period for the heart-beat timer when outgoing heart-beats are off.
/// The branch is disabled in that case; the timer only needs a valid period.
const IDLE_TICK: Duration = Duration::from_secs(3600);

pub(crate) struct SessionSettings {
    pub endpoint: Endpoint,
    pub reconnect_delay: Duration,
    pub heartbeat: Heartbeat,
    pub subscription_id: String,
}

pub(crate) struct SessionChannels {
    pub inbound: mpsc::UnboundedSender<Value>,
    pub state: watch::Sender<ConnectionState>,
    pub shutdown: watch::Receiver<bool>,
}

impl SessionChannels {
    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }
}

enum SessionOutcome {
    /// The owner asked to stop, or stopped listening.
    Shutdown,
    /// The link went away without an error worth reporting.
    Dropped,
}

enum FrameFlow {
    Continue,
    ConsumerGone,
}

pub(crate) async fn run(settings: SessionSettings, mut channels: SessionChannels) {
    loop {
        if *channels.shutdown.borrow() {
            break;
        }
        channels.set_state(ConnectionState::Activating);

        match run_session(&settings, &mut channels).await {
            Ok(SessionOutcome::Shutdown) => break,
            Ok(SessionOutcome::Dropped) => {
                warn!(url = %settings.endpoint, "STOMP connection lost");
            }
            Err(err) => report(&err),
        }

        channels.set_state(ConnectionState::Erroring);
        if settings.reconnect_delay.is_zero() {
            info!(url = %settings.endpoint, "automatic reconnect disabled, staying inactive");
            break;
        }

        debug!(
            delay_ms = settings.reconnect_delay.as_millis() as u64,
            "STOMP reconnecting after delay"
        );
        tokio::select! {
            _ = tokio::time::sleep(settings.reconnect_delay) => {}
            _ = wait_for_shutdown(&mut channels.shutdown) => break,
        }
    }

    channels.set_state(ConnectionState::Inactive);
    debug!(url = %settings.endpoint, "STOMP worker stopped");
}

async fn run_session(
    settings: &SessionSettings,
    channels: &mut SessionChannels,
) -> Result<SessionOutcome> {
    let mut socket = tokio::select! {
        opened = websocket::open(&settings.endpoint) => opened?,
        _ = wait_for_shutdown(&mut channels.shutdown) => return Ok(SessionOutcome::Shutdown),
    };

    let connect = Frame::new(Command::Connect)
        .with_header("accept-version", ACCEPT_VERSION)
        .with_header("host", settings.endpoint.host())
        .with_header("heart-beat", settings.heartbeat.header_value());
    websocket::send_frame(&mut socket, &connect).await?;

    let (connected, backlog) = tokio::select! {
        connected = await_connected(&mut socket) => connected?,
        _ = wait_for_shutdown(&mut channels.shutdown) => {
            websocket::disconnect(&mut socket).await;
            return Ok(SessionOutcome::Shutdown);
        }
    };

    let server_heartbeat = connected
        .header("heart-beat")
        .and_then(Heartbeat::parse)
        .unwrap_or(Heartbeat::DISABLED);
    let agreed = Heartbeat::negotiate(settings.heartbeat, server_heartbeat);

    let subscribe = Frame::new(Command::Subscribe)
        .with_header("id", settings.subscription_id.as_str())
        .with_header("destination", GROUPS_TOPIC)
        .with_header("ack", "auto");
    websocket::send_frame(&mut socket, &subscribe).await?;

    channels.set_state(ConnectionState::Connected);
    info!(
        url = %settings.endpoint,
        version = connected.header("version").unwrap_or("1.0"),
        "STOMP connected, subscribed to {GROUPS_TOPIC}"
    );

    // Frames that shared a message with CONNECTED.
    for frame in backlog {
        if let FrameFlow::ConsumerGone = handle_frame(frame, settings, channels)? {
            websocket::disconnect(&mut socket).await;
            return Ok(SessionOutcome::Shutdown);
        }
    }

    let sends_heartbeats = !agreed.outgoing.is_zero();
    let expects_heartbeats = !agreed.incoming.is_zero();
    let mut pulse = tokio::time::interval_at(
        Instant::now() + agreed.outgoing,
        if sends_heartbeats { agreed.outgoing } else { IDLE_TICK },
    );
    pulse.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let liveness = agreed.incoming * 2;
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            _ = wait_for_shutdown(&mut channels.shutdown) => {
                websocket::disconnect(&mut socket).await;
                return Ok(SessionOutcome::Shutdown);
            }
            _ = pulse.tick(), if sends_heartbeats => {
                websocket::send_heartbeat(&mut socket).await?;
            }
            _ = tokio::time::sleep_until(last_seen + liveness), if expects_heartbeats => {
                warn!(
                    silent_ms = liveness.as_millis() as u64,
                    "STOMP peer silent past heart-beat window"
                );
                return Ok(SessionOutcome::Dropped);
            }
            inbound = socket.next() => {
                last_seen = Instant::now();
                let message = match inbound {
                    Some(Ok(WsMessage::Close(close))) => {
                        debug!(?close, "STOMP websocket closed by peer");
                        return Ok(SessionOutcome::Dropped);
                    }
                    Some(Ok(message)) => message,
                    Some(Err(err)) => return Err(err.into()),
                    None => return Ok(SessionOutcome::Dropped),
                };
                let Some(frames) = websocket::frames_from(&message) else {
                    continue;
                };
                for frame in well_formed(frames) {
                    if let FrameFlow::ConsumerGone = handle_frame(frame, settings, channels)? {
                        websocket::disconnect(&mut socket).await;
                        return Ok(SessionOutcome::Shutdown);
                    }
                }
            }
        }
    }
}

fn handle_frame(
    frame: Frame,
    settings: &SessionSettings,
    channels: &SessionChannels,
) -> Result<FrameFlow> {
    match frame.command {
        Command::Message => {
            if let Some(id) = frame.header("subscription") {
                if id != settings.subscription_id {
                    debug!(subscription = id, "ignoring MESSAGE for foreign subscription");
                    return Ok(FrameFlow::Continue);
                }
            }
            if channels.inbound.send(decode_body(&frame.body)).is_err() {
                return Ok(FrameFlow::ConsumerGone);
            }
        }
        Command::Error => return Err(broker_error(&frame)),
        Command::Receipt => {
            debug!(receipt = frame.header("receipt-id").unwrap_or_default(), "STOMP receipt");
        }
        other => debug!("ignoring unexpected {other} frame"),
    }
    Ok(FrameFlow::Continue)
}

/// Waits for `CONNECTED`, returning it with any frames that followed it in
/// the same message.
async fn await_connected(socket: &mut WsStream) -> Result<(Frame, Vec<Frame>)> {
    while let Some(message) = socket.next().await {
        let message = message?;
        if message.is_close() {
            break;
        }
        let Some(frames) = websocket::frames_from(&message) else {
            continue;
        };
        let mut frames = well_formed(frames).into_iter();
        if let Some(frame) = frames.next() {
            return match frame.command {
                Command::Connected => Ok((frame, frames.collect())),
                Command::Error => Err(broker_error(&frame)),
                other => Err(Error::Protocol(format!("expected CONNECTED, got {other}"))),
            };
        }
    }
    Err(Error::Protocol(
        "connection closed before CONNECTED".to_string(),
    ))
}

/// Drops malformed frames with a warning, keeping the rest in order.
fn well_formed(frames: Vec<std::result::Result<Frame, FrameError>>) -> Vec<Frame> {
    frames
        .into_iter()
        .filter_map(|frame| match frame {
            Ok(frame) => Some(frame),
            Err(err) => {
                warn!(error = %err, "skipping malformed STOMP frame");
                None
            }
        })
        .collect()
}

fn broker_error(frame: &Frame) -> Error {
    Error::Broker {
        message: frame.header("message").unwrap_or("unknown error").to_string(),
        details: frame.body.clone(),
    }
}

fn report(err: &Error) {
    match err {
        Error::Broker { message, details } => {
            error!("Broker reported error: {message}");
            error!("Details: {details}");
        }
        Error::WebSocket(err) => error!(error = %err, "WebSocket error"),
        other => error!(error = %other, "STOMP session failed"),
    }
}

/// Resolves once shutdown is requested or the owning handle is gone.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
