use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::Stream;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::error;
use uuid::Uuid;

use crate::realtime::session::{self, SessionChannels, SessionSettings};
use crate::stomp::Heartbeat;
use crate::transport::Endpoint;
use crate::utils::error::Result;

/// The one destination every connection subscribes to.
pub const GROUPS_TOPIC: &str = "/topic/groups";

/// Endpoint used by [`SubscriberConfig::default`].
pub const DEFAULT_ENDPOINT: &str = "https://localhost:8081/ws";

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(5000);

pub const DEFAULT_HEARTBEAT_MS: u64 = 10_000;

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;
pub type HandlerResult = std::result::Result<(), HandlerError>;

/// Subscriber-wide settings, fixed at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberConfig {
    /// URL dialed when a connection is created without one.
    pub default_url: String,
    /// Delay before reconnecting after a dropped link. Zero disables reconnects.
    pub reconnect_delay: Duration,
    /// Heart-beat intervals offered in `CONNECT`.
    pub heartbeat: Heartbeat,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            default_url: DEFAULT_ENDPOINT.to_string(),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            heartbeat: Heartbeat::from_millis(DEFAULT_HEARTBEAT_MS, DEFAULT_HEARTBEAT_MS),
        }
    }
}

/// Per-connection overrides. Unset fields fall back to the [`SubscriberConfig`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionOptions {
    pub url: Option<String>,
    pub reconnect_delay: Option<Duration>,
}

impl ConnectionOptions {
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = Some(delay);
        self
    }
}

/// Lifecycle of a connection as seen by its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Inactive,
    Activating,
    Connected,
    Erroring,
}

/// Creates connections to the group change feed.
#[derive(Debug, Clone, Default)]
pub struct RealtimeSubscriber {
    config: SubscriberConfig,
}

impl RealtimeSubscriber {
    pub fn new(config: SubscriberConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SubscriberConfig {
        &self.config
    }

    /// Starts a connection and returns its payloads as a stream.
    ///
    /// The connection is activated immediately on a background task, so this
    /// must be called from within a tokio runtime. Only an unusable URL is
    /// reported here; connection problems are logged and retried by the worker.
    pub fn subscribe(&self, options: ConnectionOptions) -> Result<Subscription> {
        let url = options.url.as_deref().unwrap_or(&self.config.default_url);
        let endpoint = Endpoint::resolve(url)?;
        let reconnect_delay = options
            .reconnect_delay
            .unwrap_or(self.config.reconnect_delay);

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Inactive);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let settings = SessionSettings {
            endpoint: endpoint.clone(),
            reconnect_delay,
            heartbeat: self.config.heartbeat,
            subscription_id: format!("sub-{}", Uuid::new_v4()),
        };
        let channels = SessionChannels {
            inbound: inbound_tx,
            state: state_tx,
            shutdown: shutdown_rx,
        };
        let worker = tokio::spawn(session::run(settings, channels));

        Ok(Subscription {
            receiver: inbound_rx,
            control: Control {
                endpoint,
                state: state_rx,
                shutdown: shutdown_tx,
                closed: Arc::new(AtomicBool::new(false)),
                worker: Some(worker),
            },
        })
    }

    /// Starts a connection that feeds every payload to `on_message`.
    ///
    /// `on_message` runs on a dedicated task, once per frame and in arrival
    /// order, never concurrently with itself. Errors it returns and panics it
    /// raises are logged; later frames are still delivered.
    pub fn create_connection<F>(
        &self,
        on_message: F,
        options: ConnectionOptions,
    ) -> Result<ConnectionHandle>
    where
        F: FnMut(Value) -> HandlerResult + Send + 'static,
    {
        let Subscription { receiver, control } = self.subscribe(options)?;
        let dispatcher = tokio::spawn(dispatch(receiver, control.closed.clone(), on_message));
        Ok(ConnectionHandle {
            control,
            dispatcher: Some(dispatcher),
        })
    }
}

/// Shared ownership of the worker behind a handle or subscription.
///
/// Dropping it requests shutdown.
#[derive(Debug)]
struct Control {
    endpoint: Endpoint,
    state: watch::Receiver<ConnectionState>,
    shutdown: watch::Sender<bool>,
    closed: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl Control {
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.shutdown.send_replace(true);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn join(&mut self) {
        if let Some(worker) = self.worker.take() {
            if let Err(err) = worker.await {
                error!(error = %err, "STOMP worker task failed");
            }
        }
    }
}

impl Drop for Control {
    fn drop(&mut self) {
        self.close();
    }
}

/// Caller-owned handle of a callback-driven connection.
#[derive(Debug)]
pub struct ConnectionHandle {
    control: Control,
    dispatcher: Option<JoinHandle<()>>,
}

impl ConnectionHandle {
    /// Stops delivery immediately and asks the worker to disconnect.
    pub fn close(&self) {
        self.control.close();
    }

    /// Like [`close`](Self::close), then waits for the worker to send
    /// `DISCONNECT` and for any in-flight callback to return.
    pub async fn deactivate(mut self) {
        self.control.close();
        self.control.join().await;
        if let Some(dispatcher) = self.dispatcher.take() {
            let _ = dispatcher.await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.control.is_closed()
    }

    pub fn state(&self) -> ConnectionState {
        *self.control.state.borrow()
    }

    /// Receiver that observes every state transition.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.control.state.clone()
    }

    /// The URL this connection was created with.
    pub fn url(&self) -> &str {
        self.control.endpoint.configured()
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.control.endpoint
    }
}

/// Stream of decoded payloads from one connection.
///
/// Ends once [`close`](Self::close) is called, dropping anything still
/// buffered.
#[derive(Debug)]
pub struct Subscription {
    receiver: mpsc::UnboundedReceiver<Value>,
    control: Control,
}

impl Subscription {
    pub async fn next_payload(&mut self) -> Option<Value> {
        if self.control.is_closed() {
            return None;
        }
        let payload = self.receiver.recv().await?;
        if self.control.is_closed() {
            return None;
        }
        Some(payload)
    }

    pub fn close(&mut self) {
        self.control.close();
        self.receiver.close();
    }

    pub async fn deactivate(mut self) {
        self.close();
        self.control.join().await;
    }

    pub fn is_closed(&self) -> bool {
        self.control.is_closed()
    }

    pub fn state(&self) -> ConnectionState {
        *self.control.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.control.state.clone()
    }

    pub fn url(&self) -> &str {
        self.control.endpoint.configured()
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.control.endpoint
    }

    /// Subscription fed by `receiver` with no worker behind it. `closed` is
    /// shared so a test can flip it the way a dispatcher clone would.
    #[cfg(test)]
    pub(crate) fn detached(
        endpoint: Endpoint,
        receiver: mpsc::UnboundedReceiver<Value>,
        closed: Arc<AtomicBool>,
    ) -> Self {
        let (_state_tx, state) = watch::channel(ConnectionState::Inactive);
        let (shutdown, _shutdown_rx) = watch::channel(false);
        Self {
            receiver,
            control: Control {
                endpoint,
                state,
                shutdown,
                closed,
                worker: None,
            },
        }
    }
}

impl Stream for Subscription {
    type Item = Value;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Value>> {
        if self.control.is_closed() {
            return Poll::Ready(None);
        }
        match self.receiver.poll_recv(cx) {
            Poll::Ready(Some(_)) if self.control.is_closed() => Poll::Ready(None),
            other => other,
        }
    }
}

async fn dispatch<F>(
    mut receiver: mpsc::UnboundedReceiver<Value>,
    closed: Arc<AtomicBool>,
    mut on_message: F,
) where
    F: FnMut(Value) -> HandlerResult + Send + 'static,
{
    while let Some(payload) = receiver.recv().await {
        if closed.load(Ordering::SeqCst) {
            break;
        }
        deliver(&mut on_message, payload);
    }
}

/// Runs the handler on one payload, absorbing errors and panics.
pub(crate) fn deliver<F>(on_message: &mut F, payload: Value)
where
    F: FnMut(Value) -> HandlerResult,
{
    match panic::catch_unwind(AssertUnwindSafe(|| on_message(payload))) {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!(error = %err, "onMessage handler error"),
        Err(panic) => error!(panic = panic_message(panic.as_ref()), "onMessage handler panicked"),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "non-string panic"
    }
}
