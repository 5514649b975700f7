use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_tungstenite::{WebSocketStream, accept_async};
use tungstenite::protocol::Message as WsMessage;

use super::payload::{GroupChange, GroupChangeKind, decode_body, raw_payload};
use super::subscriber::{
    ConnectionOptions, ConnectionState, GROUPS_TOPIC, HandlerResult, RealtimeSubscriber,
    SubscriberConfig, Subscription, deliver,
};
use crate::stomp::{Command, Frame, Heartbeat, decode_frames};
use crate::transport::Endpoint;
use crate::utils::error::Error;

const WAIT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(200);

/// In-process STOMP broker that accepts subscribers and hands each completed
/// connect/subscribe handshake to the test.
///
/// `CONNECTED` carries `heart_beat` and is followed, in the same websocket
/// message, by `trailer`.
struct MockBroker {
    url: String,
    sessions: mpsc::UnboundedReceiver<BrokerSession>,
}

impl MockBroker {
    async fn start() -> Self {
        Self::start_with("0,0", "").await
    }

    async fn start_with(heart_beat: &'static str, trailer: &'static str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind");
        let addr = listener.local_addr().expect("local_addr");
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let tx = tx.clone();
                tokio::spawn(async move {
                    if let Some(session) = BrokerSession::handshake(stream, heart_beat, trailer).await {
                        let _ = tx.send(session);
                    }
                });
            }
        });

        Self {
            url: format!("ws://{addr}/ws"),
            sessions: rx,
        }
    }

    async fn next_session(&mut self) -> BrokerSession {
        timeout(WAIT, self.sessions.recv())
            .await
            .expect("timed out waiting for a subscriber")
            .expect("broker stopped")
    }

    async fn assert_no_session(&mut self) {
        assert!(timeout(QUIET, self.sessions.recv()).await.is_err());
    }
}

struct BrokerSession {
    socket: WebSocketStream<TcpStream>,
    connect: Frame,
    subscribe: Frame,
    next_message_id: u32,
}

impl BrokerSession {
    async fn handshake(stream: TcpStream, heart_beat: &str, trailer: &str) -> Option<Self> {
        let mut socket = accept_async(stream).await.ok()?;
        let connect = read_frame(&mut socket).await?;
        let connected = Frame::new(Command::Connected)
            .with_header("version", "1.2")
            .with_header("heart-beat", heart_beat);
        send_raw(&mut socket, &format!("{}{trailer}", connected.encode())).await;
        let subscribe = read_frame(&mut socket).await?;
        Some(Self {
            socket,
            connect,
            subscribe,
            next_message_id: 0,
        })
    }

    fn subscription_id(&self) -> String {
        self.subscribe.header("id").unwrap_or_default().to_string()
    }

    async fn publish(&mut self, body: &str) {
        let subscription = self.subscription_id();
        self.publish_to(&subscription, body).await;
    }

    async fn publish_to(&mut self, subscription: &str, body: &str) {
        let frame = self.message(subscription, body);
        send_raw(&mut self.socket, &frame.encode()).await;
    }

    fn message(&mut self, subscription: &str, body: &str) -> Frame {
        self.next_message_id += 1;
        Frame::new(Command::Message)
            .with_header("destination", GROUPS_TOPIC)
            .with_header("subscription", subscription)
            .with_header("message-id", self.next_message_id.to_string())
            .with_body(body)
    }

    async fn fail(&mut self, message: &str, details: &str) {
        let frame = Frame::new(Command::Error)
            .with_header("message", message)
            .with_body(details);
        send_raw(&mut self.socket, &frame.encode()).await;
    }

    async fn next_frame(&mut self) -> Option<Frame> {
        timeout(WAIT, read_frame(&mut self.socket))
            .await
            .expect("timed out waiting for a frame")
    }

    /// Next text message exactly as sent, heart-beats included.
    async fn next_text(&mut self) -> Option<String> {
        let socket = &mut self.socket;
        timeout(WAIT, async move {
            while let Some(Ok(msg)) = socket.next().await {
                match msg {
                    WsMessage::Text(text) => return Some(text.as_str().to_string()),
                    WsMessage::Close(_) => return None,
                    _ => {}
                }
            }
            None
        })
        .await
        .expect("timed out waiting for a text message")
    }
}

async fn read_frame(socket: &mut WebSocketStream<TcpStream>) -> Option<Frame> {
    while let Some(Ok(msg)) = socket.next().await {
        if msg.is_close() {
            return None;
        }
        if let WsMessage::Text(text) = msg {
            // Heart-beat only messages decode to nothing.
            if let Some(frame) = decode_frames(text.as_str()).into_iter().next() {
                return frame.ok();
            }
        }
    }
    None
}

async fn send_raw(socket: &mut WebSocketStream<TcpStream>, text: &str) {
    // Sends may race with a subscriber that is already going away.
    let _ = socket.send(WsMessage::Text(text.to_string().into())).await;
}

fn subscriber_for(broker: &MockBroker) -> RealtimeSubscriber {
    RealtimeSubscriber::new(SubscriberConfig {
        default_url: broker.url.clone(),
        reconnect_delay: Duration::from_millis(50),
        ..SubscriberConfig::default()
    })
}

fn heartbeating_subscriber_for(broker: &MockBroker, heartbeat: Heartbeat) -> RealtimeSubscriber {
    RealtimeSubscriber::new(SubscriberConfig {
        default_url: broker.url.clone(),
        reconnect_delay: Duration::from_millis(50),
        heartbeat,
    })
}

fn collecting_handler() -> (
    impl FnMut(Value) -> HandlerResult + Send + 'static,
    mpsc::UnboundedReceiver<Value>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = move |payload: Value| -> HandlerResult {
        let _ = tx.send(payload);
        Ok(())
    };
    (handler, rx)
}

async fn recv_payload(rx: &mut mpsc::UnboundedReceiver<Value>) -> Value {
    timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for a payload")
        .expect("handler dropped")
}

async fn assert_quiet(rx: &mut mpsc::UnboundedReceiver<Value>) {
    match timeout(QUIET, rx.recv()).await {
        Err(_) | Ok(None) => {}
        Ok(Some(payload)) => panic!("Unexpected payload {payload}"),
    }
}

async fn wait_for_state(rx: &mut watch::Receiver<ConnectionState>, target: ConnectionState) {
    let reached = timeout(WAIT, rx.wait_for(|state| *state == target))
        .await
        .expect("timed out waiting for state")
        .is_ok();
    assert!(reached, "state channel closed before {target:?}");
}

#[test]
fn test_decode_body_parses_json() {
    assert_eq!(
        decode_body("{\"id\":1,\"name\":\"A\"}"),
        json!({"id": 1, "name": "A"})
    );
    assert_eq!(decode_body("[1,2]"), json!([1, 2]));
    assert_eq!(decode_body("\"text\""), json!("text"));
}

#[test]
fn test_decode_body_wraps_non_json() {
    assert_eq!(
        decode_body("not-json"),
        json!({"event": "raw", "body": "not-json"})
    );
    assert_eq!(decode_body(""), raw_payload(""));
}

#[test]
fn test_group_change_from_payload() {
    let change = GroupChange::from_payload(&json!({"event": "deleted", "id": 42})).unwrap();
    assert_eq!(change.kind, GroupChangeKind::Deleted);
    assert_eq!(change.id, 42);

    assert!(GroupChange::from_payload(&raw_payload("x")).is_none());
    assert!(GroupChange::from_payload(&json!({"event": "created"})).is_none());
}

#[test]
fn test_deliver_absorbs_errors_and_panics() {
    let mut seen = Vec::new();
    let mut handler = |payload: Value| -> HandlerResult {
        seen.push(payload.clone());
        match payload["n"].as_i64() {
            Some(1) => Err("handler refused".into()),
            Some(2) => panic!("handler blew up"),
            _ => Ok(()),
        }
    };
    deliver(&mut handler, json!({"n": 1}));
    deliver(&mut handler, json!({"n": 2}));
    deliver(&mut handler, json!({"n": 3}));
    assert_eq!(seen.len(), 3);
}

#[test]
fn test_default_config() {
    let config = SubscriberConfig::default();
    assert_eq!(config.default_url, "https://localhost:8081/ws");
    assert_eq!(config.reconnect_delay, Duration::from_millis(5000));
    assert_eq!(config.heartbeat, Heartbeat::from_millis(10_000, 10_000));
}

#[tokio::test]
async fn test_invalid_url_fails_at_creation() {
    let subscriber = RealtimeSubscriber::default();
    let (handler, _rx) = collecting_handler();
    let result =
        subscriber.create_connection(handler, ConnectionOptions::default().with_url("mailto:x"));
    assert!(matches!(result, Err(Error::UnsupportedScheme(_))));
}

#[tokio::test]
async fn test_connects_and_subscribes_to_groups_topic() {
    let mut broker = MockBroker::start().await;
    let subscriber = subscriber_for(&broker);
    let (handler, _rx) = collecting_handler();
    let handle = subscriber
        .create_connection(handler, ConnectionOptions::default())
        .unwrap();

    let session = broker.next_session().await;
    assert_eq!(session.connect.command, Command::Connect);
    assert!(session.connect.header("accept-version").unwrap().contains("1.2"));
    assert_eq!(session.connect.header("heart-beat"), Some("10000,10000"));
    assert_eq!(session.subscribe.command, Command::Subscribe);
    assert_eq!(session.subscribe.header("destination"), Some(GROUPS_TOPIC));
    assert_eq!(session.subscribe.header("ack"), Some("auto"));

    let mut state = handle.watch_state();
    wait_for_state(&mut state, ConnectionState::Connected).await;
    handle.deactivate().await;
}

#[tokio::test]
async fn test_default_url_is_used_when_none_given() {
    let mut broker = MockBroker::start().await;
    let subscriber = subscriber_for(&broker);
    let (handler, _rx) = collecting_handler();
    let handle = subscriber
        .create_connection(handler, ConnectionOptions::default())
        .unwrap();

    assert_eq!(handle.url(), broker.url);
    broker.next_session().await;
    handle.deactivate().await;
}

#[tokio::test]
async fn test_url_option_overrides_default() {
    let mut broker = MockBroker::start().await;
    let subscriber = RealtimeSubscriber::new(SubscriberConfig {
        default_url: "ws://127.0.0.1:1/unused".to_string(),
        ..SubscriberConfig::default()
    });
    let (handler, _rx) = collecting_handler();
    let handle = subscriber
        .create_connection(handler, ConnectionOptions::default().with_url(&broker.url))
        .unwrap();

    assert_eq!(handle.url(), broker.url);
    broker.next_session().await;
    handle.deactivate().await;
}

#[tokio::test]
async fn test_json_frame_is_delivered_as_parsed_value() {
    let mut broker = MockBroker::start().await;
    let (handler, mut rx) = collecting_handler();
    let handle = subscriber_for(&broker)
        .create_connection(handler, ConnectionOptions::default())
        .unwrap();

    let mut session = broker.next_session().await;
    session.publish("{\"id\":1,\"name\":\"A\"}").await;

    assert_eq!(recv_payload(&mut rx).await, json!({"id": 1, "name": "A"}));
    handle.deactivate().await;
}

#[tokio::test]
async fn test_non_json_frame_is_delivered_as_raw_wrapper() {
    let mut broker = MockBroker::start().await;
    let (handler, mut rx) = collecting_handler();
    let handle = subscriber_for(&broker)
        .create_connection(handler, ConnectionOptions::default())
        .unwrap();

    let mut session = broker.next_session().await;
    session.publish("not-json").await;

    assert_eq!(
        recv_payload(&mut rx).await,
        json!({"event": "raw", "body": "not-json"})
    );
    handle.deactivate().await;
}

#[tokio::test]
async fn test_every_frame_delivered_once_in_order() {
    let mut broker = MockBroker::start().await;
    let (handler, mut rx) = collecting_handler();
    let handle = subscriber_for(&broker)
        .create_connection(handler, ConnectionOptions::default())
        .unwrap();

    let mut session = broker.next_session().await;
    for id in 0..50 {
        session
            .publish(&json!({"event": "updated", "id": id}).to_string())
            .await;
    }

    for id in 0..50 {
        let payload = recv_payload(&mut rx).await;
        assert_eq!(payload["id"], id);
    }
    assert_quiet(&mut rx).await;
    handle.deactivate().await;
}

#[tokio::test]
async fn test_handler_failure_does_not_stop_delivery() {
    let mut broker = MockBroker::start().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut calls = 0;
    let handler = move |payload: Value| -> HandlerResult {
        calls += 1;
        let _ = tx.send(payload);
        match calls {
            1 => Err("first frame rejected".into()),
            2 => panic!("second frame panicked"),
            _ => Ok(()),
        }
    };
    let handle = subscriber_for(&broker)
        .create_connection(handler, ConnectionOptions::default())
        .unwrap();

    let mut session = broker.next_session().await;
    session.publish("{\"n\":1}").await;
    session.publish("{\"n\":2}").await;
    session.publish("{\"n\":3}").await;

    assert_eq!(recv_payload(&mut rx).await, json!({"n": 1}));
    assert_eq!(recv_payload(&mut rx).await, json!({"n": 2}));
    assert_eq!(recv_payload(&mut rx).await, json!({"n": 3}));
    assert_eq!(handle.state(), ConnectionState::Connected);
    handle.deactivate().await;
}

#[tokio::test]
async fn test_no_delivery_after_close() {
    let mut broker = MockBroker::start().await;
    let (handler, mut rx) = collecting_handler();
    let handle = subscriber_for(&broker)
        .create_connection(handler, ConnectionOptions::default())
        .unwrap();

    let mut session = broker.next_session().await;
    session.publish("{\"before\":true}").await;
    assert_eq!(recv_payload(&mut rx).await, json!({"before": true}));

    handle.close();
    assert!(handle.is_closed());
    session.publish("{\"after\":true}").await;
    assert_quiet(&mut rx).await;
    handle.deactivate().await;
}

#[tokio::test]
async fn test_deactivate_sends_disconnect_and_does_not_reconnect() {
    let mut broker = MockBroker::start().await;
    let (handler, _rx) = collecting_handler();
    let handle = subscriber_for(&broker)
        .create_connection(handler, ConnectionOptions::default())
        .unwrap();

    let mut session = broker.next_session().await;
    let mut state = handle.watch_state();
    wait_for_state(&mut state, ConnectionState::Connected).await;

    handle.deactivate().await;
    let frame = session.next_frame().await.expect("expected DISCONNECT");
    assert_eq!(frame.command, Command::Disconnect);
    assert_eq!(*state.borrow(), ConnectionState::Inactive);
    broker.assert_no_session().await;
}

#[tokio::test]
async fn test_reconnects_after_broker_error() {
    let mut broker = MockBroker::start().await;
    let (handler, mut rx) = collecting_handler();
    let handle = subscriber_for(&broker)
        .create_connection(handler, ConnectionOptions::default())
        .unwrap();

    let mut first = broker.next_session().await;
    first.fail("boom", "broker exploded").await;

    let mut second = broker.next_session().await;
    assert_eq!(second.subscribe.header("destination"), Some(GROUPS_TOPIC));
    second.publish("{\"event\":\"created\",\"id\":7}").await;
    assert_eq!(
        recv_payload(&mut rx).await,
        json!({"event": "created", "id": 7})
    );
    handle.deactivate().await;
}

#[tokio::test]
async fn test_reconnects_after_dropped_connection() {
    let mut broker = MockBroker::start().await;
    let (handler, mut rx) = collecting_handler();
    let handle = subscriber_for(&broker)
        .create_connection(handler, ConnectionOptions::default())
        .unwrap();

    let first = broker.next_session().await;
    drop(first);

    let mut second = broker.next_session().await;
    second.publish("\"back\"").await;
    assert_eq!(recv_payload(&mut rx).await, json!("back"));
    handle.deactivate().await;
}

#[tokio::test]
async fn test_zero_reconnect_delay_disables_reconnect() {
    let mut broker = MockBroker::start().await;
    let (handler, _rx) = collecting_handler();
    let handle = subscriber_for(&broker)
        .create_connection(
            handler,
            ConnectionOptions::default().with_reconnect_delay(Duration::ZERO),
        )
        .unwrap();

    let first = broker.next_session().await;
    let mut state = handle.watch_state();
    wait_for_state(&mut state, ConnectionState::Connected).await;

    drop(first);
    wait_for_state(&mut state, ConnectionState::Inactive).await;
    broker.assert_no_session().await;
    handle.deactivate().await;
}

#[tokio::test]
async fn test_foreign_subscription_and_malformed_frames_are_skipped() {
    let mut broker = MockBroker::start().await;
    let (handler, mut rx) = collecting_handler();
    let handle = subscriber_for(&broker)
        .create_connection(handler, ConnectionOptions::default())
        .unwrap();

    let mut session = broker.next_session().await;
    session.publish_to("someone-else", "{\"skip\":true}").await;
    send_raw(&mut session.socket, "GARBAGE\n\n\0").await;
    send_raw(&mut session.socket, "\n").await;
    session.publish("{\"kept\":true}").await;

    assert_eq!(recv_payload(&mut rx).await, json!({"kept": true}));
    assert_quiet(&mut rx).await;
    assert_eq!(handle.state(), ConnectionState::Connected);
    handle.deactivate().await;
}

#[tokio::test]
async fn test_malformed_frame_in_batch_keeps_its_neighbours() {
    let mut broker = MockBroker::start().await;
    let (handler, mut rx) = collecting_handler();
    let handle = subscriber_for(&broker)
        .create_connection(handler, ConnectionOptions::default())
        .unwrap();

    let mut session = broker.next_session().await;
    let subscription = session.subscription_id();
    let before = session.message(&subscription, "{\"seq\":1}").encode();
    let after = session.message(&subscription, "{\"seq\":2}").encode();
    let batch = format!("{before}GARBAGE\n\n\0{after}");
    send_raw(&mut session.socket, &batch).await;

    assert_eq!(recv_payload(&mut rx).await, json!({"seq": 1}));
    assert_eq!(recv_payload(&mut rx).await, json!({"seq": 2}));
    assert_quiet(&mut rx).await;
    assert_eq!(handle.state(), ConnectionState::Connected);
    handle.deactivate().await;
}

#[tokio::test]
async fn test_frames_batched_with_connected_are_delivered() {
    let mut broker = MockBroker::start_with(
        "0,0",
        "MESSAGE\ndestination:/topic/groups\nmessage-id:0\n\n{\"early\":true}\0",
    )
    .await;
    let (handler, mut rx) = collecting_handler();
    let handle = subscriber_for(&broker)
        .create_connection(handler, ConnectionOptions::default())
        .unwrap();

    let mut session = broker.next_session().await;
    assert_eq!(recv_payload(&mut rx).await, json!({"early": true}));

    session.publish("{\"late\":true}").await;
    assert_eq!(recv_payload(&mut rx).await, json!({"late": true}));
    handle.deactivate().await;
}

#[tokio::test]
async fn test_sends_heartbeats_at_negotiated_interval() {
    let mut broker = MockBroker::start_with("0,50", "").await;
    let (handler, _rx) = collecting_handler();
    let handle = heartbeating_subscriber_for(&broker, Heartbeat::from_millis(50, 0))
        .create_connection(handler, ConnectionOptions::default())
        .unwrap();

    let mut session = broker.next_session().await;
    assert_eq!(session.connect.header("heart-beat"), Some("50,0"));
    for _ in 0..2 {
        assert_eq!(session.next_text().await.as_deref(), Some("\n"));
    }
    handle.deactivate().await;
}

#[tokio::test]
async fn test_silent_broker_triggers_reconnect() {
    let mut broker = MockBroker::start_with("50,0", "").await;
    let (handler, mut rx) = collecting_handler();
    let handle = heartbeating_subscriber_for(&broker, Heartbeat::from_millis(0, 50))
        .create_connection(handler, ConnectionOptions::default())
        .unwrap();

    // Kept open but never written to.
    let _silent = broker.next_session().await;

    let mut second = broker.next_session().await;
    second.publish("\"alive\"").await;
    assert_eq!(recv_payload(&mut rx).await, json!("alive"));
    handle.deactivate().await;
}

#[tokio::test]
async fn test_stream_drops_payload_that_arrives_after_close() {
    let (tx, rx) = mpsc::unbounded_channel();
    let closed = Arc::new(AtomicBool::new(false));
    let endpoint = Endpoint::resolve("ws://127.0.0.1:1/ws").unwrap();
    let mut subscription = Subscription::detached(endpoint, rx, closed.clone());

    tx.send(json!({"seq": 1})).unwrap();
    assert_eq!(subscription.next().await, Some(json!({"seq": 1})));

    // Closed through a shared flag, so the payload is still in the channel.
    tx.send(json!({"seq": 2})).unwrap();
    closed.store(true, Ordering::SeqCst);
    assert_eq!(subscription.next().await, None);
    assert_eq!(subscription.next_payload().await, None);
    assert!(subscription.is_closed());
}

#[tokio::test]
async fn test_subscription_stream_yields_payloads_until_closed() {
    let mut broker = MockBroker::start().await;
    let mut subscription = subscriber_for(&broker)
        .subscribe(ConnectionOptions::default())
        .unwrap();

    let mut session = broker.next_session().await;
    session.publish("{\"seq\":1}").await;
    session.publish("oops").await;
    session.publish("{\"seq\":3}").await;

    let first = timeout(WAIT, subscription.next()).await.unwrap();
    assert_eq!(first, Some(json!({"seq": 1})));
    let second = timeout(WAIT, subscription.next_payload()).await.unwrap();
    assert_eq!(second, Some(json!({"event": "raw", "body": "oops"})));

    // The third payload may already be buffered; closing discards it.
    subscription.close();
    assert!(subscription.is_closed());
    assert_eq!(subscription.next().await, None);
    assert_eq!(subscription.next_payload().await, None);

    let frame = session.next_frame().await.expect("expected DISCONNECT");
    assert_eq!(frame.command, Command::Disconnect);
    subscription.deactivate().await;
}

#[tokio::test]
async fn test_dropping_subscription_stops_worker() {
    let mut broker = MockBroker::start().await;
    let subscription = subscriber_for(&broker)
        .subscribe(ConnectionOptions::default())
        .unwrap();

    let mut session = broker.next_session().await;
    let mut state = subscription.watch_state();
    wait_for_state(&mut state, ConnectionState::Connected).await;

    drop(subscription);
    let frame = session.next_frame().await.expect("expected DISCONNECT");
    assert_eq!(frame.command, Command::Disconnect);
    broker.assert_no_session().await;
}
