//! # Hosted Change Feed (Phoenix channels)
//!
//! Provider for the hosted realtime service. One WebSocket carries every
//! channel; each channel is a Phoenix topic `realtime:{channel name}`.
//!
//! Frames are JSON objects `{ topic, event, payload, ref, join_ref }`:
//! - `phx_join` / `phx_leave` open and close a channel
//! - `phx_reply` answers a join (status `ok` or `error`)
//! - `postgres_changes` carries `payload.data` = one row change
//! - `phx_error` / `phx_close` / `system` report channel state
//! - `heartbeat` on topic `phoenix` keeps the socket alive
//!
//! The adapter does not reconnect. When the socket drops, every open
//! channel is told `Errored` and stays that way until its owner resubscribes.

use std::collections::HashMap;
use std::fmt::Display;
use std::time::Duration;

use futures_util::{Sink, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use crate::config::ProviderConfig;
use crate::observability::{log_event, Event};

use super::errors::{RealtimeError, RealtimeResult};
use super::event::ChangeEvent;
use super::provider::{ChangeFeedProvider, ChannelHandle, ChannelSink, ChannelSpec, ChannelStatus};

const PHOENIX_TOPIC: &str = "phoenix";
const PHX_JOIN: &str = "phx_join";
const PHX_LEAVE: &str = "phx_leave";
const PHX_REPLY: &str = "phx_reply";
const PHX_ERROR: &str = "phx_error";
const PHX_CLOSE: &str = "phx_close";
const HEARTBEAT: &str = "heartbeat";
const POSTGRES_CHANGES: &str = "postgres_changes";
const SYSTEM: &str = "system";

/// How often pending joins are checked against their deadline
const JOIN_SWEEP_INTERVAL: Duration = Duration::from_millis(500);

type FeedSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One Phoenix frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhoenixMessage {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub msg_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_ref: Option<String>,
}

impl PhoenixMessage {
    fn new(topic: &str, event: &str, payload: Value, msg_ref: String) -> Self {
        Self {
            topic: topic.to_string(),
            event: event.to_string(),
            payload,
            msg_ref: Some(msg_ref),
            join_ref: None,
        }
    }

    fn with_join_ref(mut self, join_ref: &str) -> Self {
        self.join_ref = Some(join_ref.to_string());
        self
    }
}

/// Phoenix topic of a channel
pub fn topic_for(spec: &ChannelSpec) -> String {
    format!("realtime:{}", spec.name)
}

/// `phx_join` payload subscribing to the channel's row changes
pub fn join_payload(spec: &ChannelSpec, access_token: &str) -> Value {
    let change = |event: &str| {
        json!({
            "event": event,
            "schema": spec.schema,
            "table": spec.table,
            "filter": spec.filter,
        })
    };

    let postgres_changes: Vec<Value> = if spec.kinds.is_all() {
        vec![change("*")]
    } else {
        spec.kinds.iter().map(|k| change(k.wire_name())).collect()
    };

    json!({
        "config": {
            "broadcast": { "ack": false, "self": false },
            "presence": { "key": "" },
            "postgres_changes": postgres_changes,
            "private": false,
        },
        "access_token": access_token,
    })
}

/// What an inbound frame means for its channel
#[derive(Debug, PartialEq)]
enum Inbound {
    JoinReply {
        reply_ref: Option<String>,
        result: Result<(), String>,
    },
    Change(ChangeEvent),
    Status(ChannelStatus),
    Invalid(String),
    Ignore,
}

fn interpret(message: &PhoenixMessage) -> Inbound {
    match message.event.as_str() {
        PHX_REPLY => {
            let ok = message.payload.get("status").and_then(Value::as_str) == Some("ok");
            let result = if ok {
                Ok(())
            } else {
                Err(message
                    .payload
                    .pointer("/response/reason")
                    .and_then(Value::as_str)
                    .unwrap_or("join refused")
                    .to_string())
            };
            Inbound::JoinReply {
                reply_ref: message.msg_ref.clone(),
                result,
            }
        }
        POSTGRES_CHANGES => match message.payload.get("data") {
            Some(data) => match ChangeEvent::from_change_data(data) {
                Ok(event) => Inbound::Change(event),
                Err(err) => Inbound::Invalid(err.to_string()),
            },
            None => Inbound::Invalid("postgres_changes without data".into()),
        },
        PHX_ERROR => Inbound::Status(ChannelStatus::Errored("channel error".into())),
        PHX_CLOSE => Inbound::Status(ChannelStatus::Closed),
        SYSTEM => {
            if message.payload.get("status").and_then(Value::as_str) == Some("error") {
                let reason = message
                    .payload
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("system error")
                    .to_string();
                Inbound::Status(ChannelStatus::Errored(reason))
            } else {
                Inbound::Ignore
            }
        }
        _ => Inbound::Ignore,
    }
}

enum Command {
    Join {
        topic: String,
        payload: Value,
        sink: ChannelSink,
    },
    Leave {
        topic: String,
    },
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum JoinState {
    Pending(Instant),
    Joined,
    Failed,
}

struct JoinedChannel {
    sink: ChannelSink,
    join_ref: String,
    state: JoinState,
}

/// Connection task state
struct Connection {
    connection_id: String,
    channels: HashMap<String, JoinedChannel>,
    next_ref: u64,
    heartbeat_interval: Duration,
    join_timeout: Duration,
}

impl Connection {
    fn next_ref(&mut self) -> String {
        self.next_ref += 1;
        self.next_ref.to_string()
    }

    async fn run(mut self, socket: FeedSocket, mut commands: mpsc::UnboundedReceiver<Command>) {
        let (mut ws_sender, mut ws_receiver) = socket.split();

        let mut heartbeat = tokio::time::interval_at(
            Instant::now() + self.heartbeat_interval,
            self.heartbeat_interval,
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweep = tokio::time::interval(JOIN_SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let lost: Option<String> = loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Join { topic, payload, sink }) => {
                        let join_ref = self.next_ref();
                        let frame = PhoenixMessage::new(&topic, PHX_JOIN, payload, join_ref.clone())
                            .with_join_ref(&join_ref);
                        if let Err(e) = send_frame(&mut ws_sender, &frame).await {
                            sink.status(ChannelStatus::Errored(e.clone()));
                            break Some(e);
                        }
                        self.channels.insert(topic, JoinedChannel {
                            sink,
                            join_ref,
                            state: JoinState::Pending(Instant::now() + self.join_timeout),
                        });
                    }
                    Some(Command::Leave { topic }) => {
                        if let Some(channel) = self.channels.remove(&topic) {
                            let msg_ref = self.next_ref();
                            let frame = PhoenixMessage::new(&topic, PHX_LEAVE, json!({}), msg_ref)
                                .with_join_ref(&channel.join_ref);
                            if let Err(e) = send_frame(&mut ws_sender, &frame).await {
                                break Some(e);
                            }
                        }
                    }
                    Some(Command::Shutdown) | None => {
                        let _ = ws_sender.send(Message::Close(None)).await;
                        break None;
                    }
                },

                message = ws_receiver.next() => match message {
                    Some(Ok(Message::Text(text))) => self.handle_text(&text),
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = ws_sender.send(Message::Pong(data)).await {
                            break Some(e.to_string());
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        break Some("connection closed by server".to_string());
                    }
                    Some(Err(e)) => break Some(e.to_string()),
                    Some(Ok(_)) => {}
                },

                _ = heartbeat.tick() => {
                    let msg_ref = self.next_ref();
                    let frame = PhoenixMessage::new(PHOENIX_TOPIC, HEARTBEAT, json!({}), msg_ref);
                    if let Err(e) = send_frame(&mut ws_sender, &frame).await {
                        break Some(e);
                    }
                    log_event(Event::FeedHeartbeat, &[("connection", self.connection_id.as_str())]);
                }

                _ = sweep.tick() => self.expire_joins(Instant::now()),
            }
        };

        let reason = lost.unwrap_or_else(|| "shutdown".to_string());
        log_event(
            Event::FeedDisconnected,
            &[
                ("connection", self.connection_id.as_str()),
                ("reason", reason.as_str()),
            ],
        );
        for channel in self.channels.values() {
            channel
                .sink
                .status(ChannelStatus::Errored(format!("connection lost: {}", reason)));
        }
    }

    fn handle_text(&mut self, text: &str) {
        let message: PhoenixMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                let reason = e.to_string();
                log_event(
                    Event::FeedInvalidMessage,
                    &[
                        ("connection", self.connection_id.as_str()),
                        ("reason", reason.as_str()),
                    ],
                );
                return;
            }
        };

        // Heartbeat replies
        if message.topic == PHOENIX_TOPIC {
            return;
        }
        let Some(channel) = self.channels.get_mut(&message.topic) else {
            return;
        };

        match interpret(&message) {
            Inbound::JoinReply { reply_ref, result } => {
                let answers_join = reply_ref.as_deref() == Some(channel.join_ref.as_str());
                if !answers_join || !matches!(channel.state, JoinState::Pending(_)) {
                    return;
                }
                match result {
                    Ok(()) => {
                        channel.state = JoinState::Joined;
                        channel.sink.status(ChannelStatus::Subscribed);
                    }
                    Err(reason) => {
                        channel.state = JoinState::Failed;
                        channel.sink.status(ChannelStatus::Errored(reason));
                    }
                }
            }
            Inbound::Change(event) => channel.sink.event(event),
            Inbound::Status(status) => {
                if status.is_failure() {
                    channel.state = JoinState::Failed;
                }
                channel.sink.status(status);
            }
            Inbound::Invalid(reason) => log_event(
                Event::FeedInvalidMessage,
                &[
                    ("reason", reason.as_str()),
                    ("topic", message.topic.as_str()),
                ],
            ),
            Inbound::Ignore => {}
        }
    }

    fn expire_joins(&mut self, now: Instant) {
        for channel in self.channels.values_mut() {
            if let JoinState::Pending(deadline) = channel.state {
                if now >= deadline {
                    channel.state = JoinState::Failed;
                    channel.sink.status(ChannelStatus::TimedOut);
                }
            }
        }
    }
}

async fn send_frame<S>(sender: &mut S, frame: &PhoenixMessage) -> Result<(), String>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let text = serde_json::to_string(frame).map_err(|e| e.to_string())?;
    sender
        .send(Message::Text(text))
        .await
        .map_err(|e| e.to_string())
}

/// Provider backed by the hosted realtime service
#[derive(Debug)]
pub struct PhoenixFeed {
    commands: mpsc::UnboundedSender<Command>,
    connection_id: String,
    access_token: String,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Join { topic, .. } => write!(f, "Join({})", topic),
            Command::Leave { topic } => write!(f, "Leave({})", topic),
            Command::Shutdown => write!(f, "Shutdown"),
        }
    }
}

impl PhoenixFeed {
    /// Connect to the hosted feed and start the connection task
    pub async fn connect(config: &ProviderConfig) -> RealtimeResult<Self> {
        let url = config.websocket_url()?;
        let access_token = config.api_key.clone().unwrap_or_default();

        let (socket, _response) = connect_async(url.as_str()).await.map_err(|e| {
            RealtimeError::ConnectionError(format!("WebSocket connect failed: {}", e))
        })?;

        let connection_id = Uuid::new_v4().to_string();
        log_event(
            Event::FeedConnected,
            &[
                ("connection", connection_id.as_str()),
                ("endpoint", config.endpoint.as_str()),
            ],
        );

        let (commands, receiver) = mpsc::unbounded_channel();
        let connection = Connection {
            connection_id: connection_id.clone(),
            channels: HashMap::new(),
            next_ref: 0,
            heartbeat_interval: config.heartbeat_interval(),
            join_timeout: config.join_timeout(),
        };
        tokio::spawn(connection.run(socket, receiver));

        Ok(Self {
            commands,
            connection_id,
            access_token,
        })
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Whether the connection task is still running
    pub fn is_connected(&self) -> bool {
        !self.commands.is_closed()
    }

    /// Close the socket. Open channels are reported as errored.
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

impl ChangeFeedProvider for PhoenixFeed {
    fn open(&self, spec: &ChannelSpec, sink: ChannelSink) -> RealtimeResult<Box<dyn ChannelHandle>> {
        let topic = topic_for(spec);
        sink.status(ChannelStatus::Joining);

        self.commands
            .send(Command::Join {
                topic: topic.clone(),
                payload: join_payload(spec, &self.access_token),
                sink,
            })
            .map_err(|_| RealtimeError::ChannelOpenFailed {
                channel: spec.name.clone(),
                reason: "feed connection is closed".into(),
            })?;

        Ok(Box::new(PhoenixChannel {
            name: spec.name.clone(),
            topic,
            commands: self.commands.clone(),
        }))
    }
}

struct PhoenixChannel {
    name: String,
    topic: String,
    commands: mpsc::UnboundedSender<Command>,
}

impl ChannelHandle for PhoenixChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn close(self: Box<Self>) {
        // Connection already gone: nothing left to leave
        let _ = self.commands.send(Command::Leave { topic: self.topic });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::event::{ChangeKind, ChangeKinds};
    use crate::realtime::provider::ChannelMessage;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    fn spec(kinds: ChangeKinds) -> ChannelSpec {
        ChannelSpec {
            name: "medical_analyses:u1".into(),
            schema: "public".into(),
            table: "medical_analyses".into(),
            filter: "user_id=eq.u1".into(),
            kinds,
        }
    }

    fn frame(topic: &str, event: &str, payload: Value, msg_ref: Option<&str>) -> PhoenixMessage {
        PhoenixMessage {
            topic: topic.into(),
            event: event.into(),
            payload,
            msg_ref: msg_ref.map(String::from),
            join_ref: None,
        }
    }

    #[test]
    fn test_join_payload_all_kinds() {
        let payload = join_payload(&spec(ChangeKinds::all()), "anon");
        let changes = payload["config"]["postgres_changes"].as_array().unwrap();

        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0]["event"], "*");
        assert_eq!(changes[0]["table"], "medical_analyses");
        assert_eq!(changes[0]["filter"], "user_id=eq.u1");
        assert_eq!(payload["access_token"], "anon");
    }

    #[test]
    fn test_join_payload_selected_kinds() {
        let kinds = ChangeKinds::only(ChangeKind::Created).with(ChangeKind::Deleted);
        let payload = join_payload(&spec(kinds), "anon");
        let events: Vec<&str> = payload["config"]["postgres_changes"]
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["event"].as_str().unwrap())
            .collect();

        assert_eq!(events, vec!["INSERT", "DELETE"]);
    }

    #[test]
    fn test_message_wire_shape() {
        let message = PhoenixMessage::new("realtime:x", PHX_JOIN, json!({}), "3".into()).with_join_ref("3");
        let wire = serde_json::to_value(&message).unwrap();
        assert_eq!(wire["ref"], "3");
        assert_eq!(wire["join_ref"], "3");

        let parsed: PhoenixMessage =
            serde_json::from_str(r#"{"topic":"phoenix","event":"phx_reply","payload":{"status":"ok"},"ref":null}"#)
                .unwrap();
        assert_eq!(parsed.msg_ref, None);
        assert_eq!(parsed.join_ref, None);
    }

    #[test]
    fn test_interpret_replies() {
        let ok = frame("realtime:x", PHX_REPLY, json!({"status": "ok", "response": {}}), Some("1"));
        assert_eq!(
            interpret(&ok),
            Inbound::JoinReply { reply_ref: Some("1".into()), result: Ok(()) }
        );

        let refused = frame(
            "realtime:x",
            PHX_REPLY,
            json!({"status": "error", "response": {"reason": "unauthorized"}}),
            Some("1"),
        );
        assert_eq!(
            interpret(&refused),
            Inbound::JoinReply { reply_ref: Some("1".into()), result: Err("unauthorized".into()) }
        );
    }

    #[test]
    fn test_interpret_change() {
        let message = frame(
            "realtime:x",
            POSTGRES_CHANGES,
            json!({"data": {"type": "INSERT", "table": "medical_analyses", "record": {"id": 1}}, "ids": [1]}),
            None,
        );
        match interpret(&message) {
            Inbound::Change(event) => {
                assert_eq!(event.kind, ChangeKind::Created);
                assert_eq!(event.row.id().as_deref(), Some("1"));
            }
            other => panic!("unexpected: {:?}", other),
        }

        let broken = frame("realtime:x", POSTGRES_CHANGES, json!({}), None);
        assert!(matches!(interpret(&broken), Inbound::Invalid(_)));
    }

    #[test]
    fn test_interpret_channel_state() {
        assert_eq!(
            interpret(&frame("realtime:x", PHX_CLOSE, json!({}), None)),
            Inbound::Status(ChannelStatus::Closed)
        );
        assert!(matches!(
            interpret(&frame("realtime:x", PHX_ERROR, json!({}), None)),
            Inbound::Status(ChannelStatus::Errored(_))
        ));
        assert_eq!(
            interpret(&frame("realtime:x", SYSTEM, json!({"status": "error", "message": "bad filter"}), None)),
            Inbound::Status(ChannelStatus::Errored("bad filter".into()))
        );
        assert_eq!(
            interpret(&frame("realtime:x", SYSTEM, json!({"status": "ok"}), None)),
            Inbound::Ignore
        );
        assert_eq!(interpret(&frame("realtime:x", "presence_state", json!({}), None)), Inbound::Ignore);
    }

    #[test]
    fn test_expire_joins() {
        let (sink, mut rx) = ChannelSink::channel();
        let now = Instant::now();
        let mut connection = Connection {
            connection_id: "c".into(),
            channels: HashMap::new(),
            next_ref: 0,
            heartbeat_interval: Duration::from_secs(30),
            join_timeout: Duration::from_secs(10),
        };
        connection.channels.insert(
            "realtime:x".into(),
            JoinedChannel {
                sink,
                join_ref: "1".into(),
                state: JoinState::Pending(now + Duration::from_secs(10)),
            },
        );

        connection.expire_joins(now + Duration::from_secs(5));
        assert!(rx.try_recv().is_err());

        connection.expire_joins(now + Duration::from_secs(10));
        assert_eq!(rx.try_recv().unwrap(), ChannelMessage::Status(ChannelStatus::TimedOut));

        // Only reported once
        connection.expire_joins(now + Duration::from_secs(20));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_late_reply_after_timeout_is_ignored() {
        let (sink, mut rx) = ChannelSink::channel();
        let mut connection = Connection {
            connection_id: "c".into(),
            channels: HashMap::new(),
            next_ref: 0,
            heartbeat_interval: Duration::from_secs(30),
            join_timeout: Duration::from_secs(10),
        };
        connection.channels.insert(
            "realtime:x".into(),
            JoinedChannel {
                sink,
                join_ref: "1".into(),
                state: JoinState::Failed,
            },
        );

        connection.handle_text(r#"{"topic":"realtime:x","event":"phx_reply","payload":{"status":"ok"},"ref":"1"}"#);
        assert!(rx.try_recv().is_err());
    }

    async fn next_frame(ws: &mut WebSocketStream<TcpStream>) -> PhoenixMessage {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("socket ended: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_join_receive_and_leave_over_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();

            let join = next_frame(&mut ws).await;
            assert_eq!(join.event, PHX_JOIN);
            assert_eq!(join.payload["config"]["postgres_changes"][0]["filter"], "user_id=eq.u1");

            let reply = frame(&join.topic, PHX_REPLY, json!({"status": "ok", "response": {}}), join.msg_ref.as_deref());
            ws.send(Message::Text(serde_json::to_string(&reply).unwrap())).await.unwrap();

            let change = frame(
                &join.topic,
                POSTGRES_CHANGES,
                json!({"data": {
                    "type": "UPDATE",
                    "table": "medical_analyses",
                    "record": {"id": "a1", "user_id": "u1", "status": "completed"},
                    "old_record": {"id": "a1"},
                    "commit_timestamp": "2024-05-01T10:00:00Z"
                }}),
                None,
            );
            ws.send(Message::Text(serde_json::to_string(&change).unwrap())).await.unwrap();

            next_frame(&mut ws).await
        });

        let config = ProviderConfig {
            endpoint: format!("ws://{}", addr),
            api_key: Some("anon".into()),
            ..ProviderConfig::default()
        };
        let feed = PhoenixFeed::connect(&config).await.unwrap();
        assert!(feed.is_connected());

        let (sink, mut rx) = ChannelSink::channel();
        let handle = feed.open(&spec(ChangeKinds::all()), sink).unwrap();

        assert_eq!(rx.recv().await, Some(ChannelMessage::Status(ChannelStatus::Joining)));
        assert_eq!(rx.recv().await, Some(ChannelMessage::Status(ChannelStatus::Subscribed)));
        match rx.recv().await {
            Some(ChannelMessage::Event(event)) => {
                assert_eq!(event.kind, ChangeKind::Updated);
                assert_eq!(event.row.get_str("status"), Some("completed"));
            }
            other => panic!("unexpected: {:?}", other),
        }

        handle.close();
        let leave = server.await.unwrap();
        assert_eq!(leave.event, PHX_LEAVE);
        assert_eq!(leave.topic, "realtime:medical_analyses:u1");

        feed.shutdown();
    }
}
