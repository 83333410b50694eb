use super::*;
use std::{
    sync::atomic::{AtomicBool, AtomicU32, Ordering},
    time::Duration,
};

use api_types::protocol::{ChannelCommand, TypingNotice, UserProfile};
use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header::CONTENT_TYPE, HeaderMap, StatusCode},
    response::{IntoResponse, Response as AxumResponse},
    routing::{get, patch, post},
    Json, Router,
};
use chrono::Utc;
use tokio::net::TcpListener;

use crate::session::{SessionStore, SessionTokens};

struct MockRealtime {
    connected: AtomicBool,
    commands: Mutex<Vec<ChannelCommand>>,
    events: broadcast::Sender<ChannelEvent>,
}

impl MockRealtime {
    fn new(connected: bool) -> Arc<Self> {
        Arc::new(Self {
            connected: AtomicBool::new(connected),
            commands: Mutex::new(Vec::new()),
            events: broadcast::channel(64).0,
        })
    }

    async fn recorded(&self) -> Vec<ChannelCommand> {
        self.commands.lock().await.clone()
    }
}

#[async_trait]
impl RealtimeHandle for MockRealtime {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn join_conversations(&self, conversation_ids: Vec<ConversationId>) {
        self.commands
            .lock()
            .await
            .push(ChannelCommand::JoinConversations(conversation_ids));
    }

    async fn send_message(&self, message: OutgoingMessage) {
        self.commands
            .lock()
            .await
            .push(ChannelCommand::SendMessage(message));
    }

    async fn mark_as_read(&self, request: ReadRequest) {
        self.commands
            .lock()
            .await
            .push(ChannelCommand::MarkAsRead(request));
    }

    async fn typing(&self, command: TypingCommand) {
        self.commands
            .lock()
            .await
            .push(ChannelCommand::Typing(command));
    }

    fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }
}

#[derive(Clone)]
struct RestState {
    history: Arc<Mutex<Vec<Message>>>,
    read_requests: Arc<Mutex<Vec<ReadRequest>>>,
    sent: Arc<Mutex<Vec<serde_json::Value>>>,
    conversation_fetches: Arc<AtomicU32>,
    fail_sends: Arc<AtomicBool>,
}

async fn handle_history(
    State(state): State<RestState>,
    Path(_conversation_id): Path<String>,
) -> AxumResponse {
    Json(state.history.lock().await.clone()).into_response()
}

async fn handle_mark_read(
    State(state): State<RestState>,
    Path(_conversation_id): Path<String>,
    Json(body): Json<ReadRequest>,
) -> AxumResponse {
    state.read_requests.lock().await.push(body.clone());
    Json(ReadReceipt {
        conversation_id: body.conversation_id,
        message_ids: body.message_ids,
        read_at: Utc::now(),
    })
    .into_response()
}

async fn handle_send(
    State(state): State<RestState>,
    headers: HeaderMap,
    bytes: Bytes,
) -> AxumResponse {
    if state.fail_sends.load(Ordering::SeqCst) {
        return (StatusCode::INTERNAL_SERVER_ERROR, "send rejected").into_response();
    }
    let is_multipart = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.starts_with("multipart/form-data"))
        .unwrap_or(false);
    if is_multipart {
        state
            .sent
            .lock()
            .await
            .push(serde_json::json!({"multipart": true}));
        return Json(Message {
            id: MessageId::new("srv-img-1"),
            conversation_id: ConversationId::new("conv-1"),
            sender_id: UserId::new("u-1"),
            receiver_id: UserId::new("u-2"),
            text: None,
            image_url: Some("https://cdn.example.test/srv-img-1.png".to_string()),
            created_at: Utc::now(),
            read_at: None,
        })
        .into_response();
    }
    let request: SendMessageRequest = match serde_json::from_slice(&bytes) {
        Ok(request) => request,
        Err(err) => return (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
    };
    state
        .sent
        .lock()
        .await
        .push(serde_json::to_value(&request).unwrap());
    Json(Message {
        id: MessageId::new("srv-1"),
        conversation_id: request.conversation_id,
        sender_id: UserId::new("u-1"),
        receiver_id: request.receiver_id,
        text: request.text,
        image_url: None,
        created_at: Utc::now(),
        read_at: None,
    })
    .into_response()
}

async fn handle_conversations(State(state): State<RestState>) -> AxumResponse {
    state.conversation_fetches.fetch_add(1, Ordering::SeqCst);
    Json(vec![ConversationSummary {
        id: ConversationId::new("conv-1"),
        participant_ids: vec![UserId::new("u-1"), UserId::new("u-2")],
        last_message: None,
        unread_count: 0,
    }])
    .into_response()
}

async fn spawn_rest_server(history: Vec<Message>) -> anyhow::Result<(String, RestState)> {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let state = RestState {
        history: Arc::new(Mutex::new(history)),
        read_requests: Arc::new(Mutex::new(Vec::new())),
        sent: Arc::new(Mutex::new(Vec::new())),
        conversation_fetches: Arc::new(AtomicU32::new(0)),
        fail_sends: Arc::new(AtomicBool::new(false)),
    };
    let app = Router::new()
        .route("/messages/:conversation_id", get(handle_history))
        .route("/messages/:conversation_id/read", patch(handle_mark_read))
        .route("/messages", post(handle_send))
        .route("/conversations", get(handle_conversations))
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok((format!("http://{addr}"), state))
}

struct Harness {
    consumer: Arc<ConversationConsumer>,
    realtime: Arc<MockRealtime>,
    rest: RestState,
}

async fn harness(connected: bool, history: Vec<Message>) -> Harness {
    let (base_url, rest) = spawn_rest_server(history).await.expect("spawn server");
    let session = SessionStore::new();
    session
        .install(
            SessionTokens {
                access_token: "token-1".to_string(),
                refresh_token: "refresh-1".to_string(),
            },
            UserProfile {
                user_id: UserId::new("u-1"),
                display_name: "Alice Example".to_string(),
            },
        )
        .await;
    let pipeline = Arc::new(RequestPipeline::new(base_url, session).expect("pipeline"));
    let realtime = MockRealtime::new(connected);
    let consumer = ConversationConsumer::new(
        pipeline,
        Arc::clone(&realtime) as Arc<dyn RealtimeHandle>,
        UserId::new("u-1"),
    );
    Harness {
        consumer,
        realtime,
        rest,
    }
}

fn conv() -> ConversationId {
    ConversationId::new("conv-1")
}

fn stored_message(id: &str, sender: &str, receiver: &str, read: bool) -> Message {
    Message {
        id: MessageId::new(id),
        conversation_id: conv(),
        sender_id: UserId::new(sender),
        receiver_id: UserId::new(receiver),
        text: Some(format!("message {id}")),
        image_url: None,
        created_at: Utc::now(),
        read_at: read.then(Utc::now),
    }
}

fn pushed_message(id: &str) -> Message {
    stored_message(id, "u-2", "u-1", false)
}

#[tokio::test]
async fn opening_replaces_history_and_acknowledges_unread_messages() {
    let history = vec![
        stored_message("m-1", "u-1", "u-2", true),
        stored_message("m-2", "u-2", "u-1", true),
        stored_message("m-3", "u-2", "u-1", false),
    ];
    let h = harness(true, history).await;

    h.consumer.open_conversation(&conv()).await.expect("open");

    let messages = h.consumer.messages().await;
    assert_eq!(messages.len(), 3);
    assert!(messages.iter().all(|m| m.read_at.is_some()));

    let expected = ReadRequest {
        conversation_id: conv(),
        message_ids: vec![MessageId::new("m-3")],
    };
    assert_eq!(h.rest.read_requests.lock().await.clone(), vec![expected.clone()]);

    let commands = h.realtime.recorded().await;
    assert!(commands.contains(&ChannelCommand::JoinConversations(vec![conv()])));
    assert!(commands.contains(&ChannelCommand::MarkAsRead(expected)));
}

#[tokio::test]
async fn realtime_send_defers_to_the_server_echo() {
    let h = harness(true, Vec::new()).await;
    h.consumer.open_conversation(&conv()).await.expect("open");

    h.consumer
        .send_text(&UserId::new("u-2"), "hi there")
        .await
        .expect("send");

    // Nothing goes over REST and nothing is appended until the echo lands.
    assert!(h.rest.sent.lock().await.is_empty());
    assert!(h.consumer.messages().await.is_empty());
    let commands = h.realtime.recorded().await;
    assert!(commands.iter().any(|c| matches!(
        c,
        ChannelCommand::SendMessage(m) if m.text.as_deref() == Some("hi there")
    )));

    let echo = stored_message("srv-9", "u-1", "u-2", false);
    h.consumer.handle_event(ChannelEvent::NewMessage(echo)).await;
    let messages = h.consumer.messages().await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id, MessageId::new("srv-9"));
}

#[tokio::test]
async fn offline_text_send_falls_back_to_rest() {
    let h = harness(false, Vec::new()).await;
    h.consumer.open_conversation(&conv()).await.expect("open");

    h.consumer
        .send_text(&UserId::new("u-2"), "fallback")
        .await
        .expect("send");

    let sent = h.rest.sent.lock().await.clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0]["conversationId"], "conv-1");
    let messages = h.consumer.messages().await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id, MessageId::new("srv-1"));

    // A later realtime echo carrying the same id is dropped.
    let echo = stored_message("srv-1", "u-1", "u-2", false);
    h.consumer.handle_event(ChannelEvent::NewMessage(echo)).await;
    assert_eq!(h.consumer.messages().await.len(), 1);
}

#[tokio::test]
async fn image_send_goes_over_rest_and_dedupes_the_echo() {
    let h = harness(false, Vec::new()).await;
    h.consumer.open_conversation(&conv()).await.expect("open");

    h.consumer
        .send_image(&UserId::new("u-2"), "boiler.png", "image/png", vec![1, 2, 3])
        .await
        .expect("send image");

    assert_eq!(h.rest.sent.lock().await.clone(), vec![serde_json::json!({"multipart": true})]);
    let messages = h.consumer.messages().await;
    assert_eq!(messages.len(), 1);
    assert!(messages[0].image_url.is_some());

    let echo = messages[0].clone();
    h.consumer.handle_event(ChannelEvent::NewMessage(echo)).await;
    assert_eq!(h.consumer.messages().await.len(), 1);
}

#[tokio::test]
async fn pushed_messages_append_in_arrival_order_and_duplicates_drop() {
    let h = harness(true, vec![stored_message("m-1", "u-1", "u-2", true)]).await;
    h.consumer.open_conversation(&conv()).await.expect("open");

    h.consumer
        .handle_event(ChannelEvent::NewMessage(pushed_message("m-2")))
        .await;
    h.consumer
        .handle_event(ChannelEvent::NewMessage(pushed_message("m-3")))
        .await;
    h.consumer
        .handle_event(ChannelEvent::NewMessage(pushed_message("m-2")))
        .await;

    let ids: Vec<String> = h
        .consumer
        .messages()
        .await
        .iter()
        .map(|m| m.id.to_string())
        .collect();
    assert_eq!(ids, vec!["m-1", "m-2", "m-3"]);
}

#[tokio::test]
async fn read_state_never_moves_backwards() {
    let h = harness(true, vec![stored_message("m-3", "u-2", "u-1", false)]).await;
    h.consumer.open_conversation(&conv()).await.expect("open");

    let first = h.consumer.messages().await[0]
        .read_at
        .expect("marked read on open");

    let stale = ReadReceipt {
        conversation_id: conv(),
        message_ids: vec![MessageId::new("m-3")],
        read_at: first - chrono::Duration::hours(1),
    };
    h.consumer.apply_read_receipt(&stale).await;

    assert_eq!(h.consumer.messages().await[0].read_at, Some(first));
}

#[tokio::test]
async fn events_for_other_conversations_are_ignored() {
    let h = harness(true, Vec::new()).await;
    h.consumer.open_conversation(&conv()).await.expect("open");

    let mut foreign = pushed_message("m-x");
    foreign.conversation_id = ConversationId::new("conv-2");
    h.consumer
        .handle_event(ChannelEvent::NewMessage(foreign))
        .await;

    assert!(h.consumer.messages().await.is_empty());
}

#[tokio::test]
async fn notifications_refresh_the_conversation_list() {
    let h = harness(true, Vec::new()).await;

    h.consumer
        .handle_event(ChannelEvent::MessageNotification(NotificationSummary {
            conversation_id: conv(),
            sender_id: UserId::new("u-2"),
            preview: Some("new message".to_string()),
        }))
        .await;

    assert_eq!(h.rest.conversation_fetches.load(Ordering::SeqCst), 1);
    assert_eq!(h.consumer.conversations().await.len(), 1);
    assert_eq!(h.consumer.unread_counts().await.get(&conv()), Some(&0));
    let commands = h.realtime.recorded().await;
    assert!(commands.contains(&ChannelCommand::JoinConversations(vec![conv()])));
}

#[tokio::test]
async fn rest_send_failure_leaves_the_sequence_unchanged() {
    let h = harness(false, Vec::new()).await;
    h.consumer.open_conversation(&conv()).await.expect("open");
    h.rest.fail_sends.store(true, Ordering::SeqCst);

    let result = h.consumer.send_text(&UserId::new("u-2"), "doomed").await;

    assert!(result.is_err());
    assert!(h.consumer.messages().await.is_empty());
}

#[tokio::test]
async fn typing_round_trip_reaches_the_update_stream() {
    let h = harness(true, Vec::new()).await;
    h.consumer.open_conversation(&conv()).await.expect("open");
    let mut updates = h.consumer.subscribe_updates();

    h.consumer.notify_typing(true).await;
    let commands = h.realtime.recorded().await;
    assert!(commands.iter().any(|c| matches!(
        c,
        ChannelCommand::Typing(t) if t.is_typing && t.conversation_id == conv()
    )));

    h.consumer
        .handle_event(ChannelEvent::UserTyping(TypingNotice {
            conversation_id: conv(),
            user_id: UserId::new("u-2"),
            is_typing: true,
        }))
        .await;

    let seen = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match updates.recv().await.expect("updates open") {
                ConversationUpdate::PeerTyping {
                    user_id, is_typing, ..
                } => return (user_id, is_typing),
                _ => continue,
            }
        }
    })
    .await
    .expect("timed out waiting for typing update");
    assert_eq!(seen, (UserId::new("u-2"), true));
}

#[tokio::test]
async fn event_pump_delivers_channel_events() {
    let h = harness(true, Vec::new()).await;
    h.consumer.open_conversation(&conv()).await.expect("open");
    let pump = h.consumer.spawn_event_pump();

    h.realtime
        .events
        .send(ChannelEvent::NewMessage(pushed_message("m-9")))
        .expect("pump subscribed");

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if !h.consumer.messages().await.is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timed out waiting for pumped event");
    pump.abort();
}
