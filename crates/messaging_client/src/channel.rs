use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use api_types::{
    domain::ConversationId,
    protocol::{ChannelCommand, ChannelEvent, OutgoingMessage, ReadRequest, TypingCommand},
};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::{
    sync::{broadcast, mpsc, watch, Mutex},
    task::JoinHandle,
};
use tokio_stream::wrappers::BroadcastStream;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsFrame};
use tracing::{info, warn};
use url::Url;

pub const DEFAULT_RECONNECT_ATTEMPTS: u32 = 5;
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);

const OUTBOUND_QUEUE_DEPTH: usize = 64;
const EVENT_FANOUT_DEPTH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelStatus {
    pub state: ChannelState,
    pub token_version: u64,
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub ws_url: String,
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
}

impl ChannelConfig {
    pub fn new(ws_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
            reconnect_attempts: DEFAULT_RECONNECT_ATTEMPTS,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

/// Command/event surface the conversation layer depends on, independent of a
/// live socket.
#[async_trait]
pub trait RealtimeHandle: Send + Sync {
    fn is_connected(&self) -> bool;
    async fn join_conversations(&self, conversation_ids: Vec<ConversationId>);
    async fn send_message(&self, message: OutgoingMessage);
    async fn mark_as_read(&self, request: ReadRequest);
    async fn typing(&self, command: TypingCommand);
    fn subscribe(&self) -> broadcast::Receiver<ChannelEvent>;
}

#[derive(Default)]
struct ChannelInner {
    generation: u64,
    token: Option<String>,
    token_version: u64,
    outbound: Option<mpsc::Sender<ChannelCommand>>,
    reader_task: Option<JoinHandle<()>>,
    writer_task: Option<JoinHandle<()>>,
}

impl ChannelInner {
    fn teardown(&mut self) {
        self.outbound = None;
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        if let Some(task) = self.writer_task.take() {
            task.abort();
        }
    }
}

/// Owns the one persistent push connection per session.
///
/// Transport loss triggers a bounded automatic reconnect using the last
/// token; once the attempts are exhausted the channel stays `Disconnected`
/// until an explicit `connect`/`reconnect_with_new_token`. A generation
/// counter scopes the reader/writer tasks and the recovery loop so explicit
/// lifecycle calls always cancel stale recovery.
pub struct RealtimeChannel {
    config: ChannelConfig,
    inner: Mutex<ChannelInner>,
    events: broadcast::Sender<ChannelEvent>,
    status: watch::Sender<ChannelStatus>,
}

impl RealtimeChannel {
    pub fn new(config: ChannelConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_FANOUT_DEPTH);
        let (status, _) = watch::channel(ChannelStatus {
            state: ChannelState::Disconnected,
            token_version: 0,
        });
        Arc::new(Self {
            config,
            inner: Mutex::new(ChannelInner::default()),
            events,
            status,
        })
    }

    pub async fn connect(self: &Arc<Self>, access_token: &str, token_version: u64) -> Result<()> {
        let generation = {
            let mut inner = self.inner.lock().await;
            inner.teardown();
            inner.generation += 1;
            inner.token = Some(access_token.to_string());
            inner.token_version = token_version;
            inner.generation
        };
        self.set_status(ChannelState::Connecting, token_version);
        match self.establish(generation).await {
            Ok(_) => Ok(()),
            Err(err) => {
                self.set_status(ChannelState::Disconnected, token_version);
                Err(err)
            }
        }
    }

    /// Tears down any existing connection and opens a new one carrying the
    /// rotated token. Unacknowledged commands from the old connection are not
    /// retried.
    pub async fn reconnect_with_new_token(
        self: &Arc<Self>,
        access_token: &str,
        token_version: u64,
    ) -> Result<()> {
        self.connect(access_token, token_version).await
    }

    pub async fn disconnect(&self) {
        let token_version = {
            let mut inner = self.inner.lock().await;
            inner.generation += 1;
            inner.teardown();
            inner.token = None;
            inner.token_version
        };
        self.set_status(ChannelState::Disconnected, token_version);
        info!("realtime: channel disconnected");
    }

    pub fn status(&self) -> ChannelStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ChannelStatus> {
        self.status.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    /// Lazy, non-terminating stream of inbound events for the life of the
    /// channel.
    pub fn event_stream(&self) -> BroadcastStream<ChannelEvent> {
        BroadcastStream::new(self.events.subscribe())
    }

    fn handshake_url(&self, access_token: &str) -> Result<String> {
        let mut url = Url::parse(&self.config.ws_url)
            .with_context(|| format!("invalid realtime url: {}", self.config.ws_url))?;
        url.query_pairs_mut().append_pair("token", access_token);
        Ok(url.to_string())
    }

    /// Opens the socket and installs the reader/writer tasks. Returns `false`
    /// when `generation` was superseded while connecting.
    ///
    /// Returns a boxed future to break the async recursion cycle
    /// (establish -> reader -> on_connection_lost -> run_reconnect ->
    /// establish), which the compiler cannot type-check with opaque
    /// `async fn` futures.
    fn establish<'a>(
        self: &'a Arc<Self>,
        generation: u64,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<bool>> + Send + 'a>> {
        Box::pin(async move {
        let (token, token_version) = {
            let inner = self.inner.lock().await;
            if inner.generation != generation {
                return Ok(false);
            }
            let token = inner
                .token
                .clone()
                .context("no access token available for realtime connect")?;
            (token, inner.token_version)
        };

        let url = self.handshake_url(&token)?;
        let (socket, _) = connect_async(url.as_str())
            .await
            .with_context(|| format!("failed to connect realtime channel: {}", self.config.ws_url))?;
        let (mut sink, mut stream) = socket.split();

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<ChannelCommand>(OUTBOUND_QUEUE_DEPTH);
        let writer = tokio::spawn(async move {
            while let Some(command) = outbound_rx.recv().await {
                let text = match serde_json::to_string(&command) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(kind = command.kind(), "realtime: failed to encode command: {err}");
                        continue;
                    }
                };
                if sink.send(WsFrame::Text(text)).await.is_err() {
                    break;
                }
            }
        });

        let channel = Arc::clone(self);
        let reader = tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(WsFrame::Text(text)) => match serde_json::from_str::<ChannelEvent>(&text) {
                        Ok(event) => {
                            let _ = channel.events.send(event);
                        }
                        Err(err) => warn!("realtime: discarding undecodable server event: {err}"),
                    },
                    Ok(WsFrame::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!("realtime: transport error: {err}");
                        break;
                    }
                }
            }
            channel.on_connection_lost(generation).await;
        });

        {
            let mut inner = self.inner.lock().await;
            if inner.generation != generation {
                writer.abort();
                reader.abort();
                return Ok(false);
            }
            inner.outbound = Some(outbound_tx);
            inner.reader_task = Some(reader);
            inner.writer_task = Some(writer);
        }
        self.set_status(ChannelState::Connected, token_version);
        info!(token_version, "realtime: channel connected");
        Ok(true)
        })
    }

    async fn on_connection_lost(self: &Arc<Self>, generation: u64) {
        let token_version = {
            let mut inner = self.inner.lock().await;
            if inner.generation != generation {
                return;
            }
            inner.outbound = None;
            inner.token_version
        };
        self.set_status(ChannelState::Disconnected, token_version);
        warn!("realtime: connection lost; scheduling reconnect");
        let channel = Arc::clone(self);
        tokio::spawn(async move {
            channel.run_reconnect(generation).await;
        });
    }

    async fn run_reconnect(self: Arc<Self>, generation: u64) {
        for attempt in 1..=self.config.reconnect_attempts {
            tokio::time::sleep(self.config.reconnect_delay).await;
            let token_version = {
                let inner = self.inner.lock().await;
                if inner.generation != generation {
                    return;
                }
                inner.token_version
            };
            self.set_status(ChannelState::Connecting, token_version);
            match self.establish(generation).await {
                Ok(true) => {
                    info!(attempt, "realtime: reconnected");
                    return;
                }
                Ok(false) => return,
                Err(err) => {
                    warn!(
                        attempt,
                        max_attempts = self.config.reconnect_attempts,
                        "realtime: reconnect attempt failed: {err:#}"
                    );
                    self.set_status(ChannelState::Disconnected, token_version);
                }
            }
        }
        warn!("realtime: reconnect attempts exhausted; waiting for an explicit reconnect");
    }

    fn set_status(&self, state: ChannelState, token_version: u64) {
        self.status.send_replace(ChannelStatus {
            state,
            token_version,
        });
    }

    async fn send_command(&self, command: ChannelCommand) {
        let outbound = {
            let inner = self.inner.lock().await;
            inner.outbound.clone()
        };
        let connected = self.status.borrow().state == ChannelState::Connected;
        let Some(outbound) = outbound.filter(|_| connected) else {
            warn!(
                kind = command.kind(),
                "realtime: command dropped; channel not connected"
            );
            return;
        };
        if outbound.send(command).await.is_err() {
            warn!("realtime: connection closed before command could be written");
        }
    }
}

#[async_trait]
impl RealtimeHandle for RealtimeChannel {
    fn is_connected(&self) -> bool {
        self.status.borrow().state == ChannelState::Connected
    }

    async fn join_conversations(&self, conversation_ids: Vec<ConversationId>) {
        self.send_command(ChannelCommand::JoinConversations(conversation_ids))
            .await;
    }

    async fn send_message(&self, message: OutgoingMessage) {
        self.send_command(ChannelCommand::SendMessage(message)).await;
    }

    async fn mark_as_read(&self, request: ReadRequest) {
        self.send_command(ChannelCommand::MarkAsRead(request)).await;
    }

    async fn typing(&self, command: TypingCommand) {
        self.send_command(ChannelCommand::Typing(command)).await;
    }

    fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
#[path = "tests/channel_tests.rs"]
mod tests;
