use std::{
    collections::{HashSet, HashMap},
    sync::Arc,
};

use anyhow::{Context, Result};
use api_types::{
    domain::{ConversationId, MessageId, UserId},
    protocol::{
        ChannelEvent, ConversationSummary, Message, NotificationSummary, OutgoingMessage,
        ReadReceipt, ReadRequest, SendMessageRequest, StartConversationRequest, TypingCommand,
    },
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{debug, warn};

use crate::{
    channel::RealtimeHandle,
    pipeline::{FilePart, RequestPipeline},
};

const UPDATE_FANOUT_DEPTH: usize = 256;

/// View-model updates fanned out to the UI layer.
#[derive(Debug, Clone)]
pub enum ConversationUpdate {
    HistoryReplaced {
        conversation_id: ConversationId,
    },
    MessageAppended {
        message: Message,
    },
    ReadStateChanged {
        conversation_id: ConversationId,
        message_ids: Vec<MessageId>,
    },
    ConversationsRefreshed,
    PeerTyping {
        conversation_id: ConversationId,
        user_id: UserId,
        is_typing: bool,
    },
}

#[derive(Default)]
struct ConsumerState {
    open_conversation: Option<ConversationId>,
    messages: Vec<Message>,
    known_ids: HashSet<MessageId>,
    conversations: Vec<ConversationSummary>,
}

/// Merges REST-fetched history with realtime-pushed events into one ordered,
/// id-unique message sequence per open conversation, and keeps read state
/// consistent across both acknowledgment paths.
pub struct ConversationConsumer {
    pipeline: Arc<RequestPipeline>,
    channel: Arc<dyn RealtimeHandle>,
    current_user: UserId,
    inner: Mutex<ConsumerState>,
    updates: broadcast::Sender<ConversationUpdate>,
}

impl ConversationConsumer {
    pub fn new(
        pipeline: Arc<RequestPipeline>,
        channel: Arc<dyn RealtimeHandle>,
        current_user: UserId,
    ) -> Arc<Self> {
        let (updates, _) = broadcast::channel(UPDATE_FANOUT_DEPTH);
        Arc::new(Self {
            pipeline,
            channel,
            current_user,
            inner: Mutex::new(ConsumerState::default()),
            updates,
        })
    }

    pub fn subscribe_updates(&self) -> broadcast::Receiver<ConversationUpdate> {
        self.updates.subscribe()
    }

    pub fn spawn_event_pump(self: &Arc<Self>) -> JoinHandle<()> {
        let consumer = Arc::clone(self);
        let mut events = consumer.channel.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => consumer.handle_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "conversation: realtime events dropped under load");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Fetches the full history for `conversation_id`, replacing the local
    /// sequence wholesale, then runs the mark-as-read pass.
    pub async fn open_conversation(&self, conversation_id: &ConversationId) -> Result<()> {
        let history: Vec<Message> = self
            .pipeline
            .get_json(&format!("/messages/{conversation_id}"))
            .await?;
        {
            let mut state = self.inner.lock().await;
            state.open_conversation = Some(conversation_id.clone());
            state.known_ids = history.iter().map(|m| m.id.clone()).collect();
            state.messages = history;
        }
        let _ = self.updates.send(ConversationUpdate::HistoryReplaced {
            conversation_id: conversation_id.clone(),
        });

        self.channel
            .join_conversations(vec![conversation_id.clone()])
            .await;

        if let Err(err) = self.mark_open_conversation_read().await {
            warn!(conversation_id = %conversation_id, "conversation: mark-as-read pass failed: {err:#}");
        }
        Ok(())
    }

    pub async fn close_conversation(&self) {
        let mut state = self.inner.lock().await;
        state.open_conversation = None;
        state.messages.clear();
        state.known_ids.clear();
    }

    pub async fn handle_event(&self, event: ChannelEvent) {
        match event {
            ChannelEvent::NewMessage(message) => self.on_new_message(message).await,
            ChannelEvent::MessageNotification(summary) => self.on_notification(summary).await,
            ChannelEvent::MessagesRead(receipt) => self.apply_read_receipt(&receipt).await,
            ChannelEvent::UserTyping(notice) => {
                let _ = self.updates.send(ConversationUpdate::PeerTyping {
                    conversation_id: notice.conversation_id,
                    user_id: notice.user_id,
                    is_typing: notice.is_typing,
                });
            }
            ChannelEvent::Error(error) => warn!("realtime: server error event: {error}"),
        }
    }

    /// Sends a text message. When the channel is connected the message goes
    /// out as a realtime command and is not appended locally; the server echo
    /// arrives via `new-message` with the authoritative id and timestamp.
    /// Otherwise the REST endpoint is used and its response appended directly.
    pub async fn send_text(&self, receiver_id: &UserId, text: &str) -> Result<()> {
        let conversation_id = self
            .open_conversation_id()
            .await
            .context("no open conversation")?;
        if self.channel.is_connected() {
            self.channel
                .send_message(OutgoingMessage {
                    conversation_id,
                    receiver_id: receiver_id.clone(),
                    text: Some(text.to_string()),
                    image_url: None,
                    image_name: None,
                })
                .await;
        } else {
            let created: Message = self
                .pipeline
                .post_json(
                    "/messages",
                    &SendMessageRequest {
                        conversation_id,
                        receiver_id: receiver_id.clone(),
                        text: Some(text.to_string()),
                    },
                )
                .await?;
            self.append_if_new(&created).await;
        }
        self.refresh_conversations_best_effort().await;
        Ok(())
    }

    /// Image sends always go over REST (multipart); no realtime echo is
    /// expected for this path.
    pub async fn send_image(
        &self,
        receiver_id: &UserId,
        file_name: &str,
        mime_type: &str,
        bytes: Vec<u8>,
    ) -> Result<()> {
        let conversation_id = self
            .open_conversation_id()
            .await
            .context("no open conversation")?;
        let fields = vec![
            ("conversationId".to_string(), conversation_id.to_string()),
            ("receiverId".to_string(), receiver_id.to_string()),
            ("imageName".to_string(), file_name.to_string()),
        ];
        let created: Message = self
            .pipeline
            .post_multipart(
                "/messages",
                fields,
                FilePart {
                    name: "image".to_string(),
                    file_name: file_name.to_string(),
                    mime_type: mime_type.to_string(),
                    bytes,
                },
            )
            .await?;
        self.append_if_new(&created).await;
        self.refresh_conversations_best_effort().await;
        Ok(())
    }

    pub async fn notify_typing(&self, is_typing: bool) {
        let Some(conversation_id) = self.open_conversation_id().await else {
            return;
        };
        self.channel
            .typing(TypingCommand {
                conversation_id,
                is_typing,
            })
            .await;
    }

    pub async fn start_conversation(&self, receiver_id: &UserId) -> Result<ConversationSummary> {
        let conversation: ConversationSummary = self
            .pipeline
            .post_json(
                "/conversations",
                &StartConversationRequest {
                    receiver_id: receiver_id.clone(),
                },
            )
            .await?;
        self.refresh_conversations_best_effort().await;
        Ok(conversation)
    }

    pub async fn refresh_conversations(&self) -> Result<()> {
        let conversations: Vec<ConversationSummary> =
            self.pipeline.get_json("/conversations").await?;
        let ids: Vec<ConversationId> = conversations.iter().map(|c| c.id.clone()).collect();
        {
            let mut state = self.inner.lock().await;
            state.conversations = conversations;
        }
        if self.channel.is_connected() && !ids.is_empty() {
            self.channel.join_conversations(ids).await;
        }
        let _ = self.updates.send(ConversationUpdate::ConversationsRefreshed);
        Ok(())
    }

    /// Acknowledges every locally-held unread message addressed to the
    /// current user: REST is authoritative, and when the channel is connected
    /// the same id set is also announced over realtime so the sender's open
    /// view updates without polling.
    pub async fn mark_open_conversation_read(&self) -> Result<()> {
        let (conversation_id, unread) = {
            let state = self.inner.lock().await;
            let Some(conversation_id) = state.open_conversation.clone() else {
                return Ok(());
            };
            let unread: Vec<MessageId> = state
                .messages
                .iter()
                .filter(|m| m.receiver_id == self.current_user && m.read_at.is_none())
                .map(|m| m.id.clone())
                .collect();
            (conversation_id, unread)
        };
        if unread.is_empty() {
            return Ok(());
        }

        let request = ReadRequest {
            conversation_id: conversation_id.clone(),
            message_ids: unread,
        };
        let receipt: ReadReceipt = self
            .pipeline
            .patch_json(&format!("/messages/{conversation_id}/read"), &request)
            .await?;
        if self.channel.is_connected() {
            self.channel.mark_as_read(request).await;
        }
        self.apply_read_receipt(&receipt).await;
        Ok(())
    }

    /// Sets `read_at` for each matching unread message exactly once; repeat
    /// acknowledgments for an already-read message are no-ops.
    pub async fn apply_read_receipt(&self, receipt: &ReadReceipt) {
        let changed = {
            let mut state = self.inner.lock().await;
            if state.open_conversation.as_ref() != Some(&receipt.conversation_id) {
                return;
            }
            let wanted: HashSet<&MessageId> = receipt.message_ids.iter().collect();
            let mut changed = Vec::new();
            for message in state.messages.iter_mut() {
                if message.read_at.is_none() && wanted.contains(&message.id) {
                    message.read_at = Some(receipt.read_at);
                    changed.push(message.id.clone());
                }
            }
            changed
        };
        if !changed.is_empty() {
            let _ = self.updates.send(ConversationUpdate::ReadStateChanged {
                conversation_id: receipt.conversation_id.clone(),
                message_ids: changed,
            });
        }
    }

    pub async fn messages(&self) -> Vec<Message> {
        self.inner.lock().await.messages.clone()
    }

    pub async fn conversations(&self) -> Vec<ConversationSummary> {
        self.inner.lock().await.conversations.clone()
    }

    pub async fn open_conversation_id(&self) -> Option<ConversationId> {
        self.inner.lock().await.open_conversation.clone()
    }

    pub async fn unread_counts(&self) -> HashMap<ConversationId, u32> {
        self.inner
            .lock()
            .await
            .conversations
            .iter()
            .map(|c| (c.id.clone(), c.unread_count))
            .collect()
    }

    async fn on_new_message(&self, message: Message) {
        if !self.append_if_new(&message).await {
            return;
        }
        if message.receiver_id == self.current_user {
            if let Err(err) = self.mark_open_conversation_read().await {
                warn!("conversation: mark-as-read pass failed: {err:#}");
            }
        }
    }

    async fn on_notification(&self, summary: NotificationSummary) {
        if let Err(err) = self.refresh_conversations().await {
            warn!(
                conversation_id = %summary.conversation_id,
                "conversation: list refresh failed: {err:#}"
            );
        }
    }

    /// Appends `message` when it belongs to the open conversation and its id
    /// is not yet present. Second arrivals are dropped.
    async fn append_if_new(&self, message: &Message) -> bool {
        {
            let mut state = self.inner.lock().await;
            if state.open_conversation.as_ref() != Some(&message.conversation_id) {
                return false;
            }
            if !state.known_ids.insert(message.id.clone()) {
                debug!(message_id = %message.id, "conversation: duplicate message dropped");
                return false;
            }
            state.messages.push(message.clone());
        }
        let _ = self.updates.send(ConversationUpdate::MessageAppended {
            message: message.clone(),
        });
        true
    }

    async fn refresh_conversations_best_effort(&self) {
        if let Err(err) = self.refresh_conversations().await {
            warn!("conversation: list refresh after send failed: {err:#}");
        }
    }
}

#[cfg(test)]
#[path = "tests/conversation_tests.rs"]
mod tests;
