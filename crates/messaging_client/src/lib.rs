use std::sync::Arc;

use anyhow::{anyhow, Result};
use api_types::protocol::{LoginRequest, UserProfile};
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::warn;

pub mod channel;
pub mod conversation;
pub mod pipeline;
pub mod session;

pub use channel::{ChannelConfig, ChannelState, ChannelStatus, RealtimeChannel, RealtimeHandle};
pub use conversation::{ConversationConsumer, ConversationUpdate};
pub use pipeline::{ApiCall, FilePart, PipelineError, RequestPipeline};
pub use session::{SessionSnapshot, SessionStore, SessionTokens};

struct ConsumerSlot {
    consumer: Arc<ConversationConsumer>,
    pump: JoinHandle<()>,
}

/// Composition root: owns the session store, request pipeline, realtime
/// channel, and (after login) the conversation view-model. Token rotations
/// performed by the pipeline are observed through the session version watch
/// and translated into a channel reconnect with the rotated token.
pub struct BackofficeClient {
    session: Arc<SessionStore>,
    pipeline: Arc<RequestPipeline>,
    channel: Arc<RealtimeChannel>,
    view: Mutex<Option<ConsumerSlot>>,
    _rotation_task: JoinHandle<()>,
}

impl BackofficeClient {
    pub fn new(base_url: impl Into<String>) -> Result<Arc<Self>> {
        let base_url = base_url.into();
        let channel_config = ChannelConfig::new(realtime_url_for(&base_url)?);
        Self::with_channel_config(base_url, channel_config)
    }

    pub fn with_channel_config(
        base_url: impl Into<String>,
        channel_config: ChannelConfig,
    ) -> Result<Arc<Self>> {
        let session = SessionStore::new();
        let pipeline = Arc::new(RequestPipeline::new(base_url, Arc::clone(&session))?);
        let channel = RealtimeChannel::new(channel_config);
        let rotation_task = spawn_rotation_watcher(Arc::clone(&session), Arc::clone(&channel));
        Ok(Arc::new(Self {
            session,
            pipeline,
            channel,
            view: Mutex::new(None),
            _rotation_task: rotation_task,
        }))
    }

    /// Authenticates, which installs the session and (via the rotation
    /// watcher) brings up the realtime channel, then wires the conversation
    /// view-model for the logged-in user.
    pub async fn login(&self, username: &str, password: &str) -> Result<UserProfile> {
        let user = self
            .pipeline
            .login(&LoginRequest {
                username: username.to_string(),
                password: password.to_string(),
            })
            .await?;

        let consumer = ConversationConsumer::new(
            Arc::clone(&self.pipeline),
            Arc::clone(&self.channel) as Arc<dyn RealtimeHandle>,
            user.user_id.clone(),
        );
        let pump = consumer.spawn_event_pump();
        let mut view = self.view.lock().await;
        if let Some(previous) = view.take() {
            previous.pump.abort();
        }
        *view = Some(ConsumerSlot { consumer, pump });
        Ok(user)
    }

    pub async fn logout(&self) {
        self.pipeline.logout().await;
        if let Some(slot) = self.view.lock().await.take() {
            slot.pump.abort();
        }
    }

    pub async fn conversations(&self) -> Result<Arc<ConversationConsumer>> {
        self.view
            .lock()
            .await
            .as_ref()
            .map(|slot| Arc::clone(&slot.consumer))
            .ok_or_else(|| anyhow!("not logged in"))
    }

    pub fn session(&self) -> &Arc<SessionStore> {
        &self.session
    }

    pub fn pipeline(&self) -> &Arc<RequestPipeline> {
        &self.pipeline
    }

    pub fn channel(&self) -> &Arc<RealtimeChannel> {
        &self.channel
    }
}

fn realtime_url_for(base_url: &str) -> Result<String> {
    let ws_base = if base_url.starts_with("https://") {
        base_url.replacen("https://", "wss://", 1)
    } else if base_url.starts_with("http://") {
        base_url.replacen("http://", "ws://", 1)
    } else {
        return Err(anyhow!("base url must start with http:// or https://"));
    };
    Ok(format!("{ws_base}/ws"))
}

fn spawn_rotation_watcher(
    session: Arc<SessionStore>,
    channel: Arc<RealtimeChannel>,
) -> JoinHandle<()> {
    let mut versions = session.subscribe_versions();
    tokio::spawn(async move {
        while versions.changed().await.is_ok() {
            let version = *versions.borrow_and_update();
            match session.current().await {
                Some(snapshot) if snapshot.version == version => {
                    if let Err(err) = channel
                        .reconnect_with_new_token(&snapshot.tokens.access_token, version)
                        .await
                    {
                        warn!(version, "realtime: reconnect with rotated token failed: {err:#}");
                    }
                }
                Some(_) => {}
                None => channel.disconnect().await,
            }
        }
    })
}

#[cfg(test)]
#[path = "tests/client_tests.rs"]
mod tests;
