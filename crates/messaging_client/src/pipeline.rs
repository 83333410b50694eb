use std::sync::Arc;

use api_types::protocol::{LoginRequest, LoginResponse, RefreshRequest, RefreshResponse, UserProfile};
use reqwest::{multipart, Client, Method, Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::session::{SessionStore, SessionTokens};

const LOGIN_PATH: &str = "/auth/login";
const REFRESH_PATH: &str = "/auth/refresh";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("not authenticated")]
    NotAuthenticated,
    #[error("session expired: token refresh was rejected")]
    SessionExpired,
    #[error("request failed with status {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("failed to encode request body: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
}

/// A rebuildable description of one API request, so the 401 retry can
/// re-issue the original request verbatim with the rotated token.
#[derive(Debug, Clone)]
pub struct ApiCall {
    method: Method,
    path: String,
    body: CallBody,
}

#[derive(Debug, Clone)]
enum CallBody {
    Empty,
    Json(serde_json::Value),
    Multipart {
        fields: Vec<(String, String)>,
        file: FilePart,
    },
}

#[derive(Debug, Clone)]
pub struct FilePart {
    pub name: String,
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl ApiCall {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: CallBody::Empty,
        }
    }

    pub fn with_json<B: Serialize>(mut self, body: &B) -> Result<Self, PipelineError> {
        self.body = CallBody::Json(serde_json::to_value(body)?);
        Ok(self)
    }

    pub fn with_multipart(mut self, fields: Vec<(String, String)>, file: FilePart) -> Self {
        self.body = CallBody::Multipart { fields, file };
        self
    }
}

struct RefreshGate {
    in_flight: bool,
    waiters: Vec<oneshot::Sender<Result<String, ()>>>,
}

/// Attaches the current access token to every outbound call and transparently
/// recovers from a single access-token expiry, guaranteeing at most one
/// refresh request is in flight at any time.
pub struct RequestPipeline {
    http: Client,
    base_url: String,
    session: Arc<SessionStore>,
    refresh_gate: Mutex<RefreshGate>,
}

impl RequestPipeline {
    pub fn new(
        base_url: impl Into<String>,
        session: Arc<SessionStore>,
    ) -> Result<Self, PipelineError> {
        let http = Client::builder().cookie_store(true).build()?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            session,
            refresh_gate: Mutex::new(RefreshGate {
                in_flight: false,
                waiters: Vec::new(),
            }),
        })
    }

    pub fn session(&self) -> &Arc<SessionStore> {
        &self.session
    }

    pub async fn login(&self, request: &LoginRequest) -> Result<UserProfile, PipelineError> {
        let response = self
            .http
            .post(format!("{}{}", self.base_url, LOGIN_PATH))
            .json(request)
            .send()
            .await?;
        let body: LoginResponse = Self::decode(response).await?;
        self.session
            .install(
                SessionTokens {
                    access_token: body.token,
                    refresh_token: body.refresh_token,
                },
                body.user.clone(),
            )
            .await;
        Ok(body.user)
    }

    pub async fn logout(&self) {
        self.session.clear().await;
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, PipelineError> {
        let response = self.dispatch(ApiCall::new(Method::GET, path)).await?;
        Self::decode(response).await
    }

    pub async fn post_json<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, PipelineError> {
        let call = ApiCall::new(Method::POST, path).with_json(body)?;
        let response = self.dispatch(call).await?;
        Self::decode(response).await
    }

    pub async fn patch_json<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, PipelineError> {
        let call = ApiCall::new(Method::PATCH, path).with_json(body)?;
        let response = self.dispatch(call).await?;
        Self::decode(response).await
    }

    pub async fn post_multipart<T: DeserializeOwned>(
        &self,
        path: &str,
        fields: Vec<(String, String)>,
        file: FilePart,
    ) -> Result<T, PipelineError> {
        let call = ApiCall::new(Method::POST, path).with_multipart(fields, file);
        let response = self.dispatch(call).await?;
        Self::decode(response).await
    }

    /// Issues `call` with the current access token. On a 401 the call is
    /// retried exactly once behind the single-flight refresh; every other
    /// response passes through unchanged.
    pub async fn dispatch(&self, call: ApiCall) -> Result<Response, PipelineError> {
        let token = self
            .session
            .access_token()
            .await
            .ok_or(PipelineError::NotAuthenticated)?;
        let response = self.issue(&call, &token).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        debug!(path = %call.path, "auth: unauthorized response; coordinating token refresh");
        let rotated = self.refresh_access_token().await?;
        Ok(self.issue(&call, &rotated).await?)
    }

    async fn issue(&self, call: &ApiCall, access_token: &str) -> Result<Response, PipelineError> {
        let url = format!("{}{}", self.base_url, call.path);
        let mut request = self
            .http
            .request(call.method.clone(), url)
            .bearer_auth(access_token);
        request = match &call.body {
            CallBody::Empty => request,
            CallBody::Json(value) => request.json(value),
            CallBody::Multipart { fields, file } => {
                let mut form = multipart::Form::new();
                for (name, value) in fields {
                    form = form.text(name.clone(), value.clone());
                }
                let part = multipart::Part::bytes(file.bytes.clone())
                    .file_name(file.file_name.clone())
                    .mime_str(&file.mime_type)?;
                form = form.part(file.name.clone(), part);
                request.multipart(form)
            }
        };
        Ok(request.send().await?)
    }

    /// Single-flight refresh: the first 401 caller runs the refresh request;
    /// concurrent callers enqueue and are released in FIFO order once it
    /// settles. Refresh failure is fatal for the session.
    async fn refresh_access_token(&self) -> Result<String, PipelineError> {
        let waiter = {
            let mut gate = self.refresh_gate.lock().await;
            if gate.in_flight {
                let (tx, rx) = oneshot::channel();
                gate.waiters.push(tx);
                Some(rx)
            } else {
                gate.in_flight = true;
                None
            }
        };

        if let Some(rx) = waiter {
            return match rx.await {
                Ok(Ok(token)) => Ok(token),
                _ => Err(PipelineError::SessionExpired),
            };
        }

        let outcome = self.run_refresh().await;

        let waiters = {
            let mut gate = self.refresh_gate.lock().await;
            gate.in_flight = false;
            std::mem::take(&mut gate.waiters)
        };
        let shared = outcome.as_ref().map(String::clone).map_err(|_| ());
        for waiter in waiters {
            let _ = waiter.send(shared.clone());
        }

        outcome
    }

    async fn run_refresh(&self) -> Result<String, PipelineError> {
        let refresh_token = self
            .session
            .refresh_token()
            .await
            .ok_or(PipelineError::NotAuthenticated)?;

        info!("auth: access token rejected; refreshing session");
        let response = self
            .http
            .post(format!("{}{}", self.base_url, REFRESH_PATH))
            .json(&RefreshRequest { refresh_token })
            .send()
            .await;

        let body = match response {
            Ok(response) if response.status().is_success() => {
                match response.json::<RefreshResponse>().await {
                    Ok(body) => body,
                    Err(err) => return self.fail_refresh(err.to_string()).await,
                }
            }
            Ok(response) => {
                return self
                    .fail_refresh(format!("refresh endpoint returned {}", response.status()))
                    .await;
            }
            Err(err) => return self.fail_refresh(err.to_string()).await,
        };

        self.session
            .rotate(SessionTokens {
                access_token: body.token.clone(),
                refresh_token: body.refresh_token,
            })
            .await;
        Ok(body.token)
    }

    async fn fail_refresh(&self, reason: String) -> Result<String, PipelineError> {
        warn!(%reason, "auth: refresh failed; clearing session and forcing re-login");
        self.session.clear().await;
        Err(PipelineError::SessionExpired)
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, PipelineError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::Status { status, body });
        }
        Ok(response.json().await?)
    }
}

#[cfg(test)]
#[path = "tests/pipeline_tests.rs"]
mod tests;
