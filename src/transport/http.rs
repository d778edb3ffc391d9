//! reqwest-backed transport.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::multipart::{Form, Part};
use tracing::debug;

use crate::config::ChatConfig;
use crate::error::ChatError;
use crate::types::{Attachment, ChatReply, ChatRequest};

use super::{ByteStream, ChatTransport};

/// Talks to the chat server over HTTP.
#[derive(Debug, Clone)]
pub struct HttpChatTransport {
    client: reqwest::Client,
    config: ChatConfig,
}

impl HttpChatTransport {
    pub fn new(config: ChatConfig) -> Result<Self, ChatError> {
        config.validate()?;
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .pool_max_idle_per_host(10)
            .build()?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(token) = &self.config.api_token {
            if let Ok(val) = HeaderValue::from_str(&format!("Bearer {token}")) {
                headers.insert(AUTHORIZATION, val);
            }
        }
        headers
    }

    fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.config.response_timeout_ms)
    }
}

#[async_trait]
impl ChatTransport for HttpChatTransport {
    async fn open_stream(&self, request: &ChatRequest) -> Result<ByteStream, ChatError> {
        let url = self.url(&self.config.stream_path);
        debug!(%url, session_id = %request.metadata.session_id, "Opening chat stream");

        let resp = self
            .client
            .post(&url)
            .headers(self.headers())
            .header(ACCEPT, "text/event-stream")
            .json(request)
            .send()
            .await?;

        let resp = check_status(resp).await?;
        let stream = resp.bytes_stream().map(|chunk| chunk.map_err(ChatError::from));
        Ok(Box::pin(stream))
    }

    async fn complete(&self, request: &ChatRequest) -> Result<ChatReply, ChatError> {
        let url = self.url(&self.config.json_path);
        debug!(%url, session_id = %request.metadata.session_id, "Sending JSON chat request");

        let resp = self
            .client
            .post(&url)
            .headers(self.headers())
            .timeout(self.response_timeout())
            .json(request)
            .send()
            .await?;

        let resp = check_status(resp).await?;
        let body = resp.text().await?;
        Ok(serde_json::from_str(&body)?)
    }

    async fn upload(
        &self,
        request: &ChatRequest,
        attachments: &[Attachment],
    ) -> Result<ChatReply, ChatError> {
        let url = self.url(&self.config.upload_path);
        debug!(
            %url,
            session_id = %request.metadata.session_id,
            files = attachments.len(),
            "Uploading chat request"
        );

        let mut form = Form::new();
        for (name, value) in request.form_fields() {
            form = form.text(name, value);
        }
        for attachment in attachments {
            let part = Part::bytes(attachment.data.clone())
                .file_name(attachment.file_name.clone())
                .mime_str(&attachment.mime_type)
                .map_err(|e| {
                    ChatError::InvalidArgument(format!(
                        "Invalid MIME type '{}': {e}",
                        attachment.mime_type
                    ))
                })?;
            form = form.part("files", part);
        }

        let resp = self
            .client
            .post(&url)
            .headers(self.headers())
            .timeout(self.response_timeout())
            .multipart(form)
            .send()
            .await?;

        let resp = check_status(resp).await?;
        let body = resp.text().await?;
        Ok(ChatReply {
            content: Some(body).filter(|b| !b.is_empty()),
            error: None,
        })
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, ChatError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(status_to_error(status.as_u16(), &body))
}

/// Map a non-2xx status and its body to an error.
pub fn status_to_error(status: u16, body: &str) -> ChatError {
    let message = extract_error_message(body).unwrap_or_else(|| body.to_string());
    match status {
        400 | 422 => ChatError::Validation(message),
        401 | 403 => ChatError::Authentication(message),
        _ => ChatError::api(status, message),
    }
}

fn extract_error_message(body: &str) -> Option<String> {
    let value = serde_json::from_str::<serde_json::Value>(body).ok()?;
    let field = value.get("error").or_else(|| value.get("message"))?;
    match field {
        serde_json::Value::String(s) => Some(s.clone()),
        other => other
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string),
    }
}
