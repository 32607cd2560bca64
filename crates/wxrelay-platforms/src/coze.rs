//! Coze platform: the v3 create / retrieve / message-list polling flow.

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use serde_json::json;

use wxrelay_common::{
    CozeConfig, MessageSendMode, PlatformDescriptor, PlatformKind, PlatformReply,
};

use crate::error::{PlatformError, Result};
use crate::{Platform, PlatformRequest, api_error};

/// Client-side timeout per request; the whole flow is additionally bounded
/// by the polling schedule below.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum status polls before the chat is declared timed out (~2 min).
const MAX_POLLS: u32 = 60;

/// Base poll interval in seconds; the first three polls use it directly.
const BASE_INTERVAL_SECS: f64 = 1.0;

/// Interval ceiling for the exponential phase.
const MAX_INTERVAL_SECS: f64 = 5.0;

/// Coze envelope: `code`/`msg` rather than the WeChat daemon's `message`.
#[derive(Debug, Deserialize)]
struct CozeEnvelope<T> {
    code: i64,
    #[serde(default)]
    msg: String,
    data: Option<T>,
}

/// Payload of `/v3/chat` and `/v3/chat/retrieve`.
#[derive(Debug, Deserialize)]
struct ChatData {
    /// Chat id.
    id: Option<String>,
    conversation_id: Option<String>,
    #[serde(default)]
    status: String,
    last_error: Option<ChatError>,
}

#[derive(Debug, Deserialize)]
struct ChatError {
    #[serde(default)]
    msg: String,
}

/// One message from `/v3/chat/message/list`.
#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    role: String,
    #[serde(default, rename = "type")]
    kind: String,
    #[serde(default)]
    content: String,
}

/// An additional message sent with the chat creation call.
#[derive(Debug, Serialize)]
struct AdditionalMessage<'a> {
    role: &'static str,
    content: &'a str,
    content_type: &'static str,
}

/// Coze bot platform.
pub struct CozePlatform {
    id: String,
    name: String,
    config: CozeConfig,
    client: reqwest::Client,
}

impl CozePlatform {
    /// Builds the platform from a stored descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::Config`] for a malformed config blob or a
    /// missing bot id.
    pub fn from_descriptor(descriptor: &PlatformDescriptor) -> Result<Self> {
        let config: CozeConfig = serde_json::from_value(descriptor.config.clone())
            .map_err(|e| PlatformError::Config(format!("coze config: {e}")))?;
        if config.bot_id.is_empty() {
            return Err(PlatformError::Config("coze bot_id is empty".to_string()));
        }
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            id: descriptor.platform_id.clone(),
            name: descriptor.name.clone(),
            config,
            client,
        })
    }

    fn api_base(&self) -> &str {
        self.config.api_base.trim_end_matches('/')
    }

    async fn get_envelope<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<T> {
        let response = self
            .client
            .get(url)
            .query(query)
            .bearer_auth(self.config.api_key.expose_secret())
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(api_error(status.as_u16(), &body));
        }
        let envelope: CozeEnvelope<T> = serde_json::from_str(&body)?;
        if envelope.code != 0 {
            return Err(PlatformError::Upstream(format!(
                "coze code {}: {}",
                envelope.code, envelope.msg
            )));
        }
        envelope
            .data
            .ok_or_else(|| PlatformError::InvalidResponse("coze envelope without data".to_string()))
    }

    /// Phase 1: create the chat, returning `(conversation_id, chat_id)`.
    async fn create_chat(
        &self,
        user_id: &str,
        content: &str,
        conversation_id: Option<&str>,
    ) -> Result<(String, String)> {
        let mut body = json!({
            "bot_id": self.config.bot_id,
            "user_id": user_id,
            "stream": false,
            // auto_save_history=false trips a v3 API error, so always true.
            "auto_save_history": true,
            "additional_messages": [AdditionalMessage {
                role: "user",
                content,
                content_type: "text",
            }],
        });
        if let Some(id) = conversation_id {
            body["conversation_id"] = json!(id);
        }

        let response = self
            .client
            .post(format!("{}/v3/chat", self.api_base()))
            .bearer_auth(self.config.api_key.expose_secret())
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(api_error(status.as_u16(), &text));
        }
        let envelope: CozeEnvelope<ChatData> = serde_json::from_str(&text)?;
        if envelope.code != 0 {
            return Err(PlatformError::Upstream(format!(
                "coze code {}: {}",
                envelope.code, envelope.msg
            )));
        }
        let data = envelope
            .data
            .ok_or_else(|| PlatformError::InvalidResponse("chat creation without data".to_string()))?;
        match (data.conversation_id, data.id) {
            (Some(conversation_id), Some(chat_id)) => Ok((conversation_id, chat_id)),
            _ => Err(PlatformError::InvalidResponse(
                "chat creation missing conversation or chat id".to_string(),
            )),
        }
    }

    /// Phase 2: poll the chat status until it completes.
    async fn wait_for_completion(&self, conversation_id: &str, chat_id: &str) -> Result<()> {
        for poll in 0..MAX_POLLS {
            let data: ChatData = self
                .get_envelope(
                    &format!("{}/v3/chat/retrieve", self.api_base()),
                    &[("conversation_id", conversation_id), ("chat_id", chat_id)],
                )
                .await?;

            match data.status.as_str() {
                "completed" => {
                    debug!("coze chat {chat_id} completed after {} polls", poll + 1);
                    return Ok(());
                }
                "failed" => {
                    let reason = data
                        .last_error
                        .map_or_else(|| "chat failed".to_string(), |e| e.msg);
                    return Err(PlatformError::Upstream(reason));
                }
                "created" | "in_progress" => {}
                other => warn!("coze chat {chat_id} in unknown status {other:?}"),
            }

            // Three quick polls, then exponential backoff capped at 5 s.
            let interval = if poll < 3 {
                BASE_INTERVAL_SECS
            } else {
                (BASE_INTERVAL_SECS * 1.5_f64.powi(i32::try_from(poll).unwrap_or(i32::MAX) - 2))
                    .min(MAX_INTERVAL_SECS)
            };
            tokio::time::sleep(Duration::from_secs_f64(interval)).await;
        }
        Err(PlatformError::PollTimeout(MAX_POLLS))
    }

    /// Phase 3: fetch the messages and pick the assistant's answer.
    async fn fetch_answer(&self, conversation_id: &str, chat_id: &str) -> Result<String> {
        let messages: Vec<ChatMessage> = self
            .get_envelope(
                &format!("{}/v3/chat/message/list", self.api_base()),
                &[("conversation_id", conversation_id), ("chat_id", chat_id)],
            )
            .await?;
        messages
            .into_iter()
            .find(|m| m.role == "assistant" && m.kind == "answer")
            .map(|m| m.content)
            .ok_or_else(|| PlatformError::InvalidResponse("no assistant answer".to_string()))
    }
}

#[async_trait]
impl Platform for CozePlatform {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> PlatformKind {
        PlatformKind::Coze
    }

    fn send_mode(&self) -> MessageSendMode {
        self.config.message_send_mode
    }

    async fn test_connection(&self) -> Result<serde_json::Value> {
        // The workspace listing is the cheapest authenticated probe.
        let workspaces: serde_json::Value = self
            .get_envelope(&format!("{}/v1/workspaces", self.api_base()), &[])
            .await?;
        Ok(workspaces)
    }

    async fn process_message(&self, request: &PlatformRequest) -> Result<PlatformReply> {
        let continuity = self
            .config
            .continuous_conversation
            .then(|| request.conversation_id.as_deref())
            .flatten();

        let (conversation_id, chat_id) = self
            .create_chat(&request.user_id, &request.content, continuity)
            .await?;
        info!(
            "coze chat {chat_id} created in conversation {conversation_id} for {}",
            request.message_id
        );

        self.wait_for_completion(&conversation_id, &chat_id).await?;
        let answer = self.fetch_answer(&conversation_id, &chat_id).await?;

        let mut reply = PlatformReply::text(answer);
        if self.config.continuous_conversation {
            reply.conversation_id = Some(conversation_id);
        }
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn platform(base: &str, continuous: bool) -> CozePlatform {
        CozePlatform::from_descriptor(&PlatformDescriptor {
            platform_id: "coze1".to_string(),
            name: "coze".to_string(),
            kind: PlatformKind::Coze,
            config: json!({
                "api_base": base,
                "api_key": "pat-1",
                "bot_id": "bot-1",
                "workspace_id": "ws-1",
                "continuous_conversation": continuous
            }),
            enabled: true,
            create_time: 0,
            update_time: 0,
        })
        .unwrap()
    }

    fn request(content: &str, conversation_id: Option<&str>) -> PlatformRequest {
        PlatformRequest {
            instance_id: "a".to_string(),
            message_id: "m1".to_string(),
            chat_name: "grp".to_string(),
            sender: "bob".to_string(),
            sender_remark: None,
            user_id: "grp==bob".to_string(),
            content: content.to_string(),
            conversation_id: conversation_id.map(String::from),
            file_path: None,
            file_type: wxrelay_common::FileType::None,
        }
    }

    async fn mount_happy_flow(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/v3/chat"))
            .and(body_partial_json(json!({"bot_id": "bot-1", "stream": false,
                                           "auto_save_history": true})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 0, "msg": "",
                "data": {"id": "chat-1", "conversation_id": "conv-1", "status": "in_progress"}
            })))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v3/chat/retrieve"))
            .and(query_param("conversation_id", "conv-1"))
            .and(query_param("chat_id", "chat-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 0, "msg": "",
                "data": {"id": "chat-1", "conversation_id": "conv-1", "status": "completed"}
            })))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v3/chat/message/list"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 0, "msg": "",
                "data": [
                    {"role": "assistant", "type": "follow_up", "content": "anything else?"},
                    {"role": "assistant", "type": "answer", "content": "the answer"}
                ]
            })))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn three_phase_flow_returns_assistant_answer() {
        let server = MockServer::start().await;
        mount_happy_flow(&server).await;

        let reply = platform(&server.uri(), true)
            .process_message(&request("hello", None))
            .await
            .unwrap();
        assert_eq!(reply.content, "the answer");
        assert_eq!(reply.conversation_id.as_deref(), Some("conv-1"));
    }

    #[tokio::test]
    async fn conversation_is_not_persisted_without_continuity() {
        let server = MockServer::start().await;
        mount_happy_flow(&server).await;

        let reply = platform(&server.uri(), false)
            .process_message(&request("hello", Some("conv-stored")))
            .await
            .unwrap();
        assert!(reply.conversation_id.is_none());
    }

    #[tokio::test]
    async fn continuity_passes_stored_conversation_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v3/chat"))
            .and(body_partial_json(json!({"conversation_id": "conv-stored"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 0, "msg": "",
                "data": {"id": "chat-1", "conversation_id": "conv-stored", "status": "completed"}
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v3/chat/retrieve"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 0, "msg": "",
                "data": {"id": "chat-1", "conversation_id": "conv-stored", "status": "completed"}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v3/chat/message/list"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 0, "msg": "",
                "data": [{"role": "assistant", "type": "answer", "content": "hi again"}]
            })))
            .mount(&server)
            .await;

        let reply = platform(&server.uri(), true)
            .process_message(&request("hello", Some("conv-stored")))
            .await
            .unwrap();
        assert_eq!(reply.content, "hi again");
    }

    #[tokio::test]
    async fn failed_chat_surfaces_upstream_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v3/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 0, "msg": "",
                "data": {"id": "chat-1", "conversation_id": "conv-1", "status": "in_progress"}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v3/chat/retrieve"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 0, "msg": "",
                "data": {"id": "chat-1", "conversation_id": "conv-1", "status": "failed",
                          "last_error": {"code": 5000, "msg": "bot exploded"}}
            })))
            .mount(&server)
            .await;

        let err = platform(&server.uri(), false)
            .process_message(&request("hello", None))
            .await
            .unwrap_err();
        assert!(matches!(err, PlatformError::Upstream(reason) if reason == "bot exploded"));
    }

    #[tokio::test]
    async fn non_zero_code_is_upstream_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v3/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 4000, "msg": "invalid bot"
            })))
            .mount(&server)
            .await;

        let err = platform(&server.uri(), false)
            .process_message(&request("hello", None))
            .await
            .unwrap_err();
        assert!(matches!(err, PlatformError::Upstream(_)));
    }
}
