//! OpenAI-compatible platform: stateless chat completions.
//!
//! Each call sends the configured system prompt plus the single user turn;
//! the core intentionally keeps no multi-turn memory for this kind.

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use wxrelay_common::{
    MessageSendMode, OpenAiConfig, PlatformDescriptor, PlatformKind, PlatformReply,
};

use crate::error::{PlatformError, Result};
use crate::{Platform, PlatformRequest, api_error};

/// Client-side timeout; the delivery service wraps calls in its own
/// wall-clock deadline as well.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// One chat message in the completions request.
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    /// `system`, `user` or `assistant`.
    pub role: &'static str,
    /// Message text.
    pub content: String,
}

/// Chat completions request body.
#[derive(Debug, Clone, Serialize, TypedBuilder)]
pub struct ChatCompletionRequest {
    /// Model identifier.
    pub model: String,
    /// System prompt plus the user turn.
    pub messages: Vec<ChatMessage>,
    /// Sampling temperature.
    #[builder(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Completion token cap.
    #[builder(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

/// One choice of a chat completions response.
#[derive(Debug, Deserialize)]
pub struct ChatChoice {
    /// The generated message.
    pub message: ChoiceMessage,
}

/// The message inside a choice.
#[derive(Debug, Deserialize)]
pub struct ChoiceMessage {
    /// Generated text; absent for pure tool-call answers.
    #[serde(default)]
    pub content: Option<String>,
}

/// Chat completions response body.
#[derive(Debug, Deserialize)]
pub struct ChatCompletionResponse {
    /// Generated completions.
    #[serde(default)]
    pub choices: Vec<ChatChoice>,
}

/// OpenAI-compatible chat platform.
pub struct OpenAiPlatform {
    id: String,
    name: String,
    config: OpenAiConfig,
    client: reqwest::Client,
}

impl OpenAiPlatform {
    /// Builds the platform from a stored descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::Config`] for a malformed config blob.
    pub fn from_descriptor(descriptor: &PlatformDescriptor) -> Result<Self> {
        let config: OpenAiConfig = serde_json::from_value(descriptor.config.clone())
            .map_err(|e| PlatformError::Config(format!("openai config: {e}")))?;
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
}

#[async_trait]
impl Platform for OpenAiPlatform {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> PlatformKind {
        PlatformKind::Openai
    }

    fn send_mode(&self) -> MessageSendMode {
        self.config.message_send_mode
    }

    async fn test_connection(&self) -> Result<serde_json::Value> {
        // The models listing is the cheapest authenticated probe.
        let response = self
            .client
            .get(format!("{}/models", self.api_base()))
            .bearer_auth(self.config.api_key.expose_secret())
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(api_error(status.as_u16(), &body));
        }
        let models: serde_json::Value = serde_json::from_str(&body)?;
        Ok(models)
    }

    async fn process_message(&self, request: &PlatformRequest) -> Result<PlatformReply> {
        let body = ChatCompletionRequest::builder()
            .model(self.config.model.clone())
            .messages(vec![
                ChatMessage {
                    role: "system",
                    content: self.config.system_prompt.clone(),
                },
                ChatMessage {
                    role: "user",
                    content: request.content.clone(),
                },
            ])
            .temperature(Some(self.config.temperature))
            .max_tokens(Some(self.config.max_tokens))
            .build();

        debug!("calling {} model {}", self.api_base(), self.config.model);
        let response = self
            .client
            .post(format!("{}/chat/completions", self.api_base()))
            .bearer_auth(self.config.api_key.expose_secret())
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(api_error(status.as_u16(), &text));
        }

        let parsed: ChatCompletionResponse = serde_json::from_str(&text)?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| {
                PlatformError::InvalidResponse("completion carried no message content".to_string())
            })?;

        info!("openai reply ({} chars) for {}", content.len(), request.message_id);
        Ok(PlatformReply::text(content))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn platform(base: &str) -> OpenAiPlatform {
        OpenAiPlatform::from_descriptor(&PlatformDescriptor {
            platform_id: "openai1".to_string(),
            name: "assistant".to_string(),
            kind: PlatformKind::Openai,
            config: json!({
                "api_base": base,
                "api_key": "sk-test",
                "model": "gpt-4o-mini",
                "system_prompt": "be brief",
                "temperature": 0.2,
                "max_tokens": 64
            }),
            enabled: true,
            create_time: 0,
            update_time: 0,
        })
        .unwrap()
    }

    fn request(content: &str) -> PlatformRequest {
        PlatformRequest {
            instance_id: "a".to_string(),
            message_id: "m1".to_string(),
            chat_name: "alice".to_string(),
            sender: "alice".to_string(),
            sender_remark: None,
            user_id: "alice".to_string(),
            content: content.to_string(),
            conversation_id: None,
            file_path: None,
            file_type: wxrelay_common::FileType::None,
        }
    }

    #[tokio::test]
    async fn sends_system_prompt_and_returns_first_choice() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("Authorization", "Bearer sk-test"))
            .and(body_partial_json(json!({
                "model": "gpt-4o-mini",
                "messages": [
                    {"role": "system", "content": "be brief"},
                    {"role": "user", "content": "hi"}
                ]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"role": "assistant", "content": "hello"}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let reply = platform(&server.uri())
            .process_message(&request("hi"))
            .await
            .unwrap();
        assert!(reply.should_reply);
        assert_eq!(reply.content, "hello");
        // This kind keeps no multi-turn state, so no conversation id.
        assert!(reply.conversation_id.is_none());
    }

    #[tokio::test]
    async fn upstream_error_is_surfaced() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .mount(&server)
            .await;

        let err = platform(&server.uri())
            .process_message(&request("hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, PlatformError::Api { status: 429, .. }));
    }

    #[tokio::test]
    async fn missing_choices_is_invalid_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": []})))
            .mount(&server)
            .await;

        let err = platform(&server.uri())
            .process_message(&request("hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, PlatformError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn connection_test_lists_models() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"id": "gpt-4o-mini"}]
            })))
            .mount(&server)
            .await;

        let probe = platform(&server.uri()).test_connection().await.unwrap();
        assert_eq!(probe["data"][0]["id"], "gpt-4o-mini");
    }
}
