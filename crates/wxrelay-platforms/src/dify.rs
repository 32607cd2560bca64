//! Dify platform: blocking chat-messages with file upload and stale-session
//! recovery.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use wxrelay_common::{
    DifyConfig, FileType, MessageSendMode, PlatformDescriptor, PlatformKind, PlatformReply,
};

use crate::error::{PlatformError, Result};
use crate::{Platform, PlatformRequest, api_error};

/// Client-side timeout; the delivery service wraps calls in its own
/// wall-clock deadline as well.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Extensions Dify treats as documents.
const DOCUMENT_EXTENSIONS: [&str; 16] = [
    "txt", "md", "markdown", "pdf", "html", "xlsx", "xls", "docx", "doc", "csv", "eml", "msg",
    "pptx", "ppt", "xml", "epub",
];

/// Extensions Dify treats as images.
const IMAGE_EXTENSIONS: [&str; 6] = ["jpg", "jpeg", "png", "gif", "webp", "svg"];

/// A file reference attached to a chat message after upload.
#[derive(Debug, Clone, Serialize)]
pub struct DifyFileRef {
    /// `document` or `image`, derived from the extension.
    #[serde(rename = "type")]
    pub kind: &'static str,
    /// Always `local_file` for uploaded content.
    pub transfer_method: &'static str,
    /// Id returned by `/files/upload`.
    pub upload_file_id: String,
}

/// `/chat-messages` request body.
#[derive(Debug, Clone, Serialize, TypedBuilder)]
pub struct DifyChatRequest {
    /// App input variables; always empty for the relay.
    pub inputs: serde_json::Value,
    /// The user's message.
    pub query: String,
    /// Always `blocking`; the relay never streams.
    pub response_mode: &'static str,
    /// End-user identifier for Dify's session accounting.
    pub user: String,
    /// Conversation to continue, when one is known.
    #[builder(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    /// Uploaded attachments.
    #[builder(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<DifyFileRef>>,
}

/// `/chat-messages` response body.
#[derive(Debug, Deserialize)]
pub struct DifyChatResponse {
    /// The answer text.
    #[serde(default)]
    pub answer: String,
    /// Conversation id for continuity.
    #[serde(default)]
    pub conversation_id: Option<String>,
}

/// `/files/upload` response body.
#[derive(Debug, Deserialize)]
struct UploadResponse {
    id: String,
}

/// Dify chat platform.
pub struct DifyPlatform {
    id: String,
    name: String,
    config: DifyConfig,
    client: reqwest::Client,
}

impl DifyPlatform {
    /// Builds the platform from a stored descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::Config`] for a malformed config blob.
    pub fn from_descriptor(descriptor: &PlatformDescriptor) -> Result<Self> {
        let config: DifyConfig = serde_json::from_value(descriptor.config.clone())
            .map_err(|e| PlatformError::Config(format!("dify config: {e}")))?;
        if config.api_base.is_empty() {
            return Err(PlatformError::Config("dify api_base is empty".to_string()));
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

    /// Uploads a local file and returns the reference to attach.
    ///
    /// # Errors
    ///
    /// Returns a file error when the path cannot be read, or the upstream
    /// failure.
    pub async fn upload_file(&self, path: &str, user: &str) -> Result<DifyFileRef> {
        let bytes = tokio::fs::read(path).await?;
        if bytes.is_empty() {
            return Err(PlatformError::InvalidResponse(format!(
                "attachment {path} is empty"
            )));
        }
        let file_name = Path::new(path)
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("attachment")
            .to_string();
        let kind = dify_file_kind(&file_name);

        let part = reqwest::multipart::Part::bytes(bytes).file_name(file_name.clone());
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("user", user.to_string());

        debug!("uploading {file_name} to dify as {kind}");
        let response = self
            .client
            .post(format!("{}/files/upload", self.api_base()))
            .bearer_auth(self.config.api_key.expose_secret())
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(api_error(status.as_u16(), &body));
        }
        let uploaded: UploadResponse = serde_json::from_str(&body)?;
        Ok(DifyFileRef {
            kind,
            transfer_method: "local_file",
            upload_file_id: uploaded.id,
        })
    }

    async fn chat(&self, body: &DifyChatRequest) -> Result<(u16, String)> {
        let response = self
            .client
            .post(format!("{}/chat-messages", self.api_base()))
            .bearer_auth(self.config.api_key.expose_secret())
            .json(body)
            .send()
            .await?;
        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        Ok((status, text))
    }
}

/// Derives the Dify file category from a file name. Unknown extensions fall
/// back to `document`, matching the upstream's tolerance.
#[must_use]
pub fn dify_file_kind(file_name: &str) -> &'static str {
    let extension = Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();
    if IMAGE_EXTENSIONS.contains(&extension.as_str()) {
        "image"
    } else {
        if !DOCUMENT_EXTENSIONS.contains(&extension.as_str()) {
            warn!("unknown attachment extension {extension:?}, treating as document");
        }
        "document"
    }
}

#[async_trait]
impl Platform for DifyPlatform {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> PlatformKind {
        PlatformKind::Dify
    }

    fn send_mode(&self) -> MessageSendMode {
        self.config.message_send_mode
    }

    async fn test_connection(&self) -> Result<serde_json::Value> {
        // app-info first, parameters as the fallback for older deployments.
        for endpoint in ["app-info", "parameters"] {
            let response = self
                .client
                .get(format!("{}/{endpoint}", self.api_base()))
                .bearer_auth(self.config.api_key.expose_secret())
                .send()
                .await?;
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            if status.is_success() {
                return Ok(serde_json::from_str(&body)?);
            }
            if endpoint == "parameters" {
                return Err(api_error(status.as_u16(), &body));
            }
            warn!("dify app-info probe failed ({status}), trying parameters");
        }
        unreachable!("loop always returns on the fallback endpoint")
    }

    async fn process_message(&self, request: &PlatformRequest) -> Result<PlatformReply> {
        let user = if request.user_id.is_empty() {
            self.config
                .user_id
                .clone()
                .unwrap_or_else(|| "wxrelay".to_string())
        } else {
            request.user_id.clone()
        };

        let files = match (&request.file_path, request.file_type) {
            (Some(path), FileType::Image | FileType::File) => {
                Some(vec![self.upload_file(path, &user).await?])
            }
            _ => None,
        };

        // Per-user continuity wins over the legacy app-wide slot.
        let conversation_id = request
            .conversation_id
            .clone()
            .or_else(|| self.config.conversation_id.clone().filter(|id| !id.is_empty()));

        let mut body = DifyChatRequest::builder()
            .inputs(serde_json::json!({}))
            .query(request.content.clone())
            .response_mode("blocking")
            .user(user)
            .conversation_id(conversation_id.clone())
            .files(files)
            .build();

        let (status, text) = self.chat(&body).await?;

        let (status, text) = if status == 404 && conversation_id.is_some() {
            // The upstream forgot the conversation; retry once without it
            // and tell the caller to drop the stored mapping.
            let stale = conversation_id.clone().unwrap_or_default();
            warn!("dify conversation {stale} is gone, retrying without it");
            body.conversation_id = None;
            let (retry_status, retry_text) = self.chat(&body).await?;
            if !(200..300).contains(&retry_status) {
                return Err(PlatformError::SessionInvalid {
                    conversation_id: stale,
                });
            }
            let parsed: DifyChatResponse = serde_json::from_str(&retry_text)?;
            let mut reply = PlatformReply::text(parsed.answer);
            reply.stale_conversation_id = Some(stale);
            reply.conversation_id = parsed.conversation_id;
            info!("dify recovered with a fresh conversation for {}", request.message_id);
            return Ok(reply);
        } else {
            (status, text)
        };

        if !(200..300).contains(&status) {
            return Err(api_error(status, &text));
        }

        let parsed: DifyChatResponse = serde_json::from_str(&text)?;
        let mut reply = PlatformReply::text(parsed.answer);
        reply.conversation_id = parsed.conversation_id;
        Ok(reply)
    }
}
