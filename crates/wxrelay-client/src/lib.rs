//! # wxrelay-client
//!
//! HTTP client for remote WeChat automation daemons ("instances").
//!
//! Every instance exposes the same JSON API: an `X-API-Key` header for auth
//! and a `{code, message, data}` envelope on every response. [`WxApiClient`]
//! wraps one instance; [`InstanceRegistry`] owns the set of configured
//! instances and hands out lazily-built clients.
//!
//! Requests to a single instance are serialised so the automation daemon,
//! which drives a real WeChat window, never sees concurrent calls.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error};
use reqwest::Method;
use reqwest_middleware::ClientWithMiddleware;
use reqwest_retry::{RetryTransientMiddleware, policies::ExponentialBackoff};
use reqwest_retry_after::RetryAfterMiddleware;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde_json::json;

mod error;
mod registry;
mod types;

pub use error::{ClientError, Result};
pub use registry::{InstanceConfig, InstanceRegistry};
pub use types::{
    ApiEnvelope, MessagesPayload, PollFlags, RemoteMessage, ResourceGauge, SystemResources,
    WeChatStatus,
};

/// Default per-request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// How many transient transport failures the middleware retries before the
/// error reaches the caller. Poll-cycle level retry stays the caller's job.
const TRANSPORT_RETRIES: u32 = 2;

/// Longest error-body excerpt carried in a [`ClientError::Http`].
const ERROR_BODY_LIMIT: usize = 200;

/// Client for one remote WeChat automation daemon.
pub struct WxApiClient {
    client: ClientWithMiddleware,
    base_url: String,
    api_key: Arc<SecretString>,
    /// One in-flight request per instance; the remote daemon drives a real
    /// UI and cannot service concurrent calls.
    request_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for WxApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WxApiClient")
            .field("base_url", &self.base_url)
            .field("api_key", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

impl WxApiClient {
    /// Creates a client for `base_url` with the given key and timeout.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Configuration`] if the base URL does not parse,
    /// or a network error if the HTTP client cannot be built.
    pub fn new(base_url: &str, api_key: SecretString, timeout_secs: u64) -> Result<Self> {
        let base_url = base_url.trim_end_matches('/').to_string();
        url::Url::parse(&base_url)
            .map_err(|e| ClientError::Configuration(format!("invalid base URL {base_url}: {e}")))?;

        let reqwest_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;

        let retry_policy = ExponentialBackoff::builder()
            .retry_bounds(Duration::from_millis(250), Duration::from_secs(2))
            .build_with_max_retries(TRANSPORT_RETRIES);

        // RetryAfterMiddleware goes first so Retry-After headers are honoured
        // before the exponential backoff kicks in.
        let client = reqwest_middleware::ClientBuilder::new(reqwest_client)
            .with(RetryAfterMiddleware::new())
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(Self {
            client,
            base_url,
            api_key: Arc::new(api_key),
            request_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Brings the remote WeChat client up. Required before any other call.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or a non-zero envelope code.
    pub async fn initialize(&self) -> Result<bool> {
        self.call::<serde_json::Value>(Method::POST, "/api/wechat/initialize", &[], None)
            .await?;
        Ok(true)
    }

    /// Fetches the remote WeChat client status.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or a non-zero envelope code.
    pub async fn status(&self) -> Result<WeChatStatus> {
        self.call(Method::GET, "/api/wechat/status", &[], None).await
    }

    /// Fetches CPU and memory figures from the remote host.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or a non-zero envelope code.
    pub async fn system_resources(&self) -> Result<SystemResources> {
        self.call(Method::GET, "/api/system/resources", &[], None)
            .await
    }

    /// Sends a plain text message, optionally at-mentioning `at_list`.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or a non-zero envelope code.
    pub async fn send(&self, receiver: &str, message: &str, at_list: &[String]) -> Result<()> {
        let body = json!({
            "receiver": receiver,
            "message": message,
            "at_list": at_list,
        });
        self.call::<serde_json::Value>(Method::POST, "/api/message/send", &[], Some(&body))
            .await?;
        Ok(())
    }

    /// Sends an image by path on the remote host.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or a non-zero envelope code.
    pub async fn send_image(&self, receiver: &str, image_path: &str) -> Result<()> {
        let body = json!({"receiver": receiver, "image_path": image_path});
        self.call::<serde_json::Value>(Method::POST, "/api/message/send-image", &[], Some(&body))
            .await?;
        Ok(())
    }

    /// Sends a file by path on the remote host.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or a non-zero envelope code.
    pub async fn send_file(&self, receiver: &str, file_path: &str) -> Result<()> {
        let body = json!({"receiver": receiver, "file_path": file_path});
        self.call::<serde_json::Value>(Method::POST, "/api/message/send-file", &[], Some(&body))
            .await?;
        Ok(())
    }

    /// Sends a message through the remote's character-paced typing endpoint.
    ///
    /// The pacing contract of the endpoint is daemon-specific, so chunking is
    /// passed through from configuration instead of being hard-coded here.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or a non-zero envelope code.
    pub async fn send_typing(
        &self,
        receiver: &str,
        message: &str,
        chunk_size: u32,
        chunk_delay_ms: u64,
    ) -> Result<()> {
        let body = json!({
            "receiver": receiver,
            "message": message,
            "chunk_size": chunk_size,
            "chunk_delay_ms": chunk_delay_ms,
        });
        self.call::<serde_json::Value>(Method::POST, "/api/message/send-typing", &[], Some(&body))
            .await?;
        Ok(())
    }

    /// One-shot poll of the main window for unread messages.
    ///
    /// The daemon groups messages by chat; the returned list is flattened
    /// with `chat_name` filled in on every message.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or a non-zero envelope code.
    pub async fn get_unread(&self, flags: PollFlags) -> Result<Vec<RemoteMessage>> {
        let query = flags.as_query();
        let payload: MessagesPayload = self
            .call(Method::GET, "/api/message/get-next-new", &query, None)
            .await?;

        let mut messages = Vec::new();
        for (chat_name, chat_messages) in payload.messages {
            for mut message in chat_messages {
                message.chat_name.get_or_insert_with(|| chat_name.clone());
                messages.push(message);
            }
        }
        Ok(messages)
    }

    /// Subscribes the remote daemon to a chat.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or a non-zero envelope code.
    pub async fn add_listener(&self, who: &str, flags: PollFlags) -> Result<()> {
        let body = json!({
            "who": who,
            "savePic": flags.save_pic,
            "saveVideo": flags.save_video,
            "saveFile": flags.save_file,
            "saveVoice": flags.save_voice,
            "parseUrl": flags.parse_url,
        });
        self.call::<serde_json::Value>(Method::POST, "/api/message/listen/add", &[], Some(&body))
            .await?;
        Ok(())
    }

    /// Removes the remote subscription for a chat.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or a non-zero envelope code.
    pub async fn remove_listener(&self, who: &str) -> Result<()> {
        let body = json!({"who": who});
        self.call::<serde_json::Value>(Method::POST, "/api/message/listen/remove", &[], Some(&body))
            .await?;
        Ok(())
    }

    /// Fetches new messages for one subscribed chat.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or a non-zero envelope code.
    /// A 404 means the remote lost the subscription; callers check with
    /// [`ClientError::is_listener_missing`] and re-arm.
    pub async fn get_listener_messages(&self, who: &str) -> Result<Vec<RemoteMessage>> {
        let query = [("who", who)];
        let payload: MessagesPayload = self
            .call(Method::GET, "/api/message/listen/get", &query, None)
            .await?;

        let mut messages = payload.messages.into_values().flatten().collect::<Vec<_>>();
        for message in &mut messages {
            message.chat_name.get_or_insert_with(|| who.to_string());
        }
        Ok(messages)
    }

    /// Issues one request and unwraps the response envelope.
    ///
    /// Missing `data` on a zero-code response decodes as `T::default()`,
    /// which covers the ack-only endpoints.
    async fn call<T: DeserializeOwned + Default>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&serde_json::Value>,
    ) -> Result<T> {
        let _guard = self.request_lock.lock().await;

        let url = format!("{}{path}", self.base_url);
        let mut request = self
            .client
            .request(method, &url)
            .header("X-API-Key", self.api_key.expose_secret());
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let body: String = body.chars().take(ERROR_BODY_LIMIT).collect();
            error!("{url} failed with HTTP {status}: {body}");
            return Err(ClientError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let envelope: ApiEnvelope<T> = response.json().await.map_err(ClientError::Network)?;
        if envelope.code != 0 {
            debug!("{url} returned business code {}", envelope.code);
            return Err(ClientError::Api {
                code: envelope.code,
                message: envelope.message,
            });
        }
        Ok(envelope.data.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> WxApiClient {
        WxApiClient::new(&server.uri(), SecretString::from("test-key"), 5).unwrap()
    }

    #[tokio::test]
    async fn status_carries_api_key_header() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/wechat/status"))
            .and(header("X-API-Key", "test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "code": 0, "message": "ok", "data": {"online": true, "uptime": 3.0}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let status = client_for(&server).status().await.unwrap();
        assert!(status.online);
    }

    #[tokio::test]
    async fn non_zero_code_is_an_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/wechat/initialize"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "code": 1, "message": "wechat not running"
            })))
            .mount(&server)
            .await;

        let err = client_for(&server).initialize().await.unwrap_err();
        assert!(matches!(err, ClientError::Api { code: 1, .. }));
    }

    #[tokio::test]
    async fn http_error_carries_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/message/listen/get"))
            .respond_with(ResponseTemplate::new(404).set_body_string("listener not found"))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .get_listener_messages("alice")
            .await
            .unwrap_err();
        assert!(err.is_listener_missing());
    }

    #[tokio::test]
    async fn unread_poll_flattens_chats_and_sends_flags() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/message/get-next-new"))
            .and(query_param("savePic", "true"))
            .and(query_param("saveVoice", "false"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "code": 0,
                "data": {"messages": {
                    "alice": [{"id": "m1", "content": "hi", "sender": "alice"}],
                    "dev group": [{"id": "m2", "content": "yo", "sender": "bob"}]
                }}
            })))
            .mount(&server)
            .await;

        let mut messages = client_for(&server)
            .get_unread(PollFlags::default())
            .await
            .unwrap();
        messages.sort_by(|a, b| a.id.cmp(&b.id));
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].chat_name.as_deref(), Some("alice"));
        assert_eq!(messages[1].chat_name.as_deref(), Some("dev group"));
    }

    #[tokio::test]
    async fn send_posts_receiver_and_at_list() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/message/send"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"code": 0})))
            .expect(1)
            .mount(&server)
            .await;

        client_for(&server)
            .send("dev group", "@bob done", &["bob".to_string()])
            .await
            .unwrap();
    }

    #[test]
    fn rejects_invalid_base_url() {
        let err = WxApiClient::new("not a url", SecretString::from("k"), 5).unwrap_err();
        assert!(matches!(err, ClientError::Configuration(_)));
    }
}
