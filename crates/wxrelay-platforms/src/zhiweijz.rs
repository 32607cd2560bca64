//! Accounting (zhiweijz) platform: JWT-authenticated smart bookkeeping.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use log::{debug, info, warn};
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;

use wxrelay_common::{
    MessageSendMode, PlatformDescriptor, PlatformKind, PlatformReply, ZhiweijzConfig,
};

use crate::error::{PlatformError, Result};
use crate::{Platform, PlatformRequest, api_error};

/// The upstream's marker for a message that has nothing to do with
/// bookkeeping; arrives in an HTTP 400 body.
const IRRELEVANT_MARKER: &str = "消息与记账无关";

/// The fixed notice sent back (when configured) for irrelevant messages.
const IRRELEVANT_REPLY: &str = "信息与记账无关";

/// Tokens are refreshed this long before their `exp` claim.
const TOKEN_SAFETY_WINDOW_SECS: i64 = 300;

/// A held JWT and its decoded expiry.
#[derive(Debug, Clone, Default)]
struct TokenState {
    token: Option<String>,
    expires_at: Option<i64>,
}

impl TokenState {
    fn is_valid(&self, now: i64) -> bool {
        match (&self.token, self.expires_at) {
            (Some(_), Some(expires_at)) => now < expires_at - TOKEN_SAFETY_WINDOW_SECS,
            (Some(_), None) => true,
            _ => false,
        }
    }
}

/// `/api/auth/login` response body.
#[derive(Debug, Deserialize)]
struct LoginResponse {
    token: Option<String>,
}

/// Accounting platform.
pub struct ZhiweijzPlatform {
    id: String,
    name: String,
    config: ZhiweijzConfig,
    client: reqwest::Client,
    /// Token state is owned by this worker; all access goes through its
    /// methods.
    token: Mutex<TokenState>,
}

impl ZhiweijzPlatform {
    /// Builds the platform from a stored descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::Config`] for a malformed config blob or
    /// missing credentials.
    pub fn from_descriptor(descriptor: &PlatformDescriptor) -> Result<Self> {
        let config: ZhiweijzConfig = serde_json::from_value(descriptor.config.clone())
            .map_err(|e| PlatformError::Config(format!("zhiweijz config: {e}")))?;
        if config.server_url.is_empty() || config.username.is_empty() {
            return Err(PlatformError::Config(
                "zhiweijz server_url and username are required".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout))
            .build()?;
        Ok(Self {
            id: descriptor.platform_id.clone(),
            name: descriptor.name.clone(),
            config,
            client,
            token: Mutex::new(TokenState::default()),
        })
    }

    fn server_url(&self) -> &str {
        self.config.server_url.trim_end_matches('/')
    }

    /// Logs in and stores the fresh token. Returns it for immediate use.
    async fn login(&self) -> Result<String> {
        let response = self
            .client
            .post(format!("{}/api/auth/login", self.server_url()))
            .json(&json!({
                "email": self.config.username,
                "password": self.config.password.expose_secret(),
            }))
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(api_error(status.as_u16(), &body));
        }

        let parsed: LoginResponse = serde_json::from_str(&body)?;
        let token = parsed.token.ok_or_else(|| {
            PlatformError::InvalidResponse("login response without token".to_string())
        })?;

        let expires_at = jwt_expiry(&token);
        let mut state = self.token.lock().await;
        state.token = Some(token.clone());
        state.expires_at = expires_at;
        info!("zhiweijz login ok, token expires at {expires_at:?}");
        Ok(token)
    }

    /// Returns a token valid for at least the safety window, logging in when
    /// allowed and needed.
    async fn ensure_token(&self, now: i64) -> Result<String> {
        {
            let state = self.token.lock().await;
            if state.is_valid(now)
                && let Some(token) = &state.token
            {
                return Ok(token.clone());
            }
        }
        if !self.config.auto_login {
            return Err(PlatformError::Config(
                "token expired and auto_login is disabled".to_string(),
            ));
        }
        self.login().await
    }

    async fn post_accounting(
        &self,
        token: &str,
        description: &str,
        user_name: Option<&str>,
    ) -> Result<reqwest::Response> {
        let mut body = json!({
            "description": description,
            "accountBookId": self.config.account_book_id,
        });
        if let Some(user_name) = user_name {
            body["userName"] = json!(user_name);
        }
        Ok(self
            .client
            .post(format!(
                "{}/api/ai/smart-accounting/direct",
                self.server_url()
            ))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?)
    }

    fn irrelevant_reply(&self) -> PlatformReply {
        if self.config.warn_on_irrelevant {
            PlatformReply::text(IRRELEVANT_REPLY)
        } else {
            PlatformReply::declined(IRRELEVANT_REPLY)
        }
    }
}

/// Decodes the `exp` claim of a JWT without verifying the signature; the
/// expiry only drives proactive refresh, the server stays authoritative.
fn jwt_expiry(token: &str) -> Option<i64> {
    let payload = token.split('.').nth(1)?;
    let decoded = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&decoded).ok()?;
    claims.get("exp").and_then(serde_json::Value::as_i64)
}

/// Renders the upstream accounting result into the chat reply.
fn format_accounting_reply(result: &serde_json::Value) -> String {
    if let Some(smart) = result.get("smartAccountingResult") {
        return format_smart_result(smart);
    }
    if let Some(data) = result.get("data") {
        return format_data_result(data);
    }
    "✅ 记账成功！".to_string()
}

fn format_smart_result(smart: &serde_json::Value) -> String {
    if smart.get("isRelevant").and_then(serde_json::Value::as_bool) == Some(false) {
        return IRRELEVANT_REPLY.to_string();
    }
    if let Some(error) = smart.get("error").and_then(serde_json::Value::as_str) {
        let lowered = error.to_lowercase();
        if lowered.contains("token") && (lowered.contains("limit") || error.contains("限制")) {
            return format!("💳 token使用达到限制: {error}");
        }
        if lowered.contains("rate") || error.contains("频繁") || lowered.contains("too many") {
            return format!("⏱️ 访问过于频繁: {error}");
        }
        return format!("❌ 记账失败: {error}");
    }

    let Some(amount) = field(smart, &["amount"]) else {
        let message = field(smart, &["message"]).unwrap_or_else(|| "记账失败".to_string());
        return format!("❌ 记账失败: {message}");
    };

    let mut lines = vec!["✅ 记账成功！".to_string()];
    // note carries the cleaned-up detail, originalDescription the raw text.
    if let Some(note) = field(smart, &["note", "description"]) {
        lines.push(format!("📝 明细：{note}"));
    }
    if let Some(date) = field(smart, &["date"]) {
        let date = date.split('T').next().unwrap_or(&date).to_string();
        lines.push(format!("📅 日期：{date}"));
    }
    push_direction_category(
        &mut lines,
        field(smart, &["type", "direction"]).as_deref(),
        field(smart, &["categoryName", "category"]).as_deref(),
    );
    lines.push(format!("💰 金额：{amount}元"));
    if let Some(budget) = field(smart, &["budgetName", "budget"]) {
        let owner = field(smart, &["budgetOwnerName", "budgetOwner"]);
        if budget == "个人预算"
            && let Some(owner) = owner
        {
            lines.push(format!("📊 预算：{budget}（{owner}）"));
        } else {
            lines.push(format!("📊 预算：{budget}"));
        }
    }
    lines.join("\n")
}

fn format_data_result(data: &serde_json::Value) -> String {
    let mut lines = vec!["✅ 记账成功！".to_string()];
    if let Some(description) = field(data, &["description"]) {
        lines.push(format!("📝 明细：{description}"));
    }
    if let Some(date) = field(data, &["date"]) {
        lines.push(format!("📅 日期：{date}"));
    }
    push_direction_category(
        &mut lines,
        field(data, &["direction"]).as_deref().or(Some("支出")),
        field(data, &["category"]).as_deref(),
    );
    if let Some(amount) = field(data, &["amount"]) {
        lines.push(format!("💰 金额：{amount}元"));
    }
    match data.get("budget") {
        Some(serde_json::Value::Object(budget)) => {
            let remaining = budget.get("remaining").map_or_else(
                || "0".to_string(),
                |v| v.as_f64().map_or_else(|| v.to_string(), |f| f.to_string()),
            );
            lines.push(format!("📊 预算余额：{remaining}元"));
        }
        Some(serde_json::Value::String(budget)) => {
            lines.push(format!("📊 预算：{budget}"));
        }
        _ => {}
    }
    lines.join("\n")
}

fn push_direction_category(
    lines: &mut Vec<String>,
    direction: Option<&str>,
    category: Option<&str>,
) {
    let mut parts = Vec::new();
    if let Some(direction) = direction.filter(|d| !d.is_empty()) {
        let (icon, text) = direction_info(direction);
        parts.push(format!("{icon} 方向：{text}"));
    }
    if let Some(category) = category.filter(|c| !c.is_empty()) {
        parts.push(format!("分类：{}{category}", category_icon(category)));
    }
    if !parts.is_empty() {
        lines.push(parts.join("；"));
    }
}

/// String or number field lookup with fallback key order.
fn field(value: &serde_json::Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match value.get(*key) {
        Some(serde_json::Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Icon for an expense/income category.
fn category_icon(category: &str) -> &'static str {
    match category {
        "餐饮" => "🍽️",
        "交通" => "🚗",
        "购物" => "🛒",
        "娱乐" => "🎮",
        "医疗" => "🏥",
        "教育" => "📚",
        "学习" => "📝",
        "日用" => "🧴",
        "住房" => "🏠",
        "通讯" => "📱",
        "服装" => "👕",
        "美容" => "💄",
        "运动" => "⚽",
        "旅游" => "✈️",
        "投资" => "💰",
        "保险" => "🛡️",
        "转账" => "💸",
        "红包" => "🧧",
        "工资" => "💼",
        "奖金" => "🎁",
        "兼职" => "👨‍💻",
        "理财" => "📈",
        "其他" => "📦",
        _ => "📂",
    }
}

/// Icon and display text for a booking direction.
fn direction_info(direction: &str) -> (&'static str, String) {
    match direction.to_lowercase().as_str() {
        "支出" | "expense" => ("💸", "支出".to_string()),
        "收入" | "income" => ("💰", "收入".to_string()),
        "transfer" | "转账" => ("🔄", "转账".to_string()),
        _ => ("💸", direction.to_string()),
    }
}

#[async_trait]
impl Platform for ZhiweijzPlatform {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> PlatformKind {
        PlatformKind::Zhiweijz
    }

    fn send_mode(&self) -> MessageSendMode {
        self.config.message_send_mode
    }

    async fn test_connection(&self) -> Result<serde_json::Value> {
        let token = self.login().await?;
        let response = self
            .client
            .get(format!("{}/api/account-books", self.server_url()))
            .bearer_auth(&token)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(api_error(status.as_u16(), &body));
        }
        let books: serde_json::Value = serde_json::from_str(&body)?;
        Ok(json!({
            "server_url": self.config.server_url,
            "username": self.config.username,
            "current_account_book": self.config.account_book_name.clone()
                .unwrap_or_else(|| self.config.account_book_id.clone()),
            "account_books": books,
        }))
    }

    async fn process_message(&self, request: &PlatformRequest) -> Result<PlatformReply> {
        let now = chrono_now();
        let token = self.ensure_token(now).await?;
        let sender_name = request.sender_remark.as_deref().filter(|r| !r.is_empty());
        let sender_name = sender_name.or(Some(request.sender.as_str()).filter(|s| !s.is_empty()));

        debug!("posting accounting request for {}", request.message_id);
        let response = self
            .post_accounting(&token, &request.content, sender_name)
            .await?;
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();

        let (status, body) = if status == 401 {
            // Stale token: one re-login and retry, then give up.
            warn!("zhiweijz token rejected, re-logging in");
            let token = self.login().await?;
            let retry = self
                .post_accounting(&token, &request.content, sender_name)
                .await?;
            let retry_status = retry.status().as_u16();
            let retry_body = retry.text().await.unwrap_or_default();
            (retry_status, retry_body)
        } else {
            (status, body)
        };

        match status {
            200 | 201 => {
                let parsed: serde_json::Value =
                    serde_json::from_str(&body).unwrap_or(serde_json::Value::Null);
                let formatted = format_accounting_reply(&parsed);
                if formatted.contains(IRRELEVANT_REPLY) {
                    return Ok(self.irrelevant_reply());
                }
                Ok(PlatformReply::text(formatted).with_raw(parsed))
            }
            400 if body.contains(IRRELEVANT_MARKER) => {
                info!("message {} is unrelated to bookkeeping", request.message_id);
                Ok(self.irrelevant_reply())
            }
            _ => Err(api_error(status, &body)),
        }
    }
}

fn chrono_now() -> i64 {
    chrono_now_impl()
}

#[cfg(not(test))]
fn chrono_now_impl() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}

#[cfg(test)]
fn chrono_now_impl() -> i64 {
    1_700_000_000
}
