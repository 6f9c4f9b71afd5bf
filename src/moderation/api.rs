use super::ModerationError;
use crate::config::HostConfig;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, COOKIE, SERVER};
use reqwest::{Client, RequestBuilder};
use serde::Serialize;
use std::time::Duration;
use url::Url;

/// Reason sent with every network ban.
pub const BAN_REASON: &str = "SPAM";

/// Direct calls to the host's moderation endpoint.
#[async_trait]
pub trait ModerationEndpoint: Send + Sync {
    /// `POST .../bans` for the sender's address. The host decides whether
    /// this removes the message or bans the sender; remove and exclude
    /// both go through it.
    async fn ban_user(&self, user_address: &str) -> Result<(), ModerationError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BanRequest<'a> {
    user_address: &'a str,
    reason: &'a str,
}

/// What the classifier needs to know about a response.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResponseMeta {
    pub status: u16,
    /// `cf-mitigated` header present.
    pub cf_mitigated: bool,
    /// `server: cloudflare` with an HTML body.
    pub cloudflare_html: bool,
}

/// Map an HTTP response to the moderation result.
pub fn classify_response(meta: ResponseMeta) -> Result<(), ModerationError> {
    let challenged = meta.cf_mitigated || meta.cloudflare_html;
    match meta.status {
        200..=299 => Ok(()),
        403 | 503 if challenged => Err(ModerationError::Blocked(format!(
            "HTTP {} edge challenge",
            meta.status
        ))),
        403 => Err(ModerationError::PermissionDenied),
        429 => Err(ModerationError::RateLimited),
        status => Err(ModerationError::NetworkError(format!("HTTP {status}"))),
    }
}

pub struct HttpModerationClient {
    client: Client,
    base: Url,
    room_id: String,
    session_cookie: Option<String>,
}

impl HttpModerationClient {
    pub fn new(host: &HostConfig) -> Result<Self> {
        let base = host
            .api_base
            .as_deref()
            .ok_or_else(|| anyhow!("host.api_base is not configured"))?;
        let room_id = host
            .room_id
            .clone()
            .ok_or_else(|| anyhow!("host.room_id is not configured"))?;
        let base = Url::parse(base).with_context(|| format!("Invalid API base URL: {base}"))?;
        if base.cannot_be_a_base() {
            return Err(anyhow!("API base URL cannot carry a path: {base}"));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(host.timeout_seconds))
            .user_agent(host.user_agent.clone())
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base,
            room_id,
            session_cookie: host.session_cookie.clone(),
        })
    }

    /// `{base}/chat/moderation/rooms/{room}/{tail...}`
    pub fn endpoint(&self, tail: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(["chat", "moderation", "rooms", self.room_id.as_str()])
                .extend(tail);
        }
        url
    }

    fn with_session(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.session_cookie {
            Some(cookie) => request.header(COOKIE, cookie),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<(), ModerationError> {
        let response = self
            .with_session(request)
            .send()
            .await
            .map_err(|e| ModerationError::NetworkError(e.to_string()))?;

        let headers = response.headers();
        let header_contains = |name, needle: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.to_ascii_lowercase().contains(needle))
                .unwrap_or(false)
        };
        let meta = ResponseMeta {
            status: response.status().as_u16(),
            cf_mitigated: headers.contains_key("cf-mitigated"),
            cloudflare_html: header_contains(SERVER, "cloudflare")
                && header_contains(CONTENT_TYPE, "text/html"),
        };
        log::debug!("Moderation API {} -> {}", response.url(), meta.status);
        classify_response(meta)
    }
}

#[async_trait]
impl ModerationEndpoint for HttpModerationClient {
    async fn ban_user(&self, user_address: &str) -> Result<(), ModerationError> {
        let url = self.endpoint(&["bans"]);
        let body = BanRequest {
            user_address,
            reason: BAN_REASON,
        };
        self.send(self.client.post(url).json(&body)).await
    }
}
