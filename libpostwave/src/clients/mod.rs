//! Platform API clients
//!
//! Each client is a thin typed wrapper around one platform's REST API. The
//! publish core depends only on the [`PlatformClient`] trait: create content,
//! look up recent activity, probe the account, refresh credentials. Every
//! call returns either a payload with whatever rate-limit state the response
//! carried, or one of the [`ClientError`] shapes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::de::DeserializeOwned;
use std::time::Duration;
use thiserror::Error;

use crate::error::PlatformError;
use crate::rate_limit::{reset_from_headers, RateLimitInfo};
use crate::types::{MediaKind, MediaRef, Platform};

pub mod linkedin;
pub mod mock;
pub mod threads;
pub mod tiktok;
pub mod twitter;

pub use linkedin::LinkedInClient;
pub use mock::MockClient;
pub use threads::ThreadsClient;
pub use tiktok::TikTokClient;
pub use twitter::TwitterClient;

pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// Default wait when a 429 carries no reset information.
const DEFAULT_RATE_LIMIT_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ClientError {
    #[error("rate limited until {reset_at}")]
    RateLimit { reset_at: DateTime<Utc> },

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        // Some endpoints take the access token as a query parameter
        ClientError::Transport(e.without_url().to_string())
    }
}

impl ClientError {
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        ClientError::Api {
            status,
            message: message.into(),
        }
    }

    pub fn into_platform_error(self, platform: Platform) -> PlatformError {
        match self {
            ClientError::RateLimit { reset_at } => PlatformError::RateLimited {
                platform: platform.to_string(),
                reset_at,
            },
            ClientError::Api { status: 401, message } => PlatformError::Authentication(message),
            ClientError::Api { status, message } => PlatformError::Api { status, message },
            ClientError::Transport(message) => PlatformError::Network(message),
        }
    }

    /// Whether retrying the same request later could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::RateLimit { .. } | ClientError::Transport(_) => true,
            ClientError::Api { status, .. } => *status >= 500 || *status == 408,
        }
    }
}

/// A successful payload plus the rate-limit state the response reported.
#[derive(Debug, Clone)]
pub struct ApiResponse<T> {
    pub data: T,
    pub rate_limit: Option<RateLimitInfo>,
}

impl<T> ApiResponse<T> {
    pub fn new(data: T) -> Self {
        Self {
            data,
            rate_limit: None,
        }
    }

    pub fn with_rate_limit(data: T, rate_limit: Option<RateLimitInfo>) -> Self {
        Self { data, rate_limit }
    }
}

/// Media ready to attach to a create call: an uploaded id, or a public URL
/// for platforms that pull media themselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaHandle {
    pub id: String,
    pub kind: MediaKind,
}

#[derive(Debug, Clone, Default)]
pub struct CreateRequest {
    pub text: String,
    pub reply_to: Option<String>,
    pub media: Vec<MediaHandle>,
    /// Author identity for platforms that need it in the body (LinkedIn URN)
    pub account_id: Option<String>,
    /// TikTok privacy level
    pub privacy_level: Option<String>,
}

impl CreateRequest {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }
}

/// Created content, one case per platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformResponse {
    Twitter { tweet_id: String },
    LinkedIn { share_urn: String },
    Threads { media_id: String, container_id: String },
    TikTok { publish_id: String },
}

impl PlatformResponse {
    pub fn platform(&self) -> Platform {
        match self {
            PlatformResponse::Twitter { .. } => Platform::Twitter,
            PlatformResponse::LinkedIn { .. } => Platform::LinkedIn,
            PlatformResponse::Threads { .. } => Platform::Threads,
            PlatformResponse::TikTok { .. } => Platform::TikTok,
        }
    }

    pub fn external_id(&self) -> &str {
        match self {
            PlatformResponse::Twitter { tweet_id } => tweet_id,
            PlatformResponse::LinkedIn { share_urn } => share_urn,
            PlatformResponse::Threads { media_id, .. } => media_id,
            PlatformResponse::TikTok { publish_id } => publish_id,
        }
    }
}

/// An item from the account's own recent activity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityItem {
    pub id: String,
    pub text: String,
    pub in_reply_to: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy)]
pub enum RefreshGrant<'a> {
    /// Standard OAuth refresh_token grant
    RefreshToken(&'a str),
    /// Re-issue from the current, still valid access token
    CurrentAccessToken(&'a str),
}

/// Tokens returned by a refresh call.
#[derive(Debug)]
pub struct TokenGrant {
    pub access_token: SecretString,
    pub refresh_token: Option<SecretString>,
    pub expires_in: Option<i64>,
    pub scopes: Option<Vec<String>>,
}

#[async_trait]
pub trait PlatformClient: Send + Sync {
    fn platform(&self) -> Platform;

    async fn create(
        &self,
        access_token: &str,
        request: &CreateRequest,
    ) -> ClientResult<ApiResponse<PlatformResponse>>;

    async fn upload_media(
        &self,
        access_token: &str,
        media: &MediaRef,
        account_id: Option<&str>,
    ) -> ClientResult<ApiResponse<MediaHandle>>;

    /// The account's own most recent items, newest first.
    async fn recent_activity(
        &self,
        access_token: &str,
        account_id: Option<&str>,
        limit: usize,
    ) -> ClientResult<ApiResponse<Vec<ActivityItem>>>;

    /// Platform identifier of the authenticated account.
    async fn account_id(&self, access_token: &str) -> ClientResult<ApiResponse<String>>;

    async fn refresh(&self, grant: RefreshGrant<'_>) -> ClientResult<TokenGrant>;

    /// Whether `error` is the platform rejecting a verbatim re-post.
    fn is_duplicate_content(&self, _error: &ClientError) -> bool {
        false
    }
}

pub(crate) fn build_http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(60))
        .user_agent(concat!("postwave/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

/// Map status codes to [`ClientError`] and return the body text of a
/// successful response together with header rate-limit state.
pub(crate) async fn read_body(
    resp: reqwest::Response,
    headers_carry_limits: bool,
) -> ClientResult<(String, Option<RateLimitInfo>, reqwest::header::HeaderMap)> {
    let status = resp.status();
    let headers = resp.headers().clone();
    let rate_limit = if headers_carry_limits {
        RateLimitInfo::from_headers(&headers)
    } else {
        None
    };

    if status.as_u16() == 429 {
        return Err(ClientError::RateLimit {
            reset_at: reset_from_headers(&headers, Utc::now(), DEFAULT_RATE_LIMIT_BACKOFF),
        });
    }

    let text = resp.text().await?;
    if !status.is_success() {
        return Err(ClientError::api(status.as_u16(), error_message(&text)));
    }

    Ok((text, rate_limit, headers))
}

/// Like [`read_body`], then parse JSON.
pub(crate) async fn read_json<T: DeserializeOwned>(
    resp: reqwest::Response,
    headers_carry_limits: bool,
) -> ClientResult<ApiResponse<T>> {
    let (text, rate_limit, _) = read_body(resp, headers_carry_limits).await?;
    let data = parse_json(&text)?;
    Ok(ApiResponse::with_rate_limit(data, rate_limit))
}

pub(crate) fn parse_json<T: DeserializeOwned>(text: &str) -> ClientResult<T> {
    serde_json::from_str(text).map_err(|e| {
        ClientError::api(
            200,
            format!("unexpected response body: {} - body: {}", e, truncate(text, 200)),
        )
    })
}

/// Best-effort human message from an error body.
pub(crate) fn error_message(body: &str) -> String {
    let value: serde_json::Value = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(_) => return truncate(body, 500),
    };

    let candidates = [
        value.pointer("/detail"),
        value.pointer("/errors/0/message"),
        value.pointer("/error/message"),
        value.pointer("/error_description"),
        value.pointer("/message"),
        value.pointer("/title"),
        value.pointer("/error"),
    ];
    let found = candidates
        .into_iter()
        .flatten()
        .find_map(|v| v.as_str().map(str::to_string));
    found.unwrap_or_else(|| truncate(body, 500))
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

/// Download media bytes for platforms that need an upload.
pub(crate) async fn fetch_media(http: &reqwest::Client, url: &str) -> ClientResult<Vec<u8>> {
    let resp = http.get(url).send().await?;
    let status = resp.status();
    if !status.is_success() {
        return Err(ClientError::api(
            status.as_u16(),
            format!("failed to fetch media {}", url),
        ));
    }
    Ok(resp.bytes().await?.to_vec())
}
