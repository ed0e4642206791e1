//! TikTok Content Posting API client
//!
//! Every response is wrapped in `{ "data": ..., "error": { "code": "ok" } }`
//! and failures are signalled through the error code as much as through the
//! HTTP status. Media is pulled by TikTok from public URLs.

use async_trait::async_trait;
use chrono::Utc;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use super::{
    build_http_client, parse_json, ActivityItem, ApiResponse, ClientError, ClientResult,
    CreateRequest, MediaHandle, PlatformClient, PlatformResponse, RefreshGrant, TokenGrant,
};
use crate::config::ClientCredentials;
use crate::rate_limit::reset_from_headers;
use crate::types::{MediaKind, MediaRef, Platform};

pub const DEFAULT_API_BASE: &str = "https://open.tiktokapis.com";

pub const PRIVACY_PUBLIC: &str = "PUBLIC_TO_EVERYONE";
pub const PRIVACY_SELF_ONLY: &str = "SELF_ONLY";

const TITLE_LIMIT: usize = 90;

pub struct TikTokClient {
    http: reqwest::Client,
    api_base: String,
    token_url: String,
    credentials: ClientCredentials,
}

impl TikTokClient {
    pub fn new(credentials: ClientCredentials) -> Self {
        Self::with_base(credentials, DEFAULT_API_BASE, None)
    }

    pub fn with_base(
        credentials: ClientCredentials,
        api_base: &str,
        token_url: Option<String>,
    ) -> Self {
        let api_base = api_base.trim_end_matches('/').to_string();
        Self {
            http: build_http_client(),
            token_url: token_url.unwrap_or_else(|| format!("{}/v2/oauth/token/", api_base)),
            api_base,
            credentials,
        }
    }

    async fn post_init(
        &self,
        access_token: &str,
        path: &str,
        body: serde_json::Value,
    ) -> ClientResult<String> {
        let resp = self
            .http
            .post(format!("{}{}", self.api_base, path))
            .bearer_auth(access_token)
            .header(reqwest::header::CONTENT_TYPE, "application/json; charset=UTF-8")
            .json(&body)
            .send()
            .await?;
        let init: PublishInit = read_envelope(resp).await?;
        Ok(init.publish_id)
    }
}

#[async_trait]
impl PlatformClient for TikTokClient {
    fn platform(&self) -> Platform {
        Platform::TikTok
    }

    async fn create(
        &self,
        access_token: &str,
        request: &CreateRequest,
    ) -> ClientResult<ApiResponse<PlatformResponse>> {
        let privacy_level = request.privacy_level.as_deref().unwrap_or(PRIVACY_SELF_ONLY);

        let publish_id = match request.media.as_slice() {
            [] => return Err(ClientError::api(400, "TikTok posts need a video or photos")),
            [video] if video.kind == MediaKind::Video => {
                let body = json!({
                    "post_info": {
                        "title": title(&request.text, 2200),
                        "privacy_level": privacy_level,
                    },
                    "source_info": {
                        "source": "PULL_FROM_URL",
                        "video_url": video.id,
                    },
                });
                self.post_init(access_token, "/v2/post/publish/video/init/", body)
                    .await?
            }
            photos => {
                if photos.iter().any(|m| m.kind == MediaKind::Video) {
                    return Err(ClientError::api(400, "TikTok cannot mix video with photos"));
                }
                let urls: Vec<&str> = photos.iter().map(|m| m.id.as_str()).collect();
                let body = json!({
                    "post_info": {
                        "title": title(&request.text, TITLE_LIMIT),
                        "description": request.text,
                        "privacy_level": privacy_level,
                    },
                    "source_info": {
                        "source": "PULL_FROM_URL",
                        "photo_cover_index": 0,
                        "photo_images": urls,
                    },
                    "post_mode": "DIRECT_POST",
                    "media_type": "PHOTO",
                });
                self.post_init(access_token, "/v2/post/publish/content/init/", body)
                    .await?
            }
        };

        Ok(ApiResponse::new(PlatformResponse::TikTok { publish_id }))
    }

    async fn upload_media(
        &self,
        _access_token: &str,
        media: &MediaRef,
        _account_id: Option<&str>,
    ) -> ClientResult<ApiResponse<MediaHandle>> {
        Ok(ApiResponse::new(MediaHandle {
            id: media.url.clone(),
            kind: media.kind(),
        }))
    }

    /// The posting API has no listing endpoint for our own content.
    async fn recent_activity(
        &self,
        _access_token: &str,
        _account_id: Option<&str>,
        _limit: usize,
    ) -> ClientResult<ApiResponse<Vec<ActivityItem>>> {
        Ok(ApiResponse::new(Vec::new()))
    }

    async fn account_id(&self, access_token: &str) -> ClientResult<ApiResponse<String>> {
        let resp = self
            .http
            .get(format!("{}/v2/user/info/", self.api_base))
            .query(&[("fields", "open_id")])
            .bearer_auth(access_token)
            .send()
            .await?;
        let info: UserInfo = read_envelope(resp).await?;
        Ok(ApiResponse::new(info.user.open_id))
    }

    async fn refresh(&self, grant: RefreshGrant<'_>) -> ClientResult<TokenGrant> {
        let refresh_token = match grant {
            RefreshGrant::RefreshToken(token) => token,
            RefreshGrant::CurrentAccessToken(_) => {
                return Err(ClientError::api(
                    400,
                    "TikTok requires a refresh token to issue a new access token",
                ))
            }
        };

        let resp = self
            .http
            .post(&self.token_url)
            .form(&[
                ("client_key", self.credentials.client_id.as_str()),
                ("client_secret", self.credentials.client_secret.expose_secret()),
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ])
            .send()
            .await?;

        let status = resp.status();
        let text = resp.text().await?;
        let token: TokenResponse = parse_json(&text)?;
        if let Some(error) = token.error.filter(|e| !e.is_empty()) {
            let status = if status.is_success() { 400 } else { status.as_u16() };
            return Err(ClientError::api(
                status,
                token.error_description.unwrap_or(error),
            ));
        }
        if !status.is_success() {
            return Err(ClientError::api(status.as_u16(), "token refresh rejected"));
        }

        let access_token = token
            .access_token
            .ok_or_else(|| ClientError::api(200, "token response without access_token"))?;
        Ok(TokenGrant {
            access_token: SecretString::from(access_token),
            refresh_token: token.refresh_token.map(SecretString::from),
            expires_in: token.expires_in,
            scopes: token
                .scope
                .map(|s| s.split(',').map(|p| p.trim().to_string()).collect()),
        })
    }
}

fn title(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

/// Unwrap the `{data, error}` envelope.
async fn read_envelope<T: DeserializeOwned>(resp: reqwest::Response) -> ClientResult<T> {
    let status = resp.status();
    let headers = resp.headers().clone();
    let text = resp.text().await?;

    if status.as_u16() == 429 {
        return Err(ClientError::RateLimit {
            reset_at: reset_from_headers(&headers, Utc::now(), Duration::from_secs(60)),
        });
    }

    let envelope: Envelope<T> = parse_json(&text)?;
    match envelope.error {
        Some(error) if error.code != "ok" => Err(map_error_code(status.as_u16(), error)),
        _ if !status.is_success() => Err(ClientError::api(status.as_u16(), text)),
        _ => envelope
            .data
            .ok_or_else(|| ClientError::api(status.as_u16(), "response without data")),
    }
}

fn map_error_code(status: u16, error: EnvelopeError) -> ClientError {
    let now = Utc::now();
    match error.code.as_str() {
        "rate_limit_exceeded" => ClientError::RateLimit {
            reset_at: now + chrono::Duration::minutes(1),
        },
        // Daily posting cap
        "spam_risk_too_many_posts" => ClientError::RateLimit {
            reset_at: now + chrono::Duration::hours(24),
        },
        "access_token_invalid" | "scope_not_authorized" => {
            ClientError::api(401, format!("{}: {}", error.code, error.message))
        }
        _ => ClientError::api(
            if status < 400 { 400 } else { status },
            format!("{}: {}", error.code, error.message),
        ),
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: Option<T>,
    error: Option<EnvelopeError>,
}

#[derive(Debug, Deserialize)]
struct EnvelopeError {
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct PublishInit {
    publish_id: String,
}

#[derive(Debug, Deserialize)]
struct UserInfo {
    user: TikTokUser,
}

#[derive(Debug, Deserialize)]
struct TikTokUser {
    open_id: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    scope: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}
