//! X (Twitter) API v2 client
//!
//! Rate limits come from `x-rate-limit-*` headers on every response. Images
//! use the simple upload; video goes through initialize/append/finalize and
//! is polled until processing finishes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

use super::{
    build_http_client, fetch_media, parse_json, read_body, read_json, ActivityItem, ApiResponse,
    ClientError, ClientResult, CreateRequest, MediaHandle, PlatformClient, PlatformResponse,
    RefreshGrant, TokenGrant,
};
use crate::config::ClientCredentials;
use crate::types::{MediaKind, MediaRef, Platform};

pub const DEFAULT_API_BASE: &str = "https://api.x.com";

const CHUNK_SIZE: usize = 1024 * 1024;
const MAX_PROCESSING_POLLS: u32 = 60;

pub struct TwitterClient {
    http: reqwest::Client,
    api_base: String,
    token_url: String,
    credentials: ClientCredentials,
}

impl TwitterClient {
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
            token_url: token_url.unwrap_or_else(|| format!("{}/2/oauth2/token", api_base)),
            api_base,
            credentials,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path)
    }

    async fn upload_simple(
        &self,
        access_token: &str,
        data: Vec<u8>,
        mime: &str,
    ) -> ClientResult<ApiResponse<String>> {
        let media_category = if mime == "image/gif" {
            "tweet_gif"
        } else {
            "tweet_image"
        };
        let part = reqwest::multipart::Part::bytes(data)
            .mime_str(mime)
            .map_err(|e| ClientError::api(400, format!("invalid mime type: {}", e)))?;
        let form = reqwest::multipart::Form::new()
            .text("media_category", media_category.to_string())
            .part("media", part);

        let resp = self
            .http
            .post(self.url("/2/media/upload"))
            .bearer_auth(access_token)
            .multipart(form)
            .send()
            .await?;

        let body: ApiResponse<MediaEnvelope> = read_json(resp, true).await?;
        Ok(ApiResponse::with_rate_limit(body.data.data.id, body.rate_limit))
    }

    async fn upload_chunked(
        &self,
        access_token: &str,
        data: Vec<u8>,
        mime: &str,
    ) -> ClientResult<ApiResponse<String>> {
        // v2 rejects video/quicktime; the container is mp4-compatible
        let mime = if mime == "video/quicktime" { "video/mp4" } else { mime };

        let resp = self
            .http
            .post(self.url("/2/media/upload/initialize"))
            .bearer_auth(access_token)
            .json(&json!({
                "media_type": mime,
                "total_bytes": data.len(),
                "media_category": "tweet_video",
            }))
            .send()
            .await?;
        let init: ApiResponse<MediaEnvelope> = read_json(resp, true).await?;
        let media_id = init.data.data.id;
        debug!("Twitter media {} initialized ({} bytes)", media_id, data.len());

        for (segment_index, chunk) in data.chunks(CHUNK_SIZE).enumerate() {
            let part = reqwest::multipart::Part::bytes(chunk.to_vec())
                .mime_str(mime)
                .map_err(|e| ClientError::api(400, format!("invalid mime type: {}", e)))?;
            let form = reqwest::multipart::Form::new()
                .text("segment_index", segment_index.to_string())
                .part("media", part);

            let resp = self
                .http
                .post(self.url(&format!("/2/media/upload/{}/append", media_id)))
                .bearer_auth(access_token)
                .multipart(form)
                .send()
                .await?;
            read_body(resp, true).await?;
        }

        let resp = self
            .http
            .post(self.url(&format!("/2/media/upload/{}/finalize", media_id)))
            .bearer_auth(access_token)
            .send()
            .await?;
        let finalized: ApiResponse<MediaEnvelope> = read_json(resp, true).await?;

        let mut processing = finalized.data.data.processing_info;
        let mut rate_limit = finalized.rate_limit;
        let mut polls = 0;
        while let Some(info) = processing.take() {
            match info.state.as_str() {
                "succeeded" => break,
                "failed" => {
                    return Err(ClientError::api(422, "media processing failed"));
                }
                _ => {}
            }
            polls += 1;
            if polls > MAX_PROCESSING_POLLS {
                return Err(ClientError::Transport(format!(
                    "media {} still processing after {} polls",
                    media_id, MAX_PROCESSING_POLLS
                )));
            }
            let wait = info.check_after_secs.unwrap_or(5).clamp(1, 60);
            tokio::time::sleep(Duration::from_secs(wait)).await;

            let resp = self
                .http
                .get(self.url("/2/media/upload"))
                .query(&[("command", "STATUS"), ("media_id", media_id.as_str())])
                .bearer_auth(access_token)
                .send()
                .await?;
            let status: ApiResponse<MediaEnvelope> = read_json(resp, true).await?;
            rate_limit = status.rate_limit.or(rate_limit);
            processing = status.data.data.processing_info;
        }

        Ok(ApiResponse::with_rate_limit(media_id, rate_limit))
    }
}

#[async_trait]
impl PlatformClient for TwitterClient {
    fn platform(&self) -> Platform {
        Platform::Twitter
    }

    async fn create(
        &self,
        access_token: &str,
        request: &CreateRequest,
    ) -> ClientResult<ApiResponse<PlatformResponse>> {
        let mut body = json!({ "text": request.text });
        if let Some(reply_to) = &request.reply_to {
            body["reply"] = json!({ "in_reply_to_tweet_id": reply_to });
        }
        if !request.media.is_empty() {
            let ids: Vec<&str> = request.media.iter().map(|m| m.id.as_str()).collect();
            body["media"] = json!({ "media_ids": ids });
        }

        let resp = self
            .http
            .post(self.url("/2/tweets"))
            .bearer_auth(access_token)
            .json(&body)
            .send()
            .await?;

        let created: ApiResponse<TweetEnvelope> = read_json(resp, true).await?;
        Ok(ApiResponse::with_rate_limit(
            PlatformResponse::Twitter {
                tweet_id: created.data.data.id,
            },
            created.rate_limit,
        ))
    }

    async fn upload_media(
        &self,
        access_token: &str,
        media: &MediaRef,
        _account_id: Option<&str>,
    ) -> ClientResult<ApiResponse<MediaHandle>> {
        let data = fetch_media(&self.http, &media.url).await?;
        let kind = media.kind();
        let uploaded = match kind {
            MediaKind::Video => self.upload_chunked(access_token, data, media.mime()).await?,
            MediaKind::Image => self.upload_simple(access_token, data, media.mime()).await?,
        };
        Ok(ApiResponse::with_rate_limit(
            MediaHandle {
                id: uploaded.data,
                kind,
            },
            uploaded.rate_limit,
        ))
    }

    async fn recent_activity(
        &self,
        access_token: &str,
        account_id: Option<&str>,
        limit: usize,
    ) -> ClientResult<ApiResponse<Vec<ActivityItem>>> {
        let user_id = match account_id {
            Some(id) => id.to_string(),
            None => self.account_id(access_token).await?.data,
        };
        let max_results = limit.clamp(5, 100).to_string();

        let resp = self
            .http
            .get(self.url(&format!("/2/users/{}/tweets", user_id)))
            .query(&[
                ("max_results", max_results.as_str()),
                ("tweet.fields", "created_at,referenced_tweets"),
            ])
            .bearer_auth(access_token)
            .send()
            .await?;

        let timeline: ApiResponse<TimelineEnvelope> = read_json(resp, true).await?;
        let items = timeline
            .data
            .data
            .into_iter()
            .map(|tweet| ActivityItem {
                in_reply_to: tweet
                    .referenced_tweets
                    .iter()
                    .find(|r| r.kind == "replied_to")
                    .map(|r| r.id.clone()),
                id: tweet.id,
                text: tweet.text,
                created_at: tweet.created_at,
            })
            .collect();
        Ok(ApiResponse::with_rate_limit(items, timeline.rate_limit))
    }

    async fn account_id(&self, access_token: &str) -> ClientResult<ApiResponse<String>> {
        let resp = self
            .http
            .get(self.url("/2/users/me"))
            .bearer_auth(access_token)
            .send()
            .await?;
        let me: ApiResponse<UserEnvelope> = read_json(resp, true).await?;
        Ok(ApiResponse::with_rate_limit(me.data.data.id, me.rate_limit))
    }

    async fn refresh(&self, grant: RefreshGrant<'_>) -> ClientResult<TokenGrant> {
        let refresh_token = match grant {
            RefreshGrant::RefreshToken(token) => token,
            RefreshGrant::CurrentAccessToken(_) => {
                return Err(ClientError::api(
                    400,
                    "X requires a refresh token to issue a new access token",
                ))
            }
        };

        let resp = self
            .http
            .post(&self.token_url)
            .basic_auth(
                &self.credentials.client_id,
                Some(self.credentials.client_secret.expose_secret()),
            )
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", self.credentials.client_id.as_str()),
            ])
            .send()
            .await?;

        let (text, _, _) = read_body(resp, false).await?;
        let token: TokenResponse = parse_json(&text)?;
        Ok(TokenGrant {
            access_token: SecretString::from(token.access_token),
            refresh_token: token.refresh_token.map(SecretString::from),
            expires_in: token.expires_in,
            scopes: token
                .scope
                .map(|s| s.split_whitespace().map(str::to_string).collect()),
        })
    }

    fn is_duplicate_content(&self, error: &ClientError) -> bool {
        duplicate_rejection(error)
    }
}

/// X rejects a verbatim re-post with 403 and a "duplicate content" detail.
pub fn duplicate_rejection(error: &ClientError) -> bool {
    matches!(error, ClientError::Api { status: 403, message } if message.to_lowercase().contains("duplicate"))
}

#[derive(Debug, Deserialize)]
struct TweetEnvelope {
    data: TweetData,
}

#[derive(Debug, Deserialize)]
struct TweetData {
    id: String,
}

#[derive(Debug, Deserialize)]
struct TimelineEnvelope {
    #[serde(default)]
    data: Vec<TimelineTweet>,
}

#[derive(Debug, Deserialize)]
struct TimelineTweet {
    id: String,
    text: String,
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    referenced_tweets: Vec<ReferencedTweet>,
}

#[derive(Debug, Deserialize)]
struct ReferencedTweet {
    #[serde(rename = "type")]
    kind: String,
    id: String,
}

#[derive(Debug, Deserialize)]
struct UserEnvelope {
    data: UserData,
}

#[derive(Debug, Deserialize)]
struct UserData {
    id: String,
}

#[derive(Debug, Deserialize)]
struct MediaEnvelope {
    data: MediaData,
}

#[derive(Debug, Deserialize)]
struct MediaData {
    id: String,
    processing_info: Option<ProcessingInfo>,
}

#[derive(Debug, Deserialize)]
struct ProcessingInfo {
    state: String,
    check_after_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    scope: Option<String>,
}
