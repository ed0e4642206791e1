//! Threads (Meta Graph) client
//!
//! Publishing is two steps: create a media container, then publish it.
//! Media is pulled by Threads from public URLs, so "uploading" only hands the
//! URL through. The access token travels as a query parameter.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::{
    build_http_client, error_message, parse_json, ActivityItem, ApiResponse, ClientError,
    ClientResult, CreateRequest, MediaHandle, PlatformClient, PlatformResponse, RefreshGrant,
    TokenGrant,
};
use crate::rate_limit::reset_from_headers;
use crate::types::{MediaKind, MediaRef, Platform};

pub const DEFAULT_API_BASE: &str = "https://graph.threads.net/v1.0";
pub const DEFAULT_REFRESH_URL: &str = "https://graph.threads.net/refresh_access_token";

/// Graph error codes that mean "slow down"
const RATE_LIMIT_CODES: [i64; 4] = [4, 17, 32, 613];
const MAX_CONTAINER_POLLS: u32 = 30;
const CONTAINER_POLL_INTERVAL: Duration = Duration::from_secs(5);
const MAX_CAROUSEL_ITEMS: usize = 20;

pub struct ThreadsClient {
    http: reqwest::Client,
    api_base: String,
    refresh_url: String,
}

impl Default for ThreadsClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadsClient {
    pub fn new() -> Self {
        Self::with_base(DEFAULT_API_BASE, None)
    }

    pub fn with_base(api_base: &str, refresh_url: Option<String>) -> Self {
        Self {
            http: build_http_client(),
            api_base: api_base.trim_end_matches('/').to_string(),
            refresh_url: refresh_url.unwrap_or_else(|| DEFAULT_REFRESH_URL.to_string()),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.api_base, path.trim_start_matches('/'))
    }

    async fn create_container(
        &self,
        access_token: &str,
        params: &[(&str, &str)],
    ) -> ClientResult<String> {
        let resp = self
            .http
            .post(self.url("me/threads"))
            .query(params)
            .query(&[("access_token", access_token)])
            .send()
            .await?;
        let created: IdResponse = read_graph(resp).await?;
        Ok(created.id)
    }

    async fn media_container(
        &self,
        access_token: &str,
        media: &MediaHandle,
        carousel_item: bool,
    ) -> ClientResult<String> {
        let (media_type, url_param) = match media.kind {
            MediaKind::Image => ("IMAGE", "image_url"),
            MediaKind::Video => ("VIDEO", "video_url"),
        };
        let mut params = vec![("media_type", media_type), (url_param, media.id.as_str())];
        if carousel_item {
            params.push(("is_carousel_item", "true"));
        }
        let id = self.create_container(access_token, &params).await?;
        if media.kind == MediaKind::Video {
            self.wait_until_finished(access_token, &id).await?;
        }
        Ok(id)
    }

    /// Video containers are processed asynchronously and cannot be published
    /// before they report FINISHED.
    async fn wait_until_finished(&self, access_token: &str, container_id: &str) -> ClientResult<()> {
        for _ in 0..MAX_CONTAINER_POLLS {
            let resp = self
                .http
                .get(self.url(container_id))
                .query(&[("fields", "status,error_message"), ("access_token", access_token)])
                .send()
                .await?;
            let status: ContainerStatus = read_graph(resp).await?;
            match status.status.as_str() {
                "FINISHED" => return Ok(()),
                "ERROR" | "EXPIRED" => {
                    return Err(ClientError::api(
                        422,
                        status
                            .error_message
                            .unwrap_or_else(|| format!("container {} failed processing", container_id)),
                    ))
                }
                other => debug!("Threads container {} is {}", container_id, other),
            }
            tokio::time::sleep(CONTAINER_POLL_INTERVAL).await;
        }
        Err(ClientError::Transport(format!(
            "container {} still processing after {} polls",
            container_id, MAX_CONTAINER_POLLS
        )))
    }

    async fn list(
        &self,
        access_token: &str,
        edge: &str,
        limit: &str,
    ) -> ClientResult<Vec<GraphThread>> {
        let resp = self
            .http
            .get(self.url(edge))
            .query(&[
                ("fields", "id,text,timestamp,replied_to"),
                ("limit", limit),
                ("access_token", access_token),
            ])
            .send()
            .await?;
        let page: GraphPage = read_graph(resp).await?;
        Ok(page.data)
    }
}

#[async_trait]
impl PlatformClient for ThreadsClient {
    fn platform(&self) -> Platform {
        Platform::Threads
    }

    async fn create(
        &self,
        access_token: &str,
        request: &CreateRequest,
    ) -> ClientResult<ApiResponse<PlatformResponse>> {
        let reply_to = request.reply_to.as_deref();

        let container_id = match request.media.as_slice() {
            [] => {
                let mut params = vec![("media_type", "TEXT"), ("text", request.text.as_str())];
                if let Some(parent) = reply_to {
                    params.push(("reply_to_id", parent));
                }
                self.create_container(access_token, &params).await?
            }
            [single] => {
                let (media_type, url_param) = match single.kind {
                    MediaKind::Image => ("IMAGE", "image_url"),
                    MediaKind::Video => ("VIDEO", "video_url"),
                };
                let mut params = vec![
                    ("media_type", media_type),
                    (url_param, single.id.as_str()),
                    ("text", request.text.as_str()),
                ];
                if let Some(parent) = reply_to {
                    params.push(("reply_to_id", parent));
                }
                let id = self.create_container(access_token, &params).await?;
                if single.kind == MediaKind::Video {
                    self.wait_until_finished(access_token, &id).await?;
                }
                id
            }
            many => {
                if many.len() > MAX_CAROUSEL_ITEMS {
                    return Err(ClientError::api(
                        400,
                        format!("carousels take at most {} items", MAX_CAROUSEL_ITEMS),
                    ));
                }
                let mut children = Vec::with_capacity(many.len());
                for item in many {
                    children.push(self.media_container(access_token, item, true).await?);
                }
                let children = children.join(",");
                let mut params = vec![
                    ("media_type", "CAROUSEL"),
                    ("children", children.as_str()),
                    ("text", request.text.as_str()),
                ];
                if let Some(parent) = reply_to {
                    params.push(("reply_to_id", parent));
                }
                self.create_container(access_token, &params).await?
            }
        };

        let resp = self
            .http
            .post(self.url("me/threads_publish"))
            .query(&[
                ("creation_id", container_id.as_str()),
                ("access_token", access_token),
            ])
            .send()
            .await?;
        let published: IdResponse = read_graph(resp).await?;

        Ok(ApiResponse::new(PlatformResponse::Threads {
            media_id: published.id,
            container_id,
        }))
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

    async fn recent_activity(
        &self,
        access_token: &str,
        _account_id: Option<&str>,
        limit: usize,
    ) -> ClientResult<ApiResponse<Vec<ActivityItem>>> {
        let limit = limit.clamp(1, 100).to_string();
        let mut threads = self.list(access_token, "me/threads", &limit).await?;
        threads.extend(self.list(access_token, "me/replies", &limit).await?);

        let mut items: Vec<ActivityItem> = threads
            .into_iter()
            .map(|t| ActivityItem {
                created_at: t.timestamp.as_deref().and_then(parse_graph_timestamp),
                in_reply_to: t.replied_to.map(|r| r.id),
                text: t.text.unwrap_or_default(),
                id: t.id,
            })
            .collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(ApiResponse::new(items))
    }

    async fn account_id(&self, access_token: &str) -> ClientResult<ApiResponse<String>> {
        let resp = self
            .http
            .get(self.url("me"))
            .query(&[("fields", "id"), ("access_token", access_token)])
            .send()
            .await?;
        let me: IdResponse = read_graph(resp).await?;
        Ok(ApiResponse::new(me.id))
    }

    async fn refresh(&self, grant: RefreshGrant<'_>) -> ClientResult<TokenGrant> {
        let current = match grant {
            RefreshGrant::CurrentAccessToken(token) => token,
            RefreshGrant::RefreshToken(_) => {
                return Err(ClientError::api(
                    400,
                    "Threads re-issues tokens from the current access token",
                ))
            }
        };

        let resp = self
            .http
            .get(&self.refresh_url)
            .query(&[("grant_type", "th_refresh_token"), ("access_token", current)])
            .send()
            .await?;
        let token: TokenResponse = read_graph(resp).await?;
        Ok(TokenGrant {
            access_token: SecretString::from(token.access_token),
            refresh_token: None,
            expires_in: token.expires_in,
            scopes: None,
        })
    }
}

/// Graph timestamps look like `2024-07-01T12:00:00+0000`.
fn parse_graph_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%z")
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Graph errors carry a numeric code; throttling codes map to [`ClientError::RateLimit`].
async fn read_graph<T: DeserializeOwned>(resp: reqwest::Response) -> ClientResult<T> {
    let status = resp.status();
    let headers = resp.headers().clone();
    let text = resp.text().await?;

    if status.is_success() {
        return parse_json(&text);
    }

    let code = serde_json::from_str::<serde_json::Value>(&text)
        .ok()
        .and_then(|v| v.pointer("/error/code").and_then(|c| c.as_i64()));
    if status.as_u16() == 429 || code.is_some_and(|c| RATE_LIMIT_CODES.contains(&c)) {
        return Err(ClientError::RateLimit {
            reset_at: reset_from_headers(&headers, Utc::now(), Duration::from_secs(3600)),
        });
    }
    Err(ClientError::api(status.as_u16(), error_message(&text)))
}

#[derive(Debug, Deserialize)]
struct IdResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ContainerStatus {
    status: String,
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GraphPage {
    #[serde(default)]
    data: Vec<GraphThread>,
}

#[derive(Debug, Deserialize)]
struct GraphThread {
    id: String,
    text: Option<String>,
    timestamp: Option<String>,
    replied_to: Option<IdResponse>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<i64>,
}
