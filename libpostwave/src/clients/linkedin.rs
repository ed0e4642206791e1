//! LinkedIn Posts API client
//!
//! LinkedIn sends no quota headers, so the handler counts calls itself.
//! Refresh tokens are reusable until they expire.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{
    build_http_client, fetch_media, parse_json, read_body, read_json, ActivityItem, ApiResponse,
    ClientError, ClientResult, CreateRequest, MediaHandle, PlatformClient, PlatformResponse,
    RefreshGrant, TokenGrant,
};
use crate::config::ClientCredentials;
use crate::types::{MediaKind, MediaRef, Platform};

pub const DEFAULT_API_BASE: &str = "https://api.linkedin.com";
pub const DEFAULT_TOKEN_URL: &str = "https://www.linkedin.com/oauth/v2/accessToken";

const LINKEDIN_VERSION: &str = "202405";
const RESTLI_PROTOCOL_VERSION: &str = "2.0.0";

pub struct LinkedInClient {
    http: reqwest::Client,
    api_base: String,
    token_url: String,
    credentials: ClientCredentials,
}

impl LinkedInClient {
    pub fn new(credentials: ClientCredentials) -> Self {
        Self::with_base(credentials, DEFAULT_API_BASE, None)
    }

    pub fn with_base(
        credentials: ClientCredentials,
        api_base: &str,
        token_url: Option<String>,
    ) -> Self {
        Self {
            http: build_http_client(),
            api_base: api_base.trim_end_matches('/').to_string(),
            token_url: token_url.unwrap_or_else(|| DEFAULT_TOKEN_URL.to_string()),
            credentials,
        }
    }

    fn rest(&self, method: reqwest::Method, path: &str, access_token: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.api_base, path))
            .bearer_auth(access_token)
            .header("LinkedIn-Version", LINKEDIN_VERSION)
            .header("X-Restli-Protocol-Version", RESTLI_PROTOCOL_VERSION)
    }
}

#[async_trait]
impl PlatformClient for LinkedInClient {
    fn platform(&self) -> Platform {
        Platform::LinkedIn
    }

    async fn create(
        &self,
        access_token: &str,
        request: &CreateRequest,
    ) -> ClientResult<ApiResponse<PlatformResponse>> {
        let author = request
            .account_id
            .as_deref()
            .ok_or_else(|| ClientError::api(400, "LinkedIn posts need an author URN"))?;
        if request.reply_to.is_some() {
            return Err(ClientError::api(400, "LinkedIn posts cannot reply to other posts"));
        }

        let mut body = json!({
            "author": author,
            "commentary": request.text,
            "visibility": "PUBLIC",
            "distribution": {
                "feedDistribution": "MAIN_FEED",
                "targetEntities": [],
                "thirdPartyDistributionChannels": [],
            },
            "lifecycleState": "PUBLISHED",
            "isReshareDisabledByAuthor": false,
        });
        match request.media.as_slice() {
            [] => {}
            [single] => body["content"] = json!({ "media": { "id": single.id } }),
            many => {
                let images: Vec<Value> = many.iter().map(|m| json!({ "id": m.id })).collect();
                body["content"] = json!({ "multiImage": { "images": images } });
            }
        }

        let resp = self
            .rest(reqwest::Method::POST, "/rest/posts", access_token)
            .json(&body)
            .send()
            .await?;

        let (_, _, headers) = read_body(resp, false).await?;
        let share_urn = headers
            .get("x-restli-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| ClientError::api(201, "post created without an x-restli-id header"))?;

        Ok(ApiResponse::new(PlatformResponse::LinkedIn { share_urn }))
    }

    async fn upload_media(
        &self,
        access_token: &str,
        media: &MediaRef,
        account_id: Option<&str>,
    ) -> ClientResult<ApiResponse<MediaHandle>> {
        if media.kind() == MediaKind::Video {
            return Err(ClientError::api(400, "video uploads are not supported for LinkedIn"));
        }
        let owner = account_id
            .ok_or_else(|| ClientError::api(400, "LinkedIn uploads need an owner URN"))?;

        let resp = self
            .rest(
                reqwest::Method::POST,
                "/rest/images?action=initializeUpload",
                access_token,
            )
            .json(&json!({ "initializeUploadRequest": { "owner": owner } }))
            .send()
            .await?;
        let init: ApiResponse<InitializeUploadResponse> = read_json(resp, false).await?;
        let upload = init.data.value;

        let data = fetch_media(&self.http, &media.url).await?;
        let resp = self
            .http
            .put(&upload.upload_url)
            .bearer_auth(access_token)
            .header(reqwest::header::CONTENT_TYPE, media.mime())
            .body(data)
            .send()
            .await?;
        read_body(resp, false).await?;

        Ok(ApiResponse::new(MediaHandle {
            id: upload.image,
            kind: MediaKind::Image,
        }))
    }

    async fn recent_activity(
        &self,
        access_token: &str,
        account_id: Option<&str>,
        limit: usize,
    ) -> ClientResult<ApiResponse<Vec<ActivityItem>>> {
        let author = match account_id {
            Some(id) => id.to_string(),
            None => self.account_id(access_token).await?.data,
        };
        let count = limit.clamp(1, 100).to_string();

        let resp = self
            .rest(reqwest::Method::GET, "/rest/posts", access_token)
            .header("X-RestLi-Method", "FINDER")
            .query(&[
                ("q", "author"),
                ("author", author.as_str()),
                ("count", count.as_str()),
                ("sortBy", "LAST_MODIFIED"),
            ])
            .send()
            .await?;

        let page: ApiResponse<PostsPage> = read_json(resp, false).await?;
        let items = page
            .data
            .elements
            .into_iter()
            .map(|post| ActivityItem {
                id: post.id,
                text: post.commentary.unwrap_or_default(),
                in_reply_to: None,
                created_at: post
                    .created_at
                    .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
            })
            .collect();
        Ok(ApiResponse::new(items))
    }

    async fn account_id(&self, access_token: &str) -> ClientResult<ApiResponse<String>> {
        let resp = self
            .http
            .get(format!("{}/v2/userinfo", self.api_base))
            .bearer_auth(access_token)
            .send()
            .await?;
        let info: ApiResponse<UserInfo> = read_json(resp, false).await?;
        Ok(ApiResponse::new(format!("urn:li:person:{}", info.data.sub)))
    }

    async fn refresh(&self, grant: RefreshGrant<'_>) -> ClientResult<TokenGrant> {
        let refresh_token = match grant {
            RefreshGrant::RefreshToken(token) => token,
            RefreshGrant::CurrentAccessToken(_) => {
                return Err(ClientError::api(
                    400,
                    "LinkedIn requires a refresh token to issue a new access token",
                ))
            }
        };

        let resp = self
            .http
            .post(&self.token_url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", self.credentials.client_id.as_str()),
                ("client_secret", self.credentials.client_secret.expose_secret()),
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
                .map(|s| s.split(',').map(|p| p.trim().to_string()).collect()),
        })
    }

    fn is_duplicate_content(&self, error: &ClientError) -> bool {
        duplicate_rejection(error)
    }
}

/// LinkedIn reports a repeated share as 422 (or 409) with "duplicate" in the message.
pub fn duplicate_rejection(error: &ClientError) -> bool {
    matches!(error, ClientError::Api { status: 409 | 422, message } if message.to_lowercase().contains("duplicate"))
}

#[derive(Debug, Deserialize)]
struct InitializeUploadResponse {
    value: UploadTarget,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadTarget {
    upload_url: String,
    image: String,
}

#[derive(Debug, Deserialize)]
struct PostsPage {
    #[serde(default)]
    elements: Vec<LinkedInPost>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LinkedInPost {
    id: String,
    commentary: Option<String>,
    created_at: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct UserInfo {
    sub: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    scope: Option<String>,
}
