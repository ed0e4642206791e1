//! Scripted in-memory client for testing
//!
//! Simulates one platform end to end without network access: create calls can
//! be scripted to fail at a given call number, every successful create shows
//! up in recent activity, and refresh behaves like an OAuth provider that
//! honours the platform's rotation rule. Clones share state, so a test can
//! keep a handle while a handler owns another.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::{
    ActivityItem, ApiResponse, ClientError, ClientResult, CreateRequest, MediaHandle,
    PlatformClient, PlatformResponse, RefreshGrant, TokenGrant,
};
use crate::credentials::RotationPolicy;
use crate::types::{MediaRef, Platform};

/// Failure injected into a create call.
#[derive(Debug, Clone)]
pub enum MockFailure {
    /// The platform keeps the content but the call reports a duplicate, as
    /// when a retry re-submits a segment whose first response was lost.
    Duplicate,
    RateLimit { reset_at: DateTime<Utc> },
    Api { status: u16, message: String },
    Transport(String),
}

impl MockFailure {
    pub fn api(status: u16, message: &str) -> Self {
        MockFailure::Api {
            status,
            message: message.to_string(),
        }
    }
}

/// A create call the mock accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostedItem {
    pub id: String,
    pub text: String,
    pub reply_to: Option<String>,
    pub media: Vec<String>,
}

#[derive(Debug)]
struct MockState {
    next_id: u64,
    create_calls: usize,
    upload_calls: usize,
    refresh_calls: usize,
    fail_at: BTreeMap<usize, MockFailure>,
    fail_always: Option<MockFailure>,
    /// Create calls from this number on stall for the given time
    create_delay: Option<(usize, Duration)>,
    refresh_delay: Option<Duration>,
    posted: Vec<PostedItem>,
    /// Newest first
    activity: Vec<ActivityItem>,
    valid_refresh_tokens: BTreeSet<String>,
    refresh_failure: Option<ClientError>,
    expires_in: Option<i64>,
    account_id: String,
}

#[derive(Debug, Clone)]
pub struct MockClient {
    platform: Platform,
    state: Arc<Mutex<MockState>>,
}

impl MockClient {
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            state: Arc::new(Mutex::new(MockState {
                next_id: 1,
                create_calls: 0,
                upload_calls: 0,
                refresh_calls: 0,
                fail_at: BTreeMap::new(),
                fail_always: None,
                create_delay: None,
                refresh_delay: None,
                posted: Vec::new(),
                activity: Vec::new(),
                valid_refresh_tokens: BTreeSet::new(),
                refresh_failure: None,
                expires_in: Some(3600),
                account_id: format!("mock-{}-account", platform),
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        // A panicking test thread must not wedge the others
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fail the `call`-th create call (1-based).
    pub fn fail_create_at(self, call: usize, failure: MockFailure) -> Self {
        self.state().fail_at.insert(call, failure);
        self
    }

    /// Fail every create call.
    pub fn fail_always(self, failure: MockFailure) -> Self {
        self.state().fail_always = Some(failure);
        self
    }

    /// Stall every create call from the `call`-th on (1-based) for `delay`
    /// before the platform answers.
    pub fn with_create_delay_from(self, call: usize, delay: Duration) -> Self {
        self.state().create_delay = Some((call, delay));
        self
    }

    /// Register a refresh token the simulated provider will accept.
    pub fn with_refresh_token(self, token: &str) -> Self {
        self.state().valid_refresh_tokens.insert(token.to_string());
        self
    }

    /// Stall refresh calls for `delay` before the provider answers.
    pub fn with_refresh_delay(self, delay: Duration) -> Self {
        self.state().refresh_delay = Some(delay);
        self
    }

    pub fn with_refresh_failure(self, error: ClientError) -> Self {
        self.state().refresh_failure = Some(error);
        self
    }

    pub fn with_expires_in(self, expires_in: Option<i64>) -> Self {
        self.state().expires_in = expires_in;
        self
    }

    pub fn with_activity(self, item: ActivityItem) -> Self {
        self.state().activity.insert(0, item);
        self
    }

    pub fn create_calls(&self) -> usize {
        self.state().create_calls
    }

    pub fn upload_calls(&self) -> usize {
        self.state().upload_calls
    }

    pub fn refresh_calls(&self) -> usize {
        self.state().refresh_calls
    }

    pub fn posted(&self) -> Vec<PostedItem> {
        self.state().posted.clone()
    }

    pub fn accepts_refresh_token(&self, token: &str) -> bool {
        self.state().valid_refresh_tokens.contains(token)
    }

    fn response(&self, id: String) -> PlatformResponse {
        match self.platform {
            Platform::Twitter => PlatformResponse::Twitter { tweet_id: id },
            Platform::LinkedIn => PlatformResponse::LinkedIn { share_urn: id },
            Platform::Threads => PlatformResponse::Threads {
                container_id: format!("container-{}", id),
                media_id: id,
            },
            Platform::TikTok => PlatformResponse::TikTok { publish_id: id },
        }
    }
}

impl MockState {
    fn accept(&mut self, platform: Platform, request: &CreateRequest) -> String {
        let id = format!("{}-{}", platform, self.next_id);
        self.next_id += 1;
        self.posted.push(PostedItem {
            id: id.clone(),
            text: request.text.clone(),
            reply_to: request.reply_to.clone(),
            media: request.media.iter().map(|m| m.id.clone()).collect(),
        });
        self.activity.insert(
            0,
            ActivityItem {
                id: id.clone(),
                text: request.text.clone(),
                in_reply_to: request.reply_to.clone(),
                created_at: Some(Utc::now()),
            },
        );
        id
    }
}

#[async_trait]
impl PlatformClient for MockClient {
    fn platform(&self) -> Platform {
        self.platform
    }

    async fn create(
        &self,
        _access_token: &str,
        request: &CreateRequest,
    ) -> ClientResult<ApiResponse<PlatformResponse>> {
        let (call, delay) = {
            let mut state = self.state();
            state.create_calls += 1;
            let call = state.create_calls;
            let delay = state
                .create_delay
                .filter(|(from, _)| call >= *from)
                .map(|(_, delay)| delay);
            (call, delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let id = {
            let mut state = self.state();
            let failure = state
                .fail_at
                .remove(&call)
                .or_else(|| state.fail_always.clone());
            match failure {
                None => state.accept(self.platform, request),
                Some(MockFailure::Duplicate) => {
                    state.accept(self.platform, request);
                    return Err(ClientError::api(409, "duplicate content"));
                }
                Some(MockFailure::RateLimit { reset_at }) => {
                    return Err(ClientError::RateLimit { reset_at })
                }
                Some(MockFailure::Api { status, message }) => {
                    return Err(ClientError::Api { status, message })
                }
                Some(MockFailure::Transport(message)) => {
                    return Err(ClientError::Transport(message))
                }
            }
        };
        Ok(ApiResponse::new(self.response(id)))
    }

    async fn upload_media(
        &self,
        _access_token: &str,
        media: &MediaRef,
        _account_id: Option<&str>,
    ) -> ClientResult<ApiResponse<MediaHandle>> {
        let mut state = self.state();
        state.upload_calls += 1;
        Ok(ApiResponse::new(MediaHandle {
            id: format!("media-{}", state.upload_calls),
            kind: media.kind(),
        }))
    }

    async fn recent_activity(
        &self,
        _access_token: &str,
        _account_id: Option<&str>,
        limit: usize,
    ) -> ClientResult<ApiResponse<Vec<ActivityItem>>> {
        let state = self.state();
        Ok(ApiResponse::new(
            state.activity.iter().take(limit).cloned().collect(),
        ))
    }

    async fn account_id(&self, _access_token: &str) -> ClientResult<ApiResponse<String>> {
        Ok(ApiResponse::new(self.state().account_id.clone()))
    }

    async fn refresh(&self, grant: RefreshGrant<'_>) -> ClientResult<TokenGrant> {
        let delay = self.state().refresh_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        state.refresh_calls += 1;
        if let Some(error) = state.refresh_failure.clone() {
            return Err(error);
        }

        let serial = state.refresh_calls;
        let access_token = SecretString::from(format!("{}-access-{}", self.platform, serial));
        let expires_in = state.expires_in;

        let refresh_token = match (RotationPolicy::for_platform(self.platform), grant) {
            (RotationPolicy::ExchangeCurrent, RefreshGrant::CurrentAccessToken(current)) => {
                if current.is_empty() {
                    return Err(ClientError::api(400, "invalid_token"));
                }
                None
            }
            (RotationPolicy::Reusable, RefreshGrant::RefreshToken(token)) => {
                if !state.valid_refresh_tokens.contains(token) {
                    return Err(ClientError::api(400, "invalid_grant"));
                }
                None
            }
            (
                RotationPolicy::SingleUse | RotationPolicy::RotateEveryUse,
                RefreshGrant::RefreshToken(token),
            ) => {
                if !state.valid_refresh_tokens.remove(token) {
                    return Err(ClientError::api(400, "invalid_grant"));
                }
                let next = format!("{}-refresh-{}", self.platform, serial);
                state.valid_refresh_tokens.insert(next.clone());
                Some(SecretString::from(next))
            }
            _ => return Err(ClientError::api(400, "unsupported_grant_type")),
        };

        Ok(TokenGrant {
            access_token,
            refresh_token,
            expires_in,
            scopes: None,
        })
    }

    fn is_duplicate_content(&self, error: &ClientError) -> bool {
        matches!(error, ClientError::Api { message, .. } if message.contains("duplicate"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[tokio::test]
    async fn test_scripted_failure_then_success() {
        let client = MockClient::new(Platform::Twitter)
            .fail_create_at(1, MockFailure::Transport("reset".to_string()));

        let first = client.create("t", &CreateRequest::text("hi")).await;
        assert!(matches!(first, Err(ClientError::Transport(_))));

        let second = client.create("t", &CreateRequest::text("hi")).await.unwrap();
        assert_eq!(second.data.external_id(), "twitter-1");
        assert_eq!(client.create_calls(), 2);
        assert_eq!(client.posted().len(), 1);
    }

    #[tokio::test]
    async fn test_create_delay_applies_from_the_given_call() {
        let client =
            MockClient::new(Platform::Twitter).with_create_delay_from(2, Duration::from_secs(5));

        client.create("t", &CreateRequest::text("fast")).await.unwrap();
        let slow = tokio::time::timeout(
            Duration::from_millis(50),
            client.create("t", &CreateRequest::text("slow")),
        )
        .await;

        assert!(slow.is_err());
        assert_eq!(client.create_calls(), 2);
        assert_eq!(client.posted().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_is_visible_in_activity() {
        let client = MockClient::new(Platform::Twitter).fail_create_at(1, MockFailure::Duplicate);

        let err = client
            .create("t", &CreateRequest::text("again"))
            .await
            .unwrap_err();
        assert!(client.is_duplicate_content(&err));

        let recent = client.recent_activity("t", None, 10).await.unwrap().data;
        assert_eq!(recent[0].text, "again");
    }

    #[tokio::test]
    async fn test_single_use_refresh_consumes_token() {
        let client = MockClient::new(Platform::Twitter).with_refresh_token("rt-0");

        let grant = client.refresh(RefreshGrant::RefreshToken("rt-0")).await.unwrap();
        let next = grant.refresh_token.unwrap();
        assert!(!client.accepts_refresh_token("rt-0"));
        assert!(client.accepts_refresh_token(next.expose_secret()));
        assert!(client.refresh(RefreshGrant::RefreshToken("rt-0")).await.is_err());
    }

    #[tokio::test]
    async fn test_reusable_refresh_keeps_token() {
        let client = MockClient::new(Platform::LinkedIn).with_refresh_token("rt-0");

        let grant = client.refresh(RefreshGrant::RefreshToken("rt-0")).await.unwrap();
        assert!(grant.refresh_token.is_none());
        assert!(client.refresh(RefreshGrant::RefreshToken("rt-0")).await.is_ok());
    }
}
