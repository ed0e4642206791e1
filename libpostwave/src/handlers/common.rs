//! Behaviour shared by every handler: credentials, quota tracking, media
//! upload, and the checkpointed segment loop.

use chrono::{DateTime, Utc};
use secrecy::ExposeSecret;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::registry::{HandlerArgs, HandlerSettings};
use crate::checkpoint::ThreadProgress;
use crate::clients::{ClientError, ClientResult, CreateRequest, MediaHandle, PlatformClient, PlatformResponse};
use crate::credentials::{CredentialManager, Credentials};
use crate::error::{PostwaveError, Result};
use crate::events::EventBus;
use crate::rate_limit::{retry_after, RateLimitInfo, RollingWindow, WindowLimit};
use crate::store::PublishStore;
use crate::types::{Platform, PlatformPublishResult, Post, SubStatus};
use crate::vault::{self, EncryptionKey};

/// How many of the account's latest items are searched for a duplicate.
const RECENT_ACTIVITY_LIMIT: usize = 20;

/// Inline rate-limit sleeps allowed per create call.
const MAX_INLINE_WAITS: usize = 3;

pub(crate) struct HandlerCore {
    platform: Platform,
    client: Arc<dyn PlatformClient>,
    user_id: String,
    events: EventBus,
    settings: HandlerSettings,
    window: Option<RollingWindow>,
    /// Recent activity is looked up by account id rather than "me"
    activity_by_account: bool,
    rate_limit: Mutex<Option<RateLimitInfo>>,
}

impl HandlerCore {
    pub fn new(client: Arc<dyn PlatformClient>, args: HandlerArgs) -> Self {
        Self {
            platform: client.platform(),
            client,
            user_id: args.user_id,
            events: args.events,
            settings: args.settings,
            window: None,
            activity_by_account: false,
            rate_limit: Mutex::new(None),
        }
    }

    /// Count calls against a self-tracked quota.
    pub fn with_window(mut self, limit: Option<WindowLimit>) -> Self {
        self.window = limit.map(|limit| RollingWindow::new(self.user_id.clone(), self.platform.as_str(), limit));
        self
    }

    pub fn activity_by_account(mut self) -> Self {
        self.activity_by_account = true;
        self
    }

    pub fn platform_error(&self, error: ClientError) -> PostwaveError {
        error.into_platform_error(self.platform).into()
    }

    pub fn published(&self, ids: Vec<String>) -> PlatformPublishResult {
        match ids.into_iter().next() {
            Some(first) => PlatformPublishResult::published(self.platform.as_str(), first),
            None => PlatformPublishResult::failed(self.platform.as_str(), "platform returned no post id"),
        }
    }

    pub fn failed(&self, reason: impl Into<String>) -> PlatformPublishResult {
        PlatformPublishResult::failed(self.platform.as_str(), reason)
    }

    pub fn skipped(&self, reason: impl Into<String>) -> PlatformPublishResult {
        PlatformPublishResult::skipped(self.platform.as_str(), reason)
    }

    // ------------------------------------------------------------ credentials

    fn manager<'a>(&'a self, store: &'a dyn PublishStore, key: &'a EncryptionKey) -> CredentialManager<'a> {
        CredentialManager::new(store, key, self.client.as_ref(), &self.events)
            .with_lock_lease(self.settings.lock_lease)
    }

    /// Usable credentials, refreshed inline if they have expired.
    pub async fn credentials(&self, store: &dyn PublishStore, key: &EncryptionKey) -> Result<Credentials> {
        self.manager(store, key).load(&self.user_id, Utc::now()).await
    }

    pub async fn refresh(&self, store: &dyn PublishStore, key: &EncryptionKey) -> Result<()> {
        self.manager(store, key).refresh(&self.user_id, Utc::now()).await?;
        Ok(())
    }

    /// Account id from token metadata, probing the platform the first time.
    pub async fn account_id(
        &self,
        store: &dyn PublishStore,
        key: &EncryptionKey,
        credentials: &Credentials,
    ) -> ClientResult<String> {
        if let Some(id) = credentials.account_id() {
            return Ok(id.to_string());
        }
        let resp = self.client.account_id(credentials.access_token()).await?;
        self.note_rate_limit(resp.rate_limit);
        if let Err(e) = self.manager(store, key).remember_account_id(credentials, &resp.data).await {
            warn!("Failed to remember {} account id for user {}: {}", self.platform, self.user_id, e);
        }
        Ok(resp.data)
    }

    /// Probe the stored token without refreshing it.
    pub async fn validate(&self, store: &dyn PublishStore, key: &EncryptionKey) -> Result<bool> {
        let token = match store.get_token(&self.user_id, self.platform.as_str()).await? {
            Some(token) => token,
            None => return Ok(false),
        };
        let expired = token.expires_at.is_some_and(|at| at <= Utc::now().timestamp());
        if token.needs_reauthorization() || expired {
            return Ok(false);
        }

        let access_token = vault::decrypt(key, &token.access_token)?;
        match self.client.account_id(access_token.expose_secret()).await {
            Ok(resp) => {
                self.note_rate_limit(resp.rate_limit);
                Ok(true)
            }
            Err(ClientError::Api { status: 401 | 403, .. }) => Ok(false),
            Err(e) => Err(self.platform_error(e)),
        }
    }

    // ------------------------------------------------------------- rate limits

    fn rate_limit_state(&self) -> MutexGuard<'_, Option<RateLimitInfo>> {
        self.rate_limit.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn rate_limit_info(&self) -> Option<RateLimitInfo> {
        *self.rate_limit_state()
    }

    fn note_rate_limit(&self, info: Option<RateLimitInfo>) {
        if let Some(info) = info {
            *self.rate_limit_state() = Some(info);
        }
    }

    fn note_reset(&self, reset_at: DateTime<Utc>) {
        let mut state = self.rate_limit_state();
        let limit = state.and_then(|info| info.limit);
        *state = Some(RateLimitInfo {
            limit,
            remaining: 0,
            reset_at,
        });
    }

    /// Reset time if the known quota is used up at `now`.
    async fn exhausted_until(&self, store: &dyn PublishStore, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        if let Some(window) = &self.window {
            let info = window.snapshot(store, now).await?;
            self.note_rate_limit(Some(info));
        }
        Ok(self
            .rate_limit_info()
            .filter(|info| info.is_exhausted(now))
            .map(|info| info.reset_at))
    }

    /// One create call under the quota. Short waits are slept here; anything
    /// longer than `inline_rate_limit_wait` comes back as `RateLimit`.
    ///
    /// The outer `Result` carries store failures only.
    pub async fn create(
        &self,
        store: &dyn PublishStore,
        credentials: &Credentials,
        request: &CreateRequest,
    ) -> Result<ClientResult<PlatformResponse>> {
        let mut waits = 0;
        loop {
            let outcome = match self.exhausted_until(store, Utc::now()).await? {
                Some(reset_at) => Err(ClientError::RateLimit { reset_at }),
                None => {
                    let result = self.client.create(credentials.access_token(), request).await;
                    if let Some(window) = &self.window {
                        window.record(store, Utc::now()).await?;
                    }
                    result.map(|resp| {
                        self.note_rate_limit(resp.rate_limit);
                        resp.data
                    })
                }
            };

            let reset_at = match outcome {
                Err(ClientError::RateLimit { reset_at }) => reset_at,
                other => return Ok(other),
            };
            self.note_reset(reset_at);

            let wait = retry_after(reset_at, Utc::now());
            if waits >= MAX_INLINE_WAITS || wait > self.settings.inline_rate_limit_wait {
                return Ok(Err(ClientError::RateLimit { reset_at }));
            }
            waits += 1;
            info!(
                "{} rate limited for user {}, waiting {:?} before retrying",
                self.platform, self.user_id, wait
            );
            tokio::time::sleep(wait).await;
        }
    }

    // ------------------------------------------------------------------ media

    async fn upload_media(
        &self,
        store: &dyn PublishStore,
        post: &Post,
        credentials: &Credentials,
        account_id: Option<&str>,
    ) -> Result<Vec<MediaHandle>> {
        if post.media.is_empty() {
            return Ok(Vec::new());
        }

        store.set_sub_status(&post.id, SubStatus::MediaUploading).await?;
        let mut handles = Vec::with_capacity(post.media.len());
        for media in &post.media {
            match self
                .client
                .upload_media(credentials.access_token(), media, account_id)
                .await
            {
                Ok(resp) => {
                    self.note_rate_limit(resp.rate_limit);
                    handles.push(resp.data);
                }
                Err(e) => {
                    if let ClientError::RateLimit { reset_at } = &e {
                        self.note_reset(*reset_at);
                        store.set_sub_status(&post.id, SubStatus::RateLimited).await?;
                    }
                    warn!("{} media upload failed for post {}: {}", self.platform, post.id, e);
                    return Err(self.platform_error(e));
                }
            }
        }
        store.set_sub_status(&post.id, SubStatus::MediaUploaded).await?;
        debug!("Uploaded {} media item(s) to {} for post {}", handles.len(), self.platform, post.id);
        Ok(handles)
    }

    // --------------------------------------------------------------- segments

    /// Post `segments` in order, each replying to the one before, resuming
    /// from the stored checkpoint. Media goes on the first segment.
    ///
    /// The checkpoint is written after every confirmed segment, so an error
    /// leaves it at exactly the number of segments the platform accepted.
    pub async fn publish_segments(
        &self,
        store: &dyn PublishStore,
        key: &EncryptionKey,
        post: &Post,
        credentials: &Credentials,
        segments: &[String],
        template: CreateRequest,
    ) -> Result<Vec<String>> {
        let platform = self.platform.as_str();
        let mut progress = match store.load_thread_progress(&post.id, platform).await? {
            Some(progress) => {
                progress.ensure_total(segments.len())?;
                progress
            }
            None => ThreadProgress::new(segments.len()),
        };

        if progress.is_complete() {
            info!("Post {} already fully published to {}", post.id, platform);
            return Ok(progress.tweet_ids);
        }
        if progress.posted > 0 {
            info!(
                "Resuming post {} on {} at segment {}/{}",
                post.id,
                platform,
                progress.posted + 1,
                progress.total
            );
        }

        let media = if progress.posted == 0 {
            self.upload_media(store, post, credentials, template.account_id.as_deref())
                .await?
        } else {
            Vec::new()
        };

        while !progress.is_complete() {
            let index = progress.posted;
            let mut request = template.clone();
            request.text = segments[index].clone();
            request.reply_to = progress.reply_target().map(str::to_string);
            if index == 0 {
                request.media = media.clone();
            }

            let id = match self.create(store, credentials, &request).await? {
                Ok(resp) => resp.external_id().to_string(),
                Err(e) if self.client.is_duplicate_content(&e) => {
                    info!(
                        "{} reported segment {} of post {} as a duplicate, looking it up",
                        platform,
                        index + 1,
                        post.id
                    );
                    match self
                        .recover_duplicate(store, key, credentials, &request, &progress)
                        .await
                    {
                        Ok(id) => id,
                        Err(e) => return Err(self.abort(store, post, &progress, e).await),
                    }
                }
                Err(e) => return Err(self.abort(store, post, &progress, e).await),
            };

            progress.advance(id)?;
            store.save_thread_progress(&post.id, platform, &progress).await?;
            debug!(
                "Post {} on {}: segment {}/{} confirmed",
                post.id, platform, progress.posted, progress.total
            );
        }

        Ok(progress.tweet_ids)
    }

    /// Find the id of a segment the platform already holds.
    ///
    /// Matches trimmed text among the account's latest items, newest first,
    /// skipping ids this thread already recorded and items replying elsewhere.
    async fn recover_duplicate(
        &self,
        store: &dyn PublishStore,
        key: &EncryptionKey,
        credentials: &Credentials,
        request: &CreateRequest,
        progress: &ThreadProgress,
    ) -> ClientResult<String> {
        let account_id = match &request.account_id {
            Some(id) => Some(id.clone()),
            None if self.activity_by_account => Some(self.account_id(store, key, credentials).await?),
            None => None,
        };

        let resp = self
            .client
            .recent_activity(credentials.access_token(), account_id.as_deref(), RECENT_ACTIVITY_LIMIT)
            .await?;
        self.note_rate_limit(resp.rate_limit);

        let wanted = request.text.trim();
        resp.data
            .into_iter()
            .find(|item| {
                item.text.trim() == wanted
                    && !progress.contains(&item.id)
                    && (item.in_reply_to.is_none() || item.in_reply_to == request.reply_to)
            })
            .map(|item| item.id)
            .ok_or_else(|| ClientError::api(409, "duplicate content and no matching post found"))
    }

    /// Record where the loop stopped and turn `error` into the handler error.
    async fn abort(
        &self,
        store: &dyn PublishStore,
        post: &Post,
        progress: &ThreadProgress,
        error: ClientError,
    ) -> PostwaveError {
        warn!(
            "{} publish of post {} stopped after {}/{} segments: {}",
            self.platform, post.id, progress.posted, progress.total, error
        );

        // The checkpoint itself is already durable at `posted`
        let sub_status = match &error {
            ClientError::RateLimit { reset_at } => {
                self.note_reset(*reset_at);
                Some(SubStatus::RateLimited)
            }
            _ if progress.posted > 0 => Some(SubStatus::ThreadPartial),
            _ => None,
        };
        if let Some(sub_status) = sub_status {
            if let Err(e) = store.set_sub_status(&post.id, sub_status).await {
                warn!("Failed to set sub-status on post {}: {}", post.id, e);
            }
        }

        self.platform_error(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{ActivityItem, MockClient};
    use crate::credentials::seal_new_token;
    use crate::db::Database;
    use crate::error::PlatformError;
    use std::time::Duration;
    use tempfile::TempDir;

    fn test_key() -> EncryptionKey {
        EncryptionKey::from_hex(&"11".repeat(32)).unwrap()
    }

    async fn setup(platform: Platform) -> (Database, TempDir, EncryptionKey) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let db = Database::new(db_path.to_str().unwrap()).await.unwrap();
        let key = test_key();
        let token = seal_new_token(&key, "user-1", platform, "access", Some("rt-0"), None).unwrap();
        db.upsert_token(&token).await.unwrap();
        (db, temp_dir, key)
    }

    fn handler_core(client: &MockClient) -> HandlerCore {
        HandlerCore::new(
            Arc::new(client.clone()),
            HandlerArgs::new("user-1").with_settings(HandlerSettings {
                inline_rate_limit_wait: Duration::from_secs(5),
                lock_lease: Duration::from_secs(5),
            }),
        )
    }

    async fn thread_post(db: &Database, segments: &[&str]) -> Post {
        let post = Post::new("user-1", serde_json::to_string(segments).unwrap());
        db.create_post(&post).await.unwrap();
        post
    }

    #[tokio::test]
    async fn test_segments_reply_to_previous() {
        let (db, _dir, key) = setup(Platform::Twitter).await;
        let client = MockClient::new(Platform::Twitter);
        let core = handler_core(&client);
        let post = thread_post(&db, &["one", "two", "three"]).await;
        let creds = core.credentials(&db, &key).await.unwrap();

        let ids = core
            .publish_segments(&db, &key, &post, &creds, &post.segments().unwrap(), CreateRequest::default())
            .await
            .unwrap();

        assert_eq!(ids, vec!["twitter-1", "twitter-2", "twitter-3"]);
        let posted = client.posted();
        assert_eq!(posted[0].reply_to, None);
        assert_eq!(posted[1].reply_to.as_deref(), Some("twitter-1"));
        assert_eq!(posted[2].reply_to.as_deref(), Some("twitter-2"));
    }

    #[tokio::test]
    async fn test_duplicate_recovery_skips_ids_already_in_thread() {
        let (db, _dir, key) = setup(Platform::Threads).await;
        // An older unrelated post with the same text as segment two
        let client = MockClient::new(Platform::Threads)
            .with_activity(ActivityItem {
                id: "old-1".to_string(),
                text: "same".to_string(),
                in_reply_to: Some("elsewhere".to_string()),
                created_at: None,
            })
            .fail_create_at(2, crate::clients::mock::MockFailure::Duplicate);
        let core = handler_core(&client);
        let post = thread_post(&db, &["first", "same", "last"]).await;
        let creds = core.credentials(&db, &key).await.unwrap();

        let ids = core
            .publish_segments(&db, &key, &post, &creds, &post.segments().unwrap(), CreateRequest::default())
            .await
            .unwrap();

        assert_eq!(ids, vec!["threads-1", "threads-2", "threads-3"]);
        assert_eq!(client.posted()[2].reply_to.as_deref(), Some("threads-2"));
    }

    #[tokio::test]
    async fn test_unmatched_duplicate_is_an_error() {
        let (db, _dir, key) = setup(Platform::LinkedIn).await;
        let client = MockClient::new(Platform::LinkedIn)
            .fail_always(crate::clients::mock::MockFailure::api(422, "duplicate post"));
        let core = handler_core(&client);
        let post = thread_post(&db, &["only"]).await;
        let creds = core.credentials(&db, &key).await.unwrap();

        let err = core
            .publish_segments(&db, &key, &post, &creds, &post.segments().unwrap(), CreateRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PostwaveError::Platform(PlatformError::Api { status: 409, .. })
        ));
    }

    #[tokio::test]
    async fn test_short_rate_limit_is_waited_out() {
        let (db, _dir, key) = setup(Platform::Twitter).await;
        let reset_at = Utc::now() + chrono::Duration::milliseconds(200);
        let client = MockClient::new(Platform::Twitter)
            .fail_create_at(1, crate::clients::mock::MockFailure::RateLimit { reset_at });
        let core = handler_core(&client);
        let creds = core.credentials(&db, &key).await.unwrap();

        let resp = core
            .create(&db, &creds, &CreateRequest::text("hi"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resp.external_id(), "twitter-1");
        assert_eq!(client.create_calls(), 2);
    }

    #[tokio::test]
    async fn test_long_rate_limit_is_returned() {
        let (db, _dir, key) = setup(Platform::Twitter).await;
        let reset_at = Utc::now() + chrono::Duration::minutes(15);
        let client = MockClient::new(Platform::Twitter)
            .fail_create_at(1, crate::clients::mock::MockFailure::RateLimit { reset_at });
        let core = handler_core(&client);
        let creds = core.credentials(&db, &key).await.unwrap();

        let err = core
            .create(&db, &creds, &CreateRequest::text("hi"))
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(err, ClientError::RateLimit { reset_at });
        assert_eq!(core.rate_limit_info().unwrap().remaining, 0);
    }

    #[tokio::test]
    async fn test_exhausted_window_blocks_without_calling_platform() {
        let (db, _dir, key) = setup(Platform::TikTok).await;
        let client = MockClient::new(Platform::TikTok);
        let core = handler_core(&client).with_window(Some(WindowLimit {
            limit: 1,
            window: Duration::from_secs(24 * 3600),
        }));
        let creds = core.credentials(&db, &key).await.unwrap();

        assert!(core.create(&db, &creds, &CreateRequest::text("a")).await.unwrap().is_ok());
        let second = core.create(&db, &creds, &CreateRequest::text("b")).await.unwrap();
        assert!(matches!(second, Err(ClientError::RateLimit { .. })));
        assert_eq!(client.create_calls(), 1);
    }

    #[tokio::test]
    async fn test_account_id_is_remembered() {
        let (db, _dir, key) = setup(Platform::LinkedIn).await;
        let client = MockClient::new(Platform::LinkedIn);
        let core = handler_core(&client);
        let creds = core.credentials(&db, &key).await.unwrap();

        let id = core.account_id(&db, &key, &creds).await.unwrap();
        assert_eq!(id, "mock-linkedin-account");

        let creds = core.credentials(&db, &key).await.unwrap();
        assert_eq!(creds.account_id(), Some("mock-linkedin-account"));
    }

    #[tokio::test]
    async fn test_validate_reports_missing_token() {
        let (db, _dir, key) = setup(Platform::Twitter).await;
        let client = MockClient::new(Platform::Threads);
        assert!(!handler_core(&client).validate(&db, &key).await.unwrap());

        let client = MockClient::new(Platform::Twitter);
        assert!(handler_core(&client).validate(&db, &key).await.unwrap());
    }
}
