//! Shared fixtures for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use libpostwave::checkpoint::ThreadProgress;
use libpostwave::clients::MockClient;
use libpostwave::credentials::seal_new_token;
use libpostwave::handlers::registry::build_handler;
use libpostwave::store::{NewToken, PostOutcomeWrite, StoredToken, TokenRefresh};
use libpostwave::types::PlatformStatusEntry;
use libpostwave::{
    Database, EncryptionKey, HandlerRegistry, Platform, Post, PublishStore, Result, SubStatus,
};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

pub const USER: &str = "user-1";

pub fn test_key() -> EncryptionKey {
    EncryptionKey::from_hex(&"42".repeat(32)).unwrap()
}

pub async fn setup_db() -> (Database, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("test.db");
    let db = Database::new(db_path.to_str().unwrap()).await.unwrap();
    (db, temp_dir)
}

/// Store a token for [`USER`] that stays valid for an hour.
pub async fn store_token(db: &dyn PublishStore, platform: Platform, refresh: Option<&str>) {
    let expires_at = chrono::Utc::now().timestamp() + 3600;
    let token = seal_new_token(&test_key(), USER, platform, "access-0", refresh, Some(expires_at)).unwrap();
    db.upsert_token(&token).await.unwrap();
}

pub fn thread_post(platforms: &[&str], segments: &[&str]) -> Post {
    let mut post = Post::new(USER, serde_json::to_string(segments).unwrap());
    post.platforms = platforms.iter().map(|p| p.to_string()).collect();
    post
}

pub fn text_post(platforms: &[&str], text: &str) -> Post {
    let mut post = Post::new(USER, text);
    post.platforms = platforms.iter().map(|p| p.to_string()).collect();
    post
}

/// Registry whose handlers all talk to the given scripted clients.
pub fn mock_registry(clients: &[&MockClient]) -> Arc<HandlerRegistry> {
    use libpostwave::clients::PlatformClient;

    let mut registry = HandlerRegistry::new();
    for client in clients {
        let platform = client.platform();
        let client = (*client).clone();
        registry.register(platform, move |args| {
            Ok(build_handler(platform, Arc::new(client.clone()), args, None))
        });
    }
    Arc::new(registry)
}

/// A [`Database`] that counts the writes the publish path makes.
pub struct RecordingStore {
    inner: Database,
    checkpoint_writes: AtomicUsize,
    outcome_writes: AtomicUsize,
    outcomes: Mutex<Vec<PostOutcomeWrite>>,
}

impl RecordingStore {
    pub fn new(inner: Database) -> Self {
        Self {
            inner,
            checkpoint_writes: AtomicUsize::new(0),
            outcome_writes: AtomicUsize::new(0),
            outcomes: Mutex::new(Vec::new()),
        }
    }

    pub fn db(&self) -> &Database {
        &self.inner
    }

    pub fn checkpoint_writes(&self) -> usize {
        self.checkpoint_writes.load(Ordering::SeqCst)
    }

    pub fn outcome_writes(&self) -> usize {
        self.outcome_writes.load(Ordering::SeqCst)
    }

    pub fn outcomes(&self) -> Vec<PostOutcomeWrite> {
        self.outcomes.lock().unwrap().clone()
    }
}

#[async_trait]
impl PublishStore for RecordingStore {
    async fn get_post(&self, post_id: &str) -> Result<Option<Post>> {
        self.inner.get_post(post_id).await
    }

    async fn claim_post(&self, post_id: &str, now: i64) -> Result<bool> {
        self.inner.claim_post(post_id, now).await
    }

    async fn set_sub_status(&self, post_id: &str, sub_status: SubStatus) -> Result<()> {
        self.inner.set_sub_status(post_id, sub_status).await
    }

    async fn downgrade_to_draft(&self, post_id: &str, reason: &str, now: i64) -> Result<()> {
        self.inner.downgrade_to_draft(post_id, reason, now).await
    }

    async fn record_outcome(
        &self,
        post_id: &str,
        outcome: &PostOutcomeWrite,
        platform_status: &BTreeMap<String, PlatformStatusEntry>,
        now: i64,
    ) -> Result<()> {
        self.outcome_writes.fetch_add(1, Ordering::SeqCst);
        self.outcomes.lock().unwrap().push(outcome.clone());
        self.inner
            .record_outcome(post_id, outcome, platform_status, now)
            .await
    }

    async fn load_thread_progress(
        &self,
        post_id: &str,
        platform: &str,
    ) -> Result<Option<ThreadProgress>> {
        self.inner.load_thread_progress(post_id, platform).await
    }

    async fn save_thread_progress(
        &self,
        post_id: &str,
        platform: &str,
        progress: &ThreadProgress,
    ) -> Result<()> {
        self.checkpoint_writes.fetch_add(1, Ordering::SeqCst);
        self.inner
            .save_thread_progress(post_id, platform, progress)
            .await
    }

    async fn get_token(&self, user_id: &str, platform: &str) -> Result<Option<StoredToken>> {
        self.inner.get_token(user_id, platform).await
    }

    async fn upsert_token(&self, token: &NewToken) -> Result<i64> {
        self.inner.upsert_token(token).await
    }

    async fn try_lock_token(&self, token_id: i64, now: i64, lease_until: i64) -> Result<bool> {
        self.inner.try_lock_token(token_id, now, lease_until).await
    }

    async fn unlock_token(&self, token_id: i64) -> Result<()> {
        self.inner.unlock_token(token_id).await
    }

    async fn claim_expiring_tokens(
        &self,
        platform: &str,
        expiring_before: i64,
        now: i64,
        lease_until: i64,
        limit: u32,
    ) -> Result<Vec<StoredToken>> {
        self.inner
            .claim_expiring_tokens(platform, expiring_before, now, lease_until, limit)
            .await
    }

    async fn apply_token_refresh(&self, token_id: i64, refresh: &TokenRefresh) -> Result<()> {
        self.inner.apply_token_refresh(token_id, refresh).await
    }

    async fn annotate_refresh_failure(
        &self,
        token_id: i64,
        reason: &str,
        reauth_required: bool,
        at: i64,
    ) -> Result<()> {
        self.inner
            .annotate_refresh_failure(token_id, reason, reauth_required, at)
            .await
    }

    async fn set_token_metadata(&self, token_id: i64, key: &str, value: Value) -> Result<()> {
        self.inner.set_token_metadata(token_id, key, value).await
    }

    async fn window_usage(
        &self,
        user_id: &str,
        platform: &str,
        since: i64,
    ) -> Result<(u32, Option<i64>)> {
        self.inner.window_usage(user_id, platform, since).await
    }

    async fn record_window_call(
        &self,
        user_id: &str,
        platform: &str,
        bucket_start: i64,
    ) -> Result<()> {
        self.inner
            .record_window_call(user_id, platform, bucket_start)
            .await
    }

    async fn advance_series(&self, series_id: &str, post_id: &str, at: i64) -> Result<()> {
        self.inner.advance_series(series_id, post_id, at).await
    }

    async fn record_workspace_signal(
        &self,
        workspace_id: &str,
        post_id: &str,
        platforms: &[String],
        at: i64,
    ) -> Result<()> {
        self.inner
            .record_workspace_signal(workspace_id, post_id, platforms, at)
            .await
    }
}
