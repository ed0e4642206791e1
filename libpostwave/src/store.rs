//! Storage contract used by the publish core
//!
//! The orchestrator, handlers, and sweeper only need point queries and
//! single-row updates. They talk to this trait so tests can wrap the real
//! database and observe writes. [`crate::db::Database`] is the production
//! implementation.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::checkpoint::ThreadProgress;
use crate::error::Result;
use crate::types::{PlatformStatusEntry, Post, SubStatus};

/// A stored OAuth token row. Token columns are vault ciphertext.
#[derive(Debug, Clone)]
pub struct StoredToken {
    pub id: i64,
    pub user_id: String,
    pub platform: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<i64>,
    pub scopes: Vec<String>,
    pub metadata: Map<String, Value>,
    pub refresh_locked_until: Option<i64>,
    pub updated_at: i64,
}

impl StoredToken {
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    pub fn needs_reauthorization(&self) -> bool {
        self.metadata
            .get(META_REAUTH_REQUIRED)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

pub const META_LAST_REFRESHED_AT: &str = "lastRefreshedAt";
pub const META_REFRESH_COUNT: &str = "refreshCount";
pub const META_REFRESH_FAILED_AT: &str = "refreshFailedAt";
pub const META_REFRESH_ERROR: &str = "refreshError";
pub const META_REAUTH_REQUIRED: &str = "reauthRequired";
pub const META_ACCOUNT_ID: &str = "accountId";

/// A token produced by an authorization flow, already sealed by the vault.
#[derive(Debug, Clone)]
pub struct NewToken {
    pub user_id: String,
    pub platform: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<i64>,
    pub scopes: Vec<String>,
    pub metadata: Map<String, Value>,
}

/// What happens to the stored refresh token when a refresh succeeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshTokenUpdate {
    Keep,
    Replace(String),
    Clear,
}

/// Result of a successful refresh, applied to the row in one statement.
#[derive(Debug, Clone)]
pub struct TokenRefresh {
    pub access_token: String,
    pub refresh_token: RefreshTokenUpdate,
    pub expires_at: Option<i64>,
    pub scopes: Option<Vec<String>>,
    pub refreshed_at: i64,
}

/// Final state of one publish run.
#[derive(Debug, Clone, PartialEq)]
pub enum PostOutcomeWrite {
    Published {
        external_post_id: Option<String>,
        sub_status: SubStatus,
    },
    Retry {
        next_attempt_at: i64,
        sub_status: SubStatus,
        reason: String,
        /// First success so far when some targets already published
        external_post_id: Option<String>,
    },
    Failed {
        fail_reason: String,
    },
}

#[async_trait]
pub trait PublishStore: Send + Sync {
    // ---------------------------------------------------------------- posts

    async fn get_post(&self, post_id: &str) -> Result<Option<Post>>;

    /// Move a post from `scheduled`/`retry` to `publishing` and bump its
    /// attempt counter. Returns false if the post was not in a dispatchable
    /// status, so two runs can never both pass the gate.
    async fn claim_post(&self, post_id: &str, now: i64) -> Result<bool>;

    async fn set_sub_status(&self, post_id: &str, sub_status: SubStatus) -> Result<()>;

    async fn downgrade_to_draft(&self, post_id: &str, reason: &str, now: i64) -> Result<()>;

    /// Persist the outcome of a run together with the per-platform status map.
    ///
    /// A rate-limited retry hands back the attempt `claim_post` took, so only
    /// runs that actually failed count toward the retry limit.
    async fn record_outcome(
        &self,
        post_id: &str,
        outcome: &PostOutcomeWrite,
        platform_status: &BTreeMap<String, PlatformStatusEntry>,
        now: i64,
    ) -> Result<()>;

    async fn load_thread_progress(
        &self,
        post_id: &str,
        platform: &str,
    ) -> Result<Option<ThreadProgress>>;

    async fn save_thread_progress(
        &self,
        post_id: &str,
        platform: &str,
        progress: &ThreadProgress,
    ) -> Result<()>;

    // --------------------------------------------------------------- tokens

    async fn get_token(&self, user_id: &str, platform: &str) -> Result<Option<StoredToken>>;

    async fn upsert_token(&self, token: &NewToken) -> Result<i64>;

    /// Take the refresh lease on one token. Returns false if another worker holds it.
    async fn try_lock_token(&self, token_id: i64, now: i64, lease_until: i64) -> Result<bool>;

    async fn unlock_token(&self, token_id: i64) -> Result<()>;

    /// Lease up to `limit` tokens of `platform` that expire before
    /// `expiring_before`, skipping rows already leased by another run.
    async fn claim_expiring_tokens(
        &self,
        platform: &str,
        expiring_before: i64,
        now: i64,
        lease_until: i64,
        limit: u32,
    ) -> Result<Vec<StoredToken>>;

    async fn apply_token_refresh(&self, token_id: i64, refresh: &TokenRefresh) -> Result<()>;

    /// Record a failed refresh on the row. The row is never deleted.
    async fn annotate_refresh_failure(
        &self,
        token_id: i64,
        reason: &str,
        reauth_required: bool,
        at: i64,
    ) -> Result<()>;

    async fn set_token_metadata(&self, token_id: i64, key: &str, value: Value) -> Result<()>;

    // --------------------------------------------------------- rate windows

    /// Calls recorded since `since`, and the start of the oldest bucket counted.
    async fn window_usage(
        &self,
        user_id: &str,
        platform: &str,
        since: i64,
    ) -> Result<(u32, Option<i64>)>;

    async fn record_window_call(
        &self,
        user_id: &str,
        platform: &str,
        bucket_start: i64,
    ) -> Result<()>;

    // ---------------------------------------------------- post-publish hooks

    async fn advance_series(&self, series_id: &str, post_id: &str, at: i64) -> Result<()>;

    async fn record_workspace_signal(
        &self,
        workspace_id: &str,
        post_id: &str,
        platforms: &[String],
        at: i64,
    ) -> Result<()>;
}
