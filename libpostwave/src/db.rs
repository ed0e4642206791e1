//! Database operations for Postwave

use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::checkpoint::ThreadProgress;
use crate::error::{DbError, PostwaveError, Result};
use crate::store::{
    NewToken, PostOutcomeWrite, PublishStore, RefreshTokenUpdate, StoredToken, TokenRefresh,
    META_LAST_REFRESHED_AT, META_REAUTH_REQUIRED, META_REFRESH_COUNT, META_REFRESH_ERROR,
    META_REFRESH_FAILED_AT,
};
use crate::types::{
    ApprovalStatus, MediaRef, PlatformStatusEntry, Post, PostMetadata, PostStatus, SubStatus,
};

const POST_COLUMNS: &str = "id, user_id, platform, platforms, content, media, status, sub_status, \
     workspace_id, requires_approval, approval_status, series_id, metadata, external_post_id, \
     fail_reason, scheduled_at, next_attempt_at, attempt_count, created_at, updated_at";

const TOKEN_COLUMNS: &str = "id, user_id, platform, access_token, refresh_token, expires_at, \
     scopes, metadata, refresh_locked_until, updated_at";

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database connection
    pub async fn new(db_path: &str) -> Result<Self> {
        // Expand path and create parent directories
        let expanded_path = shellexpand::tilde(db_path).to_string();
        let path = Path::new(&expanded_path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(DbError::IoError)?;
        }

        // Use forward slashes for SQLite URL (works on both Windows and Unix)
        let db_url = format!("sqlite://{}", expanded_path.replace('\\', "/"));
        let options = SqliteConnectOptions::from_str(&db_url)
            .map_err(DbError::SqlxError)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(DbError::SqlxError)?;

        // Run migrations
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(DbError::MigrationError)?;

        Ok(Self { pool })
    }

    /// Get the underlying connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert a post. Used by authoring collaborators and tests.
    pub async fn create_post(&self, post: &Post) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO posts ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            POST_COLUMNS
        ))
        .bind(&post.id)
        .bind(&post.user_id)
        .bind(&post.platform)
        .bind(to_json(&post.platforms)?)
        .bind(&post.content)
        .bind(to_json(&post.media)?)
        .bind(post.status.as_str())
        .bind(post.sub_status.as_str())
        .bind(&post.workspace_id)
        .bind(post.requires_approval)
        .bind(post.approval_status.map(|s| s.as_str()))
        .bind(&post.series_id)
        .bind(to_json(&post.metadata)?)
        .bind(&post.external_post_id)
        .bind(&post.fail_reason)
        .bind(post.scheduled_at)
        .bind(post.next_attempt_at)
        .bind(post.attempt_count as i64)
        .bind(post.created_at)
        .bind(post.updated_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// Posts eligible for a publish run at `now`, oldest first.
    pub async fn due_posts(&self, now: i64, limit: u32) -> Result<Vec<Post>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM posts
            WHERE status IN ('scheduled', 'retry')
              AND (scheduled_at IS NULL OR scheduled_at <= ?)
              AND (next_attempt_at IS NULL OR next_attempt_at <= ?)
            ORDER BY COALESCE(next_attempt_at, scheduled_at, created_at) ASC
            LIMIT ?
            "#,
            POST_COLUMNS
        ))
        .bind(now)
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(post_from_row).collect()
    }

    /// Return posts stuck in `publishing` (a run died mid-flight) to `retry`.
    ///
    /// Their checkpoints and platform status maps are left untouched, so the
    /// next run resumes where the dead one stopped.
    pub async fn release_stale_publishing(&self, stale_before: i64, now: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE posts
            SET status = 'retry', next_attempt_at = ?, fail_reason = 'publish run interrupted',
                updated_at = ?
            WHERE status = 'publishing' AND updated_at <= ?
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(stale_before)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected())
    }

    /// Delete self-tracked rate windows older than `cutoff`.
    pub async fn cleanup_rate_windows(&self, cutoff: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM rate_limit_windows WHERE window_start < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected())
    }

    /// Current series cursor, if the series exists.
    pub async fn series_index(&self, series_id: &str) -> Result<Option<i64>> {
        let row = sqlx::query_as::<_, (i64,)>("SELECT current_index FROM series WHERE id = ?")
            .bind(series_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(row.map(|r| r.0))
    }

    pub async fn workspace_signal_count(&self, workspace_id: &str) -> Result<i64> {
        let row = sqlx::query_as::<_, (i64,)>(
            "SELECT COUNT(*) FROM workspace_publish_signals WHERE workspace_id = ?",
        )
        .bind(workspace_id)
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(row.0)
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| {
        PostwaveError::InvalidInput(format!("Failed to serialize column value: {}", e))
    })
}

fn corrupt(column: &str, reason: impl ToString) -> PostwaveError {
    DbError::Corrupt {
        column: column.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

fn post_from_row(row: &SqliteRow) -> Result<Post> {
    let platforms: String = row.get("platforms");
    let media: String = row.get("media");
    let metadata: String = row.get("metadata");
    let status: String = row.get("status");
    let sub_status: String = row.get("sub_status");
    let approval_status: Option<String> = row.get("approval_status");
    let attempt_count: i64 = row.get("attempt_count");

    Ok(Post {
        id: row.get("id"),
        user_id: row.get("user_id"),
        platform: row.get("platform"),
        platforms: serde_json::from_str::<Vec<String>>(&platforms)
            .map_err(|e| corrupt("platforms", e))?,
        content: row.get("content"),
        media: serde_json::from_str::<Vec<MediaRef>>(&media).map_err(|e| corrupt("media", e))?,
        status: PostStatus::from_str(&status).map_err(|e| corrupt("status", e))?,
        sub_status: SubStatus::from_str(&sub_status).map_err(|e| corrupt("sub_status", e))?,
        workspace_id: row.get("workspace_id"),
        requires_approval: row.get("requires_approval"),
        approval_status: approval_status
            .as_deref()
            .map(ApprovalStatus::from_str)
            .transpose()
            .map_err(|e| corrupt("approval_status", e))?,
        series_id: row.get("series_id"),
        metadata: serde_json::from_str::<PostMetadata>(&metadata)
            .map_err(|e| corrupt("metadata", e))?,
        external_post_id: row.get("external_post_id"),
        fail_reason: row.get("fail_reason"),
        scheduled_at: row.get("scheduled_at"),
        next_attempt_at: row.get("next_attempt_at"),
        attempt_count: attempt_count.max(0) as u32,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn token_from_row(row: &SqliteRow) -> Result<StoredToken> {
    let scopes: String = row.get("scopes");
    let metadata: String = row.get("metadata");

    Ok(StoredToken {
        id: row.get("id"),
        user_id: row.get("user_id"),
        platform: row.get("platform"),
        access_token: row.get("access_token"),
        refresh_token: row.get("refresh_token"),
        expires_at: row.get("expires_at"),
        scopes: serde_json::from_str(&scopes).map_err(|e| corrupt("scopes", e))?,
        metadata: serde_json::from_str::<Map<String, Value>>(&metadata)
            .map_err(|e| corrupt("metadata", e))?,
        refresh_locked_until: row.get("refresh_locked_until"),
        updated_at: row.get("updated_at"),
    })
}

#[async_trait]
impl PublishStore for Database {
    async fn get_post(&self, post_id: &str) -> Result<Option<Post>> {
        let row = sqlx::query(&format!("SELECT {} FROM posts WHERE id = ?", POST_COLUMNS))
            .bind(post_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        row.as_ref().map(post_from_row).transpose()
    }

    async fn claim_post(&self, post_id: &str, now: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE posts
            SET status = 'publishing', sub_status = 'none',
                attempt_count = attempt_count + 1, updated_at = ?
            WHERE id = ? AND status IN ('scheduled', 'retry')
            "#,
        )
        .bind(now)
        .bind(post_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    async fn set_sub_status(&self, post_id: &str, sub_status: SubStatus) -> Result<()> {
        sqlx::query("UPDATE posts SET sub_status = ? WHERE id = ?")
            .bind(sub_status.as_str())
            .bind(post_id)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(())
    }

    async fn downgrade_to_draft(&self, post_id: &str, reason: &str, now: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE posts
            SET status = 'draft', sub_status = 'none', fail_reason = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(reason)
        .bind(now)
        .bind(post_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    async fn record_outcome(
        &self,
        post_id: &str,
        outcome: &PostOutcomeWrite,
        platform_status: &BTreeMap<String, PlatformStatusEntry>,
        now: i64,
    ) -> Result<()> {
        let status_json = to_json(platform_status)?;

        let query = match outcome {
            PostOutcomeWrite::Published {
                external_post_id,
                sub_status,
            } => sqlx::query(
                r#"
                UPDATE posts
                SET status = 'published', sub_status = ?, external_post_id = ?,
                    fail_reason = NULL, next_attempt_at = NULL,
                    metadata = json_set(metadata, '$.platformStatus', json(?)), updated_at = ?
                WHERE id = ?
                "#,
            )
            .bind(sub_status.as_str())
            .bind(external_post_id.clone()),
            PostOutcomeWrite::Retry {
                next_attempt_at,
                sub_status,
                reason,
                external_post_id,
            } => sqlx::query(
                r#"
                UPDATE posts
                SET status = 'retry', sub_status = ?, attempt_count = MAX(attempt_count - ?, 0),
                    next_attempt_at = ?, fail_reason = ?,
                    external_post_id = COALESCE(external_post_id, ?),
                    metadata = json_set(metadata, '$.platformStatus', json(?)), updated_at = ?
                WHERE id = ?
                "#,
            )
            .bind(sub_status.as_str())
            // A rate-limited run does not use up the retry budget
            .bind(i64::from(*sub_status == SubStatus::RateLimited))
            .bind(*next_attempt_at)
            .bind(reason.clone())
            .bind(external_post_id.clone()),
            PostOutcomeWrite::Failed { fail_reason } => sqlx::query(
                r#"
                UPDATE posts
                SET status = 'failed', fail_reason = ?, next_attempt_at = NULL,
                    metadata = json_set(metadata, '$.platformStatus', json(?)), updated_at = ?
                WHERE id = ?
                "#,
            )
            .bind(fail_reason.clone()),
        };

        query
            .bind(status_json)
            .bind(now)
            .bind(post_id)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(())
    }

    async fn load_thread_progress(
        &self,
        post_id: &str,
        platform: &str,
    ) -> Result<Option<ThreadProgress>> {
        let row = sqlx::query_as::<_, (Option<String>,)>(
            "SELECT json_extract(metadata, '$.threadProgress.' || ?) FROM posts WHERE id = ?",
        )
        .bind(platform)
        .bind(post_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        let raw = match row.and_then(|r| r.0) {
            Some(raw) => raw,
            None => return Ok(None),
        };
        let value: Value = serde_json::from_str(&raw).map_err(|e| corrupt("metadata", e))?;
        Ok(Some(ThreadProgress::from_value(&value)?))
    }

    async fn save_thread_progress(
        &self,
        post_id: &str,
        platform: &str,
        progress: &ThreadProgress,
    ) -> Result<()> {
        let value = progress.to_value()?;

        sqlx::query(
            r#"
            UPDATE posts
            SET metadata = json_set(
                metadata,
                '$.threadProgress',
                json_set(json(COALESCE(json_extract(metadata, '$.threadProgress'), '{}')), '$.' || ?, json(?))
            )
            WHERE id = ?
            "#,
        )
        .bind(platform)
        .bind(value.to_string())
        .bind(post_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    async fn get_token(&self, user_id: &str, platform: &str) -> Result<Option<StoredToken>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM oauth_tokens WHERE user_id = ? AND platform = ?",
            TOKEN_COLUMNS
        ))
        .bind(user_id)
        .bind(platform)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        row.as_ref().map(token_from_row).transpose()
    }

    async fn upsert_token(&self, token: &NewToken) -> Result<i64> {
        let now = chrono::Utc::now().timestamp();
        let row = sqlx::query_as::<_, (i64,)>(
            r#"
            INSERT INTO oauth_tokens
                (user_id, platform, access_token, refresh_token, expires_at, scopes, metadata,
                 created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id, platform) DO UPDATE SET
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                expires_at = excluded.expires_at,
                scopes = excluded.scopes,
                metadata = excluded.metadata,
                refresh_locked_until = NULL,
                updated_at = excluded.updated_at
            RETURNING id
            "#,
        )
        .bind(&token.user_id)
        .bind(&token.platform)
        .bind(&token.access_token)
        .bind(&token.refresh_token)
        .bind(token.expires_at)
        .bind(to_json(&token.scopes)?)
        .bind(to_json(&token.metadata)?)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(row.0)
    }

    async fn try_lock_token(&self, token_id: i64, now: i64, lease_until: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE oauth_tokens SET refresh_locked_until = ?
            WHERE id = ? AND (refresh_locked_until IS NULL OR refresh_locked_until <= ?)
            "#,
        )
        .bind(lease_until)
        .bind(token_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    async fn unlock_token(&self, token_id: i64) -> Result<()> {
        sqlx::query("UPDATE oauth_tokens SET refresh_locked_until = NULL WHERE id = ?")
            .bind(token_id)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(())
    }

    async fn claim_expiring_tokens(
        &self,
        platform: &str,
        expiring_before: i64,
        now: i64,
        lease_until: i64,
        limit: u32,
    ) -> Result<Vec<StoredToken>> {
        // SQLite has no SKIP LOCKED; the lease column plays that role. The
        // subquery and update run as one statement, so two sweepers can never
        // lease the same row.
        let rows = sqlx::query(&format!(
            r#"
            UPDATE oauth_tokens SET refresh_locked_until = ?
            WHERE id IN (
                SELECT id FROM oauth_tokens
                WHERE platform = ?
                  AND expires_at IS NOT NULL AND expires_at <= ?
                  AND (refresh_locked_until IS NULL OR refresh_locked_until <= ?)
                  AND COALESCE(json_extract(metadata, '$.{}'), 0) = 0
                ORDER BY expires_at ASC
                LIMIT ?
            )
            RETURNING {}
            "#,
            META_REAUTH_REQUIRED, TOKEN_COLUMNS
        ))
        .bind(lease_until)
        .bind(platform)
        .bind(expiring_before)
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(token_from_row).collect()
    }

    async fn apply_token_refresh(&self, token_id: i64, refresh: &TokenRefresh) -> Result<()> {
        let (refresh_mode, refresh_value) = match &refresh.refresh_token {
            RefreshTokenUpdate::Keep => ("keep", None),
            RefreshTokenUpdate::Replace(token) => ("replace", Some(token.clone())),
            RefreshTokenUpdate::Clear => ("clear", None),
        };
        let scopes = refresh.scopes.as_ref().map(to_json).transpose()?;

        // Access token, refresh token, and bookkeeping change in one statement
        // so a rotated refresh token can never be lost between writes.
        sqlx::query(&format!(
            r#"
            UPDATE oauth_tokens
            SET access_token = ?,
                refresh_token = CASE ?
                    WHEN 'replace' THEN ?
                    WHEN 'clear' THEN NULL
                    ELSE refresh_token
                END,
                expires_at = ?,
                scopes = COALESCE(?, scopes),
                metadata = json_remove(
                    json_set(
                        metadata,
                        '$.{last}', ?,
                        '$.{count}', COALESCE(json_extract(metadata, '$.{count}'), 0) + 1
                    ),
                    '$.{failed_at}', '$.{error}', '$.{reauth}'
                ),
                updated_at = ?
            WHERE id = ?
            "#,
            last = META_LAST_REFRESHED_AT,
            count = META_REFRESH_COUNT,
            failed_at = META_REFRESH_FAILED_AT,
            error = META_REFRESH_ERROR,
            reauth = META_REAUTH_REQUIRED,
        ))
        .bind(&refresh.access_token)
        .bind(refresh_mode)
        .bind(refresh_value)
        .bind(refresh.expires_at)
        .bind(scopes)
        .bind(refresh.refreshed_at)
        .bind(refresh.refreshed_at)
        .bind(token_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    async fn annotate_refresh_failure(
        &self,
        token_id: i64,
        reason: &str,
        reauth_required: bool,
        at: i64,
    ) -> Result<()> {
        sqlx::query(&format!(
            r#"
            UPDATE oauth_tokens
            SET metadata = json_set(metadata, '$.{}', ?, '$.{}', ?, '$.{}', json(?)),
                updated_at = ?
            WHERE id = ?
            "#,
            META_REFRESH_FAILED_AT, META_REFRESH_ERROR, META_REAUTH_REQUIRED
        ))
        .bind(at)
        .bind(reason)
        .bind(if reauth_required { "true" } else { "false" })
        .bind(at)
        .bind(token_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    async fn set_token_metadata(&self, token_id: i64, key: &str, value: Value) -> Result<()> {
        sqlx::query("UPDATE oauth_tokens SET metadata = json_set(metadata, '$.' || ?, json(?)) WHERE id = ?")
            .bind(key)
            .bind(value.to_string())
            .bind(token_id)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(())
    }

    async fn window_usage(
        &self,
        user_id: &str,
        platform: &str,
        since: i64,
    ) -> Result<(u32, Option<i64>)> {
        let row = sqlx::query_as::<_, (Option<i64>, Option<i64>)>(
            r#"
            SELECT SUM(call_count), MIN(window_start) FROM rate_limit_windows
            WHERE user_id = ? AND platform = ? AND window_start >= ?
            "#,
        )
        .bind(user_id)
        .bind(platform)
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok((row.0.unwrap_or(0).max(0) as u32, row.1))
    }

    async fn record_window_call(
        &self,
        user_id: &str,
        platform: &str,
        bucket_start: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO rate_limit_windows (user_id, platform, window_start, call_count)
            VALUES (?, ?, ?, 1)
            ON CONFLICT(user_id, platform, window_start)
            DO UPDATE SET call_count = call_count + 1
            "#,
        )
        .bind(user_id)
        .bind(platform)
        .bind(bucket_start)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    async fn advance_series(&self, series_id: &str, post_id: &str, at: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO series (id, current_index, last_published_post_id, last_published_at)
            VALUES (?, 1, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                current_index = current_index + 1,
                last_published_post_id = excluded.last_published_post_id,
                last_published_at = excluded.last_published_at
            "#,
        )
        .bind(series_id)
        .bind(post_id)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    async fn record_workspace_signal(
        &self,
        workspace_id: &str,
        post_id: &str,
        platforms: &[String],
        at: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO workspace_publish_signals (workspace_id, post_id, platforms, published_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(workspace_id)
        .bind(post_id)
        .bind(to_json(&platforms)?)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn setup_test_db() -> (Database, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let db = Database::new(db_path.to_str().unwrap()).await.unwrap();
        (db, temp_dir)
    }

    fn sample_token(user_id: &str, platform: &str, expires_at: i64) -> NewToken {
        NewToken {
            user_id: user_id.to_string(),
            platform: platform.to_string(),
            access_token: "sealed-access".to_string(),
            refresh_token: Some("sealed-refresh".to_string()),
            expires_at: Some(expires_at),
            scopes: vec!["tweet.write".to_string()],
            metadata: Map::new(),
        }
    }

    #[tokio::test]
    async fn test_create_and_get_post() {
        let (db, _temp_dir) = setup_test_db().await;
        let mut post = Post::new("user-1", r#"["a","b"]"#);
        post.platforms = vec!["twitter".to_string(), "threads".to_string()];
        post.media = vec![MediaRef::new("https://cdn.example/a.png")];
        db.create_post(&post).await.unwrap();

        let loaded = db.get_post(&post.id).await.unwrap().unwrap();
        assert_eq!(loaded.platforms, post.platforms);
        assert_eq!(loaded.media, post.media);
        assert_eq!(loaded.status, PostStatus::Scheduled);
        assert_eq!(loaded.sub_status, SubStatus::None);
    }

    #[tokio::test]
    async fn test_get_missing_post() {
        let (db, _temp_dir) = setup_test_db().await;
        assert!(db.get_post("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_post_only_once() {
        let (db, _temp_dir) = setup_test_db().await;
        let post = Post::new("user-1", "hello");
        db.create_post(&post).await.unwrap();

        assert!(db.claim_post(&post.id, 100).await.unwrap());
        assert!(!db.claim_post(&post.id, 101).await.unwrap());

        let loaded = db.get_post(&post.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, PostStatus::Publishing);
        assert_eq!(loaded.attempt_count, 1);
    }

    #[tokio::test]
    async fn test_rate_limited_retry_returns_the_attempt() {
        let (db, _temp_dir) = setup_test_db().await;
        let post = Post::new("user-1", "hello");
        db.create_post(&post).await.unwrap();
        let status = BTreeMap::new();

        db.claim_post(&post.id, 100).await.unwrap();
        let rate_limited = PostOutcomeWrite::Retry {
            next_attempt_at: 200,
            sub_status: SubStatus::RateLimited,
            reason: "twitter: rate limited".to_string(),
            external_post_id: None,
        };
        db.record_outcome(&post.id, &rate_limited, &status, 100).await.unwrap();
        let loaded = db.get_post(&post.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, PostStatus::Retry);
        assert_eq!(loaded.attempt_count, 0);

        db.claim_post(&post.id, 200).await.unwrap();
        let backoff = PostOutcomeWrite::Retry {
            next_attempt_at: 300,
            sub_status: SubStatus::None,
            reason: "twitter: service unavailable".to_string(),
            external_post_id: None,
        };
        db.record_outcome(&post.id, &backoff, &status, 200).await.unwrap();
        let loaded = db.get_post(&post.id).await.unwrap().unwrap();
        assert_eq!(loaded.attempt_count, 1);
    }

    #[tokio::test]
    async fn test_thread_progress_is_per_platform() {
        let (db, _temp_dir) = setup_test_db().await;
        let post = Post::new("user-1", r#"["a","b","c"]"#);
        db.create_post(&post).await.unwrap();

        let mut twitter = ThreadProgress::new(3);
        twitter.advance("t1").unwrap();
        db.save_thread_progress(&post.id, "twitter", &twitter).await.unwrap();

        let mut threads = ThreadProgress::new(3);
        threads.advance("m1").unwrap();
        threads.advance("m2").unwrap();
        db.save_thread_progress(&post.id, "threads", &threads).await.unwrap();

        assert_eq!(
            db.load_thread_progress(&post.id, "twitter").await.unwrap(),
            Some(twitter)
        );
        assert_eq!(
            db.load_thread_progress(&post.id, "threads").await.unwrap(),
            Some(threads)
        );
        assert!(db
            .load_thread_progress(&post.id, "linkedin")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_malformed_checkpoint_fails_loudly() {
        let (db, _temp_dir) = setup_test_db().await;
        let mut post = Post::new("user-1", r#"["a","b"]"#);
        post.metadata.thread_progress.insert(
            "twitter".to_string(),
            serde_json::json!({"posted": 2, "tweetIds": []}),
        );
        db.create_post(&post).await.unwrap();

        let err = db.load_thread_progress(&post.id, "twitter").await.unwrap_err();
        assert!(matches!(err, PostwaveError::Checkpoint(_)));
    }

    #[tokio::test]
    async fn test_record_outcome_keeps_checkpoints() {
        let (db, _temp_dir) = setup_test_db().await;
        let post = Post::new("user-1", r#"["a","b"]"#);
        db.create_post(&post).await.unwrap();

        let mut progress = ThreadProgress::new(2);
        progress.advance("1").unwrap();
        db.save_thread_progress(&post.id, "twitter", &progress).await.unwrap();

        let mut status_map = BTreeMap::new();
        status_map.insert(
            "twitter".to_string(),
            PlatformStatusEntry {
                status: crate::types::PublishStatus::Failed,
                external_post_id: None,
                error: Some("boom".to_string()),
                updated_at: 5,
            },
        );
        db.record_outcome(
            &post.id,
            &PostOutcomeWrite::Failed {
                fail_reason: "twitter: boom".to_string(),
            },
            &status_map,
            5,
        )
        .await
        .unwrap();

        let loaded = db.get_post(&post.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, PostStatus::Failed);
        assert_eq!(loaded.metadata.platform_status, status_map);
        assert_eq!(
            db.load_thread_progress(&post.id, "twitter").await.unwrap(),
            Some(progress)
        );
    }

    #[tokio::test]
    async fn test_due_posts_respects_next_attempt_at() {
        let (db, _temp_dir) = setup_test_db().await;

        let mut due = Post::new("u", "due");
        due.scheduled_at = Some(50);
        db.create_post(&due).await.unwrap();

        let mut suspended = Post::new("u", "suspended");
        suspended.status = PostStatus::Retry;
        suspended.scheduled_at = Some(10);
        suspended.next_attempt_at = Some(500);
        db.create_post(&suspended).await.unwrap();

        let mut draft = Post::new("u", "draft");
        draft.status = PostStatus::Draft;
        draft.scheduled_at = Some(10);
        db.create_post(&draft).await.unwrap();

        let ids: Vec<String> = db.due_posts(100, 10).await.unwrap().into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![due.id.clone()]);

        let ids: Vec<String> = db.due_posts(600, 10).await.unwrap().into_iter().map(|p| p.id).collect();
        assert_eq!(ids.len(), 2);
    }

    #[tokio::test]
    async fn test_release_stale_publishing() {
        let (db, _temp_dir) = setup_test_db().await;
        let post = Post::new("u", "stuck");
        db.create_post(&post).await.unwrap();
        db.claim_post(&post.id, 100).await.unwrap();

        assert_eq!(db.release_stale_publishing(50, 200).await.unwrap(), 0);
        assert_eq!(db.release_stale_publishing(150, 200).await.unwrap(), 1);
        let loaded = db.get_post(&post.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, PostStatus::Retry);
    }

    #[tokio::test]
    async fn test_token_upsert_and_refresh_bookkeeping() {
        let (db, _temp_dir) = setup_test_db().await;
        let id = db.upsert_token(&sample_token("u", "twitter", 1000)).await.unwrap();

        db.annotate_refresh_failure(id, "invalid_grant", true, 900).await.unwrap();
        let token = db.get_token("u", "twitter").await.unwrap().unwrap();
        assert!(token.needs_reauthorization());
        assert_eq!(token.metadata_str(META_REFRESH_ERROR), Some("invalid_grant"));

        db.apply_token_refresh(
            id,
            &TokenRefresh {
                access_token: "sealed-access-2".to_string(),
                refresh_token: RefreshTokenUpdate::Replace("sealed-refresh-2".to_string()),
                expires_at: Some(5000),
                scopes: None,
                refreshed_at: 1200,
            },
        )
        .await
        .unwrap();

        let token = db.get_token("u", "twitter").await.unwrap().unwrap();
        assert_eq!(token.access_token, "sealed-access-2");
        assert_eq!(token.refresh_token.as_deref(), Some("sealed-refresh-2"));
        assert_eq!(token.expires_at, Some(5000));
        assert_eq!(token.scopes, vec!["tweet.write"]);
        assert!(!token.needs_reauthorization());
        assert_eq!(token.metadata.get(META_REFRESH_COUNT).and_then(Value::as_i64), Some(1));
        assert!(token.metadata.get(META_REFRESH_ERROR).is_none());
    }

    #[tokio::test]
    async fn test_refresh_keep_and_clear() {
        let (db, _temp_dir) = setup_test_db().await;
        let id = db.upsert_token(&sample_token("u", "linkedin", 1000)).await.unwrap();

        let mut refresh = TokenRefresh {
            access_token: "a2".to_string(),
            refresh_token: RefreshTokenUpdate::Keep,
            expires_at: Some(2000),
            scopes: None,
            refreshed_at: 10,
        };
        db.apply_token_refresh(id, &refresh).await.unwrap();
        let token = db.get_token("u", "linkedin").await.unwrap().unwrap();
        assert_eq!(token.refresh_token.as_deref(), Some("sealed-refresh"));

        refresh.refresh_token = RefreshTokenUpdate::Clear;
        db.apply_token_refresh(id, &refresh).await.unwrap();
        let token = db.get_token("u", "linkedin").await.unwrap().unwrap();
        assert!(token.refresh_token.is_none());
    }

    #[tokio::test]
    async fn test_claim_expiring_tokens_skips_leased_rows() {
        let (db, _temp_dir) = setup_test_db().await;
        db.upsert_token(&sample_token("a", "twitter", 100)).await.unwrap();
        db.upsert_token(&sample_token("b", "twitter", 200)).await.unwrap();
        db.upsert_token(&sample_token("c", "twitter", 10_000)).await.unwrap();
        db.upsert_token(&sample_token("d", "linkedin", 100)).await.unwrap();

        let first = db.claim_expiring_tokens("twitter", 500, 50, 150, 10).await.unwrap();
        assert_eq!(first.len(), 2);

        // A concurrent sweep sees both rows leased
        let second = db.claim_expiring_tokens("twitter", 500, 60, 160, 10).await.unwrap();
        assert!(second.is_empty());

        // Once the lease lapses the rows can be claimed again
        let third = db.claim_expiring_tokens("twitter", 500, 151, 300, 10).await.unwrap();
        assert_eq!(third.len(), 2);
    }

    #[tokio::test]
    async fn test_claim_skips_tokens_needing_reauthorization() {
        let (db, _temp_dir) = setup_test_db().await;
        let id = db.upsert_token(&sample_token("a", "twitter", 100)).await.unwrap();
        db.annotate_refresh_failure(id, "revoked", true, 50).await.unwrap();

        assert!(db.claim_expiring_tokens("twitter", 500, 50, 150, 10).await.unwrap().is_empty());

        db.annotate_refresh_failure(id, "timeout", false, 60).await.unwrap();
        assert_eq!(db.claim_expiring_tokens("twitter", 500, 60, 150, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_try_lock_token() {
        let (db, _temp_dir) = setup_test_db().await;
        let id = db.upsert_token(&sample_token("a", "twitter", 100)).await.unwrap();

        assert!(db.try_lock_token(id, 10, 40).await.unwrap());
        assert!(!db.try_lock_token(id, 20, 50).await.unwrap());
        db.unlock_token(id).await.unwrap();
        assert!(db.try_lock_token(id, 20, 50).await.unwrap());
    }

    #[tokio::test]
    async fn test_window_usage() {
        let (db, _temp_dir) = setup_test_db().await;
        db.record_window_call("u", "linkedin", 3600).await.unwrap();
        db.record_window_call("u", "linkedin", 3600).await.unwrap();
        db.record_window_call("u", "linkedin", 7200).await.unwrap();
        db.record_window_call("other", "linkedin", 7200).await.unwrap();

        assert_eq!(db.window_usage("u", "linkedin", 0).await.unwrap(), (3, Some(3600)));
        assert_eq!(db.window_usage("u", "linkedin", 7200).await.unwrap(), (1, Some(7200)));
        assert_eq!(db.window_usage("u", "threads", 0).await.unwrap(), (0, None));

        assert_eq!(db.cleanup_rate_windows(7200).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_series_and_workspace_hooks() {
        let (db, _temp_dir) = setup_test_db().await;
        db.advance_series("s1", "p1", 10).await.unwrap();
        db.advance_series("s1", "p2", 20).await.unwrap();
        assert_eq!(db.series_index("s1").await.unwrap(), Some(2));

        db.record_workspace_signal("ws", "p1", &["twitter".to_string()], 10)
            .await
            .unwrap();
        assert_eq!(db.workspace_signal_count("ws").await.unwrap(), 1);
    }
}
