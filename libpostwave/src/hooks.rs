//! Post-publish side effects
//!
//! Hooks run after a post reaches `published`. They are best effort: the
//! orchestrator logs a failing hook and moves on, and the publish itself is
//! never rolled back.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use crate::error::Result;
use crate::store::PublishStore;
use crate::types::{PlatformPublishResult, Post, PublishStatus};

#[async_trait]
pub trait PublishHook: Send + Sync {
    fn name(&self) -> &'static str;

    async fn after_publish(
        &self,
        store: &dyn PublishStore,
        post: &Post,
        results: &[PlatformPublishResult],
        now: i64,
    ) -> Result<()>;
}

/// Moves a series cursor past the post that just went out.
pub struct SeriesAdvanceHook;

#[async_trait]
impl PublishHook for SeriesAdvanceHook {
    fn name(&self) -> &'static str {
        "series_advance"
    }

    async fn after_publish(
        &self,
        store: &dyn PublishStore,
        post: &Post,
        _results: &[PlatformPublishResult],
        now: i64,
    ) -> Result<()> {
        if let Some(series_id) = &post.series_id {
            debug!("Advancing series {} past post {}", series_id, post.id);
            store.advance_series(series_id, &post.id, now).await?;
        }
        Ok(())
    }
}

/// Records which platforms a workspace post reached, for the shared
/// workspace's preference model.
pub struct WorkspaceSignalHook;

#[async_trait]
impl PublishHook for WorkspaceSignalHook {
    fn name(&self) -> &'static str {
        "workspace_signal"
    }

    async fn after_publish(
        &self,
        store: &dyn PublishStore,
        post: &Post,
        results: &[PlatformPublishResult],
        now: i64,
    ) -> Result<()> {
        let workspace_id = match &post.workspace_id {
            Some(id) => id,
            None => return Ok(()),
        };
        let platforms: Vec<String> = results
            .iter()
            .filter(|r| r.status == PublishStatus::Published)
            .map(|r| r.platform.clone())
            .collect();
        if platforms.is_empty() {
            return Ok(());
        }
        store
            .record_workspace_signal(workspace_id, &post.id, &platforms, now)
            .await
    }
}

pub fn default_hooks() -> Vec<Arc<dyn PublishHook>> {
    vec![Arc::new(SeriesAdvanceHook), Arc::new(WorkspaceSignalHook)]
}
