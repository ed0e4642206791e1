//! X (Twitter) handler
//!
//! Takes every format. Threads are posted as a reply chain with media on the
//! first tweet. Quota comes from `x-rate-limit-*` headers.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use super::common::HandlerCore;
use super::registry::HandlerArgs;
use super::PlatformPublisher;
use crate::clients::{CreateRequest, PlatformClient};
use crate::error::Result;
use crate::rate_limit::{RateLimitInfo, WindowLimit};
use crate::store::PublishStore;
use crate::types::{MediaKind, Platform, PlatformPublishResult, Post};
use crate::vault::EncryptionKey;

pub const MAX_IMAGES: usize = 4;

pub struct TwitterHandler {
    core: HandlerCore,
}

impl TwitterHandler {
    pub fn new(client: Arc<dyn PlatformClient>, args: HandlerArgs) -> Self {
        Self {
            core: HandlerCore::new(client, args).activity_by_account(),
        }
    }

    pub fn with_window(mut self, limit: Option<WindowLimit>) -> Self {
        self.core = self.core.with_window(limit);
        self
    }
}

/// Up to four images, or one video on its own.
fn check_media(post: &Post) -> std::result::Result<(), String> {
    let videos = post
        .media
        .iter()
        .filter(|m| m.kind() == MediaKind::Video)
        .count();
    match (videos, post.media.len()) {
        (0, n) if n <= MAX_IMAGES => Ok(()),
        (0, n) => Err(format!(
            "X allows at most {} images per post, got {}",
            MAX_IMAGES, n
        )),
        (1, 1) => Ok(()),
        _ => Err("X allows a single video with no other media".to_string()),
    }
}

#[async_trait]
impl PlatformPublisher for TwitterHandler {
    fn platform(&self) -> Platform {
        Platform::Twitter
    }

    async fn publish(
        &self,
        store: &dyn PublishStore,
        post: &Post,
        key: &EncryptionKey,
    ) -> Result<PlatformPublishResult> {
        let segments = post.segments()?;
        if let Err(reason) = check_media(post) {
            return Ok(self.core.failed(reason));
        }

        info!(
            "Publishing post {} to X ({:?}, {} segment(s))",
            post.id,
            post.format()?,
            segments.len()
        );
        let credentials = self.core.credentials(store, key).await?;
        let ids = self
            .core
            .publish_segments(store, key, post, &credentials, &segments, CreateRequest::default())
            .await?;
        Ok(self.core.published(ids))
    }

    async fn validate_credentials(&self, store: &dyn PublishStore, key: &EncryptionKey) -> Result<bool> {
        self.core.validate(store, key).await
    }

    fn rate_limit_info(&self) -> Option<RateLimitInfo> {
        self.core.rate_limit_info()
    }

    async fn refresh_credentials(&self, store: &dyn PublishStore, key: &EncryptionKey) -> Result<()> {
        self.core.refresh(store, key).await
    }
}
