//! Threads handler
//!
//! Text, image, video, and carousels of up to 20 items. Multi-segment posts
//! use the native reply chain.

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
use crate::types::{Platform, PlatformPublishResult, Post};
use crate::vault::EncryptionKey;

pub const MAX_CAROUSEL_ITEMS: usize = 20;

pub struct ThreadsHandler {
    core: HandlerCore,
}

impl ThreadsHandler {
    pub fn new(client: Arc<dyn PlatformClient>, args: HandlerArgs) -> Self {
        Self {
            core: HandlerCore::new(client, args),
        }
    }

    pub fn with_window(mut self, limit: Option<WindowLimit>) -> Self {
        self.core = self.core.with_window(limit);
        self
    }
}

#[async_trait]
impl PlatformPublisher for ThreadsHandler {
    fn platform(&self) -> Platform {
        Platform::Threads
    }

    async fn publish(
        &self,
        store: &dyn PublishStore,
        post: &Post,
        key: &EncryptionKey,
    ) -> Result<PlatformPublishResult> {
        let segments = post.segments()?;
        if post.media.len() > MAX_CAROUSEL_ITEMS {
            return Ok(self.core.failed(format!(
                "Threads carousels hold at most {} items, got {}",
                MAX_CAROUSEL_ITEMS,
                post.media.len()
            )));
        }

        info!(
            "Publishing post {} to Threads ({:?}, {} segment(s))",
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
