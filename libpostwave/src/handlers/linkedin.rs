//! LinkedIn handler
//!
//! Text, single-image, and multi-image posts authored by the member URN. A
//! thread has no LinkedIn equivalent and goes out as one post with the
//! segments separated by blank lines. Video is not supported.

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
use crate::types::{Platform, PlatformPublishResult, Post, PostFormat};
use crate::vault::EncryptionKey;

pub const MAX_IMAGES: usize = 20;

const SEGMENT_SEPARATOR: &str = "\n\n";

pub struct LinkedInHandler {
    core: HandlerCore,
}

impl LinkedInHandler {
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
impl PlatformPublisher for LinkedInHandler {
    fn platform(&self) -> Platform {
        Platform::LinkedIn
    }

    async fn publish(
        &self,
        store: &dyn PublishStore,
        post: &Post,
        key: &EncryptionKey,
    ) -> Result<PlatformPublishResult> {
        let format = post.format()?;
        if format == PostFormat::Video {
            return Ok(self.core.skipped("LinkedIn video posts are not supported"));
        }
        if post.media.len() > MAX_IMAGES {
            return Ok(self.core.failed(format!(
                "LinkedIn allows at most {} images per post, got {}",
                MAX_IMAGES,
                post.media.len()
            )));
        }

        let segments = vec![post.segments()?.join(SEGMENT_SEPARATOR)];
        info!("Publishing post {} to LinkedIn ({:?})", post.id, format);

        let credentials = self.core.credentials(store, key).await?;
        let author = self
            .core
            .account_id(store, key, &credentials)
            .await
            .map_err(|e| self.core.platform_error(e))?;
        let template = CreateRequest {
            account_id: Some(author),
            ..Default::default()
        };

        let ids = self
            .core
            .publish_segments(store, key, post, &credentials, &segments, template)
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
