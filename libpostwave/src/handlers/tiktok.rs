//! TikTok handler
//!
//! Video and photo posts only; text and threads are skipped. Posts are public
//! once the app has passed TikTok's audit, private (`SELF_ONLY`) before that.
//! The audit state is read from the token's `auditStatus` metadata.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use super::common::HandlerCore;
use super::registry::HandlerArgs;
use super::PlatformPublisher;
use crate::clients::tiktok::{PRIVACY_PUBLIC, PRIVACY_SELF_ONLY};
use crate::clients::{CreateRequest, PlatformClient};
use crate::credentials::Credentials;
use crate::error::Result;
use crate::rate_limit::{RateLimitInfo, WindowLimit};
use crate::store::PublishStore;
use crate::types::{MediaKind, Platform, PlatformPublishResult, Post, PostFormat};
use crate::vault::EncryptionKey;

pub const MAX_PHOTOS: usize = 35;

pub const META_AUDIT_STATUS: &str = "auditStatus";

pub struct TikTokHandler {
    core: HandlerCore,
}

impl TikTokHandler {
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

fn privacy_level(credentials: &Credentials) -> &'static str {
    match credentials.metadata_str(META_AUDIT_STATUS) {
        Some("approved") => PRIVACY_PUBLIC,
        _ => PRIVACY_SELF_ONLY,
    }
}

fn check_media(post: &Post) -> std::result::Result<(), String> {
    let videos = post
        .media
        .iter()
        .filter(|m| m.kind() == MediaKind::Video)
        .count();
    match (videos, post.media.len()) {
        (1, 1) => Ok(()),
        (0, n) if n <= MAX_PHOTOS => Ok(()),
        (0, n) => Err(format!(
            "TikTok photo posts hold at most {} photos, got {}",
            MAX_PHOTOS, n
        )),
        _ => Err("TikTok posts take one video or photos, not both".to_string()),
    }
}

#[async_trait]
impl PlatformPublisher for TikTokHandler {
    fn platform(&self) -> Platform {
        Platform::TikTok
    }

    async fn publish(
        &self,
        store: &dyn PublishStore,
        post: &Post,
        key: &EncryptionKey,
    ) -> Result<PlatformPublishResult> {
        let format = post.format()?;
        if matches!(format, PostFormat::Text | PostFormat::Thread) {
            return Ok(self
                .core
                .skipped("TikTok needs a video or photos; text posts are not supported"));
        }
        if let Err(reason) = check_media(post) {
            return Ok(self.core.failed(reason));
        }

        let credentials = self.core.credentials(store, key).await?;
        let privacy = privacy_level(&credentials);
        info!(
            "Publishing post {} to TikTok ({:?}, privacy {})",
            post.id, format, privacy
        );

        let template = CreateRequest {
            privacy_level: Some(privacy.to_string()),
            ..Default::default()
        };
        let ids = self
            .core
            .publish_segments(store, key, post, &credentials, &post.segments()?, template)
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
