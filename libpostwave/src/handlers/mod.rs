//! Platform handlers
//!
//! A handler publishes one post to one platform. It owns format dispatch
//! (text, image, video, carousel, thread), the thread checkpoint, inline
//! token refresh, and rate-limit tracking. Handlers are created fresh for
//! every publish through the [`registry::HandlerRegistry`] and keep no state
//! between calls, so one post can be dispatched to several platforms at once.
//!
//! # Examples
//!
//! ```no_run
//! use libpostwave::config::Config;
//! use libpostwave::events::EventBus;
//! use libpostwave::handlers::registry::{default_registry, HandlerArgs, HandlerSettings};
//!
//! # async fn example(db: libpostwave::db::Database, post: libpostwave::types::Post) -> libpostwave::error::Result<()> {
//! let config = Config::load()?;
//! let key = config.encryption_key()?;
//! let registry = default_registry(&config);
//!
//! let args = HandlerArgs {
//!     user_id: post.user_id.clone(),
//!     events: EventBus::default(),
//!     settings: HandlerSettings::from_config(&config),
//! };
//! let handler = registry.create("twitter", args)?;
//! let result = handler.publish(&db, &post, &key).await?;
//! println!("{:?}", result.status);
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use chrono::Utc;
use std::time::Duration;

use crate::error::Result;
use crate::rate_limit::RateLimitInfo;
use crate::store::PublishStore;
use crate::types::{Platform, PlatformPublishResult, Post};
use crate::vault::EncryptionKey;

mod common;
pub mod linkedin;
pub mod registry;
pub mod threads;
pub mod tiktok;
pub mod twitter;

pub use linkedin::LinkedInHandler;
pub use registry::{default_registry, HandlerArgs, HandlerRegistry, HandlerSettings};
pub use threads::ThreadsHandler;
pub use tiktok::TikTokHandler;
pub use twitter::TwitterHandler;

#[async_trait]
pub trait PlatformPublisher: Send + Sync {
    fn platform(&self) -> Platform;

    /// Publish `post` to this platform.
    ///
    /// Expected outcomes (duplicate content, content the platform cannot
    /// take) come back as a result. Rate limits come back as
    /// `PlatformError::RateLimited` and unusable credentials as a
    /// credential error, so the orchestrator can treat them differently.
    /// Checkpoints, sub-status changes, and refreshed tokens are persisted
    /// before this returns either way.
    async fn publish(
        &self,
        store: &dyn PublishStore,
        post: &Post,
        key: &EncryptionKey,
    ) -> Result<PlatformPublishResult>;

    /// Read-only probe of the stored credentials. Not used on the publish path.
    async fn validate_credentials(&self, store: &dyn PublishStore, key: &EncryptionKey) -> Result<bool>;

    /// Quota state from the most recent API interaction; `None` before any call.
    fn rate_limit_info(&self) -> Option<RateLimitInfo>;

    fn is_rate_limited(&self) -> bool {
        self.rate_limit_info()
            .map(|info| info.is_exhausted(Utc::now()))
            .unwrap_or(false)
    }

    /// Time until the quota resets; zero when unknown or already reset.
    fn retry_after(&self) -> Duration {
        self.rate_limit_info()
            .map(|info| info.retry_after(Utc::now()))
            .unwrap_or(Duration::ZERO)
    }

    /// Fetch and persist new tokens.
    async fn refresh_credentials(&self, store: &dyn PublishStore, key: &EncryptionKey) -> Result<()>;
}
