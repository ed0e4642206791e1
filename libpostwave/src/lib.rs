//! Postwave - scheduled multi-platform publishing
//!
//! This library holds the publishing core behind the `postwave-send` daemon:
//! the post store, per-platform handlers and API clients, the orchestrator
//! that fans a post out to its targets, and the sweeper that keeps OAuth
//! tokens fresh.
//!
//! Publishing is resumable. Thread progress is checkpointed after every
//! confirmed segment, and a post is claimed atomically before any platform
//! call, so a crash or a second daemon never double-posts.

pub mod checkpoint;
pub mod clients;
pub mod config;
pub mod credentials;
pub mod db;
pub mod error;
pub mod events;
pub mod handlers;
pub mod hooks;
pub mod logging;
pub mod orchestrator;
pub mod rate_limit;
pub mod retry;
pub mod store;
pub mod sweeper;
pub mod types;
pub mod vault;

// Re-export commonly used types
pub use config::Config;
pub use credentials::{CredentialManager, Credentials, RotationPolicy};
pub use db::Database;
pub use error::{ErrorClass, PostwaveError, Result};
pub use events::{Event, EventBus};
pub use handlers::{default_registry, HandlerArgs, HandlerRegistry, PlatformPublisher};
pub use orchestrator::{Orchestrator, PublishOutcome};
pub use store::PublishStore;
pub use sweeper::{CredentialSweeper, SweepReport};
pub use types::{Platform, PlatformPublishResult, Post, PostStatus, PublishStatus, SubStatus};
pub use vault::EncryptionKey;
