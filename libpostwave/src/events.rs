//! Publish and credential events
//!
//! An in-process broadcast bus. The daemon logs every event; a notification
//! collaborator subscribes to [`Event::CredentialRefreshFailed`] to ask the
//! user to re-authorize. Emitting never blocks and never fails: with no
//! subscribers the event is dropped, and lagging subscribers lose the oldest
//! events first.
//!
//! ```
//! use libpostwave::events::{Event, EventBus};
//!
//! let bus = EventBus::new(100);
//! let mut receiver = bus.subscribe();
//! bus.emit(Event::PublishStarted {
//!     post_id: "abc".to_string(),
//!     platforms: vec!["twitter".to_string()],
//! });
//! ```

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::PlatformPublishResult;

pub type EventReceiver = broadcast::Receiver<Event>;

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus {
    /// `capacity` is the per-subscriber buffer before lagging events are dropped.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: Event) {
        // Err only means nobody is listening
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    PublishStarted {
        post_id: String,
        platforms: Vec<String>,
    },

    PlatformPublished {
        post_id: String,
        platform: String,
        external_post_id: Option<String>,
    },

    PlatformFailed {
        post_id: String,
        platform: String,
        error: String,
    },

    /// All targets settled and at least one succeeded
    PublishCompleted {
        post_id: String,
        partial: bool,
        results: Vec<PlatformPublishResult>,
    },

    /// The run was parked until `next_attempt_at` (rate limit or retry backoff)
    PublishSuspended {
        post_id: String,
        next_attempt_at: i64,
        reason: String,
    },

    PublishFailed {
        post_id: String,
        error: String,
    },

    CredentialRefreshed {
        user_id: String,
        platform: String,
        expires_at: Option<i64>,
    },

    /// The token cannot be refreshed; the user must re-authorize
    CredentialRefreshFailed {
        user_id: String,
        platform: String,
        reason: String,
        reauth_required: bool,
    },
}
