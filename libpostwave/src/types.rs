//! Core types for Postwave

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{PostwaveError, Result};

/// External platforms a post can be published to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Twitter,
    LinkedIn,
    Threads,
    TikTok,
}

impl Platform {
    pub const ALL: [Platform; 4] = [
        Platform::Twitter,
        Platform::LinkedIn,
        Platform::Threads,
        Platform::TikTok,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Twitter => "twitter",
            Platform::LinkedIn => "linkedin",
            Platform::Threads => "threads",
            Platform::TikTok => "tiktok",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = PostwaveError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "twitter" | "x" => Ok(Platform::Twitter),
            "linkedin" => Ok(Platform::LinkedIn),
            "threads" => Ok(Platform::Threads),
            "tiktok" => Ok(Platform::TikTok),
            other => Err(PostwaveError::InvalidInput(format!(
                "Unknown platform '{}'. Valid options: twitter, linkedin, threads, tiktok",
                other
            ))),
        }
    }
}

/// Lifecycle status of a post. Only the orchestrator moves a post between these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostStatus {
    Draft,
    Scheduled,
    Retry,
    Publishing,
    Published,
    Failed,
}

impl PostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostStatus::Draft => "draft",
            PostStatus::Scheduled => "scheduled",
            PostStatus::Retry => "retry",
            PostStatus::Publishing => "publishing",
            PostStatus::Published => "published",
            PostStatus::Failed => "failed",
        }
    }

    /// Whether a publish run may start from this status.
    pub fn is_dispatchable(&self) -> bool {
        matches!(self, PostStatus::Scheduled | PostStatus::Retry)
    }
}

impl fmt::Display for PostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PostStatus {
    type Err = PostwaveError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "draft" => Ok(PostStatus::Draft),
            "scheduled" => Ok(PostStatus::Scheduled),
            "retry" => Ok(PostStatus::Retry),
            "publishing" => Ok(PostStatus::Publishing),
            "published" => Ok(PostStatus::Published),
            "failed" => Ok(PostStatus::Failed),
            other => Err(PostwaveError::InvalidInput(format!(
                "Unknown post status '{}'",
                other
            ))),
        }
    }
}

/// Intra-operation visibility while a post is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubStatus {
    #[default]
    None,
    MediaUploading,
    MediaUploaded,
    ThreadPartial,
    RateLimited,
    PartialFailure,
}

impl SubStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubStatus::None => "none",
            SubStatus::MediaUploading => "media_uploading",
            SubStatus::MediaUploaded => "media_uploaded",
            SubStatus::ThreadPartial => "thread_partial",
            SubStatus::RateLimited => "rate_limited",
            SubStatus::PartialFailure => "partial_failure",
        }
    }
}

impl fmt::Display for SubStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubStatus {
    type Err = PostwaveError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" | "" => Ok(SubStatus::None),
            "media_uploading" => Ok(SubStatus::MediaUploading),
            "media_uploaded" => Ok(SubStatus::MediaUploaded),
            "thread_partial" => Ok(SubStatus::ThreadPartial),
            "rate_limited" => Ok(SubStatus::RateLimited),
            "partial_failure" => Ok(SubStatus::PartialFailure),
            other => Err(PostwaveError::InvalidInput(format!(
                "Unknown sub-status '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
        }
    }
}

impl FromStr for ApprovalStatus {
    type Err = PostwaveError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(ApprovalStatus::Pending),
            "approved" => Ok(ApprovalStatus::Approved),
            "rejected" => Ok(ApprovalStatus::Rejected),
            other => Err(PostwaveError::InvalidInput(format!(
                "Unknown approval status '{}'",
                other
            ))),
        }
    }
}

// ============================================================================
// Media
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

/// A reference to media hosted elsewhere (usually object storage).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaRef {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<MediaKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt_text: Option<String>,
}

impl MediaRef {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            kind: None,
            mime_type: None,
            alt_text: None,
        }
    }

    /// Explicit kind if set, otherwise inferred from the MIME type or URL extension.
    pub fn kind(&self) -> MediaKind {
        if let Some(kind) = self.kind {
            return kind;
        }
        if self.mime().starts_with("video/") {
            MediaKind::Video
        } else {
            MediaKind::Image
        }
    }

    pub fn mime(&self) -> &str {
        if let Some(mime) = self.mime_type.as_deref() {
            return mime;
        }
        let path = self.url.split(['?', '#']).next().unwrap_or_default();
        let ext = path.rsplit('.').next().unwrap_or_default().to_lowercase();
        match ext.as_str() {
            "jpg" | "jpeg" => "image/jpeg",
            "png" => "image/png",
            "gif" => "image/gif",
            "webp" => "image/webp",
            "mp4" => "video/mp4",
            "mov" => "video/quicktime",
            "webm" => "video/webm",
            _ => "application/octet-stream",
        }
    }
}

// ============================================================================
// Posts
// ============================================================================

/// Content format a handler dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostFormat {
    Text,
    Image,
    Video,
    Carousel,
    Thread,
}

/// Per-platform outcome as recorded in `metadata.platformStatus`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformStatusEntry {
    pub status: PublishStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_post_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub updated_at: i64,
}

/// Post metadata. Unknown keys written by other collaborators are preserved.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostMetadata {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub platform_status: BTreeMap<String, PlatformStatusEntry>,
    /// Raw checkpoints keyed by platform; parse through `checkpoint::ThreadProgress`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub thread_progress: BTreeMap<String, serde_json::Value>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    pub user_id: String,
    /// Single-platform legacy target.
    pub platform: Option<String>,
    /// Multi-target mode. Takes precedence over `platform` when non-empty.
    pub platforms: Vec<String>,
    /// Plain text, or a JSON-encoded array of thread segments.
    pub content: String,
    pub media: Vec<MediaRef>,
    pub status: PostStatus,
    pub sub_status: SubStatus,
    pub workspace_id: Option<String>,
    pub requires_approval: bool,
    pub approval_status: Option<ApprovalStatus>,
    pub series_id: Option<String>,
    pub metadata: PostMetadata,
    pub external_post_id: Option<String>,
    pub fail_reason: Option<String>,
    pub scheduled_at: Option<i64>,
    pub next_attempt_at: Option<i64>,
    pub attempt_count: u32,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Post {
    pub fn new(user_id: impl Into<String>, content: impl Into<String>) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            platform: None,
            platforms: Vec::new(),
            content: content.into(),
            media: Vec::new(),
            status: PostStatus::Scheduled,
            sub_status: SubStatus::None,
            workspace_id: None,
            requires_approval: false,
            approval_status: None,
            series_id: None,
            metadata: PostMetadata::default(),
            external_post_id: None,
            fail_reason: None,
            scheduled_at: Some(now),
            next_attempt_at: None,
            attempt_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Target platform identifiers, de-duplicated in declaration order.
    /// Known platforms are named canonically (`x` becomes `twitter`); unknown
    /// names are kept so the run reports them as unregistered.
    pub fn targets(&self) -> Vec<String> {
        let source: Vec<&String> = if self.platforms.is_empty() {
            self.platform.iter().collect()
        } else {
            self.platforms.iter().collect()
        };

        let mut targets: Vec<String> = Vec::with_capacity(source.len());
        for name in source {
            let name = match Platform::from_str(name) {
                Ok(platform) => platform.as_str().to_string(),
                Err(_) => name.trim().to_lowercase(),
            };
            if !name.is_empty() && !targets.contains(&name) {
                targets.push(name);
            }
        }
        targets
    }

    /// Content split into segments. A JSON array of strings is a thread;
    /// anything else is a single segment.
    pub fn segments(&self) -> Result<Vec<String>> {
        let trimmed = self.content.trim();
        if trimmed.starts_with('[') {
            if let Ok(segments) = serde_json::from_str::<Vec<String>>(trimmed) {
                if segments.is_empty() {
                    return Err(PostwaveError::InvalidInput(
                        "Thread content has no segments".to_string(),
                    ));
                }
                if segments.iter().any(|s| s.trim().is_empty()) {
                    return Err(PostwaveError::InvalidInput(
                        "Thread content has an empty segment".to_string(),
                    ));
                }
                return Ok(segments);
            }
        }
        if trimmed.is_empty() && self.media.is_empty() {
            return Err(PostwaveError::InvalidInput(
                "Post has neither content nor media".to_string(),
            ));
        }
        Ok(vec![self.content.clone()])
    }

    pub fn format(&self) -> Result<PostFormat> {
        if self.segments()?.len() > 1 {
            return Ok(PostFormat::Thread);
        }
        Ok(match self.media.as_slice() {
            [] => PostFormat::Text,
            [single] if single.kind() == MediaKind::Video => PostFormat::Video,
            [_] => PostFormat::Image,
            many if many.iter().any(|m| m.kind() == MediaKind::Video) => PostFormat::Video,
            _ => PostFormat::Carousel,
        })
    }

    /// Whether the approval gate lets this post through.
    pub fn is_approved(&self) -> bool {
        if self.workspace_id.is_none() || !self.requires_approval {
            return true;
        }
        self.approval_status == Some(ApprovalStatus::Approved)
    }
}

// ============================================================================
// Publish results
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishStatus {
    Published,
    Failed,
    Skipped,
}

/// Outcome of one platform for one orchestration attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformPublishResult {
    pub platform: String,
    pub status: PublishStatus,
    pub external_post_id: Option<String>,
    pub error: Option<String>,
}

impl PlatformPublishResult {
    pub fn published(platform: impl Into<String>, external_post_id: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            status: PublishStatus::Published,
            external_post_id: Some(external_post_id.into()),
            error: None,
        }
    }

    pub fn failed(platform: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            status: PublishStatus::Failed,
            external_post_id: None,
            error: Some(error.into()),
        }
    }

    pub fn skipped(platform: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            status: PublishStatus::Skipped,
            external_post_id: None,
            error: Some(reason.into()),
        }
    }

    pub fn to_status_entry(&self, now: i64) -> PlatformStatusEntry {
        PlatformStatusEntry {
            status: self.status,
            external_post_id: self.external_post_id.clone(),
            error: self.error.clone(),
            updated_at: now,
        }
    }
}
