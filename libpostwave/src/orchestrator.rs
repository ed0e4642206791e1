//! Publish orchestration
//!
//! One call publishes one post to all of its target platforms:
//!
//! 1. Gate: the post must exist, be approved if its workspace requires it,
//!    be `scheduled` or `retry`, and be due. Claiming it (`→ publishing`) is a
//!    conditional update, so two runs can never both get through.
//! 2. Dispatch: every target gets a fresh handler and runs concurrently under
//!    one deadline. A failing target never stops the others. Targets already
//!    recorded as published by an earlier run are not called again.
//! 3. Aggregate: the per-target results become one outcome, written to the
//!    post in a single store call.
//! 4. Hooks: best-effort side effects after a successful publish.
//!
//! Waiting for a rate-limit reset or a retry backoff is never a sleep here:
//! the post goes back to `retry` with `next_attempt_at` and the poller calls
//! again once it is due.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{ErrorClass, PlatformError, Result};
use crate::events::{Event, EventBus};
use crate::handlers::{HandlerArgs, HandlerRegistry, HandlerSettings};
use crate::hooks::{default_hooks, PublishHook};
use crate::retry::RetryPolicy;
use crate::store::{PostOutcomeWrite, PublishStore};
use crate::types::{PlatformPublishResult, PlatformStatusEntry, Post, PublishStatus, SubStatus};
use crate::vault::EncryptionKey;

/// What a publish call did.
#[derive(Debug, Clone, PartialEq)]
pub enum PublishOutcome {
    /// The gate stopped the run before any platform was called.
    Skipped { reason: String },
    Published {
        partial: bool,
        external_post_id: Option<String>,
        results: Vec<PlatformPublishResult>,
    },
    /// Parked until `next_attempt_at`.
    Suspended {
        next_attempt_at: i64,
        reason: String,
        results: Vec<PlatformPublishResult>,
    },
    Failed {
        reason: String,
        results: Vec<PlatformPublishResult>,
    },
}

/// One target's result plus what the orchestrator needs to classify it.
#[derive(Debug, Clone)]
pub(crate) struct TargetReport {
    pub result: PlatformPublishResult,
    /// `None` when the handler returned a result rather than an error
    pub class: Option<ErrorClass>,
    pub reset_at: Option<DateTime<Utc>>,
    /// A thread on this target stopped part way
    pub partial_thread: bool,
}

impl TargetReport {
    fn from_result(result: PlatformPublishResult) -> Self {
        Self {
            result,
            class: None,
            reset_at: None,
            partial_thread: false,
        }
    }

    fn is_transient(&self) -> bool {
        self.class == Some(ErrorClass::Transient)
    }
}

pub struct Orchestrator {
    store: Arc<dyn PublishStore>,
    registry: Arc<HandlerRegistry>,
    key: EncryptionKey,
    events: EventBus,
    hooks: Vec<Arc<dyn PublishHook>>,
    policy: RetryPolicy,
    operation_timeout: Duration,
    settings: HandlerSettings,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn PublishStore>, registry: Arc<HandlerRegistry>, key: EncryptionKey) -> Self {
        Self {
            store,
            registry,
            key,
            events: EventBus::default(),
            hooks: default_hooks(),
            policy: RetryPolicy::default(),
            operation_timeout: Duration::from_secs(600),
            settings: HandlerSettings::default(),
        }
    }

    /// Orchestrator with retry, timeout, and handler settings from `config`.
    pub fn from_config(
        store: Arc<dyn PublishStore>,
        registry: Arc<HandlerRegistry>,
        key: EncryptionKey,
        config: &Config,
    ) -> Self {
        Self::new(store, registry, key)
            .with_policy(RetryPolicy::from_config(&config.publishing))
            .with_timeout(config.publishing.operation_timeout)
            .with_settings(HandlerSettings::from_config(config))
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn with_hooks(mut self, hooks: Vec<Arc<dyn PublishHook>>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn with_settings(mut self, settings: HandlerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub async fn publish_post(&self, post_id: &str) -> Result<PublishOutcome> {
        self.publish_post_at(post_id, Utc::now()).await
    }

    /// Publish `post_id` as of `now`.
    ///
    /// Platform failures are part of the outcome. An `Err` means the store
    /// failed; a post left in `publishing` by one is returned to `retry` by
    /// the daemon's stale-run sweep.
    pub async fn publish_post_at(&self, post_id: &str, now: DateTime<Utc>) -> Result<PublishOutcome> {
        let now_ts = now.timestamp();

        let post = match self.store.get_post(post_id).await? {
            Some(post) => post,
            None => return Ok(skipped(post_id, "not found")),
        };

        if post.status.is_dispatchable() && !post.is_approved() {
            info!("Post {} is still awaiting approval, returning it to draft", post_id);
            self.store
                .downgrade_to_draft(post_id, "approval still pending at publish time", now_ts)
                .await?;
            return Ok(skipped(post_id, "unapproved"));
        }
        if !post.status.is_dispatchable() {
            return Ok(skipped(post_id, &format!("status is {}", post.status)));
        }
        if let Some(next) = post.next_attempt_at.filter(|next| *next > now_ts) {
            return Ok(skipped(post_id, &format!("not due until {}", next)));
        }
        if !self.store.claim_post(post_id, now_ts).await? {
            return Ok(skipped(post_id, "claimed by another run"));
        }

        let targets = post.targets();
        let attempts = post.attempt_count + 1;
        info!(
            "Publishing post {} to [{}] (attempt {})",
            post_id,
            targets.join(", "),
            attempts
        );
        self.events.emit(Event::PublishStarted {
            post_id: post_id.to_string(),
            platforms: targets.clone(),
        });

        let reports = self.dispatch(&post, &targets).await;
        let write = if targets.is_empty() {
            PostOutcomeWrite::Failed {
                fail_reason: "post has no target platforms".to_string(),
            }
        } else {
            aggregate(&reports, attempts, &self.policy, now)
        };

        let mut platform_status: BTreeMap<String, PlatformStatusEntry> = post.metadata.platform_status.clone();
        for report in reports.iter().filter(|r| !carried(&post, &r.result.platform)) {
            platform_status.insert(report.result.platform.clone(), report.result.to_status_entry(now_ts));
        }
        self.store
            .record_outcome(post_id, &write, &platform_status, now_ts)
            .await?;

        let results: Vec<PlatformPublishResult> = reports.into_iter().map(|r| r.result).collect();
        let outcome = self.finish(&post, write, results, now_ts).await;
        Ok(outcome)
    }

    /// Run every target that is not already published, concurrently.
    async fn dispatch(&self, post: &Post, targets: &[String]) -> Vec<TargetReport> {
        let deadline = tokio::time::Instant::now() + self.operation_timeout;

        let runs = targets.iter().map(|platform| async move {
            if carried(post, platform) {
                debug!("Post {} already published to {}, not calling it again", post.id, platform);
                let external_id = post
                    .metadata
                    .platform_status
                    .get(platform)
                    .and_then(|entry| entry.external_post_id.clone());
                return TargetReport::from_result(PlatformPublishResult {
                    platform: platform.clone(),
                    status: PublishStatus::Published,
                    external_post_id: external_id,
                    error: None,
                });
            }

            let run = tokio::time::timeout_at(deadline, self.publish_to(post, platform)).await;
            let result = match run {
                Ok(result) => result,
                Err(_) => Err(PlatformError::Timeout(format!(
                    "{} did not finish within {:?}",
                    platform, self.operation_timeout
                ))
                .into()),
            };

            match result {
                Ok(result) => {
                    if result.status == PublishStatus::Failed {
                        warn!(
                            "Post {} rejected by {}: {}",
                            post.id,
                            platform,
                            result.error.as_deref().unwrap_or("unknown error")
                        );
                    }
                    TargetReport::from_result(result)
                }
                Err(e) => {
                    warn!("Publishing post {} to {} failed: {}", post.id, platform, e);
                    let partial_thread = match self.store.load_thread_progress(&post.id, platform).await {
                        Ok(Some(progress)) => progress.posted > 0 && !progress.is_complete(),
                        _ => false,
                    };
                    TargetReport {
                        result: PlatformPublishResult::failed(platform.as_str(), e.to_string()),
                        class: Some(e.class()),
                        reset_at: e.rate_limit_reset(),
                        partial_thread,
                    }
                }
            }
        });

        join_all(runs).await
    }

    async fn publish_to(&self, post: &Post, platform: &str) -> Result<PlatformPublishResult> {
        let args = HandlerArgs {
            user_id: post.user_id.clone(),
            events: self.events.clone(),
            settings: self.settings,
        };
        let handler = self.registry.create(platform, args)?;
        handler.publish(self.store.as_ref(), post, &self.key).await
    }

    /// Emit events, run hooks, and build the outcome.
    async fn finish(
        &self,
        post: &Post,
        write: PostOutcomeWrite,
        results: Vec<PlatformPublishResult>,
        now: i64,
    ) -> PublishOutcome {
        for result in results.iter().filter(|r| !carried(post, &r.platform)) {
            match result.status {
                PublishStatus::Published => self.events.emit(Event::PlatformPublished {
                    post_id: post.id.clone(),
                    platform: result.platform.clone(),
                    external_post_id: result.external_post_id.clone(),
                }),
                PublishStatus::Failed => self.events.emit(Event::PlatformFailed {
                    post_id: post.id.clone(),
                    platform: result.platform.clone(),
                    error: result.error.clone().unwrap_or_default(),
                }),
                PublishStatus::Skipped => {}
            }
        }

        match write {
            PostOutcomeWrite::Published {
                external_post_id,
                sub_status,
            } => {
                let partial = sub_status == SubStatus::PartialFailure;
                info!(
                    "Post {} published{}",
                    post.id,
                    if partial { " with failures" } else { "" }
                );
                self.events.emit(Event::PublishCompleted {
                    post_id: post.id.clone(),
                    partial,
                    results: results.clone(),
                });
                self.run_hooks(post, &results, now).await;
                PublishOutcome::Published {
                    partial,
                    external_post_id,
                    results,
                }
            }
            PostOutcomeWrite::Retry {
                next_attempt_at,
                reason,
                ..
            } => {
                info!(
                    "Post {} suspended until {}: {}",
                    post.id, next_attempt_at, reason
                );
                self.events.emit(Event::PublishSuspended {
                    post_id: post.id.clone(),
                    next_attempt_at,
                    reason: reason.clone(),
                });
                PublishOutcome::Suspended {
                    next_attempt_at,
                    reason,
                    results,
                }
            }
            PostOutcomeWrite::Failed { fail_reason } => {
                warn!("Post {} failed: {}", post.id, fail_reason);
                self.events.emit(Event::PublishFailed {
                    post_id: post.id.clone(),
                    error: fail_reason.clone(),
                });
                PublishOutcome::Failed {
                    reason: fail_reason,
                    results,
                }
            }
        }
    }

    async fn run_hooks(&self, post: &Post, results: &[PlatformPublishResult], now: i64) {
        for hook in &self.hooks {
            if let Err(e) = hook.after_publish(self.store.as_ref(), post, results, now).await {
                warn!("Post-publish hook {} failed for post {}: {}", hook.name(), post.id, e);
            }
        }
    }
}

fn skipped(post_id: &str, reason: &str) -> PublishOutcome {
    info!("Skipping post {}: {}", post_id, reason);
    PublishOutcome::Skipped {
        reason: reason.to_string(),
    }
}

/// Whether an earlier run already published `post` to `platform`.
fn carried(post: &Post, platform: &str) -> bool {
    post.metadata
        .platform_status
        .get(platform)
        .is_some_and(|entry| entry.status == PublishStatus::Published)
}

/// `platform: error; platform: error` over the failed targets.
fn consolidated_errors(reports: &[TargetReport]) -> String {
    reports
        .iter()
        .filter(|r| r.result.status == PublishStatus::Failed)
        .map(|r| {
            format!(
                "{}: {}",
                r.result.platform,
                r.result.error.as_deref().unwrap_or("unknown error")
            )
        })
        .collect::<Vec<_>>()
        .join("; ")
}

/// Fold per-target reports into the single write for this run.
///
/// `attempts` counts this run.
pub(crate) fn aggregate(
    reports: &[TargetReport],
    attempts: u32,
    policy: &RetryPolicy,
    now: DateTime<Utc>,
) -> PostOutcomeWrite {
    let first_published = reports
        .iter()
        .find(|r| r.result.status == PublishStatus::Published)
        .and_then(|r| r.result.external_post_id.clone());
    let any_published = reports
        .iter()
        .any(|r| r.result.status == PublishStatus::Published);
    let any_failed = reports
        .iter()
        .any(|r| r.result.status == PublishStatus::Failed);
    let latest_reset = reports.iter().filter_map(|r| r.reset_at).max();

    if let Some(reset_at) = latest_reset {
        return PostOutcomeWrite::Retry {
            next_attempt_at: reset_at.timestamp().max(now.timestamp()),
            sub_status: SubStatus::RateLimited,
            reason: consolidated_errors(reports),
            external_post_id: first_published,
        };
    }

    if !any_failed {
        return PostOutcomeWrite::Published {
            external_post_id: first_published,
            sub_status: SubStatus::None,
        };
    }

    if any_published {
        return PostOutcomeWrite::Published {
            external_post_id: first_published,
            sub_status: SubStatus::PartialFailure,
        };
    }

    if reports.iter().any(TargetReport::is_transient) && policy.allows_another(attempts) {
        let delay = chrono::Duration::from_std(policy.next_delay(attempts))
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let sub_status = if reports.iter().any(|r| r.partial_thread) {
            SubStatus::ThreadPartial
        } else {
            SubStatus::None
        };
        return PostOutcomeWrite::Retry {
            next_attempt_at: (now + delay).timestamp(),
            sub_status,
            reason: consolidated_errors(reports),
            external_post_id: None,
        };
    }

    PostOutcomeWrite::Failed {
        fail_reason: consolidated_errors(reports),
    }
}
