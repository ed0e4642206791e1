//! Credential sweeper
//!
//! Refreshes tokens shortly before they expire so scheduled publishes rarely
//! need an inline refresh. Each platform has its own lookahead, sized to how
//! long its tokens live. Rows are claimed with a lease that skips rows other
//! sweeps already hold, so several sweepers can run side by side.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::{Config, SweeperConfig};
use crate::credentials::RotationPolicy;
use crate::error::Result;
use crate::events::{Event, EventBus};
use crate::handlers::{HandlerArgs, HandlerRegistry, HandlerSettings};
use crate::store::{PublishStore, StoredToken};
use crate::types::Platform;
use crate::vault::EncryptionKey;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub refreshed: usize,
    pub failed: usize,
    /// Tokens that cannot be refreshed without the user
    pub skipped: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.refreshed + self.failed + self.skipped
    }
}

pub struct CredentialSweeper {
    store: Arc<dyn PublishStore>,
    registry: Arc<HandlerRegistry>,
    key: EncryptionKey,
    events: EventBus,
    config: SweeperConfig,
    settings: HandlerSettings,
    platforms: Vec<(Platform, Duration)>,
}

impl CredentialSweeper {
    pub fn new(
        store: Arc<dyn PublishStore>,
        registry: Arc<HandlerRegistry>,
        key: EncryptionKey,
        config: SweeperConfig,
    ) -> Self {
        let settings = HandlerSettings {
            lock_lease: config.lock_lease,
            ..HandlerSettings::default()
        };
        Self {
            store,
            registry,
            key,
            events: EventBus::default(),
            config,
            settings,
            platforms: Vec::new(),
        }
    }

    /// Sweeper over every platform that has a config section and a handler.
    pub fn from_config(
        store: Arc<dyn PublishStore>,
        registry: Arc<HandlerRegistry>,
        key: EncryptionKey,
        config: &Config,
    ) -> Self {
        let mut sweeper = Self::new(store, registry, key, config.sweeper.clone());
        sweeper.settings = HandlerSettings::from_config(config);
        for platform in Platform::ALL {
            if let Some(section) = config.platform(platform) {
                if sweeper.registry.has(platform.as_str()) {
                    sweeper = sweeper.with_platform(platform, section.lookahead(platform));
                }
            }
        }
        sweeper
    }

    /// Sweep `platform`, refreshing tokens that expire within `lookahead`.
    pub fn with_platform(mut self, platform: Platform, lookahead: Duration) -> Self {
        self.platforms.retain(|(p, _)| *p != platform);
        self.platforms.push((platform, lookahead));
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        let lease = chrono::Duration::from_std(self.config.lock_lease)
            .unwrap_or_else(|_| chrono::Duration::seconds(120));

        for (platform, lookahead) in &self.platforms {
            let lookahead = chrono::Duration::from_std(*lookahead)
                .unwrap_or_else(|_| chrono::Duration::hours(1));
            let tokens = self
                .store
                .claim_expiring_tokens(
                    platform.as_str(),
                    (now + lookahead).timestamp(),
                    now.timestamp(),
                    (now + lease).timestamp(),
                    self.config.batch_size,
                )
                .await?;
            if tokens.is_empty() {
                continue;
            }
            debug!("Sweeping {} expiring {} token(s)", tokens.len(), platform);

            for token in tokens {
                // The refresh takes its own lease on the row
                self.store.unlock_token(token.id).await?;

                if RotationPolicy::for_platform(*platform).needs_refresh_token()
                    && token.refresh_token.is_none()
                {
                    self.flag_unrefreshable(&token, *platform, now).await;
                    report.skipped += 1;
                    continue;
                }

                match self.refresh(&token, *platform).await {
                    Ok(()) => report.refreshed += 1,
                    Err(e) => {
                        warn!(
                            "Sweep could not refresh {} token for user {}: {}",
                            platform, token.user_id, e
                        );
                        report.failed += 1;
                    }
                }
            }
        }

        if report.total() > 0 {
            info!(
                "Credential sweep: {} refreshed, {} failed, {} need re-authorization",
                report.refreshed, report.failed, report.skipped
            );
        }
        Ok(report)
    }

    async fn refresh(&self, token: &StoredToken, platform: Platform) -> Result<()> {
        let args = HandlerArgs {
            user_id: token.user_id.clone(),
            events: self.events.clone(),
            settings: self.settings,
        };
        let handler = self.registry.create(platform.as_str(), args)?;
        handler
            .refresh_credentials(self.store.as_ref(), &self.key)
            .await
    }

    async fn flag_unrefreshable(&self, token: &StoredToken, platform: Platform, now: DateTime<Utc>) {
        let reason = "no refresh token stored";
        warn!(
            "{} token for user {} expires soon and has no refresh token",
            platform, token.user_id
        );
        if let Err(e) = self
            .store
            .annotate_refresh_failure(token.id, reason, true, now.timestamp())
            .await
        {
            warn!("Failed to annotate token {}: {}", token.id, e);
        }
        self.events.emit(Event::CredentialRefreshFailed {
            user_id: token.user_id.clone(),
            platform: platform.to_string(),
            reason: reason.to_string(),
            reauth_required: true,
        });
    }

    /// Sweep every `interval` until `shutdown` is set.
    pub async fn run(&self, shutdown: Arc<AtomicBool>) {
        info!(
            "Credential sweeper started (interval {:?}, {} platform(s))",
            self.config.interval,
            self.platforms.len()
        );
        loop {
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            if let Err(e) = self.run_once(Utc::now()).await {
                error!("Credential sweep failed: {}", e);
            }

            // Check shutdown every second
            let mut slept = Duration::ZERO;
            while slept < self.config.interval {
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                let step = Duration::from_secs(1).min(self.config.interval - slept);
                tokio::time::sleep(step).await;
                slept += step;
            }
        }
        info!("Credential sweeper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{MockClient, PlatformClient};
    use crate::credentials::seal_new_token;
    use crate::db::Database;
    use crate::handlers::registry::build_handler;
    use tempfile::TempDir;

    fn test_key() -> EncryptionKey {
        EncryptionKey::from_hex(&"42".repeat(32)).unwrap()
    }

    async fn setup() -> (Arc<Database>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let db = Database::new(db_path.to_str().unwrap()).await.unwrap();
        (Arc::new(db), temp_dir)
    }

    fn registry(client: &MockClient) -> Arc<HandlerRegistry> {
        let mut registry = HandlerRegistry::new();
        let platform = client.platform();
        let client = client.clone();
        registry.register(platform, move |args| {
            Ok(build_handler(platform, Arc::new(client.clone()), args, None))
        });
        Arc::new(registry)
    }

    async fn store_token(db: &Database, user: &str, platform: Platform, refresh: Option<&str>, expires_at: i64) {
        let token = seal_new_token(&test_key(), user, platform, "old-access", refresh, Some(expires_at)).unwrap();
        db.upsert_token(&token).await.unwrap();
    }

    fn sweeper(db: &Arc<Database>, client: &MockClient) -> CredentialSweeper {
        CredentialSweeper::new(db.clone(), registry(client), test_key(), SweeperConfig::default())
            .with_platform(client.platform(), Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn test_refreshes_tokens_inside_lookahead() {
        let (db, _dir) = setup().await;
        let now = Utc::now();
        store_token(&db, "soon", Platform::Twitter, Some("rt-soon"), now.timestamp() + 600).await;
        store_token(&db, "later", Platform::Twitter, Some("rt-later"), now.timestamp() + 86_400).await;

        let client = MockClient::new(Platform::Twitter)
            .with_refresh_token("rt-soon")
            .with_refresh_token("rt-later");
        let report = sweeper(&db, &client).run_once(now).await.unwrap();

        assert_eq!(report.refreshed, 1);
        assert_eq!(report.total(), 1);
        assert_eq!(client.refresh_calls(), 1);

        let renewed = db.get_token("soon", "twitter").await.unwrap().unwrap();
        assert!(renewed.expires_at.unwrap() > now.timestamp() + 600);
        assert!(renewed.refresh_locked_until.is_none());
        let untouched = db.get_token("later", "twitter").await.unwrap().unwrap();
        assert_eq!(untouched.expires_at, Some(now.timestamp() + 86_400));
    }

    #[tokio::test]
    async fn test_missing_refresh_token_flags_reauth() {
        let (db, _dir) = setup().await;
        let now = Utc::now();
        store_token(&db, "user-1", Platform::Twitter, None, now.timestamp() + 60).await;

        let client = MockClient::new(Platform::Twitter);
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let report = sweeper(&db, &client)
            .with_events(events)
            .run_once(now)
            .await
            .unwrap();

        assert_eq!(report.skipped, 1);
        assert_eq!(client.refresh_calls(), 0);
        let token = db.get_token("user-1", "twitter").await.unwrap().unwrap();
        assert!(token.needs_reauthorization());
        assert!(matches!(
            rx.try_recv().unwrap(),
            Event::CredentialRefreshFailed { reauth_required: true, .. }
        ));

        // Flagged rows are not claimed again
        let report = sweeper(&db, &client).run_once(now).await.unwrap();
        assert_eq!(report.total(), 0);
    }

    #[tokio::test]
    async fn test_rejected_refresh_counts_as_failed() {
        let (db, _dir) = setup().await;
        let now = Utc::now();
        store_token(&db, "user-1", Platform::LinkedIn, Some("rt-revoked"), now.timestamp() + 60).await;

        let client = MockClient::new(Platform::LinkedIn);
        let report = sweeper(&db, &client).run_once(now).await.unwrap();

        assert_eq!(report.failed, 1);
        let token = db.get_token("user-1", "linkedin").await.unwrap().unwrap();
        assert!(token.refresh_locked_until.is_none());
    }

    #[tokio::test]
    async fn test_leased_rows_are_skipped() {
        let (db, _dir) = setup().await;
        let now = Utc::now();
        store_token(&db, "user-1", Platform::Twitter, Some("rt-0"), now.timestamp() + 60).await;
        let token = db.get_token("user-1", "twitter").await.unwrap().unwrap();
        assert!(db
            .try_lock_token(token.id, now.timestamp(), now.timestamp() + 300)
            .await
            .unwrap());

        let client = MockClient::new(Platform::Twitter).with_refresh_token("rt-0");
        let report = sweeper(&db, &client).run_once(now).await.unwrap();

        assert_eq!(report.total(), 0);
        assert_eq!(client.refresh_calls(), 0);
    }
}
