//! OAuth credential lifecycle
//!
//! Loads a user's token for one platform, decrypts it, and refreshes it when
//! it has expired. The same refresh routine serves the inline path (a handler
//! about to publish) and the sweeper, so both apply the platform's rotation
//! rule identically:
//!
//! | Platform | Rotation                                   |
//! |----------|--------------------------------------------|
//! | X        | refresh token is single-use                |
//! | LinkedIn | refresh token is reusable                  |
//! | Threads  | no refresh token; re-issue from the access token |
//! | TikTok   | refresh token rotates on every use         |
//!
//! A failed refresh never deletes the row. It is annotated with the failure,
//! and when the user has to re-authorize a
//! [`Event::CredentialRefreshFailed`] is emitted.

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::clients::{PlatformClient, RefreshGrant};
use crate::error::{CredentialError, Result};
use crate::events::{Event, EventBus};
use crate::store::{
    NewToken, PublishStore, RefreshTokenUpdate, StoredToken, TokenRefresh, META_ACCOUNT_ID,
    META_REFRESH_ERROR,
};
use crate::types::Platform;
use crate::vault::{self, EncryptionKey};

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// How a platform treats its refresh token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationPolicy {
    /// The refresh token works once; the replacement must be stored
    /// together with the new access token.
    SingleUse,
    /// The refresh token survives refreshes; only the access token changes.
    Reusable,
    /// There is no refresh token; the current access token buys a new one.
    ExchangeCurrent,
    /// A new refresh token comes back on every refresh, the old one dies.
    RotateEveryUse,
}

impl RotationPolicy {
    pub fn for_platform(platform: Platform) -> Self {
        match platform {
            Platform::Twitter => RotationPolicy::SingleUse,
            Platform::LinkedIn => RotationPolicy::Reusable,
            Platform::Threads => RotationPolicy::ExchangeCurrent,
            Platform::TikTok => RotationPolicy::RotateEveryUse,
        }
    }

    pub fn needs_refresh_token(&self) -> bool {
        !matches!(self, RotationPolicy::ExchangeCurrent)
    }

    /// What to store for the refresh token given what the provider returned
    /// (already sealed).
    pub fn refresh_token_update(&self, issued: Option<String>) -> RefreshTokenUpdate {
        match (self, issued) {
            (RotationPolicy::Reusable, _) => RefreshTokenUpdate::Keep,
            (RotationPolicy::ExchangeCurrent, _) => RefreshTokenUpdate::Clear,
            (RotationPolicy::SingleUse | RotationPolicy::RotateEveryUse, Some(token)) => {
                RefreshTokenUpdate::Replace(token)
            }
            // The old token is spent; keeping it would only fail later
            (RotationPolicy::SingleUse | RotationPolicy::RotateEveryUse, None) => {
                RefreshTokenUpdate::Clear
            }
        }
    }
}

/// Decrypted, ready-to-use credentials.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub token_id: i64,
    pub user_id: String,
    pub platform: Platform,
    pub access_token: SecretString,
    pub expires_at: Option<i64>,
    pub metadata: Map<String, Value>,
}

impl Credentials {
    pub fn access_token(&self) -> &str {
        self.access_token.expose_secret()
    }

    /// Platform account id recovered earlier (LinkedIn person URN, X user id).
    pub fn account_id(&self) -> Option<&str> {
        self.metadata.get(META_ACCOUNT_ID).and_then(Value::as_str)
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }
}

/// Encrypt a freshly authorized token into a row for [`PublishStore::upsert_token`].
pub fn seal_new_token(
    key: &EncryptionKey,
    user_id: &str,
    platform: Platform,
    access_token: &str,
    refresh_token: Option<&str>,
    expires_at: Option<i64>,
) -> Result<NewToken> {
    Ok(NewToken {
        user_id: user_id.to_string(),
        platform: platform.to_string(),
        access_token: vault::encrypt(key, access_token)?,
        refresh_token: refresh_token
            .map(|t| vault::encrypt(key, t))
            .transpose()?,
        expires_at,
        scopes: Vec::new(),
        metadata: Map::new(),
    })
}

/// Credential operations for one platform, borrowed for the length of a call.
pub struct CredentialManager<'a> {
    store: &'a dyn PublishStore,
    key: &'a EncryptionKey,
    client: &'a dyn PlatformClient,
    events: &'a EventBus,
    lock_lease: Duration,
}

impl<'a> CredentialManager<'a> {
    pub fn new(
        store: &'a dyn PublishStore,
        key: &'a EncryptionKey,
        client: &'a dyn PlatformClient,
        events: &'a EventBus,
    ) -> Self {
        Self {
            store,
            key,
            client,
            events,
            lock_lease: Duration::from_secs(120),
        }
    }

    /// How long a refresh may hold the token row before others take over.
    pub fn with_lock_lease(mut self, lease: Duration) -> Self {
        self.lock_lease = lease;
        self
    }

    fn platform(&self) -> Platform {
        self.client.platform()
    }

    async fn stored(&self, user_id: &str) -> Result<StoredToken> {
        self.store
            .get_token(user_id, self.platform().as_str())
            .await?
            .ok_or_else(|| {
                CredentialError::NotFound {
                    user_id: user_id.to_string(),
                    platform: self.platform().to_string(),
                }
                .into()
            })
    }

    fn decrypt(&self, token: &StoredToken) -> Result<Credentials> {
        Ok(Credentials {
            token_id: token.id,
            user_id: token.user_id.clone(),
            platform: self.platform(),
            access_token: vault::decrypt(self.key, &token.access_token)?,
            expires_at: token.expires_at,
            metadata: token.metadata.clone(),
        })
    }

    fn reauth_error(&self, token: &StoredToken, reason: &str) -> CredentialError {
        CredentialError::Expired {
            user_id: token.user_id.clone(),
            platform: self.platform().to_string(),
            reason: reason.to_string(),
        }
    }

    /// Credentials for `user_id`, refreshed first if they expired at or before `now`.
    pub async fn load(&self, user_id: &str, now: DateTime<Utc>) -> Result<Credentials> {
        let token = self.stored(user_id).await?;

        if token.needs_reauthorization() {
            let reason = token
                .metadata_str(META_REFRESH_ERROR)
                .unwrap_or("re-authorization required")
                .to_string();
            return Err(self.reauth_error(&token, &reason).into());
        }

        match token.expires_at {
            Some(expires_at) if expires_at <= now.timestamp() => {
                debug!(
                    "{} token for user {} expired at {}, refreshing inline",
                    self.platform(),
                    user_id,
                    expires_at
                );
                self.refresh_exclusive(token, now).await
            }
            _ => self.decrypt(&token),
        }
    }

    /// Refresh regardless of expiry.
    pub async fn refresh(&self, user_id: &str, now: DateTime<Utc>) -> Result<Credentials> {
        let token = self.stored(user_id).await?;
        self.refresh_exclusive(token, now).await
    }

    /// Take the row's refresh lease, or wait for whoever holds it to finish.
    ///
    /// A row renewed by someone else since `seen` was read is returned as is:
    /// refreshing again would replay a spent single-use refresh token.
    ///
    /// If this future is dropped while it holds the lease (a publish hitting
    /// its deadline mid-refresh), the lease is not released. The row stays
    /// leased until `lock_lease` runs out and the next caller takes it over.
    async fn refresh_exclusive(&self, seen: StoredToken, now: DateTime<Utc>) -> Result<Credentials> {
        let deadline = tokio::time::Instant::now() + self.lock_lease;
        let lease = chrono::Duration::from_std(self.lock_lease)
            .unwrap_or_else(|_| chrono::Duration::seconds(120));

        loop {
            let wall = Utc::now();
            if self
                .store
                .try_lock_token(seen.id, wall.timestamp(), (wall + lease).timestamp())
                .await?
            {
                let result = match self.stored(&seen.user_id).await {
                    Ok(current) if self.renewed_since(&seen, &current, now) => self.decrypt(&current),
                    Ok(current) => self.refresh_stored(&current, now).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = self.store.unlock_token(seen.id).await {
                    warn!("Failed to release refresh lease on token {}: {}", seen.id, e);
                }
                return result;
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(CredentialError::Locked.into());
            }
            debug!("Token {} is being refreshed elsewhere, waiting", seen.id);
            tokio::time::sleep(LOCK_POLL_INTERVAL).await;

            let current = self.stored(&seen.user_id).await?;
            if current.needs_reauthorization() {
                let reason = current
                    .metadata_str(META_REFRESH_ERROR)
                    .unwrap_or("refresh failed")
                    .to_string();
                return Err(self.reauth_error(&current, &reason).into());
            }
            if self.renewed_since(&seen, &current, now) {
                return self.decrypt(&current);
            }
        }
    }

    fn renewed_since(&self, seen: &StoredToken, current: &StoredToken, now: DateTime<Utc>) -> bool {
        current.access_token != seen.access_token
            && current.expires_at.map_or(true, |e| e > now.timestamp())
    }

    /// Refresh one row and persist the result. The caller holds the row's lease.
    pub async fn refresh_stored(&self, token: &StoredToken, now: DateTime<Utc>) -> Result<Credentials> {
        let policy = RotationPolicy::for_platform(self.platform());
        let access_token = vault::decrypt(self.key, &token.access_token)?;
        let refresh_token = token
            .refresh_token
            .as_deref()
            .map(|sealed| vault::decrypt(self.key, sealed))
            .transpose()?;

        let grant = match (policy, refresh_token.as_ref()) {
            (RotationPolicy::ExchangeCurrent, _) => {
                RefreshGrant::CurrentAccessToken(access_token.expose_secret())
            }
            (_, Some(refresh)) => RefreshGrant::RefreshToken(refresh.expose_secret()),
            (_, None) => {
                let reason = "no refresh token stored";
                self.record_failure(token, reason, true, now).await;
                return Err(self.reauth_error(token, reason).into());
            }
        };

        let issued = match self.client.refresh(grant).await {
            Ok(issued) => issued,
            Err(e) => {
                let transient = e.is_transient();
                let reason = e.to_string();
                self.record_failure(token, &reason, !transient, now).await;
                return Err(CredentialError::Refresh {
                    platform: self.platform().to_string(),
                    reason,
                    transient,
                }
                .into());
            }
        };

        let sealed_refresh = issued
            .refresh_token
            .as_ref()
            .map(|t| vault::encrypt(self.key, t.expose_secret()))
            .transpose()?;
        let refresh_update = policy.refresh_token_update(sealed_refresh);
        if refresh_update == RefreshTokenUpdate::Clear && policy.needs_refresh_token() {
            warn!(
                "{} refresh for user {} returned no new refresh token; the next refresh will need re-authorization",
                self.platform(),
                token.user_id
            );
        }

        let expires_at = issued.expires_in.map(|secs| now.timestamp() + secs);
        let refresh = TokenRefresh {
            access_token: vault::encrypt(self.key, issued.access_token.expose_secret())?,
            refresh_token: refresh_update,
            expires_at,
            scopes: issued.scopes.clone(),
            refreshed_at: now.timestamp(),
        };
        self.store.apply_token_refresh(token.id, &refresh).await?;

        info!(
            "Refreshed {} token for user {} (expires_at={:?})",
            self.platform(),
            token.user_id,
            expires_at
        );
        self.events.emit(Event::CredentialRefreshed {
            user_id: token.user_id.clone(),
            platform: self.platform().to_string(),
            expires_at,
        });

        Ok(Credentials {
            token_id: token.id,
            user_id: token.user_id.clone(),
            platform: self.platform(),
            access_token: issued.access_token,
            expires_at,
            metadata: token.metadata.clone(),
        })
    }

    async fn record_failure(&self, token: &StoredToken, reason: &str, reauth_required: bool, now: DateTime<Utc>) {
        warn!(
            "{} token refresh failed for user {}: {} (reauth_required={})",
            self.platform(),
            token.user_id,
            reason,
            reauth_required
        );
        if let Err(e) = self
            .store
            .annotate_refresh_failure(token.id, reason, reauth_required, now.timestamp())
            .await
        {
            warn!("Failed to annotate token {}: {}", token.id, e);
        }
        if reauth_required {
            self.events.emit(Event::CredentialRefreshFailed {
                user_id: token.user_id.clone(),
                platform: self.platform().to_string(),
                reason: reason.to_string(),
                reauth_required,
            });
        }
    }

    /// Remember the platform account id on the token row.
    pub async fn remember_account_id(&self, credentials: &Credentials, account_id: &str) -> Result<()> {
        self.store
            .set_token_metadata(
                credentials.token_id,
                META_ACCOUNT_ID,
                Value::String(account_id.to_string()),
            )
            .await
    }
}
