//! Handler registry
//!
//! Maps a platform identifier to a constructor. [`default_registry`] is the
//! one place where every platform is wired up at startup; tests build their
//! own registry around [`crate::clients::MockClient`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{LinkedInHandler, PlatformPublisher, ThreadsHandler, TikTokHandler, TwitterHandler};
use crate::clients::{LinkedInClient, PlatformClient, ThreadsClient, TikTokClient, TwitterClient};
use crate::config::{Config, PlatformConfig};
use crate::error::{ConfigError, RegistryError, Result};
use crate::events::EventBus;
use crate::types::Platform;

/// Per-run handler tuning taken from `[publishing]` and `[sweeper]`.
#[derive(Debug, Clone, Copy)]
pub struct HandlerSettings {
    pub inline_rate_limit_wait: Duration,
    pub lock_lease: Duration,
}

impl Default for HandlerSettings {
    fn default() -> Self {
        Self {
            inline_rate_limit_wait: Duration::ZERO,
            lock_lease: Duration::from_secs(120),
        }
    }
}

impl HandlerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            inline_rate_limit_wait: config.publishing.inline_rate_limit_wait,
            lock_lease: config.sweeper.lock_lease,
        }
    }
}

/// Arguments forwarded to a handler constructor.
#[derive(Clone)]
pub struct HandlerArgs {
    pub user_id: String,
    pub events: EventBus,
    pub settings: HandlerSettings,
}

impl HandlerArgs {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            events: EventBus::default(),
            settings: HandlerSettings::default(),
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn with_settings(mut self, settings: HandlerSettings) -> Self {
        self.settings = settings;
        self
    }
}

pub type HandlerFactory =
    Arc<dyn Fn(HandlerArgs) -> Result<Box<dyn PlatformPublisher>> + Send + Sync>;

#[derive(Clone, Default)]
pub struct HandlerRegistry {
    factories: BTreeMap<String, HandlerFactory>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("platforms", &self.list())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor, replacing any earlier one for the platform.
    pub fn register<F>(&mut self, platform: Platform, factory: F)
    where
        F: Fn(HandlerArgs) -> Result<Box<dyn PlatformPublisher>> + Send + Sync + 'static,
    {
        debug!("Registering handler for {}", platform);
        self.factories
            .insert(platform.as_str().to_string(), Arc::new(factory));
    }

    /// A fresh handler for `platform`.
    pub fn create(&self, platform: &str, args: HandlerArgs) -> Result<Box<dyn PlatformPublisher>> {
        let key = platform.trim().to_lowercase();
        let factory = self
            .factories
            .get(&key)
            .ok_or_else(|| RegistryError::NotRegistered(platform.to_string()))?;
        factory(args)
    }

    pub fn has(&self, platform: &str) -> bool {
        self.factories.contains_key(&platform.trim().to_lowercase())
    }

    /// Registered platform identifiers, sorted.
    pub fn list(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    pub fn unregister(&mut self, platform: &str) -> bool {
        self.factories.remove(&platform.trim().to_lowercase()).is_some()
    }
}

/// Registry with every supported platform.
///
/// A platform whose section is missing from the config, or whose client
/// credentials cannot be resolved, is still registered; creating its handler
/// fails with a configuration error naming what is missing.
pub fn default_registry(config: &Config) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();

    for platform in Platform::ALL {
        let section = config.platform(platform).cloned();
        match section.map(|section| build_client(platform, &section).map(|client| (section, client))) {
            Some(Ok((section, client))) => {
                let window = section.window_limit(platform);
                registry.register(platform, move |args| {
                    Ok(build_handler(platform, Arc::clone(&client), args, window))
                });
            }
            Some(Err(e)) => {
                let reason = match e {
                    crate::error::PostwaveError::Config(ConfigError::PlatformNotConfigured {
                        reason,
                        ..
                    }) => reason,
                    other => other.to_string(),
                };
                registry.register(platform, move |_| Err(not_configured(platform, &reason)));
            }
            None => {
                registry.register(platform, move |_| {
                    Err(not_configured(
                        platform,
                        &format!("add a [platforms.{}] section to the config", platform),
                    ))
                });
            }
        }
    }

    registry
}

fn not_configured(platform: Platform, reason: &str) -> crate::error::PostwaveError {
    ConfigError::PlatformNotConfigured {
        platform: platform.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

fn build_client(platform: Platform, section: &PlatformConfig) -> Result<Arc<dyn PlatformClient>> {
    let api_base = section.api_base.as_deref();
    let token_url = section.token_url.clone();

    let client: Arc<dyn PlatformClient> = match platform {
        Platform::Twitter => {
            let credentials = section.client_credentials(platform)?;
            Arc::new(match api_base {
                Some(base) => TwitterClient::with_base(credentials, base, token_url),
                None => TwitterClient::new(credentials),
            })
        }
        Platform::LinkedIn => {
            let credentials = section.client_credentials(platform)?;
            Arc::new(match api_base {
                Some(base) => LinkedInClient::with_base(credentials, base, token_url),
                None => LinkedInClient::new(credentials),
            })
        }
        // Token exchange uses the current access token, no client secret
        Platform::Threads => Arc::new(match api_base {
            Some(base) => ThreadsClient::with_base(base, token_url),
            None => ThreadsClient::new(),
        }),
        Platform::TikTok => {
            let credentials = section.client_credentials(platform)?;
            Arc::new(match api_base {
                Some(base) => TikTokClient::with_base(credentials, base, token_url),
                None => TikTokClient::new(credentials),
            })
        }
    };
    Ok(client)
}

/// Wrap `client` in the handler for `platform`.
pub fn build_handler(
    platform: Platform,
    client: Arc<dyn PlatformClient>,
    args: HandlerArgs,
    window: Option<crate::rate_limit::WindowLimit>,
) -> Box<dyn PlatformPublisher> {
    match platform {
        Platform::Twitter => Box::new(TwitterHandler::new(client, args).with_window(window)),
        Platform::LinkedIn => Box::new(LinkedInHandler::new(client, args).with_window(window)),
        Platform::Threads => Box::new(ThreadsHandler::new(client, args).with_window(window)),
        Platform::TikTok => Box::new(TikTokHandler::new(client, args).with_window(window)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::MockClient;
    use crate::error::PostwaveError;

    fn mock_registry() -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        for platform in [Platform::Twitter, Platform::Threads] {
            let client = MockClient::new(platform);
            registry.register(platform, move |args| {
                Ok(build_handler(platform, Arc::new(client.clone()), args, None))
            });
        }
        registry
    }

    #[test]
    fn test_register_and_create() {
        let registry = mock_registry();
        assert!(registry.has("twitter"));
        assert!(registry.has("Threads"));
        assert_eq!(registry.list(), vec!["threads", "twitter"]);

        let handler = registry.create("twitter", HandlerArgs::new("u1")).unwrap();
        assert_eq!(handler.platform(), Platform::Twitter);
        assert!(handler.rate_limit_info().is_none());
        assert_eq!(handler.retry_after(), Duration::ZERO);
    }

    #[test]
    fn test_missing_platform_names_fix() {
        let registry = mock_registry();
        let err = registry.create("tiktok", HandlerArgs::new("u1")).err().unwrap();
        assert!(matches!(err, PostwaveError::Registry(RegistryError::NotRegistered(ref p)) if p == "tiktok"));
        assert!(err.to_string().contains("default_registry"));
    }

    #[test]
    fn test_register_is_last_write_wins() {
        let mut registry = mock_registry();
        registry.register(Platform::Twitter, |_| {
            Err(PostwaveError::InvalidInput("replaced".to_string()))
        });
        assert_eq!(registry.list().len(), 2);
        assert!(registry.create("twitter", HandlerArgs::new("u1")).is_err());
    }

    #[test]
    fn test_unregister() {
        let mut registry = mock_registry();
        assert!(registry.unregister("twitter"));
        assert!(!registry.unregister("twitter"));
        assert!(!registry.has("twitter"));
    }

    #[test]
    fn test_default_registry_reports_unconfigured_platforms() {
        let mut config = Config::default_config();
        config
            .platforms
            .insert("threads".to_string(), PlatformConfig::default());
        config.platforms.insert(
            "linkedin".to_string(),
            PlatformConfig {
                client_id: Some("client".to_string()),
                client_secret_env: Some("POSTWAVE_TEST_UNSET_SECRET".to_string()),
                ..Default::default()
            },
        );
        let registry = default_registry(&config);
        assert_eq!(registry.list().len(), 4);

        // Threads needs no client secret
        assert!(registry.create("threads", HandlerArgs::new("u1")).is_ok());

        let err = registry.create("twitter", HandlerArgs::new("u1")).err().unwrap();
        assert!(err.to_string().contains("[platforms.twitter]"));
        assert_eq!(err.class(), crate::error::ErrorClass::Configuration);

        let err = registry.create("linkedin", HandlerArgs::new("u1")).err().unwrap();
        assert!(err.to_string().contains("POSTWAVE_TEST_UNSET_SECRET"));
    }
}
