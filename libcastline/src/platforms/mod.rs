//! Platform abstraction
//!
//! The pipeline never speaks a platform protocol itself. It hands a profile,
//! a caption and media URLs to a [`Platform`] and interprets the result: an
//! id on success, or a [`PlatformError`] whose variant says whether another
//! attempt makes sense.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::error::{PlatformError, Result};
use crate::types::{PlatformKind, SocialProfile};

pub mod bridge;

// Not test-only: `castline-send --dry-run` publishes through it
pub mod mock;

/// Publish capability for one social platform
#[async_trait]
pub trait Platform: Send + Sync {
    /// Publish a post on behalf of `profile`
    ///
    /// Returns the platform's id for the created post.
    ///
    /// # Errors
    ///
    /// Returns a `PlatformError`; [`PlatformError::is_transient`] decides
    /// whether the attempt is retried.
    async fn publish(
        &self,
        profile: &SocialProfile,
        caption: &str,
        media_urls: &[String],
    ) -> std::result::Result<String, PlatformError>;

    /// Which platform this publisher serves
    fn kind(&self) -> PlatformKind;

    /// Short name used in logs
    fn name(&self) -> &str {
        self.kind().as_str()
    }
}

/// Publishers keyed by platform
#[derive(Clone, Default)]
pub struct PlatformRegistry {
    platforms: HashMap<PlatformKind, Arc<dyn Platform>>,
}

impl PlatformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a publisher under its own [`Platform::kind`], replacing any
    /// previous one
    pub fn register(&mut self, platform: Arc<dyn Platform>) {
        self.platforms.insert(platform.kind(), platform);
    }

    pub fn with(mut self, platform: Arc<dyn Platform>) -> Self {
        self.register(platform);
        self
    }

    pub fn get(&self, kind: PlatformKind) -> Option<Arc<dyn Platform>> {
        self.platforms.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<PlatformKind> {
        let mut kinds: Vec<_> = self.platforms.keys().copied().collect();
        kinds.sort();
        kinds
    }

    pub fn is_empty(&self) -> bool {
        self.platforms.is_empty()
    }

    /// Build HTTP bridge publishers for every enabled `[platforms.*]` entry
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an unknown platform name, or a
    /// platform error if the HTTP client cannot be built.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut registry = Self::new();
        let timeout = config.dispatch.execution_timeout();

        for (name, bridge) in &config.platforms {
            if !bridge.enabled {
                tracing::debug!(platform = %name, "Platform disabled in config, skipping");
                continue;
            }

            let kind: PlatformKind = name.parse().map_err(|reason: String| {
                crate::error::ConfigError::InvalidValue {
                    field: format!("platforms.{}", name),
                    reason,
                }
            })?;

            let platform = bridge::BridgePlatform::new(kind, &bridge.endpoint, timeout)?;
            registry.register(Arc::new(platform));
        }

        Ok(registry)
    }

    /// A mock publisher that succeeds for every platform
    pub fn dry_run() -> Self {
        Self::dry_run_with_delay(Duration::ZERO)
    }

    pub fn dry_run_with_delay(delay: Duration) -> Self {
        let mut registry = Self::new();
        for kind in [
            PlatformKind::Instagram,
            PlatformKind::Facebook,
            PlatformKind::Tiktok,
            PlatformKind::Linkedin,
        ] {
            registry.register(Arc::new(mock::MockPlatform::new(mock::MockConfig {
                kind,
                delay,
                ..Default::default()
            })));
        }
        registry
    }
}
