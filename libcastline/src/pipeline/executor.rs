//! Publish execution for a single claimed target
//!
//! The executor never writes to the database. It loads what the platform
//! needs, makes one publish call under a hard timeout and reports an
//! [`ExecutionOutcome`]; the dispatcher commits the outcome together with
//! the retry decision.

use std::time::Duration;
use tracing::{debug, warn};

use crate::db::Database;
use crate::media::MediaUrlResolver;
use crate::platforms::PlatformRegistry;
use crate::types::PostTarget;

/// Result of one publish attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Success { platform_post_id: String },
    /// Worth another attempt (network, throttling, 5xx, timeout)
    TransientFailure { reason: String },
    /// Final (credentials, content, missing profile or publisher)
    PermanentFailure { reason: String },
}

impl ExecutionOutcome {
    fn transient(reason: impl Into<String>) -> Self {
        ExecutionOutcome::TransientFailure {
            reason: reason.into(),
        }
    }

    fn permanent(reason: impl Into<String>) -> Self {
        ExecutionOutcome::PermanentFailure {
            reason: reason.into(),
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            ExecutionOutcome::Success { .. } => None,
            ExecutionOutcome::TransientFailure { reason }
            | ExecutionOutcome::PermanentFailure { reason } => Some(reason),
        }
    }
}

pub struct PublishExecutor {
    db: Database,
    platforms: PlatformRegistry,
    media: MediaUrlResolver,
    timeout: Duration,
}

impl PublishExecutor {
    pub fn new(
        db: Database,
        platforms: PlatformRegistry,
        media: MediaUrlResolver,
        timeout: Duration,
    ) -> Self {
        Self {
            db,
            platforms,
            media,
            timeout,
        }
    }

    /// Attempt to publish `target`, which the caller has already claimed
    pub async fn execute(&self, target: &PostTarget, now: i64) -> ExecutionOutcome {
        let profile = match self.db.get_profile(&target.social_profile_id).await {
            Ok(Some(profile)) => profile,
            Ok(None) => return ExecutionOutcome::permanent("profile_missing"),
            Err(e) => return ExecutionOutcome::transient(format!("internal: {}", e)),
        };

        if !profile.is_connected {
            return ExecutionOutcome::permanent("profile_disconnected");
        }

        if profile.is_token_expired(now) {
            debug!(target_id = %target.id, profile_id = %profile.id, "Access token expired, skipping platform call");
            return ExecutionOutcome::permanent("token_expired");
        }

        let Some(platform) = self.platforms.get(profile.platform) else {
            return ExecutionOutcome::permanent(format!("no_publisher: {}", profile.platform));
        };

        let post = match self.db.get_post(&target.post_id).await {
            Ok(Some(post)) => post,
            Ok(None) => return ExecutionOutcome::permanent("post_missing"),
            Err(e) => return ExecutionOutcome::transient(format!("internal: {}", e)),
        };

        let media_urls = match self.db.get_post_media(&post.id).await {
            Ok(media) => self.media.urls(&media),
            Err(e) => return ExecutionOutcome::transient(format!("internal: {}", e)),
        };

        debug!(
            target_id = %target.id,
            platform = %platform.name(),
            media = media_urls.len(),
            "Publishing"
        );

        match tokio::time::timeout(
            self.timeout,
            platform.publish(&profile, post.caption_text(), &media_urls),
        )
        .await
        {
            Ok(Ok(platform_post_id)) => ExecutionOutcome::Success { platform_post_id },
            Ok(Err(e)) => {
                let reason = format!("{}: {}", e.code(), e);
                if e.is_transient() {
                    ExecutionOutcome::transient(reason)
                } else {
                    ExecutionOutcome::permanent(reason)
                }
            }
            Err(_) => {
                warn!(
                    target_id = %target.id,
                    platform = %platform.name(),
                    timeout_secs = self.timeout.as_secs(),
                    "Publish call timed out"
                );
                ExecutionOutcome::transient("timeout")
            }
        }
    }
}
