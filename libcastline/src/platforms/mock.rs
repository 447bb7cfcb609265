//! Mock platform implementation for testing
//!
//! A configurable publisher that can succeed, fail with any
//! [`PlatformError`], or replay a scripted sequence of outcomes, with an
//! optional delay. Shared counters let a test inspect what was published
//! after the platform has been moved into the pipeline.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;

use crate::error::PlatformError;
use crate::platforms::Platform;
use crate::types::{PlatformKind, SocialProfile};

/// One scripted result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockOutcome {
    Success,
    Fail(PlatformError),
}

/// Configuration for mock platform behavior
#[derive(Debug, Clone)]
pub struct MockConfig {
    pub kind: PlatformKind,

    /// Outcomes consumed one per call, front first
    pub script: Arc<Mutex<VecDeque<MockOutcome>>>,

    /// Outcome once the script is exhausted
    pub fallback: MockOutcome,

    /// Delay before completing a call (simulates network latency)
    pub delay: Duration,

    /// Number of times publish has been called
    pub publish_call_count: Arc<Mutex<usize>>,

    /// Captions that have been published successfully
    pub published_captions: Arc<Mutex<Vec<String>>>,

    /// Media URLs received by every call, in call order
    pub received_media: Arc<Mutex<Vec<Vec<String>>>>,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            kind: PlatformKind::Instagram,
            script: Arc::new(Mutex::new(VecDeque::new())),
            fallback: MockOutcome::Success,
            delay: Duration::from_millis(0),
            publish_call_count: Arc::new(Mutex::new(0)),
            published_captions: Arc::new(Mutex::new(Vec::new())),
            received_media: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

/// Mock platform for testing
pub struct MockPlatform {
    config: MockConfig,
}

impl MockPlatform {
    pub fn new(config: MockConfig) -> Self {
        Self { config }
    }

    /// Always succeeds
    pub fn success(kind: PlatformKind) -> Self {
        Self::new(MockConfig {
            kind,
            ..Default::default()
        })
    }

    /// Always fails with `error`
    pub fn failing(kind: PlatformKind, error: PlatformError) -> Self {
        Self::new(MockConfig {
            kind,
            fallback: MockOutcome::Fail(error),
            ..Default::default()
        })
    }

    /// Replays `outcomes` in order, then succeeds
    pub fn scripted(kind: PlatformKind, outcomes: Vec<MockOutcome>) -> Self {
        Self::new(MockConfig {
            kind,
            script: Arc::new(Mutex::new(outcomes.into())),
            ..Default::default()
        })
    }

    /// Succeeds after sleeping for `delay`
    pub fn with_delay(kind: PlatformKind, delay: Duration) -> Self {
        Self::new(MockConfig {
            kind,
            delay,
            ..Default::default()
        })
    }

    /// Handle onto the shared counters, usable after `self` is moved
    pub fn config(&self) -> MockConfig {
        self.config.clone()
    }

    pub fn publish_call_count(&self) -> usize {
        self.config.publish_call_count()
    }

    pub fn published_captions(&self) -> Vec<String> {
        self.config.published_captions()
    }
}

impl MockConfig {
    pub fn publish_call_count(&self) -> usize {
        self.publish_call_count.lock().map(|c| *c).unwrap_or(0)
    }

    pub fn published_captions(&self) -> Vec<String> {
        self.published_captions
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    pub fn received_media(&self) -> Vec<Vec<String>> {
        self.received_media
            .lock()
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    fn next_outcome(&self) -> MockOutcome {
        self.script
            .lock()
            .ok()
            .and_then(|mut script| script.pop_front())
            .unwrap_or_else(|| self.fallback.clone())
    }
}

#[async_trait]
impl Platform for MockPlatform {
    async fn publish(
        &self,
        _profile: &SocialProfile,
        caption: &str,
        media_urls: &[String],
    ) -> std::result::Result<String, PlatformError> {
        let call_number = {
            let mut count = self
                .config
                .publish_call_count
                .lock()
                .map_err(|_| PlatformError::Posting("mock state poisoned".to_string()))?;
            *count += 1;
            *count
        };

        if let Ok(mut media) = self.config.received_media.lock() {
            media.push(media_urls.to_vec());
        }

        if !self.config.delay.is_zero() {
            sleep(self.config.delay).await;
        }

        match self.config.next_outcome() {
            MockOutcome::Success => {
                if let Ok(mut captions) = self.config.published_captions.lock() {
                    captions.push(caption.to_string());
                }
                Ok(format!("mock-{}-{}", self.config.kind, call_number))
            }
            MockOutcome::Fail(error) => Err(error),
        }
    }

    fn kind(&self) -> PlatformKind {
        self.config.kind
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> SocialProfile {
        SocialProfile::new("team-1", PlatformKind::Instagram, "ig-1", "token")
    }

    #[tokio::test]
    async fn test_mock_success() {
        let platform = MockPlatform::success(PlatformKind::Instagram);

        let id = platform.publish(&profile(), "Hello", &[]).await.unwrap();

        assert_eq!(id, "mock-instagram-1");
        assert_eq!(platform.publish_call_count(), 1);
        assert_eq!(platform.published_captions(), vec!["Hello".to_string()]);
    }

    #[tokio::test]
    async fn test_mock_failing() {
        let platform = MockPlatform::failing(
            PlatformKind::Tiktok,
            PlatformError::Validation("too long".to_string()),
        );

        let result = platform.publish(&profile(), "Hello", &[]).await;

        assert_eq!(result, Err(PlatformError::Validation("too long".to_string())));
        assert!(platform.published_captions().is_empty());
    }

    #[tokio::test]
    async fn test_mock_script_then_fallback() {
        let platform = MockPlatform::scripted(
            PlatformKind::Facebook,
            vec![
                MockOutcome::Fail(PlatformError::Server("503".to_string())),
                MockOutcome::Fail(PlatformError::Network("reset".to_string())),
            ],
        );

        assert!(platform.publish(&profile(), "a", &[]).await.is_err());
        assert!(platform.publish(&profile(), "a", &[]).await.is_err());
        assert_eq!(
            platform.publish(&profile(), "a", &[]).await.unwrap(),
            "mock-facebook-3"
        );
    }

    #[tokio::test]
    async fn test_shared_counters_survive_move() {
        let platform = MockPlatform::success(PlatformKind::Linkedin);
        let handle = platform.config();
        let boxed: Arc<dyn Platform> = Arc::new(platform);

        boxed
            .publish(&profile(), "x", &["http://cdn/a.jpg".to_string()])
            .await
            .unwrap();

        assert_eq!(handle.publish_call_count(), 1);
        assert_eq!(handle.received_media(), vec![vec!["http://cdn/a.jpg".to_string()]]);
    }

    #[tokio::test]
    async fn test_mock_with_delay() {
        let platform = MockPlatform::with_delay(PlatformKind::Instagram, Duration::from_millis(50));

        let start = std::time::Instant::now();
        platform.publish(&profile(), "x", &[]).await.unwrap();

        assert!(start.elapsed() >= Duration::from_millis(50));
    }
}
