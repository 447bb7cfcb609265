//! HTTP bridge publisher
//!
//! Platform protocols live behind a small HTTP service per platform. The
//! bridge receives
//!
//! ```json
//! {"caption": "...", "media_urls": ["https://..."], "provider_id": "17841400000"}
//! ```
//!
//! with the profile's access token as a bearer header, and answers `2xx`
//! with `{"id": "<platform post id>"}`. Status codes map onto
//! [`PlatformError`] variants:
//!
//! | response                   | error            | retried |
//! |----------------------------|------------------|---------|
//! | connect / transport error  | `Network`        | yes     |
//! | client-side timeout, 408   | `Timeout`        | yes     |
//! | 429                        | `RateLimit`      | yes     |
//! | 5xx                        | `Server`         | yes     |
//! | 401, 403                   | `Authentication` | no      |
//! | any other 4xx              | `Validation`     | no      |

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::PlatformError;
use crate::platforms::Platform;
use crate::types::{PlatformKind, SocialProfile};

/// Longest error body echoed into a response log
const MAX_ERROR_BODY: usize = 200;

#[derive(Debug, Serialize)]
struct PublishBody<'a> {
    caption: &'a str,
    media_urls: &'a [String],
    provider_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct PublishResponse {
    id: serde_json::Value,
}

pub struct BridgePlatform {
    kind: PlatformKind,
    endpoint: String,
    client: reqwest::Client,
}

impl BridgePlatform {
    /// Build a bridge publisher for `kind` posting to `endpoint`
    ///
    /// # Errors
    ///
    /// Returns `PlatformError::NotConfigured` if the endpoint is empty or the
    /// HTTP client cannot be constructed.
    pub fn new(
        kind: PlatformKind,
        endpoint: &str,
        timeout: Duration,
    ) -> std::result::Result<Self, PlatformError> {
        if endpoint.trim().is_empty() {
            return Err(PlatformError::NotConfigured(format!(
                "{}: bridge endpoint is empty",
                kind
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("castline/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PlatformError::NotConfigured(format!("{}: {}", kind, e)))?;

        Ok(Self {
            kind,
            endpoint: endpoint.to_string(),
            client,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Platform for BridgePlatform {
    async fn publish(
        &self,
        profile: &SocialProfile,
        caption: &str,
        media_urls: &[String],
    ) -> std::result::Result<String, PlatformError> {
        let body = PublishBody {
            caption,
            media_urls,
            provider_id: &profile.provider_id,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&profile.access_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(self.kind, &e))?;

        let status = response.status();
        if status.is_success() {
            let parsed: PublishResponse = response.json().await.map_err(|e| {
                PlatformError::Posting(format!("{}: unreadable success response: {}", self.kind, e))
            })?;
            return platform_post_id(self.kind, parsed.id);
        }

        let text = response.text().await.unwrap_or_default();
        Err(classify_status(self.kind, status, &text))
    }

    fn kind(&self) -> PlatformKind {
        self.kind
    }
}

fn transport_error(kind: PlatformKind, error: &reqwest::Error) -> PlatformError {
    if error.is_timeout() {
        PlatformError::Timeout(format!("{}: {}", kind, error))
    } else {
        PlatformError::Network(format!("{}: {}", kind, error))
    }
}

fn platform_post_id(
    kind: PlatformKind,
    id: serde_json::Value,
) -> std::result::Result<String, PlatformError> {
    match id {
        serde_json::Value::String(s) if !s.is_empty() => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(PlatformError::Posting(format!(
            "{}: success response carried no usable id ({})",
            kind, other
        ))),
    }
}

/// Map a non-2xx status onto a platform error
pub(crate) fn classify_status(kind: PlatformKind, status: StatusCode, body: &str) -> PlatformError {
    let detail = if body.trim().is_empty() {
        format!("{}: HTTP {}", kind, status.as_u16())
    } else {
        let snippet: String = body.trim().chars().take(MAX_ERROR_BODY).collect();
        format!("{}: HTTP {}: {}", kind, status.as_u16(), snippet)
    };

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => PlatformError::Authentication(detail),
        StatusCode::REQUEST_TIMEOUT => PlatformError::Timeout(detail),
        StatusCode::TOO_MANY_REQUESTS => PlatformError::RateLimit(detail),
        s if s.is_server_error() => PlatformError::Server(detail),
        s if s.is_client_error() => PlatformError::Validation(detail),
        _ => PlatformError::Posting(detail),
    }
}
