//! Core types for Castline

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Social platforms a profile can be connected to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformKind {
    Instagram,
    Facebook,
    Tiktok,
    Linkedin,
}

impl PlatformKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlatformKind::Instagram => "instagram",
            PlatformKind::Facebook => "facebook",
            PlatformKind::Tiktok => "tiktok",
            PlatformKind::Linkedin => "linkedin",
        }
    }
}

impl FromStr for PlatformKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "instagram" => Ok(PlatformKind::Instagram),
            "facebook" => Ok(PlatformKind::Facebook),
            "tiktok" => Ok(PlatformKind::Tiktok),
            "linkedin" => Ok(PlatformKind::Linkedin),
            other => Err(format!("unknown platform '{}'", other)),
        }
    }
}

impl fmt::Display for PlatformKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a post as seen by its author
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PostStatus {
    Draft,
    Scheduled,
    Published,
    Failed,
}

impl PostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostStatus::Draft => "draft",
            PostStatus::Scheduled => "scheduled",
            PostStatus::Published => "published",
            PostStatus::Failed => "failed",
        }
    }

    /// Derive a post's status from its targets.
    ///
    /// Returns `None` while any target is still in flight (or there are no
    /// targets), meaning the post keeps its current status. Once every target
    /// is terminal the post is `Published` if at least one target published,
    /// and `Failed` otherwise.
    pub fn aggregate(targets: &[TargetStatus]) -> Option<PostStatus> {
        if targets.is_empty() || !targets.iter().all(TargetStatus::is_terminal) {
            return None;
        }

        if targets.contains(&TargetStatus::Published) {
            Some(PostStatus::Published)
        } else {
            Some(PostStatus::Failed)
        }
    }
}

impl FromStr for PostStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(PostStatus::Draft),
            "scheduled" => Ok(PostStatus::Scheduled),
            "published" => Ok(PostStatus::Published),
            "failed" => Ok(PostStatus::Failed),
            other => Err(format!("unknown post status '{}'", other)),
        }
    }
}

impl fmt::Display for PostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of a single (post, profile) publish obligation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetStatus {
    Pending,
    Processing,
    Published,
    Failed,
    Retrying,
}

impl TargetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetStatus::Pending => "pending",
            TargetStatus::Processing => "processing",
            TargetStatus::Published => "published",
            TargetStatus::Failed => "failed",
            TargetStatus::Retrying => "retrying",
        }
    }

    /// No further transitions happen from here
    pub fn is_terminal(&self) -> bool {
        match self {
            TargetStatus::Published | TargetStatus::Failed => true,
            TargetStatus::Pending | TargetStatus::Processing | TargetStatus::Retrying => false,
        }
    }

    /// The dispatch loop may claim a target in this state
    pub fn is_claimable(&self) -> bool {
        match self {
            TargetStatus::Pending | TargetStatus::Retrying => true,
            TargetStatus::Processing | TargetStatus::Published | TargetStatus::Failed => false,
        }
    }
}

impl FromStr for TargetStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TargetStatus::Pending),
            "processing" => Ok(TargetStatus::Processing),
            "published" => Ok(TargetStatus::Published),
            "failed" => Ok(TargetStatus::Failed),
            "retrying" => Ok(TargetStatus::Retrying),
            other => Err(format!("unknown target status '{}'", other)),
        }
    }
}

impl fmt::Display for TargetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    pub team_id: String,
    pub created_by: String,
    pub caption: Option<String>,
    pub post_type: String,
    pub scheduled_at: Option<i64>,
    pub status: PostStatus,
    /// Media ids in display order
    pub media_ids: Vec<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
}

impl Post {
    pub fn new(team_id: &str, created_by: &str, caption: Option<String>) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            id: Uuid::new_v4().to_string(),
            team_id: team_id.to_string(),
            created_by: created_by.to_string(),
            caption,
            post_type: "standard".to_string(),
            scheduled_at: None,
            status: PostStatus::Draft,
            media_ids: Vec::new(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Whether the scheduled time has arrived. Unscheduled posts are due.
    pub fn is_due(&self, now: i64) -> bool {
        self.scheduled_at.map_or(true, |at| at <= now)
    }

    pub fn caption_text(&self) -> &str {
        self.caption.as_deref().unwrap_or("")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostTarget {
    pub id: String,
    pub team_id: String,
    pub post_id: String,
    pub social_profile_id: String,
    pub status: TargetStatus,
    pub attempt_count: u32,
    pub next_attempt_at: Option<i64>,
    /// When the active claim was taken; `None` unless `status` is processing
    pub claimed_at: Option<i64>,
    /// Identifies the worker holding the claim
    #[serde(skip)]
    pub claim_token: Option<String>,
    pub response_log: Vec<LogEntry>,
    pub published_at: Option<i64>,
    pub platform_post_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl PostTarget {
    /// A fresh, never attempted target
    pub fn pending(post: &Post, social_profile_id: &str, now: i64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            team_id: post.team_id.clone(),
            post_id: post.id.clone(),
            social_profile_id: social_profile_id.to_string(),
            status: TargetStatus::Pending,
            attempt_count: 0,
            next_attempt_at: None,
            claimed_at: None,
            claim_token: None,
            response_log: Vec::new(),
            published_at: None,
            platform_post_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_ready(&self, now: i64) -> bool {
        self.status.is_claimable() && self.next_attempt_at.map_or(true, |at| at <= now)
    }
}

/// What a response log entry records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogEvent {
    Published,
    TransientFailure,
    PermanentFailure,
    StaleClaimRecovered,
}

/// One structured line of a target's `response_log`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub at: i64,
    /// Attempt number this entry belongs to. Recovery events carry the
    /// number of attempts completed so far.
    pub attempt: u32,
    pub event: LogEvent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Where the retry scheduler sent the target afterwards
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform_post_id: Option<String>,
}

impl LogEntry {
    pub fn to_line(&self) -> String {
        // Serializing a plain struct of strings and integers cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Parse a stored log column. Lines that are not valid entries are skipped.
    pub fn parse_log(raw: &str) -> Vec<LogEntry> {
        raw.lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }
}

/// A connected external account. Tokens never appear in `Debug` output.
#[derive(Clone, Serialize, Deserialize)]
pub struct SocialProfile {
    pub id: String,
    pub team_id: String,
    pub platform: PlatformKind,
    pub provider_id: String,
    pub name: Option<String>,
    pub handle: Option<String>,
    #[serde(skip_serializing)]
    pub access_token: String,
    #[serde(skip_serializing)]
    pub refresh_token: Option<String>,
    pub token_expires_at: Option<i64>,
    pub is_connected: bool,
}

impl SocialProfile {
    pub fn new(team_id: &str, platform: PlatformKind, provider_id: &str, access_token: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            team_id: team_id.to_string(),
            platform,
            provider_id: provider_id.to_string(),
            name: None,
            handle: None,
            access_token: access_token.to_string(),
            refresh_token: None,
            token_expires_at: None,
            is_connected: true,
        }
    }

    /// A profile without a recorded expiry never expires
    pub fn is_token_expired(&self, now: i64) -> bool {
        self.token_expires_at.is_some_and(|at| at <= now)
    }
}

impl fmt::Debug for SocialProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocialProfile")
            .field("id", &self.id)
            .field("team_id", &self.team_id)
            .field("platform", &self.platform)
            .field("provider_id", &self.provider_id)
            .field("handle", &self.handle)
            .field("access_token", &"[redacted]")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[redacted]"))
            .field("token_expires_at", &self.token_expires_at)
            .field("is_connected", &self.is_connected)
            .finish()
    }
}

/// Uploaded media file owned by a team
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Media {
    pub id: String,
    pub team_id: String,
    pub file_path: String,
    pub file_type: String,
    pub mime_type: String,
}

impl Media {
    pub fn new(team_id: &str, file_path: &str, file_type: &str, mime_type: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            team_id: team_id.to_string(),
            file_path: file_path.to_string(),
            file_type: file_type.to_string(),
            mime_type: mime_type.to_string(),
        }
    }
}

/// Per-target detail for status displays
#[derive(Debug, Clone, Serialize)]
pub struct TargetDetail {
    pub target_id: String,
    pub social_profile_id: String,
    pub status: TargetStatus,
    pub attempt_count: u32,
    pub next_attempt_at: Option<i64>,
    pub published_at: Option<i64>,
    pub platform_post_id: Option<String>,
    pub last_reason: Option<String>,
    pub response_log: Vec<LogEntry>,
}

impl From<PostTarget> for TargetDetail {
    fn from(target: PostTarget) -> Self {
        let last_reason = target
            .response_log
            .iter()
            .rev()
            .find_map(|entry| entry.reason.clone());

        Self {
            target_id: target.id,
            social_profile_id: target.social_profile_id,
            status: target.status,
            attempt_count: target.attempt_count,
            next_attempt_at: target.next_attempt_at,
            published_at: target.published_at,
            platform_post_id: target.platform_post_id,
            last_reason,
            response_log: target.response_log,
        }
    }
}

/// Aggregate status of a post plus the state of every target
#[derive(Debug, Clone, Serialize)]
pub struct PostStatusReport {
    pub post_id: String,
    pub team_id: String,
    pub status: PostStatus,
    pub scheduled_at: Option<i64>,
    pub deleted: bool,
    pub targets: Vec<TargetDetail>,
}
