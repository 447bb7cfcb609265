//! Post-publishing pipeline
//!
//! [`PublishPipeline`] is the entry point for callers: it schedules posts
//! (post row, media links and targets in one transaction), reports status,
//! cancels posts and owns the [`Dispatcher`] that does the publishing.
//!
//! # Example
//!
//! ```no_run
//! use libcastline::pipeline::{PublishPipeline, ScheduleRequest};
//! use libcastline::platforms::PlatformRegistry;
//! use libcastline::{Config, Database};
//!
//! # async fn example() -> libcastline::Result<()> {
//! let config = Config::load()?;
//! let db = Database::new(&config.database_path()).await?;
//! let pipeline = PublishPipeline::new(db, PlatformRegistry::from_config(&config)?, &config);
//!
//! let now = chrono::Utc::now().timestamp();
//! let post = pipeline
//!     .schedule_post(
//!         ScheduleRequest {
//!             team_id: "team-1".to_string(),
//!             created_by: "user-1".to_string(),
//!             caption: Some("Hello".to_string()),
//!             media_ids: vec![],
//!             profile_ids: vec!["profile-1".to_string()],
//!             scheduled_at: Some(now + 3600),
//!             draft: false,
//!         },
//!         now,
//!     )
//!     .await?;
//!
//! let status = pipeline.get_post_status(&post.id).await?;
//! println!("{}: {}", status.post_id, status.status);
//! # Ok(())
//! # }
//! ```

pub mod dispatch;
pub mod events;
pub mod executor;
pub mod expander;
pub mod retry;

pub use dispatch::{CycleReport, Dispatcher};
pub use events::{EventBus, EventReceiver, PipelineEvent};
pub use executor::{ExecutionOutcome, PublishExecutor};
pub use expander::TargetExpander;
pub use retry::{RetryDecision, RetryPolicy, RetryScheduler};

use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::info;

use crate::config::Config;
use crate::db::Database;
use crate::error::{CastlineError, Result};
use crate::media::MediaUrlResolver;
use crate::platforms::PlatformRegistry;
use crate::types::{Post, PostStatus, PostStatusReport, TargetDetail};

/// Longest caption accepted, in characters
pub const MAX_CAPTION_CHARS: usize = 5000;

/// Input for [`PublishPipeline::schedule_post`]
#[derive(Debug, Clone, Default)]
pub struct ScheduleRequest {
    pub team_id: String,
    pub created_by: String,
    pub caption: Option<String>,
    /// Media ids owned by the team, in display order
    pub media_ids: Vec<String>,
    /// Connected social profiles to publish to
    pub profile_ids: Vec<String>,
    /// `None` publishes immediately
    pub scheduled_at: Option<i64>,
    /// Save without dispatching: the post and its media links are stored,
    /// no targets are created and `profile_ids` is ignored
    pub draft: bool,
}

pub struct PublishPipeline {
    db: Database,
    expander: TargetExpander,
    dispatcher: Dispatcher,
    events: EventBus,
}

impl PublishPipeline {
    pub fn new(db: Database, platforms: PlatformRegistry, config: &Config) -> Self {
        let events = EventBus::default();
        let dispatcher = Dispatcher::new(
            db.clone(),
            platforms,
            MediaUrlResolver::from_config(&config.media),
            &config.dispatch,
            events.clone(),
        );

        Self {
            expander: TargetExpander::new(db.clone()),
            db,
            dispatcher,
            events,
        }
    }

    /// Replace the retry scheduler, e.g. with a seeded one
    pub fn with_scheduler(mut self, scheduler: RetryScheduler) -> Self {
        self.dispatcher = self.dispatcher.with_scheduler(scheduler);
        self
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    /// Create a scheduled post together with its targets, or save a draft
    ///
    /// Nothing is written unless the whole request is valid. A scheduled
    /// request without `scheduled_at` is due at `now` and wakes the dispatch
    /// loop. Drafts keep `scheduled_at` as given and are never dispatched.
    ///
    /// # Errors
    ///
    /// - `InvalidInput` for a past schedule time, an empty post, a caption
    ///   over [`MAX_CAPTION_CHARS`], or media the team does not own
    /// - `EmptySelection` / `InvalidTarget` for a bad profile selection
    pub async fn schedule_post(&self, request: ScheduleRequest, now: i64) -> Result<Post> {
        let caption = request
            .caption
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty());

        if caption.is_none() && request.media_ids.is_empty() {
            return Err(CastlineError::InvalidInput(
                "A post needs a caption or at least one media item".to_string(),
            ));
        }

        if let Some(text) = &caption {
            let chars = text.chars().count();
            if chars > MAX_CAPTION_CHARS {
                return Err(CastlineError::InvalidInput(format!(
                    "Caption is {} characters; the limit is {}",
                    chars, MAX_CAPTION_CHARS
                )));
            }
        }

        if let Some(at) = request.scheduled_at {
            if at <= now {
                return Err(CastlineError::InvalidInput(format!(
                    "scheduled_at {} is not in the future",
                    at
                )));
            }
        }

        let mut seen = HashSet::new();
        if let Some(dup) = request.media_ids.iter().find(|id| !seen.insert(id.as_str())) {
            return Err(CastlineError::InvalidInput(format!(
                "media item '{}' is attached more than once",
                dup
            )));
        }

        let owned = self
            .db
            .count_team_media(&request.team_id, &request.media_ids)
            .await?;
        if owned != request.media_ids.len() {
            return Err(CastlineError::InvalidInput(format!(
                "{} of {} media items do not belong to team '{}'",
                request.media_ids.len() - owned,
                request.media_ids.len(),
                request.team_id
            )));
        }

        let mut post = Post::new(&request.team_id, &request.created_by, caption);
        post.media_ids = request.media_ids;
        post.created_at = now;
        post.updated_at = now;

        if request.draft {
            post.scheduled_at = request.scheduled_at;
            self.db.create_post_with_targets(&post, &[]).await?;
            info!(post_id = %post.id, team_id = %post.team_id, "Draft saved");
            return Ok(post);
        }

        let immediate = request.scheduled_at.is_none();
        let scheduled_at = request.scheduled_at.unwrap_or(now);
        post.status = PostStatus::Scheduled;
        post.scheduled_at = Some(scheduled_at);

        let targets = self.expander.expand(&post, &request.profile_ids, now).await?;
        self.db.create_post_with_targets(&post, &targets).await?;

        info!(
            post_id = %post.id,
            team_id = %post.team_id,
            targets = targets.len(),
            scheduled_at,
            "Post scheduled"
        );

        self.events.emit(PipelineEvent::PostScheduled {
            post_id: post.id.clone(),
            targets: targets.len(),
            scheduled_at,
        });

        if immediate {
            self.dispatcher.trigger();
        }

        Ok(post)
    }

    /// Aggregate status plus per-target detail
    pub async fn get_post_status(&self, post_id: &str) -> Result<PostStatusReport> {
        let post = self
            .db
            .get_post(post_id)
            .await?
            .ok_or_else(|| CastlineError::NotFound(format!("post '{}'", post_id)))?;

        let targets = self
            .db
            .get_targets_for_post(post_id)
            .await?
            .into_iter()
            .map(TargetDetail::from)
            .collect();

        Ok(PostStatusReport {
            post_id: post.id,
            team_id: post.team_id,
            status: post.status,
            scheduled_at: post.scheduled_at,
            deleted: post.deleted_at.is_some(),
            targets,
        })
    }

    /// Soft-delete a post. In-flight attempts finish; nothing new is claimed.
    pub async fn cancel_post(&self, post_id: &str, now: i64) -> Result<()> {
        if self.db.soft_delete_post(post_id, now).await? {
            info!(post_id = %post_id, "Post cancelled");
            self.events.emit(PipelineEvent::PostCancelled {
                post_id: post_id.to_string(),
            });
            return Ok(());
        }

        match self.db.get_post(post_id).await? {
            Some(_) => Err(CastlineError::InvalidInput(format!(
                "post '{}' is already cancelled",
                post_id
            ))),
            None => Err(CastlineError::NotFound(format!("post '{}'", post_id))),
        }
    }

    pub async fn run_cycle(&self, now: i64) -> Result<CycleReport> {
        self.dispatcher.run_cycle(now).await
    }

    /// Run the dispatch loop until `shutdown` is set
    pub async fn run(&self, shutdown: Arc<AtomicBool>) {
        self.dispatcher.run(shutdown).await;
    }
}
