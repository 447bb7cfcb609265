//! Dispatch loop
//!
//! One cycle, in order:
//!
//! 1. hand stale claims back to the queue as `retrying`
//! 2. expand due scheduled posts that have no targets yet
//! 3. select due targets (bounded by the batch size)
//! 4. per target, on its own task under the concurrency semaphore: claim,
//!    execute, decide, resolve, and recompute the post status when the
//!    target became terminal
//!
//! Several dispatchers may share one database. Exclusivity comes from the
//! conditional claim and the token-guarded resolve in [`Database`], not from
//! anything held in memory.

use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::DispatchConfig;
use crate::db::{Database, TargetResolution};
use crate::error::Result;
use crate::media::MediaUrlResolver;
use crate::pipeline::events::{EventBus, PipelineEvent};
use crate::pipeline::executor::{ExecutionOutcome, PublishExecutor};
use crate::pipeline::expander::TargetExpander;
use crate::pipeline::retry::{RetryDecision, RetryScheduler};
use crate::platforms::PlatformRegistry;
use crate::types::{LogEntry, LogEvent, PostStatus, PostTarget, TargetStatus};

/// Longest uninterrupted sleep between shutdown checks
const SHUTDOWN_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// What a single cycle did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    /// Stale claims handed back to the queue
    pub recovered: usize,
    /// Posts expanded into targets this cycle
    pub expanded: usize,
    /// Posts failed because their team had no connected profile
    pub expansion_failed: usize,
    pub selected: usize,
    pub claimed: usize,
    /// Claims lost to another worker
    pub skipped: usize,
    pub published: usize,
    pub retried: usize,
    pub failed: usize,
    /// Outcomes discarded because the claim was recovered mid-flight
    pub lost: usize,
    pub errors: usize,
}

impl CycleReport {
    pub fn is_idle(&self) -> bool {
        *self == Self::default()
    }

    fn record(&mut self, outcome: TaskOutcome) {
        match outcome {
            TaskOutcome::Skipped => self.skipped += 1,
            TaskOutcome::Lost => {
                self.claimed += 1;
                self.lost += 1;
            }
            TaskOutcome::Published => {
                self.claimed += 1;
                self.published += 1;
            }
            TaskOutcome::Retried => {
                self.claimed += 1;
                self.retried += 1;
            }
            TaskOutcome::Failed => {
                self.claimed += 1;
                self.failed += 1;
            }
        }
    }
}

/// How one target task ended. Resolved outcomes mirror [`RetryDecision`],
/// so a task can only report a status the resolve actually wrote.
enum TaskOutcome {
    Skipped,
    Lost,
    Published,
    Retried,
    Failed,
}

impl From<&RetryDecision> for TaskOutcome {
    fn from(decision: &RetryDecision) -> Self {
        match decision {
            RetryDecision::Publish => TaskOutcome::Published,
            RetryDecision::Retry { .. } => TaskOutcome::Retried,
            RetryDecision::GiveUp => TaskOutcome::Failed,
        }
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    db: Database,
    expander: TargetExpander,
    executor: Arc<PublishExecutor>,
    scheduler: Arc<RetryScheduler>,
    events: EventBus,
    config: DispatchConfig,
    semaphore: Arc<Semaphore>,
    trigger: Arc<Notify>,
}

impl Dispatcher {
    pub fn new(
        db: Database,
        platforms: PlatformRegistry,
        media: MediaUrlResolver,
        config: &DispatchConfig,
        events: EventBus,
    ) -> Self {
        let executor = PublishExecutor::new(db.clone(), platforms, media, config.execution_timeout());

        Self {
            expander: TargetExpander::new(db.clone()),
            db,
            executor: Arc::new(executor),
            scheduler: Arc::new(RetryScheduler::from_config(config)),
            events,
            config: config.clone(),
            semaphore: Arc::new(Semaphore::new(config.concurrency())),
            trigger: Arc::new(Notify::new()),
        }
    }

    /// Replace the retry scheduler, e.g. with a seeded one
    pub fn with_scheduler(mut self, scheduler: RetryScheduler) -> Self {
        self.scheduler = Arc::new(scheduler);
        self
    }

    /// Wake the loop for an immediate cycle. A trigger fired while a cycle
    /// is running is remembered and starts the next cycle right away.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// Run cycles until `shutdown` is set
    pub async fn run(&self, shutdown: Arc<AtomicBool>) {
        info!(
            poll_interval_secs = self.config.poll_interval_secs,
            concurrency = self.config.concurrency,
            batch_size = self.config.batch_size,
            "Dispatch loop started"
        );

        loop {
            if shutdown.load(Ordering::Relaxed) {
                info!("Shutdown requested, stopping dispatch loop");
                break;
            }

            let now = Utc::now().timestamp();
            match self.run_cycle(now).await {
                Ok(report) if report.is_idle() => debug!("Nothing due"),
                Ok(report) => log_report(&report),
                Err(e) => error!(error = %e, "Dispatch cycle failed"),
            }

            self.wait_for_next_cycle(&shutdown).await;
        }
    }

    async fn wait_for_next_cycle(&self, shutdown: &AtomicBool) {
        let deadline = Instant::now() + self.config.poll_interval();

        while !shutdown.load(Ordering::Relaxed) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return;
            }

            tokio::select! {
                _ = self.trigger.notified() => {
                    debug!("Dispatch triggered");
                    return;
                }
                _ = tokio::time::sleep(remaining.min(SHUTDOWN_CHECK_INTERVAL)) => {}
            }
        }
    }

    /// Run one full cycle as of `now`
    ///
    /// Per-target failures are counted in the report and never fail the
    /// cycle. Errors are returned only when the due-work queries themselves
    /// fail.
    pub async fn run_cycle(&self, now: i64) -> Result<CycleReport> {
        let started = Instant::now();
        let mut report = CycleReport {
            recovered: self.recover_stale_claims(now).await?,
            ..Default::default()
        };

        let (expanded, expansion_failed) = self.expand_due_posts(now).await?;
        report.expanded = expanded;
        report.expansion_failed = expansion_failed;

        let due = self.db.due_targets(now, self.config.batch_size()).await?;
        report.selected = due.len();

        let mut tasks = JoinSet::new();
        for target in due {
            let Ok(permit) = self.semaphore.clone().acquire_owned().await else {
                break;
            };
            let this = self.clone();
            tasks.spawn(async move {
                let _permit = permit;
                this.process_target(target, now, started).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(outcome)) => report.record(outcome),
                Ok(Err(e)) => {
                    error!(error = %e, "Target processing failed");
                    report.errors += 1;
                }
                Err(e) => {
                    error!(error = %e, "Target task panicked");
                    report.errors += 1;
                }
            }
        }

        Ok(report)
    }

    /// Hand claims older than the stale threshold back to the queue
    async fn recover_stale_claims(&self, now: i64) -> Result<usize> {
        let cutoff = now.saturating_sub(self.config.stale_after_secs);
        let mut recovered = 0;

        for target in self.db.stale_claims(cutoff).await? {
            let Some(token) = target.claim_token.as_deref() else {
                continue;
            };

            let entry = LogEntry {
                at: now,
                attempt: target.attempt_count,
                event: LogEvent::StaleClaimRecovered,
                reason: Some(format!(
                    "claimed at {} and never resolved",
                    target.claimed_at.unwrap_or_default()
                )),
                decision: Some(RetryDecision::Retry { next_attempt_at: now }.describe()),
                platform_post_id: None,
            };

            if self.db.release_stale_claim(&target.id, token, &entry, now).await? {
                warn!(
                    target_id = %target.id,
                    post_id = %target.post_id,
                    claimed_at = ?target.claimed_at,
                    "Recovered stale claim"
                );
                self.events.emit(PipelineEvent::StaleClaimRecovered {
                    target_id: target.id.clone(),
                    post_id: target.post_id.clone(),
                    claimed_at: target.claimed_at,
                });
                recovered += 1;
            }
        }

        Ok(recovered)
    }

    /// Expand due posts that have no targets over their team's connected
    /// profiles. Returns (expanded, failed for lack of profiles).
    async fn expand_due_posts(&self, now: i64) -> Result<(usize, usize)> {
        let mut expanded = 0;
        let mut failed = 0;

        for post in self
            .db
            .due_posts_without_targets(now, self.config.batch_size())
            .await?
        {
            let profile_ids: Vec<String> = self
                .db
                .get_connected_profiles(&post.team_id)
                .await?
                .into_iter()
                .map(|p| p.id)
                .collect();

            if profile_ids.is_empty() {
                if self.db.finalize_post(&post.id, PostStatus::Failed, now).await? {
                    warn!(post_id = %post.id, team_id = %post.team_id, "No connected profiles, post failed");
                    self.events.emit(PipelineEvent::PostResolved {
                        post_id: post.id.clone(),
                        status: PostStatus::Failed,
                    });
                    failed += 1;
                }
                continue;
            }

            match self.expander.expand_stored(&post, &profile_ids, now).await {
                Ok(targets) => {
                    info!(post_id = %post.id, targets = targets.len(), "Expanded due post");
                    expanded += 1;
                }
                // Usually another worker expanded the same post first
                Err(e) => warn!(post_id = %post.id, error = %e, "Could not expand post"),
            }
        }

        Ok((expanded, failed))
    }

    async fn process_target(
        &self,
        target: PostTarget,
        now: i64,
        started: Instant,
    ) -> Result<TaskOutcome> {
        // Queued tasks claim later than the cycle started; stale recovery
        // measures from this instant
        let claimed_at = elapsed_since(now, started);
        let Some(claim) = self.db.claim_target(&target, claimed_at).await? else {
            debug!(target_id = %target.id, "Target already claimed elsewhere");
            return Ok(TaskOutcome::Skipped);
        };

        let attempt = target.attempt_count + 1;
        self.events.emit(PipelineEvent::TargetClaimed {
            target_id: target.id.clone(),
            post_id: target.post_id.clone(),
            attempt,
        });

        let outcome = self.executor.execute(&target, claimed_at).await;
        let resolved_at = elapsed_since(now, started);

        let mut decision = self.scheduler.decide(attempt, &outcome, resolved_at);
        let mut reason = outcome.reason().map(str::to_string);

        if matches!(decision, RetryDecision::Retry { .. }) && self.post_deleted(&target.post_id).await? {
            decision = RetryDecision::GiveUp;
            reason = Some("post_deleted".to_string());
        }

        let (status, next_attempt_at) = match decision {
            RetryDecision::Publish => (TargetStatus::Published, None),
            RetryDecision::Retry { next_attempt_at } => (TargetStatus::Retrying, Some(next_attempt_at)),
            RetryDecision::GiveUp => (TargetStatus::Failed, None),
        };

        let (event, platform_post_id) = match &outcome {
            ExecutionOutcome::Success { platform_post_id } => {
                (LogEvent::Published, Some(platform_post_id.clone()))
            }
            ExecutionOutcome::TransientFailure { .. } => (LogEvent::TransientFailure, None),
            ExecutionOutcome::PermanentFailure { .. } => (LogEvent::PermanentFailure, None),
        };

        let resolution = TargetResolution {
            target_id: target.id.clone(),
            claim_token: claim.token,
            status,
            next_attempt_at,
            published_at: (status == TargetStatus::Published).then_some(resolved_at),
            platform_post_id: platform_post_id.clone(),
            log_entry: LogEntry {
                at: resolved_at,
                attempt,
                event,
                reason: reason.clone(),
                decision: Some(decision.describe()),
                platform_post_id,
            },
            now: resolved_at,
        };

        if !self.db.resolve_target(&resolution).await? {
            warn!(
                target_id = %target.id,
                status = %status,
                "Claim was recovered while executing, outcome discarded"
            );
            return Ok(TaskOutcome::Lost);
        }

        match decision {
            RetryDecision::Publish => info!(target_id = %target.id, attempt, "Target published"),
            RetryDecision::Retry { next_attempt_at } => info!(
                target_id = %target.id,
                attempt,
                next_attempt_at,
                reason = ?reason,
                "Target will be retried"
            ),
            RetryDecision::GiveUp => {
                warn!(target_id = %target.id, attempt, reason = ?reason, "Target failed")
            }
        }

        self.events.emit(PipelineEvent::TargetResolved {
            target_id: target.id.clone(),
            post_id: target.post_id.clone(),
            status,
            attempt_count: attempt,
            next_attempt_at,
            reason,
        });

        if status.is_terminal() {
            self.finalize_post(&target.post_id, resolved_at).await?;
        }

        Ok(TaskOutcome::from(&decision))
    }

    async fn post_deleted(&self, post_id: &str) -> Result<bool> {
        Ok(self
            .db
            .get_post(post_id)
            .await?
            .map_or(true, |post| post.is_deleted()))
    }

    /// Recompute the post status from its targets, writing it once every
    /// target is terminal
    async fn finalize_post(&self, post_id: &str, now: i64) -> Result<Option<PostStatus>> {
        let statuses: Vec<TargetStatus> = self
            .db
            .get_targets_for_post(post_id)
            .await?
            .iter()
            .map(|t| t.status)
            .collect();

        let Some(status) = PostStatus::aggregate(&statuses) else {
            return Ok(None);
        };

        if self.db.finalize_post(post_id, status, now).await? {
            info!(post_id = %post_id, status = %status, "Post resolved");
            self.events.emit(PipelineEvent::PostResolved {
                post_id: post_id.to_string(),
                status,
            });
            return Ok(Some(status));
        }

        Ok(None)
    }
}

/// Cycle start time advanced by the wall time spent in the cycle so far
fn elapsed_since(now: i64, started: Instant) -> i64 {
    now.saturating_add(i64::try_from(started.elapsed().as_secs()).unwrap_or(0))
}

fn log_report(report: &CycleReport) {
    info!(
        recovered = report.recovered,
        expanded = report.expanded,
        expansion_failed = report.expansion_failed,
        claimed = report.claimed,
        skipped = report.skipped,
        published = report.published,
        retried = report.retried,
        failed = report.failed,
        lost = report.lost,
        errors = report.errors,
        "Dispatch cycle complete"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_idle() {
        assert!(CycleReport::default().is_idle());

        let mut report = CycleReport::default();
        report.record(TaskOutcome::Skipped);
        assert!(!report.is_idle());
    }

    #[test]
    fn test_report_record_counts() {
        let mut report = CycleReport::default();
        report.record(TaskOutcome::Published);
        report.record(TaskOutcome::Retried);
        report.record(TaskOutcome::Failed);
        report.record(TaskOutcome::Lost);
        report.record(TaskOutcome::Skipped);

        assert_eq!(report.claimed, 4);
        assert_eq!(report.published, 1);
        assert_eq!(report.retried, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.lost, 1);
        assert_eq!(report.skipped, 1);
    }

    #[test]
    fn test_task_outcome_follows_decision() {
        let mut report = CycleReport::default();
        report.record(TaskOutcome::from(&RetryDecision::GiveUp));
        report.record(TaskOutcome::from(&RetryDecision::Retry { next_attempt_at: 10 }));
        report.record(TaskOutcome::from(&RetryDecision::Publish));

        assert_eq!(
            report,
            CycleReport {
                claimed: 3,
                published: 1,
                retried: 1,
                failed: 1,
                ..Default::default()
            }
        );
    }

    #[test]
    fn test_elapsed_since_adds_wall_time() {
        let started = Instant::now() - Duration::from_millis(2500);
        assert_eq!(elapsed_since(100, started), 102);
        assert_eq!(elapsed_since(i64::MAX, started), i64::MAX);
    }
}
