//! Database operations for Castline
//!
//! Every query the pipeline relies on lives here as one method. The two that
//! carry the concurrency guarantees are [`Database::claim_target`] and
//! [`Database::resolve_target`]: both are single conditional `UPDATE`s, so
//! any number of dispatch workers can share one database file.

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{DbError, Result};
use crate::types::{
    LogEntry, Media, PlatformKind, Post, PostStatus, PostTarget, SocialProfile, TargetStatus,
};

/// Columns selected for every `PostTarget` read
const TARGET_COLUMNS: &str = r#"
    t.id, t.team_id, t.post_id, t.social_profile_id, t.status, t.attempt_count,
    t.next_attempt_at, t.claimed_at, t.claim_token, t.response_log, t.published_at,
    t.platform_post_id, t.created_at, t.updated_at
"#;

/// Proof of a successful claim, needed to resolve the target afterwards
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub target_id: String,
    pub token: String,
    pub claimed_at: i64,
}

/// Final write for one executed attempt
///
/// Applied together with the attempt increment and the log append, so a
/// target never shows a bumped `attempt_count` while still `processing`.
#[derive(Debug, Clone)]
pub struct TargetResolution {
    pub target_id: String,
    pub claim_token: String,
    /// One of `Published`, `Retrying` or `Failed`
    pub status: TargetStatus,
    pub next_attempt_at: Option<i64>,
    pub published_at: Option<i64>,
    pub platform_post_id: Option<String>,
    pub log_entry: LogEntry,
    pub now: i64,
}

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (or create) the database at `db_path` and run migrations
    pub async fn new(db_path: &str) -> Result<Self> {
        let expanded_path = shellexpand::tilde(db_path).to_string();
        let path = Path::new(&expanded_path);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(DbError::IoError)?;
            }
        }

        // Use forward slashes for SQLite URL (works on both Windows and Unix)
        let db_url = format!("sqlite://{}", expanded_path.replace('\\', "/"));
        let options = SqliteConnectOptions::from_str(&db_url)
            .map_err(DbError::SqlxError)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(DbError::SqlxError)?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(DbError::MigrationError)?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ------------------------------------------------------------------
    // Social profiles
    // ------------------------------------------------------------------

    /// Insert or refresh a connected profile
    pub async fn upsert_profile(&self, profile: &SocialProfile) -> Result<()> {
        let now = chrono::Utc::now().timestamp();

        sqlx::query(
            r#"
            INSERT INTO social_profiles (
                id, team_id, platform, provider_id, name, handle, access_token,
                refresh_token, token_expires_at, is_connected, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                handle = excluded.handle,
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                token_expires_at = excluded.token_expires_at,
                is_connected = excluded.is_connected,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&profile.id)
        .bind(&profile.team_id)
        .bind(profile.platform.as_str())
        .bind(&profile.provider_id)
        .bind(&profile.name)
        .bind(&profile.handle)
        .bind(&profile.access_token)
        .bind(&profile.refresh_token)
        .bind(profile.token_expires_at)
        .bind(i64::from(profile.is_connected))
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    pub async fn get_profile(&self, profile_id: &str) -> Result<Option<SocialProfile>> {
        let row = sqlx::query(
            r#"
            SELECT id, team_id, platform, provider_id, name, handle, access_token,
                   refresh_token, token_expires_at, is_connected
            FROM social_profiles WHERE id = ?
            "#,
        )
        .bind(profile_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        row.as_ref().map(row_to_profile).transpose()
    }

    /// Profiles of a team that are currently connected
    pub async fn get_connected_profiles(&self, team_id: &str) -> Result<Vec<SocialProfile>> {
        let rows = sqlx::query(
            r#"
            SELECT id, team_id, platform, provider_id, name, handle, access_token,
                   refresh_token, token_expires_at, is_connected
            FROM social_profiles
            WHERE team_id = ? AND is_connected = 1
            ORDER BY created_at, id
            "#,
        )
        .bind(team_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(row_to_profile).collect()
    }

    pub async fn set_profile_connected(&self, profile_id: &str, connected: bool) -> Result<()> {
        sqlx::query("UPDATE social_profiles SET is_connected = ?, updated_at = ? WHERE id = ?")
            .bind(i64::from(connected))
            .bind(chrono::Utc::now().timestamp())
            .bind(profile_id)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(())
    }

    // ------------------------------------------------------------------
    // Media
    // ------------------------------------------------------------------

    pub async fn insert_media(&self, media: &Media) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO media (id, team_id, file_path, file_type, mime_type, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&media.id)
        .bind(&media.team_id)
        .bind(&media.file_path)
        .bind(&media.file_type)
        .bind(&media.mime_type)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// Media attached to a post, in display order
    pub async fn get_post_media(&self, post_id: &str) -> Result<Vec<Media>> {
        let rows = sqlx::query(
            r#"
            SELECT m.id, m.team_id, m.file_path, m.file_type, m.mime_type
            FROM post_media pm
            JOIN media m ON m.id = pm.media_id
            WHERE pm.post_id = ?
            ORDER BY pm.position
            "#,
        )
        .bind(post_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(rows
            .iter()
            .map(|r| Media {
                id: r.get("id"),
                team_id: r.get("team_id"),
                file_path: r.get("file_path"),
                file_type: r.get("file_type"),
                mime_type: r.get("mime_type"),
            })
            .collect())
    }

    /// How many distinct ids in `media_ids` name media owned by `team_id`
    pub async fn count_team_media(&self, team_id: &str, media_ids: &[String]) -> Result<usize> {
        if media_ids.is_empty() {
            return Ok(0);
        }

        let placeholders = vec!["?"; media_ids.len()].join(", ");
        let query_str = format!(
            "SELECT COUNT(*) AS owned FROM media WHERE team_id = ? AND id IN ({})",
            placeholders
        );

        let mut query = sqlx::query(&query_str).bind(team_id);
        for media_id in media_ids {
            query = query.bind(media_id);
        }

        let row = query.fetch_one(&self.pool).await.map_err(DbError::SqlxError)?;
        let owned: i64 = row.get("owned");
        usize::try_from(owned).map_err(|_| DbError::CorruptRow(format!("media count {}", owned)).into())
    }

    // ------------------------------------------------------------------
    // Posts
    // ------------------------------------------------------------------

    /// Insert a post, its media links and its targets in one transaction.
    ///
    /// Either everything is written or nothing is.
    pub async fn create_post_with_targets(&self, post: &Post, targets: &[PostTarget]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(DbError::SqlxError)?;

        sqlx::query(
            r#"
            INSERT INTO posts (
                id, team_id, created_by, caption, post_type, scheduled_at, status,
                created_at, updated_at, deleted_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&post.id)
        .bind(&post.team_id)
        .bind(&post.created_by)
        .bind(&post.caption)
        .bind(&post.post_type)
        .bind(post.scheduled_at)
        .bind(post.status.as_str())
        .bind(post.created_at)
        .bind(post.updated_at)
        .bind(post.deleted_at)
        .execute(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        for (position, media_id) in post.media_ids.iter().enumerate() {
            sqlx::query("INSERT INTO post_media (post_id, media_id, position) VALUES (?, ?, ?)")
                .bind(&post.id)
                .bind(media_id)
                .bind(position as i64)
                .execute(&mut *tx)
                .await
                .map_err(DbError::SqlxError)?;
        }

        for target in targets {
            insert_target(&mut tx, target).await?;
        }

        tx.commit().await.map_err(DbError::SqlxError)?;
        Ok(())
    }

    pub async fn get_post(&self, post_id: &str) -> Result<Option<Post>> {
        let row = sqlx::query(
            r#"
            SELECT id, team_id, created_by, caption, post_type, scheduled_at, status,
                   created_at, updated_at, deleted_at
            FROM posts WHERE id = ?
            "#,
        )
        .bind(post_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let mut post = row_to_post(&row)?;
        post.media_ids = self.get_post_media_ids(post_id).await?;
        Ok(Some(post))
    }

    async fn get_post_media_ids(&self, post_id: &str) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT media_id FROM post_media WHERE post_id = ? ORDER BY position")
            .bind(post_id)
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(rows.iter().map(|r| r.get("media_id")).collect())
    }

    /// List posts, newest first, optionally filtered by team and status.
    /// Soft-deleted posts are left out.
    pub async fn list_posts(
        &self,
        team_id: Option<&str>,
        status: Option<PostStatus>,
        limit: usize,
    ) -> Result<Vec<Post>> {
        let mut where_clauses = vec!["deleted_at IS NULL"];
        if team_id.is_some() {
            where_clauses.push("team_id = ?");
        }
        if status.is_some() {
            where_clauses.push("status = ?");
        }

        let query_str = format!(
            r#"
            SELECT id, team_id, created_by, caption, post_type, scheduled_at, status,
                   created_at, updated_at, deleted_at
            FROM posts
            WHERE {}
            ORDER BY created_at DESC, id
            LIMIT ?
            "#,
            where_clauses.join(" AND ")
        );

        let mut query = sqlx::query(&query_str);
        if let Some(team) = team_id {
            query = query.bind(team);
        }
        if let Some(s) = status {
            query = query.bind(s.as_str());
        }
        query = query.bind(limit as i64);

        let rows = query.fetch_all(&self.pool).await.map_err(DbError::SqlxError)?;
        rows.iter().map(row_to_post).collect()
    }

    /// Scheduled posts whose time has come but which have no targets yet
    pub async fn due_posts_without_targets(&self, now: i64, limit: i64) -> Result<Vec<Post>> {
        let rows = sqlx::query(
            r#"
            SELECT p.id, p.team_id, p.created_by, p.caption, p.post_type, p.scheduled_at,
                   p.status, p.created_at, p.updated_at, p.deleted_at
            FROM posts p
            WHERE p.status = 'scheduled'
              AND p.deleted_at IS NULL
              AND (p.scheduled_at IS NULL OR p.scheduled_at <= ?)
              AND NOT EXISTS (SELECT 1 FROM post_targets t WHERE t.post_id = p.id)
            ORDER BY p.scheduled_at, p.created_at
            LIMIT ?
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(row_to_post).collect()
    }

    /// Move a scheduled post to its final status. Returns false when the
    /// post was already finalized by another worker.
    pub async fn finalize_post(&self, post_id: &str, status: PostStatus, now: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE posts SET status = ?, updated_at = ? WHERE id = ? AND status = 'scheduled'",
        )
        .bind(status.as_str())
        .bind(now)
        .bind(post_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// Soft-delete a post. Returns false if it was missing or already deleted.
    pub async fn soft_delete_post(&self, post_id: &str, now: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE posts SET deleted_at = ?, updated_at = ? WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(now)
        .bind(now)
        .bind(post_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    // ------------------------------------------------------------------
    // Targets
    // ------------------------------------------------------------------

    /// Insert targets for an existing post, all or nothing
    pub async fn insert_targets(&self, targets: &[PostTarget]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(DbError::SqlxError)?;
        for target in targets {
            insert_target(&mut tx, target).await?;
        }
        tx.commit().await.map_err(DbError::SqlxError)?;
        Ok(())
    }

    pub async fn get_target(&self, target_id: &str) -> Result<Option<PostTarget>> {
        let query_str = format!("SELECT {} FROM post_targets t WHERE t.id = ?", TARGET_COLUMNS);
        let row = sqlx::query(&query_str)
            .bind(target_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        row.as_ref().map(row_to_target).transpose()
    }

    pub async fn get_targets_for_post(&self, post_id: &str) -> Result<Vec<PostTarget>> {
        let query_str = format!(
            "SELECT {} FROM post_targets t WHERE t.post_id = ? ORDER BY t.created_at, t.id",
            TARGET_COLUMNS
        );
        let rows = sqlx::query(&query_str)
            .bind(post_id)
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        rows.iter().map(row_to_target).collect()
    }

    /// Targets that are claimable now: pending or retrying, past their
    /// next attempt time, on a live scheduled post whose time has come
    pub async fn due_targets(&self, now: i64, limit: i64) -> Result<Vec<PostTarget>> {
        let query_str = format!(
            r#"
            SELECT {}
            FROM post_targets t
            JOIN posts p ON p.id = t.post_id
            WHERE t.status IN ('pending', 'retrying')
              AND (t.next_attempt_at IS NULL OR t.next_attempt_at <= ?)
              AND p.status = 'scheduled'
              AND p.deleted_at IS NULL
              AND (p.scheduled_at IS NULL OR p.scheduled_at <= ?)
            ORDER BY COALESCE(t.next_attempt_at, p.scheduled_at, t.created_at), t.created_at, t.id
            LIMIT ?
            "#,
            TARGET_COLUMNS
        );

        let rows = sqlx::query(&query_str)
            .bind(now)
            .bind(now)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        rows.iter().map(row_to_target).collect()
    }

    /// Atomically move a target from the state in `snapshot` to processing.
    ///
    /// The update only matches if the row still has the status and attempt
    /// count seen in the snapshot, is due, and its post is not deleted.
    /// Exactly one of any number of racing callers gets `Some(claim)`.
    pub async fn claim_target(&self, snapshot: &PostTarget, now: i64) -> Result<Option<Claim>> {
        if !snapshot.status.is_claimable() {
            return Ok(None);
        }

        let token = uuid::Uuid::new_v4().to_string();
        let result = sqlx::query(
            r#"
            UPDATE post_targets
            SET status = 'processing', claimed_at = ?, claim_token = ?, updated_at = ?
            WHERE id = ?
              AND status = ?
              AND attempt_count = ?
              AND (next_attempt_at IS NULL OR next_attempt_at <= ?)
              AND EXISTS (
                  SELECT 1 FROM posts p
                  WHERE p.id = post_targets.post_id AND p.deleted_at IS NULL
              )
            "#,
        )
        .bind(now)
        .bind(&token)
        .bind(now)
        .bind(&snapshot.id)
        .bind(snapshot.status.as_str())
        .bind(i64::from(snapshot.attempt_count))
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        if result.rows_affected() == 1 {
            Ok(Some(Claim {
                target_id: snapshot.id.clone(),
                token,
                claimed_at: now,
            }))
        } else {
            Ok(None)
        }
    }

    /// Record the outcome of an executed attempt.
    ///
    /// Increments `attempt_count`, appends the log entry, applies the new
    /// status and releases the claim. Returns false if the claim no longer
    /// belongs to the caller (it was recovered as stale in the meantime).
    pub async fn resolve_target(&self, resolution: &TargetResolution) -> Result<bool> {
        let line = format!("{}\n", resolution.log_entry.to_line());

        let result = sqlx::query(
            r#"
            UPDATE post_targets
            SET status = ?,
                attempt_count = attempt_count + 1,
                next_attempt_at = ?,
                published_at = ?,
                platform_post_id = COALESCE(?, platform_post_id),
                response_log = response_log || ?,
                claimed_at = NULL,
                claim_token = NULL,
                updated_at = ?
            WHERE id = ? AND status = 'processing' AND claim_token = ?
            "#,
        )
        .bind(resolution.status.as_str())
        .bind(resolution.next_attempt_at)
        .bind(resolution.published_at)
        .bind(&resolution.platform_post_id)
        .bind(line)
        .bind(resolution.now)
        .bind(&resolution.target_id)
        .bind(&resolution.claim_token)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// Targets stuck in processing with a claim older than `cutoff`
    pub async fn stale_claims(&self, cutoff: i64) -> Result<Vec<PostTarget>> {
        let query_str = format!(
            r#"
            SELECT {} FROM post_targets t
            WHERE t.status = 'processing' AND t.claimed_at < ?
            ORDER BY t.claimed_at
            "#,
            TARGET_COLUMNS
        );

        let rows = sqlx::query(&query_str)
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        rows.iter().map(row_to_target).collect()
    }

    /// Hand a stale claim back to the queue as `retrying`, due immediately.
    ///
    /// `attempt_count` is untouched: the interrupted attempt never reported
    /// an outcome. Returns false if the claim was resolved in the meantime.
    pub async fn release_stale_claim(
        &self,
        target_id: &str,
        claim_token: &str,
        log_entry: &LogEntry,
        now: i64,
    ) -> Result<bool> {
        let line = format!("{}\n", log_entry.to_line());

        let result = sqlx::query(
            r#"
            UPDATE post_targets
            SET status = 'retrying',
                next_attempt_at = ?,
                claimed_at = NULL,
                claim_token = NULL,
                response_log = response_log || ?,
                updated_at = ?
            WHERE id = ? AND status = 'processing' AND claim_token = ?
            "#,
        )
        .bind(now)
        .bind(line)
        .bind(now)
        .bind(target_id)
        .bind(claim_token)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }
}

async fn insert_target(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    target: &PostTarget,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO post_targets (
            id, team_id, post_id, social_profile_id, status, attempt_count,
            next_attempt_at, response_log, created_at, updated_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, '', ?, ?)
        "#,
    )
    .bind(&target.id)
    .bind(&target.team_id)
    .bind(&target.post_id)
    .bind(&target.social_profile_id)
    .bind(target.status.as_str())
    .bind(i64::from(target.attempt_count))
    .bind(target.next_attempt_at)
    .bind(target.created_at)
    .bind(target.updated_at)
    .execute(&mut **tx)
    .await
    .map_err(DbError::SqlxError)?;

    Ok(())
}

fn row_to_post(r: &SqliteRow) -> Result<Post> {
    let status: String = r.get("status");
    Ok(Post {
        id: r.get("id"),
        team_id: r.get("team_id"),
        created_by: r.get("created_by"),
        caption: r.get("caption"),
        post_type: r.get("post_type"),
        scheduled_at: r.get("scheduled_at"),
        status: status.parse().map_err(DbError::CorruptRow)?,
        media_ids: Vec::new(),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
        deleted_at: r.get("deleted_at"),
    })
}

fn row_to_target(r: &SqliteRow) -> Result<PostTarget> {
    let status: String = r.get("status");
    let attempt_count: i64 = r.get("attempt_count");
    let response_log: String = r.get("response_log");

    Ok(PostTarget {
        id: r.get("id"),
        team_id: r.get("team_id"),
        post_id: r.get("post_id"),
        social_profile_id: r.get("social_profile_id"),
        status: status.parse::<TargetStatus>().map_err(DbError::CorruptRow)?,
        attempt_count: u32::try_from(attempt_count)
            .map_err(|_| DbError::CorruptRow(format!("attempt_count {}", attempt_count)))?,
        next_attempt_at: r.get("next_attempt_at"),
        claimed_at: r.get("claimed_at"),
        claim_token: r.get("claim_token"),
        response_log: LogEntry::parse_log(&response_log),
        published_at: r.get("published_at"),
        platform_post_id: r.get("platform_post_id"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    })
}

fn row_to_profile(r: &SqliteRow) -> Result<SocialProfile> {
    let platform: String = r.get("platform");
    Ok(SocialProfile {
        id: r.get("id"),
        team_id: r.get("team_id"),
        platform: platform.parse::<PlatformKind>().map_err(DbError::CorruptRow)?,
        provider_id: r.get("provider_id"),
        name: r.get("name"),
        handle: r.get("handle"),
        access_token: r.get("access_token"),
        refresh_token: r.get("refresh_token"),
        token_expires_at: r.get("token_expires_at"),
        is_connected: r.get::<i64, _>("is_connected") != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CastlineError;
    use crate::types::LogEvent;
    use tempfile::TempDir;

    async fn setup_test_db() -> (TempDir, Database) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let db = Database::new(db_path.to_str().unwrap()).await.unwrap();
        (temp_dir, db)
    }

    async fn seed_profile(db: &Database, team_id: &str) -> SocialProfile {
        let provider = uuid::Uuid::new_v4().to_string();
        let profile = SocialProfile::new(team_id, PlatformKind::Instagram, &provider, "token");
        db.upsert_profile(&profile).await.unwrap();
        profile
    }

    fn scheduled_post(team_id: &str, at: i64) -> Post {
        let mut post = Post::new(team_id, "user-1", Some("Caption".to_string()));
        post.status = PostStatus::Scheduled;
        post.scheduled_at = Some(at);
        post
    }

    fn entry(event: LogEvent) -> LogEntry {
        LogEntry {
            at: 1_000,
            attempt: 1,
            event,
            reason: None,
            decision: None,
            platform_post_id: None,
        }
    }

    #[tokio::test]
    async fn test_profile_round_trip_and_connected_filter() {
        let (_temp, db) = setup_test_db().await;
        let connected = seed_profile(&db, "team-a").await;
        let disconnected = seed_profile(&db, "team-a").await;
        seed_profile(&db, "team-b").await;
        db.set_profile_connected(&disconnected.id, false).await.unwrap();

        let profiles = db.get_connected_profiles("team-a").await.unwrap();
        assert_eq!(profiles.len(), 1);
        assert_eq!(profiles[0].id, connected.id);
        assert_eq!(profiles[0].access_token, "token");

        let fetched = db.get_profile(&disconnected.id).await.unwrap().unwrap();
        assert!(!fetched.is_connected);
    }

    #[tokio::test]
    async fn test_create_post_with_targets_and_media_order() {
        let (_temp, db) = setup_test_db().await;
        let profile = seed_profile(&db, "team-a").await;

        let first = Media::new("team-a", "uploads/b.jpg", "image", "image/jpeg");
        let second = Media::new("team-a", "uploads/a.jpg", "image", "image/jpeg");
        db.insert_media(&first).await.unwrap();
        db.insert_media(&second).await.unwrap();

        let mut post = scheduled_post("team-a", 5_000);
        post.media_ids = vec![first.id.clone(), second.id.clone()];
        let target = PostTarget::pending(&post, &profile.id, 1_000);

        db.create_post_with_targets(&post, std::slice::from_ref(&target))
            .await
            .unwrap();

        let stored = db.get_post(&post.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PostStatus::Scheduled);
        assert_eq!(stored.media_ids, vec![first.id.clone(), second.id.clone()]);

        let media = db.get_post_media(&post.id).await.unwrap();
        assert_eq!(media[0].file_path, "uploads/b.jpg");
        assert_eq!(media[1].file_path, "uploads/a.jpg");

        let targets = db.get_targets_for_post(&post.id).await.unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].status, TargetStatus::Pending);
        assert_eq!(targets[0].attempt_count, 0);
        assert!(targets[0].response_log.is_empty());
    }

    #[tokio::test]
    async fn test_count_team_media_single_query() {
        let (_temp, db) = setup_test_db().await;

        let ours = Media::new("team-a", "uploads/1.jpg", "image", "image/jpeg");
        let also_ours = Media::new("team-a", "uploads/2.mp4", "video", "video/mp4");
        let theirs = Media::new("team-b", "uploads/3.jpg", "image", "image/jpeg");
        for media in [&ours, &also_ours, &theirs] {
            db.insert_media(media).await.unwrap();
        }

        assert_eq!(db.count_team_media("team-a", &[]).await.unwrap(), 0);
        assert_eq!(
            db.count_team_media("team-a", &[ours.id.clone(), also_ours.id.clone()])
                .await
                .unwrap(),
            2
        );
        assert_eq!(
            db.count_team_media(
                "team-a",
                &[ours.id.clone(), theirs.id.clone(), "missing".to_string()]
            )
            .await
            .unwrap(),
            1
        );
        // Repeated ids name one media row
        assert_eq!(
            db.count_team_media("team-a", &[ours.id.clone(), ours.id.clone()])
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_failed_insert_leaves_no_partial_rows() {
        let (_temp, db) = setup_test_db().await;
        let profile = seed_profile(&db, "team-a").await;
        let post = scheduled_post("team-a", 5_000);

        // Second target violates UNIQUE(post_id, social_profile_id)
        let targets = vec![
            PostTarget::pending(&post, &profile.id, 1_000),
            PostTarget::pending(&post, &profile.id, 1_000),
        ];

        let result = db.create_post_with_targets(&post, &targets).await;
        assert!(matches!(result, Err(CastlineError::Database(_))));

        assert!(db.get_post(&post.id).await.unwrap().is_none());
        assert!(db.get_targets_for_post(&post.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_target_requires_existing_profile() {
        let (_temp, db) = setup_test_db().await;
        let post = scheduled_post("team-a", 5_000);
        let target = PostTarget::pending(&post, "no-such-profile", 1_000);

        let result = db.create_post_with_targets(&post, &[target]).await;
        assert!(result.is_err(), "Expected foreign key violation");
        assert!(db.get_post(&post.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_due_targets_filters() {
        let (_temp, db) = setup_test_db().await;
        let profile = seed_profile(&db, "team-a").await;

        let due_post = scheduled_post("team-a", 900);
        let future_post = scheduled_post("team-a", 5_000);
        let deleted_post = scheduled_post("team-a", 900);

        let due = PostTarget::pending(&due_post, &profile.id, 800);
        db.create_post_with_targets(&due_post, std::slice::from_ref(&due))
            .await
            .unwrap();
        db.create_post_with_targets(
            &future_post,
            &[PostTarget::pending(&future_post, &profile.id, 800)],
        )
        .await
        .unwrap();
        db.create_post_with_targets(
            &deleted_post,
            &[PostTarget::pending(&deleted_post, &profile.id, 800)],
        )
        .await
        .unwrap();
        assert!(db.soft_delete_post(&deleted_post.id, 950).await.unwrap());

        let found = db.due_targets(1_000, 10).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, due.id);
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let (_temp, db) = setup_test_db().await;
        let profile = seed_profile(&db, "team-a").await;
        let post = scheduled_post("team-a", 900);
        let target = PostTarget::pending(&post, &profile.id, 800);
        db.create_post_with_targets(&post, std::slice::from_ref(&target))
            .await
            .unwrap();

        let first = db.claim_target(&target, 1_000).await.unwrap();
        let second = db.claim_target(&target, 1_000).await.unwrap();

        assert!(first.is_some());
        assert!(second.is_none());

        let stored = db.get_target(&target.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TargetStatus::Processing);
        assert_eq!(stored.claimed_at, Some(1_000));
        assert_eq!(stored.claim_token, first.map(|c| c.token));
    }

    #[tokio::test]
    async fn test_claim_refused_for_deleted_post() {
        let (_temp, db) = setup_test_db().await;
        let profile = seed_profile(&db, "team-a").await;
        let post = scheduled_post("team-a", 900);
        let target = PostTarget::pending(&post, &profile.id, 800);
        db.create_post_with_targets(&post, std::slice::from_ref(&target))
            .await
            .unwrap();

        db.soft_delete_post(&post.id, 950).await.unwrap();

        assert!(db.claim_target(&target, 1_000).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_resolve_increments_attempt_and_appends_log() {
        let (_temp, db) = setup_test_db().await;
        let profile = seed_profile(&db, "team-a").await;
        let post = scheduled_post("team-a", 900);
        let target = PostTarget::pending(&post, &profile.id, 800);
        db.create_post_with_targets(&post, std::slice::from_ref(&target))
            .await
            .unwrap();

        let claim = db.claim_target(&target, 1_000).await.unwrap().unwrap();
        let resolved = db
            .resolve_target(&TargetResolution {
                target_id: target.id.clone(),
                claim_token: claim.token.clone(),
                status: TargetStatus::Published,
                next_attempt_at: None,
                published_at: Some(1_001),
                platform_post_id: Some("ig-123".to_string()),
                log_entry: entry(LogEvent::Published),
                now: 1_001,
            })
            .await
            .unwrap();
        assert!(resolved);

        let stored = db.get_target(&target.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TargetStatus::Published);
        assert_eq!(stored.attempt_count, 1);
        assert_eq!(stored.published_at, Some(1_001));
        assert_eq!(stored.platform_post_id.as_deref(), Some("ig-123"));
        assert_eq!(stored.claim_token, None);
        assert_eq!(stored.response_log.len(), 1);

        // A second resolve with the same (now released) claim is rejected
        let again = db
            .resolve_target(&TargetResolution {
                target_id: target.id.clone(),
                claim_token: claim.token,
                status: TargetStatus::Failed,
                next_attempt_at: None,
                published_at: None,
                platform_post_id: None,
                log_entry: entry(LogEvent::PermanentFailure),
                now: 1_002,
            })
            .await
            .unwrap();
        assert!(!again);
    }

    #[tokio::test]
    async fn test_published_requires_published_at() {
        let (_temp, db) = setup_test_db().await;
        let profile = seed_profile(&db, "team-a").await;
        let post = scheduled_post("team-a", 900);
        let target = PostTarget::pending(&post, &profile.id, 800);
        db.create_post_with_targets(&post, std::slice::from_ref(&target))
            .await
            .unwrap();

        let claim = db.claim_target(&target, 1_000).await.unwrap().unwrap();
        let result = db
            .resolve_target(&TargetResolution {
                target_id: target.id.clone(),
                claim_token: claim.token,
                status: TargetStatus::Published,
                next_attempt_at: None,
                published_at: None,
                platform_post_id: Some("x".to_string()),
                log_entry: entry(LogEvent::Published),
                now: 1_001,
            })
            .await;

        assert!(result.is_err(), "CHECK constraint should reject published without timestamp");
    }

    #[tokio::test]
    async fn test_stale_claim_release() {
        let (_temp, db) = setup_test_db().await;
        let profile = seed_profile(&db, "team-a").await;
        let post = scheduled_post("team-a", 900);
        let target = PostTarget::pending(&post, &profile.id, 800);
        db.create_post_with_targets(&post, std::slice::from_ref(&target))
            .await
            .unwrap();

        let claim = db.claim_target(&target, 1_000).await.unwrap().unwrap();

        assert!(db.stale_claims(1_000).await.unwrap().is_empty());
        let stale = db.stale_claims(1_001).await.unwrap();
        assert_eq!(stale.len(), 1);

        let released = db
            .release_stale_claim(&target.id, &claim.token, &entry(LogEvent::StaleClaimRecovered), 2_000)
            .await
            .unwrap();
        assert!(released);

        let stored = db.get_target(&target.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TargetStatus::Retrying);
        assert_eq!(stored.next_attempt_at, Some(2_000));
        assert_eq!(stored.attempt_count, 0);
        assert_eq!(stored.claimed_at, None);
    }

    #[tokio::test]
    async fn test_due_posts_without_targets() {
        let (_temp, db) = setup_test_db().await;
        let profile = seed_profile(&db, "team-a").await;

        let bare = scheduled_post("team-a", 900);
        db.create_post_with_targets(&bare, &[]).await.unwrap();

        let expanded = scheduled_post("team-a", 900);
        db.create_post_with_targets(&expanded, &[PostTarget::pending(&expanded, &profile.id, 800)])
            .await
            .unwrap();

        let later = scheduled_post("team-a", 5_000);
        db.create_post_with_targets(&later, &[]).await.unwrap();

        let found = db.due_posts_without_targets(1_000, 10).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, bare.id);
    }

    #[tokio::test]
    async fn test_finalize_post_only_once() {
        let (_temp, db) = setup_test_db().await;
        let post = scheduled_post("team-a", 900);
        db.create_post_with_targets(&post, &[]).await.unwrap();

        assert!(db.finalize_post(&post.id, PostStatus::Published, 1_000).await.unwrap());
        assert!(!db.finalize_post(&post.id, PostStatus::Failed, 1_001).await.unwrap());

        let stored = db.get_post(&post.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PostStatus::Published);
    }

    #[tokio::test]
    async fn test_list_posts_filters() {
        let (_temp, db) = setup_test_db().await;
        let a = scheduled_post("team-a", 900);
        let b = scheduled_post("team-b", 900);
        let mut draft = Post::new("team-a", "user-1", None);
        draft.status = PostStatus::Draft;
        for post in [&a, &b, &draft] {
            db.create_post_with_targets(post, &[]).await.unwrap();
        }

        let team_a = db.list_posts(Some("team-a"), None, 10).await.unwrap();
        assert_eq!(team_a.len(), 2);

        let scheduled = db
            .list_posts(None, Some(PostStatus::Scheduled), 10)
            .await
            .unwrap();
        assert_eq!(scheduled.len(), 2);

        db.soft_delete_post(&a.id, 1_000).await.unwrap();
        let team_a = db.list_posts(Some("team-a"), None, 10).await.unwrap();
        assert_eq!(team_a.len(), 1);
    }

    #[tokio::test]
    async fn test_database_initialization_with_invalid_path() {
        #[cfg(unix)]
        let invalid_path = "/dev/null/castline/test.db";

        #[cfg(windows)]
        let invalid_path = "C:\\invalid<>path\\test.db";

        let result = Database::new(invalid_path).await;
        assert!(matches!(result, Err(CastlineError::Database(_))));
    }
}
