//! Target expansion
//!
//! Turns a post plus a selection of social profile ids into one pending
//! [`PostTarget`] per distinct profile. Every id must name a connected
//! profile of the post's team.

use std::collections::HashSet;

use crate::db::Database;
use crate::error::{CastlineError, Result};
use crate::types::{Post, PostTarget};

#[derive(Clone)]
pub struct TargetExpander {
    db: Database,
}

impl TargetExpander {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Build targets for `post` without writing anything
    ///
    /// Duplicate ids collapse to one target; order of first appearance is
    /// kept.
    ///
    /// # Errors
    ///
    /// - `CastlineError::EmptySelection` if `selected` is empty
    /// - `CastlineError::InvalidTarget` naming the first id that is not a
    ///   connected profile of the post's team
    pub async fn expand(&self, post: &Post, selected: &[String], now: i64) -> Result<Vec<PostTarget>> {
        if selected.is_empty() {
            return Err(CastlineError::EmptySelection);
        }

        let connected: HashSet<String> = self
            .db
            .get_connected_profiles(&post.team_id)
            .await?
            .into_iter()
            .map(|p| p.id)
            .collect();

        let mut seen = HashSet::new();
        let mut targets = Vec::with_capacity(selected.len());

        for profile_id in selected {
            if !seen.insert(profile_id.as_str()) {
                continue;
            }
            if !connected.contains(profile_id) {
                return Err(CastlineError::InvalidTarget(format!(
                    "profile '{}' is not a connected profile of team '{}'",
                    profile_id, post.team_id
                )));
            }
            targets.push(PostTarget::pending(post, profile_id, now));
        }

        Ok(targets)
    }

    /// Expand an already stored post and write its targets in one transaction
    pub async fn expand_stored(
        &self,
        post: &Post,
        selected: &[String],
        now: i64,
    ) -> Result<Vec<PostTarget>> {
        let targets = self.expand(post, selected, now).await?;
        self.db.insert_targets(&targets).await?;

        tracing::debug!(
            post_id = %post.id,
            targets = targets.len(),
            "Expanded post into targets"
        );

        Ok(targets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PlatformKind, PostStatus, SocialProfile, TargetStatus};
    use tempfile::TempDir;

    async fn setup() -> (TempDir, Database, Vec<SocialProfile>) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let db = Database::new(db_path.to_str().unwrap()).await.unwrap();

        let mut profiles = Vec::new();
        for (kind, provider) in [
            (PlatformKind::Instagram, "ig-1"),
            (PlatformKind::Facebook, "fb-1"),
        ] {
            let profile = SocialProfile::new("team-a", kind, provider, "token");
            db.upsert_profile(&profile).await.unwrap();
            profiles.push(profile);
        }

        (temp_dir, db, profiles)
    }

    fn post() -> Post {
        let mut post = Post::new("team-a", "user-1", Some("Hi".to_string()));
        post.status = PostStatus::Scheduled;
        post.scheduled_at = Some(2_000);
        post
    }

    #[tokio::test]
    async fn test_one_pending_target_per_profile() {
        let (_temp, db, profiles) = setup().await;
        let expander = TargetExpander::new(db);
        let ids: Vec<String> = profiles.iter().map(|p| p.id.clone()).collect();

        let targets = expander.expand(&post(), &ids, 1_000).await.unwrap();

        assert_eq!(targets.len(), 2);
        for (target, id) in targets.iter().zip(&ids) {
            assert_eq!(&target.social_profile_id, id);
            assert_eq!(target.status, TargetStatus::Pending);
            assert_eq!(target.attempt_count, 0);
            assert_eq!(target.next_attempt_at, None);
        }
    }

    #[tokio::test]
    async fn test_duplicates_collapse() {
        let (_temp, db, profiles) = setup().await;
        let expander = TargetExpander::new(db);
        let id = profiles[0].id.clone();

        let targets = expander
            .expand(&post(), &[id.clone(), id.clone(), id], 1_000)
            .await
            .unwrap();

        assert_eq!(targets.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_selection() {
        let (_temp, db, _profiles) = setup().await;
        let expander = TargetExpander::new(db);

        let result = expander.expand(&post(), &[], 1_000).await;
        assert!(matches!(result, Err(CastlineError::EmptySelection)));
    }

    #[tokio::test]
    async fn test_foreign_and_disconnected_profiles_rejected() {
        let (_temp, db, profiles) = setup().await;

        let other_team = SocialProfile::new("team-b", PlatformKind::Tiktok, "tt-1", "token");
        db.upsert_profile(&other_team).await.unwrap();
        db.set_profile_connected(&profiles[1].id, false).await.unwrap();

        let expander = TargetExpander::new(db);

        let result = expander
            .expand(&post(), &[profiles[0].id.clone(), other_team.id.clone()], 1_000)
            .await;
        assert!(matches!(result, Err(CastlineError::InvalidTarget(msg)) if msg.contains(&other_team.id)));

        let result = expander.expand(&post(), &[profiles[1].id.clone()], 1_000).await;
        assert!(matches!(result, Err(CastlineError::InvalidTarget(_))));
    }

    #[tokio::test]
    async fn test_expand_stored_persists() {
        let (_temp, db, profiles) = setup().await;
        let post = post();
        db.create_post_with_targets(&post, &[]).await.unwrap();

        let expander = TargetExpander::new(db.clone());
        expander
            .expand_stored(&post, &[profiles[0].id.clone()], 1_000)
            .await
            .unwrap();

        assert_eq!(db.get_targets_for_post(&post.id).await.unwrap().len(), 1);
    }
}
