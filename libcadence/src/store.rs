//! Post store: durable record of every scheduled publish attempt
//!
//! Every transition is a single guarded `UPDATE ... WHERE status = 'pending'`
//! so concurrent sweeps, generation passes and user cancellations can never
//! both win on the same row.

use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use crate::db::Database;
use crate::error::{CadenceError, DbError, Result};
use crate::types::{GeneratedContent, PostDraft, PostStatus, ScheduledPost};

const POST_COLUMNS: &str = "id, user_id, topic, tone, content, image_url, article_url, \
     scheduled_at, status, external_post_id, error_message, claimed_at, created_at, posted_at";

/// Default age after which an in-flight claim is considered abandoned
pub const DEFAULT_CLAIM_TTL_SECS: i64 = 900;

#[derive(Clone)]
pub struct PostStore {
    db: Database,
    claim_ttl: i64,
}

impl PostStore {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            claim_ttl: DEFAULT_CLAIM_TTL_SECS,
        }
    }

    pub fn with_claim_ttl(mut self, claim_ttl_secs: u64) -> Self {
        self.claim_ttl = i64::try_from(claim_ttl_secs).unwrap_or(DEFAULT_CLAIM_TTL_SECS);
        self
    }

    /// Insert a new `pending` post
    pub async fn create(&self, user_id: &str, draft: &PostDraft) -> Result<ScheduledPost> {
        if draft.topic.trim().is_empty() {
            return Err(CadenceError::InvalidInput(
                "Post topic cannot be empty".to_string(),
            ));
        }

        let post = ScheduledPost {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            topic: draft.topic.clone(),
            tone: draft.tone.clone(),
            content: draft.content.as_ref().map(|c| c.text.clone()),
            image_url: draft.content.as_ref().and_then(|c| c.image_url.clone()),
            article_url: draft.content.as_ref().and_then(|c| c.article_url.clone()),
            scheduled_at: draft.scheduled_at,
            status: PostStatus::Pending,
            external_post_id: None,
            error_message: None,
            claimed_at: None,
            created_at: Utc::now().timestamp(),
            posted_at: None,
        };

        sqlx::query(
            r#"
            INSERT INTO scheduled_posts
                (id, user_id, topic, tone, content, image_url, article_url,
                 scheduled_at, status, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&post.id)
        .bind(&post.user_id)
        .bind(&post.topic)
        .bind(&post.tone)
        .bind(&post.content)
        .bind(&post.image_url)
        .bind(&post.article_url)
        .bind(post.scheduled_at)
        .bind(post.status.as_str())
        .bind(post.created_at)
        .execute(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        Ok(post)
    }

    pub async fn get(&self, post_id: &str) -> Result<Option<ScheduledPost>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM scheduled_posts WHERE id = ?",
            POST_COLUMNS
        ))
        .bind(post_id)
        .fetch_optional(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        row.as_ref().map(row_to_post).transpose()
    }

    /// The sweep pass work queue: due `pending` posts of every user
    ///
    /// Posts claimed by a sweep that is still within the claim TTL are left
    /// out; older claims belong to a sweep that died and are retried.
    pub async fn list_pending(&self, before: i64) -> Result<Vec<ScheduledPost>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM scheduled_posts
            WHERE status = 'pending'
              AND scheduled_at <= ?
              AND (claimed_at IS NULL OR claimed_at <= ?)
            ORDER BY scheduled_at ASC
            "#,
            POST_COLUMNS
        ))
        .bind(before)
        .bind(before - self.claim_ttl)
        .fetch_all(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(row_to_post).collect()
    }

    /// Mark a pending post as in flight; false if another sweep holds it,
    /// it was cancelled, or it is already terminal
    pub async fn claim(&self, post_id: &str, now: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_posts SET claimed_at = ?
            WHERE id = ? AND status = 'pending'
              AND (claimed_at IS NULL OR claimed_at <= ?)
            "#,
        )
        .bind(now)
        .bind(post_id)
        .bind(now - self.claim_ttl)
        .execute(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// Fill in content generated after the post was created
    pub async fn set_content(&self, post_id: &str, content: &GeneratedContent) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_posts SET content = ?, image_url = ?, article_url = ?
            WHERE id = ? AND status = 'pending'
            "#,
        )
        .bind(&content.text)
        .bind(&content.image_url)
        .bind(&content.article_url)
        .bind(post_id)
        .execute(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// Transition to `posted`; a no-op returning false unless still pending
    pub async fn mark_posted(&self, post_id: &str, external_post_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_posts
            SET status = 'posted', external_post_id = ?, error_message = NULL, posted_at = ?
            WHERE id = ? AND status = 'pending'
            "#,
        )
        .bind(external_post_id)
        .bind(Utc::now().timestamp())
        .bind(post_id)
        .execute(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// Transition to `failed`; a no-op returning false unless still pending
    pub async fn mark_failed(&self, post_id: &str, error_message: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_posts
            SET status = 'failed', error_message = ?, posted_at = ?
            WHERE id = ? AND status = 'pending'
            "#,
        )
        .bind(error_message)
        .bind(Utc::now().timestamp())
        .bind(post_id)
        .execute(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// All of a user's posts, newest target time first
    pub async fn list_for_user(&self, user_id: &str) -> Result<Vec<ScheduledPost>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM scheduled_posts
            WHERE user_id = ?
            ORDER BY scheduled_at DESC
            "#,
            POST_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(row_to_post).collect()
    }

    /// Cancel a post owned by `user_id`
    ///
    /// Only pending posts that no sweep has claimed can be deleted. Anything
    /// else (unknown id, other owner, terminal, in flight) returns false.
    pub async fn delete(&self, post_id: &str, user_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM scheduled_posts
            WHERE id = ? AND user_id = ? AND status = 'pending' AND claimed_at IS NULL
            "#,
        )
        .bind(post_id)
        .bind(user_id)
        .execute(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// Target times of a user's pending posts scheduled after `now`
    pub async fn future_pending_slots(&self, user_id: &str, now: i64) -> Result<Vec<i64>> {
        let rows = sqlx::query(
            r#"
            SELECT scheduled_at FROM scheduled_posts
            WHERE user_id = ? AND status = 'pending' AND scheduled_at > ?
            ORDER BY scheduled_at ASC
            "#,
        )
        .bind(user_id)
        .bind(now)
        .fetch_all(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        Ok(rows.iter().map(|r| r.get::<i64, _>("scheduled_at")).collect())
    }

    pub async fn count_future_pending(&self, user_id: &str, now: i64) -> Result<usize> {
        Ok(self.future_pending_slots(user_id, now).await?.len())
    }
}

fn row_to_post(r: &SqliteRow) -> Result<ScheduledPost> {
    let status: String = r.get("status");
    let status = PostStatus::parse(&status).ok_or_else(|| DbError::CorruptRow {
        table: "scheduled_posts",
        reason: format!("unknown status '{}'", status),
    })?;

    Ok(ScheduledPost {
        id: r.get("id"),
        user_id: r.get("user_id"),
        topic: r.get("topic"),
        tone: r.get("tone"),
        content: r.get("content"),
        image_url: r.get("image_url"),
        article_url: r.get("article_url"),
        scheduled_at: r.get("scheduled_at"),
        status,
        external_post_id: r.get("external_post_id"),
        error_message: r.get("error_message"),
        claimed_at: r.get("claimed_at"),
        created_at: r.get("created_at"),
        posted_at: r.get("posted_at"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::{create_test_user, setup_test_db};

    fn draft(scheduled_at: i64) -> PostDraft {
        PostDraft {
            topic: "release notes".to_string(),
            tone: "friendly".to_string(),
            content: Some(GeneratedContent {
                text: "We shipped!".to_string(),
                image_url: Some("https://img.example/1.png".to_string()),
                article_url: None,
            }),
            scheduled_at,
        }
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let (_dir, db) = setup_test_db().await;
        let user = create_test_user(&db).await;
        let store = PostStore::new(db);

        let post = store.create(&user.id, &draft(1_000)).await.unwrap();
        assert_eq!(post.status, PostStatus::Pending);

        let fetched = store.get(&post.id).await.unwrap().unwrap();
        assert_eq!(fetched.user_id, user.id);
        assert_eq!(fetched.content.as_deref(), Some("We shipped!"));
        assert_eq!(fetched.image_url.as_deref(), Some("https://img.example/1.png"));
        assert_eq!(fetched.scheduled_at, 1_000);
        assert!(fetched.claimed_at.is_none());
    }

    #[tokio::test]
    async fn test_create_rejects_empty_topic() {
        let (_dir, db) = setup_test_db().await;
        let user = create_test_user(&db).await;
        let store = PostStore::new(db);

        let mut d = draft(1_000);
        d.topic = "  ".to_string();
        assert!(matches!(
            store.create(&user.id, &d).await,
            Err(CadenceError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_list_pending_spans_users_and_respects_cutoff() {
        let (_dir, db) = setup_test_db().await;
        let alice = create_test_user(&db).await;
        let bob = create_test_user(&db).await;
        let store = PostStore::new(db);

        let due_a = store.create(&alice.id, &draft(900)).await.unwrap();
        let due_b = store.create(&bob.id, &draft(1_000)).await.unwrap();
        let _future = store.create(&bob.id, &draft(1_001)).await.unwrap();
        let done = store.create(&alice.id, &draft(500)).await.unwrap();
        store.mark_posted(&done.id, "ext-1").await.unwrap();

        let pending = store.list_pending(1_000).await.unwrap();
        let ids: Vec<_> = pending.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec![due_a.id.as_str(), due_b.id.as_str()]);
    }

    #[tokio::test]
    async fn test_claim_hides_post_until_ttl_expires() {
        let (_dir, db) = setup_test_db().await;
        let user = create_test_user(&db).await;
        let store = PostStore::new(db).with_claim_ttl(60);

        let post = store.create(&user.id, &draft(100)).await.unwrap();
        assert!(store.claim(&post.id, 200).await.unwrap());
        assert!(!store.claim(&post.id, 201).await.unwrap(), "double claim");

        assert!(store.list_pending(230).await.unwrap().is_empty());
        // Claim from a crashed sweep is stale after the TTL
        assert_eq!(store.list_pending(260).await.unwrap().len(), 1);
        assert!(store.claim(&post.id, 260).await.unwrap());
    }

    #[tokio::test]
    async fn test_mark_posted_is_idempotent() {
        let (_dir, db) = setup_test_db().await;
        let user = create_test_user(&db).await;
        let store = PostStore::new(db);
        let post = store.create(&user.id, &draft(100)).await.unwrap();

        assert!(store.mark_posted(&post.id, "post_123").await.unwrap());
        assert!(!store.mark_posted(&post.id, "post_456").await.unwrap());
        assert!(!store.mark_failed(&post.id, "late failure").await.unwrap());

        let fetched = store.get(&post.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, PostStatus::Posted);
        assert_eq!(fetched.external_post_id.as_deref(), Some("post_123"));
        assert!(fetched.error_message.is_none());
        assert!(fetched.posted_at.is_some());
    }

    #[tokio::test]
    async fn test_mark_failed_is_idempotent() {
        let (_dir, db) = setup_test_db().await;
        let user = create_test_user(&db).await;
        let store = PostStore::new(db);
        let post = store.create(&user.id, &draft(100)).await.unwrap();

        assert!(store.mark_failed(&post.id, "first").await.unwrap());
        assert!(!store.mark_failed(&post.id, "second").await.unwrap());
        assert!(!store.mark_posted(&post.id, "post_1").await.unwrap());

        let fetched = store.get(&post.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, PostStatus::Failed);
        assert_eq!(fetched.error_message.as_deref(), Some("first"));
        assert!(fetched.external_post_id.is_none());
    }

    #[tokio::test]
    async fn test_mark_unknown_post_is_noop() {
        let (_dir, db) = setup_test_db().await;
        let store = PostStore::new(db);
        assert!(!store.mark_posted("missing", "x").await.unwrap());
        assert!(!store.mark_failed("missing", "x").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_rules() {
        let (_dir, db) = setup_test_db().await;
        let owner = create_test_user(&db).await;
        let stranger = create_test_user(&db).await;
        let store = PostStore::new(db);

        let pending = store.create(&owner.id, &draft(100)).await.unwrap();
        assert!(!store.delete(&pending.id, &stranger.id).await.unwrap());
        assert!(store.delete(&pending.id, &owner.id).await.unwrap());
        assert!(store.get(&pending.id).await.unwrap().is_none());
        assert!(!store.delete(&pending.id, &owner.id).await.unwrap());

        let posted = store.create(&owner.id, &draft(100)).await.unwrap();
        store.mark_posted(&posted.id, "ext").await.unwrap();
        assert!(!store.delete(&posted.id, &owner.id).await.unwrap());

        let in_flight = store.create(&owner.id, &draft(100)).await.unwrap();
        store.claim(&in_flight.id, 100).await.unwrap();
        assert!(!store.delete(&in_flight.id, &owner.id).await.unwrap());
        assert!(store.get(&in_flight.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_cancel_races_mark_posted_exactly_one_wins() {
        let (_dir, db) = setup_test_db().await;
        let user = create_test_user(&db).await;
        let store = PostStore::new(db);

        for _ in 0..20 {
            let post = store.create(&user.id, &draft(100)).await.unwrap();

            let (deleted, posted) = tokio::join!(
                {
                    let store = store.clone();
                    let (id, uid) = (post.id.clone(), user.id.clone());
                    tokio::spawn(async move { store.delete(&id, &uid).await.unwrap() })
                },
                {
                    let store = store.clone();
                    let id = post.id.clone();
                    tokio::spawn(async move { store.mark_posted(&id, "post_123").await.unwrap() })
                }
            );
            let (deleted, posted) = (deleted.unwrap(), posted.unwrap());

            assert!(deleted ^ posted, "exactly one of cancel/mark_posted must win");
            let row = store.get(&post.id).await.unwrap();
            if deleted {
                assert!(row.is_none());
            } else {
                assert_eq!(row.unwrap().status, PostStatus::Posted);
            }
        }
    }

    #[tokio::test]
    async fn test_set_content_only_while_pending() {
        let (_dir, db) = setup_test_db().await;
        let user = create_test_user(&db).await;
        let store = PostStore::new(db);

        let mut d = draft(100);
        d.content = None;
        let post = store.create(&user.id, &d).await.unwrap();
        assert!(store.get(&post.id).await.unwrap().unwrap().content.is_none());

        let content = GeneratedContent {
            text: "Fresh".to_string(),
            image_url: None,
            article_url: Some("https://blog.example/a".to_string()),
        };
        assert!(store.set_content(&post.id, &content).await.unwrap());
        let fetched = store.get(&post.id).await.unwrap().unwrap();
        assert_eq!(fetched.content.as_deref(), Some("Fresh"));
        assert_eq!(fetched.article_url.as_deref(), Some("https://blog.example/a"));

        store.mark_failed(&post.id, "nope").await.unwrap();
        assert!(!store.set_content(&post.id, &content).await.unwrap());
    }

    #[tokio::test]
    async fn test_future_pending_slots() {
        let (_dir, db) = setup_test_db().await;
        let user = create_test_user(&db).await;
        let store = PostStore::new(db);

        store.create(&user.id, &draft(50)).await.unwrap();
        store.create(&user.id, &draft(300)).await.unwrap();
        store.create(&user.id, &draft(200)).await.unwrap();
        let done = store.create(&user.id, &draft(400)).await.unwrap();
        store.mark_failed(&done.id, "x").await.unwrap();

        assert_eq!(
            store.future_pending_slots(&user.id, 100).await.unwrap(),
            vec![200, 300]
        );
        assert_eq!(store.count_future_pending(&user.id, 100).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_list_for_user_only_returns_own_posts() {
        let (_dir, db) = setup_test_db().await;
        let alice = create_test_user(&db).await;
        let bob = create_test_user(&db).await;
        let store = PostStore::new(db);

        store.create(&alice.id, &draft(100)).await.unwrap();
        store.create(&alice.id, &draft(200)).await.unwrap();
        store.create(&bob.id, &draft(150)).await.unwrap();

        let posts = store.list_for_user(&alice.id).await.unwrap();
        assert_eq!(posts.len(), 2);
        assert_eq!(posts[0].scheduled_at, 200);
        assert!(posts.iter().all(|p| p.user_id == alice.id));
    }
}
