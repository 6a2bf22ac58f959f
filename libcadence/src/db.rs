//! Database operations for Cadence
//!
//! Owns the SQLite pool and the tables that are not specific to one engine
//! component: users, scheduling preferences and subscriptions. Posts live in
//! [`crate::store`], allowance bookkeeping in [`crate::quota`] and
//! [`crate::access_keys`].

use chrono::Utc;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::Row;
use std::path::Path;
use std::time::Duration;

use crate::error::{CadenceError, DbError, Result};
use crate::preferences::{format_posting_days, parse_posting_days, parse_posting_time};
use crate::types::{SchedulingPreference, SubscriptionState, SubscriptionStatus, User};

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) the database at `db_path` and run migrations
    pub async fn new(db_path: &str) -> Result<Self> {
        let expanded_path = shellexpand::tilde(db_path).to_string();
        let path = Path::new(&expanded_path);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(DbError::IoError)?;
            }
        }

        // WAL + busy timeout: the sweep and generation passes write
        // concurrently and must wait for each other rather than fail.
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

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
    // Users
    // ------------------------------------------------------------------

    /// Insert a user or refresh its profile fields
    ///
    /// Used by the auth subsystem after the OAuth handshake. Credits and
    /// tokens of an existing row are left untouched.
    pub async fn upsert_user(&self, user: &User) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO users (id, email, display_name, access_token, refresh_token,
                               token_expires_at, credits, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                email = excluded.email,
                display_name = excluded.display_name
            "#,
        )
        .bind(&user.id)
        .bind(&user.email)
        .bind(&user.display_name)
        .bind(&user.access_token)
        .bind(&user.refresh_token)
        .bind(user.token_expires_at)
        .bind(user.credits)
        .bind(user.created_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    pub async fn get_user(&self, user_id: &str) -> Result<Option<User>> {
        let row = sqlx::query(
            r#"
            SELECT id, email, display_name, access_token, refresh_token,
                   token_expires_at, credits, created_at
            FROM users WHERE id = ?
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(row.map(|r| User {
            id: r.get("id"),
            email: r.get("email"),
            display_name: r.get("display_name"),
            access_token: r.get("access_token"),
            refresh_token: r.get("refresh_token"),
            token_expires_at: r.get("token_expires_at"),
            credits: r.get("credits"),
            created_at: r.get("created_at"),
        }))
    }

    /// Persist upstream tokens after a handshake or a refresh
    pub async fn update_user_tokens(
        &self,
        user_id: &str,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: i64,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET access_token = ?, refresh_token = ?, token_expires_at = ?
            WHERE id = ?
            "#,
        )
        .bind(access_token)
        .bind(refresh_token)
        .bind(expires_at)
        .bind(user_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        if result.rows_affected() == 0 {
            return Err(CadenceError::NotFound(format!("user {}", user_id)));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Scheduling preferences
    // ------------------------------------------------------------------

    /// Fetch a user's preferences, creating the defaults on first access
    pub async fn get_preference(&self, user_id: &str) -> Result<SchedulingPreference> {
        let defaults = SchedulingPreference::defaults_for(user_id);
        let topics = serde_json::to_string(&defaults.topics).unwrap_or_else(|_| "[]".to_string());

        sqlx::query(
            r#"
            INSERT INTO scheduling_preferences
                (user_id, posts_per_week, posting_days, posting_time, timezone,
                 topics, tone, automation_enabled, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(defaults.posts_per_week as i64)
        .bind(format_posting_days(&defaults.posting_days))
        .bind(defaults.posting_time.format("%H:%M").to_string())
        .bind(&defaults.timezone)
        .bind(topics)
        .bind(&defaults.tone)
        .bind(defaults.automation_enabled)
        .bind(defaults.updated_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        let row = sqlx::query(
            r#"
            SELECT user_id, posts_per_week, posting_days, posting_time, timezone,
                   topics, tone, automation_enabled, updated_at
            FROM scheduling_preferences WHERE user_id = ?
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        row_to_preference(&row)
    }

    /// Replace a user's preferences (settings API)
    pub async fn save_preference(&self, prefs: &SchedulingPreference) -> Result<()> {
        if prefs.posts_per_week == 0 {
            return Err(CadenceError::InvalidInput(
                "posts_per_week must be positive".to_string(),
            ));
        }

        let topics = serde_json::to_string(&prefs.topics)
            .map_err(|e| CadenceError::InvalidInput(format!("topics: {}", e)))?;

        sqlx::query(
            r#"
            INSERT INTO scheduling_preferences
                (user_id, posts_per_week, posting_days, posting_time, timezone,
                 topics, tone, automation_enabled, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                posts_per_week = excluded.posts_per_week,
                posting_days = excluded.posting_days,
                posting_time = excluded.posting_time,
                timezone = excluded.timezone,
                topics = excluded.topics,
                tone = excluded.tone,
                automation_enabled = excluded.automation_enabled,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&prefs.user_id)
        .bind(prefs.posts_per_week as i64)
        .bind(format_posting_days(&prefs.posting_days))
        .bind(prefs.posting_time.format("%H:%M").to_string())
        .bind(&prefs.timezone)
        .bind(topics)
        .bind(&prefs.tone)
        .bind(prefs.automation_enabled)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// Preferences of every user with recurring automation switched on
    pub async fn list_automated_preferences(&self) -> Result<Vec<SchedulingPreference>> {
        let rows = sqlx::query(
            r#"
            SELECT user_id, posts_per_week, posting_days, posting_time, timezone,
                   topics, tone, automation_enabled, updated_at
            FROM scheduling_preferences
            WHERE automation_enabled = 1
            ORDER BY user_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(row_to_preference).collect()
    }

    // ------------------------------------------------------------------
    // Subscriptions (written by the payment webhook collaborator)
    // ------------------------------------------------------------------

    pub async fn get_user_subscription(&self, user_id: &str) -> Result<Option<SubscriptionState>> {
        let row = sqlx::query(
            r#"
            SELECT user_id, plan_id, status, current_period_start, current_period_end,
                   provider_subscription_id, updated_at
            FROM subscriptions WHERE user_id = ?
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        row.as_ref().map(row_to_subscription).transpose()
    }

    pub async fn upsert_subscription(&self, subscription: &SubscriptionState) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO subscriptions
                (user_id, plan_id, status, current_period_start, current_period_end,
                 provider_subscription_id, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                plan_id = excluded.plan_id,
                status = excluded.status,
                current_period_start = excluded.current_period_start,
                current_period_end = excluded.current_period_end,
                provider_subscription_id = excluded.provider_subscription_id,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&subscription.user_id)
        .bind(&subscription.plan_id)
        .bind(subscription.status.as_str())
        .bind(subscription.current_period_start)
        .bind(subscription.current_period_end)
        .bind(&subscription.provider_subscription_id)
        .bind(subscription.updated_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// Returns false when the user has no subscription row
    pub async fn update_subscription_status(
        &self,
        user_id: &str,
        status: SubscriptionStatus,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions SET status = ?, updated_at = ? WHERE user_id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(Utc::now().timestamp())
        .bind(user_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() > 0)
    }
}

fn row_to_preference(r: &SqliteRow) -> Result<SchedulingPreference> {
    let user_id: String = r.get("user_id");
    let corrupt = |reason: String| DbError::CorruptRow {
        table: "scheduling_preferences",
        reason: format!("{}: {}", user_id, reason),
    };

    let posting_days = parse_posting_days(r.get::<String, _>("posting_days").as_str())
        .map_err(|e| corrupt(e.to_string()))?;
    let posting_time = parse_posting_time(r.get::<String, _>("posting_time").as_str())
        .map_err(|e| corrupt(e.to_string()))?;
    let topics: Vec<String> = serde_json::from_str(r.get::<String, _>("topics").as_str())
        .map_err(|e| corrupt(format!("topics: {}", e)))?;
    let posts_per_week: i64 = r.get("posts_per_week");
    let posts_per_week = u32::try_from(posts_per_week)
        .map_err(|_| corrupt(format!("posts_per_week {}", posts_per_week)))?;

    Ok(SchedulingPreference {
        posts_per_week,
        posting_days,
        posting_time,
        timezone: r.get("timezone"),
        topics,
        tone: r.get("tone"),
        automation_enabled: r.get::<i64, _>("automation_enabled") != 0,
        updated_at: r.get("updated_at"),
        user_id,
    })
}

fn row_to_subscription(r: &SqliteRow) -> Result<SubscriptionState> {
    let status: String = r.get("status");
    let status = SubscriptionStatus::parse(&status).ok_or_else(|| DbError::CorruptRow {
        table: "subscriptions",
        reason: format!("unknown status '{}'", status),
    })?;

    Ok(SubscriptionState {
        user_id: r.get("user_id"),
        plan_id: r.get("plan_id"),
        status,
        current_period_start: r.get("current_period_start"),
        current_period_end: r.get("current_period_end"),
        provider_subscription_id: r.get("provider_subscription_id"),
        updated_at: r.get("updated_at"),
    })
}
