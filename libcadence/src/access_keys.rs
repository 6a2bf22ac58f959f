//! Access keys: shareable, capacity-limited post allowances
//!
//! A key carries a global counter; every user that redeems it gets a grant
//! with its own counter. Both are debited together by
//! [`Database::consume_access_key`], which the quota ledger calls when a
//! generation is committed against the `access_key` source.

use chrono::Utc;
use rand::Rng;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::{debug, info};
use uuid::Uuid;

use crate::db::Database;
use crate::error::{CadenceError, DbError, QuotaError, Result};
use crate::quota::insert_usage_event;
use crate::types::{
    AccessKey, AccessKeyGrant, AccessKeyStatus, AllowanceSource, UsageEvent, UsageKind,
};

const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const CODE_LENGTH: usize = 12;

const KEY_COLUMNS: &str =
    "k.id, k.code, k.posts_limit, k.posts_used, k.valid_from, k.expires_at, k.status, k.created_at";

/// Random redemption code, grouped as `XXXX-XXXX-XXXX`
pub fn generate_code() -> String {
    let mut rng = rand::thread_rng();
    let raw: Vec<char> = (0..CODE_LENGTH)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect();
    raw.chunks(4)
        .map(|chunk| chunk.iter().collect::<String>())
        .collect::<Vec<_>>()
        .join("-")
}

fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}

impl Database {
    /// Create a key good for `posts_limit` posts across all its redeemers
    pub async fn create_access_key(
        &self,
        posts_limit: i64,
        expires_at: Option<i64>,
        code: Option<&str>,
    ) -> Result<AccessKey> {
        if posts_limit <= 0 {
            return Err(CadenceError::InvalidInput(
                "Access key limit must be positive".to_string(),
            ));
        }

        let code = match code.map(normalize_code) {
            Some(code) if code.is_empty() => {
                return Err(CadenceError::InvalidInput(
                    "Access key code cannot be empty".to_string(),
                ))
            }
            Some(code) => code,
            None => generate_code(),
        };

        let now = Utc::now().timestamp();
        let key = AccessKey {
            id: Uuid::new_v4().to_string(),
            code,
            posts_limit,
            posts_used: 0,
            valid_from: now,
            expires_at,
            status: AccessKeyStatus::Active,
            created_at: now,
        };

        let result = sqlx::query(
            r#"
            INSERT INTO access_keys
                (id, code, posts_limit, posts_used, valid_from, expires_at, status, created_at)
            VALUES (?, ?, ?, 0, ?, ?, ?, ?)
            "#,
        )
        .bind(&key.id)
        .bind(&key.code)
        .bind(key.posts_limit)
        .bind(key.valid_from)
        .bind(key.expires_at)
        .bind(key.status.as_str())
        .bind(key.created_at)
        .execute(self.pool())
        .await;

        match result {
            Ok(_) => {}
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                return Err(CadenceError::InvalidInput(format!(
                    "Access key code '{}' already exists",
                    key.code
                )));
            }
            Err(e) => return Err(DbError::SqlxError(e).into()),
        }

        info!(key_id = %key.id, posts_limit, "created access key");
        Ok(key)
    }

    pub async fn get_access_key_by_code(&self, code: &str) -> Result<Option<AccessKey>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM access_keys k WHERE k.code = ?",
            KEY_COLUMNS
        ))
        .bind(normalize_code(code))
        .fetch_optional(self.pool())
        .await
        .map_err(DbError::SqlxError)?;

        row.as_ref().map(row_to_key).transpose()
    }

    pub async fn list_access_keys(&self) -> Result<Vec<AccessKey>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM access_keys k ORDER BY k.created_at DESC",
            KEY_COLUMNS
        ))
        .fetch_all(self.pool())
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(row_to_key).collect()
    }

    /// Bind a key to a user
    ///
    /// Redeeming a key the user already holds returns the existing grant.
    pub async fn redeem_access_key(&self, user_id: &str, code: &str) -> Result<AccessKeyGrant> {
        let now = Utc::now().timestamp();
        let key = self
            .get_access_key_by_code(code)
            .await?
            .ok_or(QuotaError::KeyInvalid)?;

        if let Some(existing) = self.get_grant(user_id, &key.id).await? {
            return Ok(existing);
        }

        match key.status {
            AccessKeyStatus::Disabled => return Err(QuotaError::KeyInvalid.into()),
            AccessKeyStatus::Expired => return Err(QuotaError::KeyExpired.into()),
            AccessKeyStatus::Exhausted => return Err(QuotaError::KeyExhausted.into()),
            AccessKeyStatus::Active => {}
        }
        if key.is_expired_at(now) {
            return Err(QuotaError::KeyExpired.into());
        }
        if key.valid_from > now {
            return Err(QuotaError::KeyInvalid.into());
        }
        if key.remaining_capacity() == 0 {
            return Err(QuotaError::KeyExhausted.into());
        }

        sqlx::query(
            r#"
            INSERT INTO user_access_key_grants (user_id, key_id, posts_used, granted_at)
            VALUES (?, ?, 0, ?)
            ON CONFLICT(user_id, key_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(&key.id)
        .bind(now)
        .execute(self.pool())
        .await
        .map_err(DbError::SqlxError)?;

        info!(user_id = %user_id, key_id = %key.id, "redeemed access key");

        self.get_grant(user_id, &key.id)
            .await?
            .ok_or_else(|| CadenceError::NotFound(format!("grant for key {}", key.id)))
    }

    /// Stop a key from being redeemed or consumed; false if the code is unknown
    pub async fn disable_access_key(&self, code: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE access_keys SET status = 'disabled' WHERE code = ?")
            .bind(normalize_code(code))
            .execute(self.pool())
            .await
            .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn list_user_grants(&self, user_id: &str) -> Result<Vec<AccessKeyGrant>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {}, g.user_id, g.posts_used AS grant_used, g.granted_at
            FROM user_access_key_grants g
            JOIN access_keys k ON k.id = g.key_id
            WHERE g.user_id = ?
            ORDER BY k.expires_at IS NULL, k.expires_at, g.granted_at
            "#,
            KEY_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(self.pool())
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(row_to_grant).collect()
    }

    async fn get_grant(&self, user_id: &str, key_id: &str) -> Result<Option<AccessKeyGrant>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {}, g.user_id, g.posts_used AS grant_used, g.granted_at
            FROM user_access_key_grants g
            JOIN access_keys k ON k.id = g.key_id
            WHERE g.user_id = ? AND g.key_id = ?
            "#,
            KEY_COLUMNS
        ))
        .bind(user_id)
        .bind(key_id)
        .fetch_optional(self.pool())
        .await
        .map_err(DbError::SqlxError)?;

        row.as_ref().map(row_to_grant).transpose()
    }

    /// Debit one post from the user's earliest-expiring usable key
    ///
    /// For each candidate grant a transaction bumps the key counter and the
    /// grant counter with guarded updates, flips the key to `exhausted` when
    /// it hits its limit and records the usage event. A candidate that lost
    /// a race to another debit is rolled back and the next one is tried.
    /// Returns the debited key id, or `None` when nothing had capacity left.
    pub async fn consume_access_key(
        &self,
        user_id: &str,
        post_id: Option<&str>,
        now: i64,
    ) -> Result<Option<String>> {
        let candidates: Vec<String> = sqlx::query(
            r#"
            SELECT g.key_id FROM user_access_key_grants g
            JOIN access_keys k ON k.id = g.key_id
            WHERE g.user_id = ?
              AND k.status = 'active'
              AND k.valid_from <= ?
              AND (k.expires_at IS NULL OR k.expires_at > ?)
              AND k.posts_used < k.posts_limit
              AND g.posts_used < k.posts_limit
            ORDER BY k.expires_at IS NULL, k.expires_at, g.granted_at
            "#,
        )
        .bind(user_id)
        .bind(now)
        .bind(now)
        .fetch_all(self.pool())
        .await
        .map_err(DbError::SqlxError)?
        .iter()
        .map(|r| r.get("key_id"))
        .collect();

        for key_id in candidates {
            let mut tx = self.pool().begin().await.map_err(DbError::SqlxError)?;

            let key_debit = sqlx::query(
                r#"
                UPDATE access_keys SET posts_used = posts_used + 1
                WHERE id = ? AND status = 'active' AND posts_used < posts_limit
                  AND (expires_at IS NULL OR expires_at > ?)
                "#,
            )
            .bind(&key_id)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(DbError::SqlxError)?;

            if key_debit.rows_affected() == 0 {
                tx.rollback().await.map_err(DbError::SqlxError)?;
                debug!(user_id = %user_id, key_id = %key_id, "access key drained concurrently");
                continue;
            }

            let grant_debit = sqlx::query(
                r#"
                UPDATE user_access_key_grants SET posts_used = posts_used + 1
                WHERE user_id = ? AND key_id = ?
                  AND posts_used < (SELECT posts_limit FROM access_keys WHERE id = ?)
                "#,
            )
            .bind(user_id)
            .bind(&key_id)
            .bind(&key_id)
            .execute(&mut *tx)
            .await
            .map_err(DbError::SqlxError)?;

            if grant_debit.rows_affected() == 0 {
                tx.rollback().await.map_err(DbError::SqlxError)?;
                continue;
            }

            sqlx::query(
                r#"
                UPDATE access_keys SET status = 'exhausted'
                WHERE id = ? AND posts_used >= posts_limit
                "#,
            )
            .bind(&key_id)
            .execute(&mut *tx)
            .await
            .map_err(DbError::SqlxError)?;

            let event = UsageEvent::new(user_id, UsageKind::Generation, 1, now)
                .with_source(AllowanceSource::AccessKey)
                .with_reason(format!("access key {}", key_id))
                .with_post(post_id);
            insert_usage_event(&mut *tx, &event).await?;

            tx.commit().await.map_err(DbError::SqlxError)?;
            return Ok(Some(key_id));
        }

        Ok(None)
    }
}

fn row_to_key(r: &SqliteRow) -> Result<AccessKey> {
    let status: String = r.get("status");
    let status = AccessKeyStatus::parse(&status).ok_or_else(|| DbError::CorruptRow {
        table: "access_keys",
        reason: format!("unknown status '{}'", status),
    })?;

    Ok(AccessKey {
        id: r.get("id"),
        code: r.get("code"),
        posts_limit: r.get("posts_limit"),
        posts_used: r.get("posts_used"),
        valid_from: r.get("valid_from"),
        expires_at: r.get("expires_at"),
        status,
        created_at: r.get("created_at"),
    })
}

fn row_to_grant(r: &SqliteRow) -> Result<AccessKeyGrant> {
    Ok(AccessKeyGrant {
        user_id: r.get("user_id"),
        key: row_to_key(r)?,
        posts_used: r.get("grant_used"),
        granted_at: r.get("granted_at"),
    })
}
