//! Quota ledger: per-user allowance checks and credit bookkeeping
//!
//! Allowance comes from the subscription plan first, then from redeemed
//! access keys. Credits are a separate balance that only moves through
//! [`QuotaLedger::add_credits`] and [`QuotaLedger::deduct_credits`], each
//! of which writes an audit [`UsageEvent`] in the same transaction.

use std::collections::HashMap;

use chrono::Utc;
use sqlx::{Row, Sqlite};
use tracing::{debug, info, warn};

use crate::config::{Config, CreditPackConfig, PlanConfig};
use crate::db::Database;
use crate::error::{CadenceError, DbError, QuotaError, Result};
use crate::types::{month_bucket, AllowanceSource, UsageEvent, UsageKind};

/// Reason reported when a user has nothing to draw from
pub const NO_ALLOWANCE_REASON: &str = "no active subscription or access keys";

/// Result of an allowance check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaDecision {
    pub allowed: bool,
    /// Allowance to debit on commit
    pub source: Option<AllowanceSource>,
    /// Posts left in that allowance; `None` when allowed means unlimited
    pub remaining: Option<i64>,
    pub reason: Option<String>,
}

impl QuotaDecision {
    fn allow(source: AllowanceSource, remaining: Option<i64>) -> Self {
        Self {
            allowed: true,
            source: Some(source),
            remaining,
            reason: None,
        }
    }

    fn deny(reason: &str) -> Self {
        Self {
            allowed: false,
            source: None,
            remaining: Some(0),
            reason: Some(reason.to_string()),
        }
    }

    /// The allowance source, or `NoAllowance` carrying the denial reason
    pub fn into_result(self) -> std::result::Result<AllowanceSource, QuotaError> {
        match (self.allowed, self.source) {
            (true, Some(source)) => Ok(source),
            _ => Err(QuotaError::NoAllowance(
                self.reason.unwrap_or_else(|| NO_ALLOWANCE_REASON.to_string()),
            )),
        }
    }
}

#[derive(Clone)]
pub struct QuotaLedger {
    db: Database,
    plans: HashMap<String, i64>,
    credit_packs: HashMap<String, i64>,
}

impl QuotaLedger {
    pub fn new(db: Database, plans: &[PlanConfig], credit_packs: &[CreditPackConfig]) -> Self {
        Self {
            db,
            plans: plans
                .iter()
                .map(|p| (p.id.clone(), p.posts_limit))
                .collect(),
            credit_packs: credit_packs
                .iter()
                .map(|p| (p.price_id.clone(), p.credits))
                .collect(),
        }
    }

    pub fn from_config(db: Database, config: &Config) -> Self {
        Self::new(db, &config.plans, &config.credit_packs)
    }

    /// Decide whether `user_id` may generate another post right now
    ///
    /// Nothing is held: the caller debits the returned source with
    /// [`commit`](Self::commit) once the post exists.
    pub async fn check_and_reserve(&self, user_id: &str) -> Result<QuotaDecision> {
        self.check_at(user_id, Utc::now().timestamp()).await
    }

    pub async fn check_at(&self, user_id: &str, now: i64) -> Result<QuotaDecision> {
        if let Some(subscription) = self.db.get_user_subscription(user_id).await? {
            if subscription.status.grants_allowance() {
                match self.plans.get(&subscription.plan_id).copied() {
                    Some(-1) => {
                        return Ok(QuotaDecision::allow(AllowanceSource::Subscription, None))
                    }
                    Some(limit) => {
                        let used = self.posts_used_this_month(user_id, now).await?;
                        let remaining = (limit - used).max(0);
                        if remaining > 0 {
                            return Ok(QuotaDecision::allow(
                                AllowanceSource::Subscription,
                                Some(remaining),
                            ));
                        }
                        debug!(user_id = %user_id, limit, used, "plan allowance exhausted");
                    }
                    None => {
                        warn!(
                            user_id = %user_id,
                            plan_id = %subscription.plan_id,
                            "subscription references unknown plan"
                        );
                    }
                }
            }
        }

        let key_remaining: i64 = self
            .db
            .list_user_grants(user_id)
            .await?
            .iter()
            .filter(|grant| grant.key.is_usable_at(now))
            .map(|grant| grant.remaining())
            .sum();

        if key_remaining > 0 {
            return Ok(QuotaDecision::allow(
                AllowanceSource::AccessKey,
                Some(key_remaining),
            ));
        }

        Ok(QuotaDecision::deny(NO_ALLOWANCE_REASON))
    }

    /// Debit one post from `source`
    pub async fn commit(
        &self,
        user_id: &str,
        source: AllowanceSource,
        post_id: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().timestamp();
        match source {
            AllowanceSource::Subscription => {
                let event = UsageEvent::new(user_id, UsageKind::Generation, 1, now)
                    .with_source(AllowanceSource::Subscription)
                    .with_post(post_id);
                insert_usage_event(self.db.pool(), &event).await?;
            }
            AllowanceSource::AccessKey => {
                if self
                    .db
                    .consume_access_key(user_id, post_id, now)
                    .await?
                    .is_none()
                {
                    return Err(QuotaError::KeyExhausted.into());
                }
            }
            AllowanceSource::Credits => {
                self.deduct_credits(user_id, 1, "post generation").await?;
            }
        }

        debug!(user_id = %user_id, source = %source, post_id = ?post_id, "quota committed");
        Ok(())
    }

    /// Audit a successful publish; never debits an allowance
    pub async fn record_publish(&self, user_id: &str, post_id: &str) -> Result<()> {
        let event = UsageEvent::new(user_id, UsageKind::Publish, 1, Utc::now().timestamp())
            .with_post(Some(post_id));
        insert_usage_event(self.db.pool(), &event).await
    }

    /// Generation events recorded in the calendar month containing `now`
    pub async fn posts_used_this_month(&self, user_id: &str, now: i64) -> Result<i64> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS used FROM usage_events
            WHERE user_id = ? AND kind = 'generation' AND month_bucket = ?
            "#,
        )
        .bind(user_id)
        .bind(month_bucket(now))
        .fetch_one(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        Ok(row.get("used"))
    }

    /// Increase the balance, returning the new balance
    pub async fn add_credits(&self, user_id: &str, amount: i64, reason: &str) -> Result<i64> {
        if amount <= 0 {
            return Err(CadenceError::InvalidInput(
                "Credit amount must be positive".to_string(),
            ));
        }

        let now = Utc::now().timestamp();
        let mut tx = self.db.pool().begin().await.map_err(DbError::SqlxError)?;

        let updated = sqlx::query("UPDATE users SET credits = credits + ? WHERE id = ?")
            .bind(amount)
            .bind(user_id)
            .execute(&mut *tx)
            .await
            .map_err(DbError::SqlxError)?;

        if updated.rows_affected() == 0 {
            tx.rollback().await.map_err(DbError::SqlxError)?;
            return Err(CadenceError::NotFound(format!("user {}", user_id)));
        }

        let event = UsageEvent::new(user_id, UsageKind::CreditAdd, amount, now)
            .with_source(AllowanceSource::Credits)
            .with_reason(reason);
        insert_usage_event(&mut *tx, &event).await?;

        let balance = balance_in(&mut tx, user_id).await?;
        tx.commit().await.map_err(DbError::SqlxError)?;

        info!(user_id = %user_id, amount, balance, reason = %reason, "credits added");
        Ok(balance)
    }

    /// Decrease the balance, returning the new balance
    ///
    /// # Errors
    ///
    /// `InsufficientCredits` when `amount` exceeds the balance; the balance
    /// is left unchanged and no event is written.
    pub async fn deduct_credits(&self, user_id: &str, amount: i64, reason: &str) -> Result<i64> {
        if amount <= 0 {
            return Err(CadenceError::InvalidInput(
                "Credit amount must be positive".to_string(),
            ));
        }

        let now = Utc::now().timestamp();
        let mut tx = self.db.pool().begin().await.map_err(DbError::SqlxError)?;

        let updated = sqlx::query(
            "UPDATE users SET credits = credits - ? WHERE id = ? AND credits >= ?",
        )
        .bind(amount)
        .bind(user_id)
        .bind(amount)
        .execute(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        if updated.rows_affected() == 0 {
            let available = sqlx::query("SELECT credits FROM users WHERE id = ?")
                .bind(user_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(DbError::SqlxError)?
                .map(|r| r.get::<i64, _>("credits"));
            tx.rollback().await.map_err(DbError::SqlxError)?;

            return match available {
                Some(available) => Err(QuotaError::InsufficientCredits {
                    required: amount,
                    available,
                }
                .into()),
                None => Err(CadenceError::NotFound(format!("user {}", user_id))),
            };
        }

        let event = UsageEvent::new(user_id, UsageKind::CreditDeduct, amount, now)
            .with_source(AllowanceSource::Credits)
            .with_reason(reason);
        insert_usage_event(&mut *tx, &event).await?;

        let balance = balance_in(&mut tx, user_id).await?;
        tx.commit().await.map_err(DbError::SqlxError)?;

        info!(user_id = %user_id, amount, balance, reason = %reason, "credits deducted");
        Ok(balance)
    }

    /// Credit a completed one-time purchase of `price_id`
    pub async fn apply_credit_pack(&self, user_id: &str, price_id: &str) -> Result<i64> {
        let credits = *self.credit_packs.get(price_id).ok_or_else(|| {
            CadenceError::InvalidInput(format!("Unknown credit pack price id: {}", price_id))
        })?;
        self.add_credits(user_id, credits, &format!("credit pack {}", price_id))
            .await
    }

    pub async fn credit_balance(&self, user_id: &str) -> Result<i64> {
        self.db
            .get_user(user_id)
            .await?
            .map(|user| user.credits)
            .ok_or_else(|| CadenceError::NotFound(format!("user {}", user_id)))
    }

    /// Most recent audit events for a user, newest first
    pub async fn usage_events(&self, user_id: &str, limit: u32) -> Result<Vec<UsageEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, kind, source, amount, reason, post_id, month_bucket, created_at
            FROM usage_events
            WHERE user_id = ?
            ORDER BY created_at DESC, rowid DESC
            LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter()
            .map(|r| {
                let kind: String = r.get("kind");
                let kind = UsageKind::parse(&kind).ok_or_else(|| DbError::CorruptRow {
                    table: "usage_events",
                    reason: format!("unknown kind '{}'", kind),
                })?;
                let source: Option<String> = r.get("source");

                Ok(UsageEvent {
                    id: r.get("id"),
                    user_id: r.get("user_id"),
                    kind,
                    source: source.as_deref().and_then(AllowanceSource::parse),
                    amount: r.get("amount"),
                    reason: r.get("reason"),
                    post_id: r.get("post_id"),
                    month_bucket: r.get("month_bucket"),
                    created_at: r.get("created_at"),
                })
            })
            .collect()
    }
}

async fn balance_in(tx: &mut sqlx::Transaction<'_, Sqlite>, user_id: &str) -> Result<i64> {
    let row = sqlx::query("SELECT credits FROM users WHERE id = ?")
        .bind(user_id)
        .fetch_one(&mut **tx)
        .await
        .map_err(DbError::SqlxError)?;
    Ok(row.get("credits"))
}

/// Append an audit event using any executor (pool or open transaction)
pub(crate) async fn insert_usage_event<'e, E>(executor: E, event: &UsageEvent) -> Result<()>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO usage_events
            (id, user_id, kind, source, amount, reason, post_id, month_bucket, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&event.id)
    .bind(&event.user_id)
    .bind(event.kind.as_str())
    .bind(event.source.map(|s| s.as_str()))
    .bind(event.amount)
    .bind(&event.reason)
    .bind(&event.post_id)
    .bind(&event.month_bucket)
    .bind(event.created_at)
    .execute(executor)
    .await
    .map_err(DbError::SqlxError)?;

    Ok(())
}
