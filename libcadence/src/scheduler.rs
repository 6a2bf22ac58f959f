//! Scheduler: the sweep and generation passes and the tasks that drive them
//!
//! The sweep pass publishes due posts. The generation pass keeps automated
//! users topped up with future posts according to their preferences. Both
//! run on their own fixed interval and may overlap each other, but a pass
//! never overlaps itself: a tick that finds the previous run still going
//! is skipped.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use rand::seq::SliceRandom;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::{Config, SchedulerConfig};
use crate::db::Database;
use crate::error::{CadenceError, Result};
use crate::preferences::next_run_times_for;
use crate::publisher::PublishPipeline;
use crate::quota::QuotaLedger;
use crate::store::PostStore;
use crate::types::{
    GeneratedContent, PostDraft, PublishContent, ScheduledPost, SchedulingPreference,
};
use crate::upstream::{ContentGenerator, SocialUpstream};

/// In-progress flag for one kind of pass, released on drop
struct PassGuard {
    flag: Arc<AtomicBool>,
}

impl PassGuard {
    fn try_acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag: flag.clone() })
    }
}

impl Drop for PassGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// The previous sweep was still running
    pub skipped: bool,
    pub due: usize,
    pub posted: usize,
    pub failed: usize,
    /// Posts cancelled, claimed elsewhere or finished by someone else
    pub lost: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GenerationReport {
    /// The previous generation pass was still running
    pub skipped: bool,
    pub users_considered: usize,
    pub posts_created: usize,
    /// Users that ran out of allowance
    pub users_blocked: usize,
    pub users_failed: usize,
}

enum SweepItem {
    Posted,
    Failed,
    Lost,
}

#[derive(Default)]
struct UserGeneration {
    created: usize,
    blocked: bool,
}

#[derive(Clone)]
pub struct Scheduler {
    db: Database,
    store: PostStore,
    ledger: QuotaLedger,
    pipeline: PublishPipeline,
    generator: Arc<dyn ContentGenerator>,
    config: SchedulerConfig,
    sweep_running: Arc<AtomicBool>,
    generation_running: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(
        db: Database,
        upstream: Arc<dyn SocialUpstream>,
        generator: Arc<dyn ContentGenerator>,
        config: &Config,
    ) -> Self {
        let scheduler = &config.scheduler;
        Self {
            store: PostStore::new(db.clone()).with_claim_ttl(scheduler.claim_ttl),
            ledger: QuotaLedger::from_config(db.clone(), config),
            pipeline: PublishPipeline::from_config(db.clone(), upstream, scheduler),
            db,
            generator,
            config: scheduler.clone(),
            sweep_running: Arc::new(AtomicBool::new(false)),
            generation_running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn store(&self) -> &PostStore {
        &self.store
    }

    pub fn ledger(&self) -> &QuotaLedger {
        &self.ledger
    }

    /// Publish every due pending post
    pub async fn run_sweep_pass(&self) -> Result<SweepReport> {
        let Some(_guard) = PassGuard::try_acquire(&self.sweep_running) else {
            debug!("previous sweep still running, skipping");
            return Ok(SweepReport {
                skipped: true,
                ..Default::default()
            });
        };

        let now = Utc::now().timestamp();
        let due = self.store.list_pending(now).await?;
        let mut report = SweepReport {
            due: due.len(),
            ..Default::default()
        };
        if due.is_empty() {
            return Ok(report);
        }

        let outcomes: Vec<SweepItem> = stream::iter(due)
            .map(|post| self.sweep_post(post))
            .buffer_unordered(self.config.sweep_concurrency.max(1))
            .collect()
            .await;

        for outcome in outcomes {
            match outcome {
                SweepItem::Posted => report.posted += 1,
                SweepItem::Failed => report.failed += 1,
                SweepItem::Lost => report.lost += 1,
            }
        }

        info!(
            due = report.due,
            posted = report.posted,
            failed = report.failed,
            lost = report.lost,
            "sweep pass complete"
        );
        Ok(report)
    }

    async fn sweep_post(&self, post: ScheduledPost) -> SweepItem {
        match self.try_sweep_post(&post).await {
            Ok(item) => item,
            Err(e) => {
                warn!(post_id = %post.id, user_id = %post.user_id, error = %e, "sweep failed for post");
                // If this fails too the claim expires and a later sweep retries
                if let Err(mark_err) = self.store.mark_failed(&post.id, &e.to_string()).await {
                    warn!(post_id = %post.id, error = %mark_err, "could not record failure");
                }
                SweepItem::Failed
            }
        }
    }

    async fn try_sweep_post(&self, post: &ScheduledPost) -> Result<SweepItem> {
        if !self.store.claim(&post.id, Utc::now().timestamp()).await? {
            debug!(post_id = %post.id, "post no longer claimable");
            return Ok(SweepItem::Lost);
        }

        let content = match post.publish_content() {
            Some(content) => content,
            None => match self.generate_late(post).await? {
                Some(content) => content,
                None => return Ok(SweepItem::Failed),
            },
        };

        let outcome = self.pipeline.publish(&post.user_id, &content).await?;

        match (&outcome.external_post_id, outcome.error_message()) {
            (Some(external_post_id), _) => {
                if self.store.mark_posted(&post.id, external_post_id).await? {
                    if let Err(e) = self.ledger.record_publish(&post.user_id, &post.id).await {
                        warn!(post_id = %post.id, error = %e, "could not record publish event");
                    }
                    Ok(SweepItem::Posted)
                } else {
                    warn!(post_id = %post.id, "post left pending state during publish");
                    Ok(SweepItem::Lost)
                }
            }
            (None, message) => {
                let message = message.unwrap_or_else(|| "publish failed".to_string());
                if self.store.mark_failed(&post.id, &message).await? {
                    Ok(SweepItem::Failed)
                } else {
                    Ok(SweepItem::Lost)
                }
            }
        }
    }

    /// Generate content for a due post that has none, billed like the
    /// generation pass
    ///
    /// Returns `None` after marking the post failed when the user has no
    /// allowance or generation fails.
    async fn generate_late(&self, post: &ScheduledPost) -> Result<Option<PublishContent>> {
        let decision = self.ledger.check_and_reserve(&post.user_id).await?;
        let source = match decision.into_result() {
            Ok(source) => source,
            Err(e) => {
                debug!(post_id = %post.id, user_id = %post.user_id, reason = %e, "no allowance for late generation");
                self.store.mark_failed(&post.id, &e.to_string()).await?;
                return Ok(None);
            }
        };

        let generated = match self.generate(&post.topic, &post.tone).await {
            Ok(generated) => generated,
            Err(e) => {
                warn!(post_id = %post.id, error = %e, "content generation failed");
                self.store.mark_failed(&post.id, &e.to_string()).await?;
                return Ok(None);
            }
        };

        if let Err(e) = self
            .ledger
            .commit(&post.user_id, source, Some(&post.id))
            .await
        {
            warn!(post_id = %post.id, user_id = %post.user_id, error = %e, "allowance gone before commit");
            self.store.mark_failed(&post.id, &e.to_string()).await?;
            return Ok(None);
        }

        self.store.set_content(&post.id, &generated).await?;
        Ok(Some(PublishContent {
            text: generated.text,
            image_url: generated.image_url,
        }))
    }

    /// Create upcoming posts for automated users below the pending ceiling
    pub async fn run_generation_pass(&self) -> Result<GenerationReport> {
        let Some(_guard) = PassGuard::try_acquire(&self.generation_running) else {
            debug!("previous generation pass still running, skipping");
            return Ok(GenerationReport {
                skipped: true,
                ..Default::default()
            });
        };

        let now = Utc::now();
        let preferences = self.db.list_automated_preferences().await?;
        let mut report = GenerationReport {
            users_considered: preferences.len(),
            ..Default::default()
        };

        for prefs in &preferences {
            match self.generate_for_user(prefs, now).await {
                Ok(user) => {
                    report.posts_created += user.created;
                    if user.blocked {
                        report.users_blocked += 1;
                    }
                }
                Err(e) => {
                    report.users_failed += 1;
                    warn!(user_id = %prefs.user_id, error = %e, "generation failed for user");
                }
            }
        }

        info!(
            users = report.users_considered,
            created = report.posts_created,
            blocked = report.users_blocked,
            failed = report.users_failed,
            "generation pass complete"
        );
        Ok(report)
    }

    async fn generate_for_user(
        &self,
        prefs: &SchedulingPreference,
        now: DateTime<Utc>,
    ) -> Result<UserGeneration> {
        let mut result = UserGeneration::default();
        let user_id = prefs.user_id.as_str();

        if prefs.topics.is_empty() {
            debug!(user_id = %user_id, "no topics configured, skipping");
            return Ok(result);
        }

        let ceiling = self.config.pending_ceiling as usize;
        let occupied = self
            .store
            .future_pending_slots(user_id, now.timestamp())
            .await?;
        if occupied.len() >= ceiling {
            return Ok(result);
        }
        let mut capacity = ceiling - occupied.len();

        for slot in next_run_times_for(prefs, now) {
            if capacity == 0 {
                break;
            }
            if occupied.contains(&slot.timestamp()) {
                continue;
            }

            let decision = self.ledger.check_and_reserve(user_id).await?;
            let Some(source) = decision.source.filter(|_| decision.allowed) else {
                debug!(
                    user_id = %user_id,
                    reason = decision.reason.as_deref().unwrap_or_default(),
                    "quota exhausted, skipping user"
                );
                result.blocked = true;
                break;
            };

            let topic = prefs
                .topics
                .choose(&mut rand::thread_rng())
                .cloned()
                .unwrap_or_default();
            let content = self.generate(&topic, &prefs.tone).await?;

            let post = self
                .store
                .create(
                    user_id,
                    &PostDraft {
                        topic,
                        tone: prefs.tone.clone(),
                        content: Some(content),
                        scheduled_at: slot.timestamp(),
                    },
                )
                .await?;

            // Unbilled posts must not reach the sweep
            if let Err(e) = self.ledger.commit(user_id, source, Some(&post.id)).await {
                if !self.store.delete(&post.id, user_id).await? {
                    warn!(post_id = %post.id, "could not remove unbilled post");
                }
                if let CadenceError::Quota(reason) = &e {
                    debug!(user_id = %user_id, reason = %reason, "allowance drained before commit");
                    result.blocked = true;
                    break;
                }
                return Err(e);
            }

            debug!(user_id = %user_id, post_id = %post.id, scheduled_at = %slot, "generated post");
            result.created += 1;
            capacity -= 1;
        }

        Ok(result)
    }

    async fn generate(&self, topic: &str, tone: &str) -> Result<GeneratedContent> {
        let timeout = self.config.call_timeout();
        tokio::time::timeout(timeout, self.generator.generate(topic, tone))
            .await
            .map_err(|_| {
                CadenceError::Generation(format!(
                    "content generation timed out after {}s",
                    timeout.as_secs()
                ))
            })?
    }

    /// Spawn both recurring passes
    ///
    /// Each tick spawns its pass so a slow pass cannot delay the timer; the
    /// pass guard turns an overlapping tick into a no-op.
    pub fn start(&self) -> SchedulerHandle {
        let (shutdown, rx) = watch::channel(false);

        let sweeper = self.clone();
        let sweep = spawn_recurring(
            "sweep",
            Duration::from_secs(self.config.sweep_interval),
            rx.clone(),
            move || {
                let scheduler = sweeper.clone();
                async move {
                    if let Err(e) = scheduler.run_sweep_pass().await {
                        warn!(error = %e, "sweep pass failed");
                    }
                }
            },
        );

        let generator = self.clone();
        let generation = spawn_recurring(
            "generation",
            Duration::from_secs(self.config.generation_interval),
            rx,
            move || {
                let scheduler = generator.clone();
                async move {
                    if let Err(e) = scheduler.run_generation_pass().await {
                        warn!(error = %e, "generation pass failed");
                    }
                }
            },
        );

        info!(
            sweep_interval = self.config.sweep_interval,
            generation_interval = self.config.generation_interval,
            "scheduler started"
        );

        SchedulerHandle {
            shutdown,
            tasks: vec![sweep, generation],
        }
    }
}

fn spawn_recurring<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    tick: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut in_flight: Vec<JoinHandle<()>> = Vec::new();

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    in_flight.retain_mut(|task| {
                        if !task.is_finished() {
                            return true;
                        }
                        if let Some(Err(e)) = FutureExt::now_or_never(&mut *task) {
                            warn!(task = name, error = %e, "pass task did not finish cleanly");
                        }
                        false
                    });
                    in_flight.push(tokio::spawn(tick()));
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        debug!(task = name, running = in_flight.len(), "waiting for in-flight passes");
        for task in in_flight {
            if let Err(e) = task.await {
                warn!(task = name, error = %e, "pass task did not finish cleanly");
            }
        }
    })
}

/// Running scheduler tasks
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Stop both timers and wait for in-flight passes to finish
    pub async fn stop(self) {
        if self.shutdown.send(true).is_err() {
            debug!("scheduler tasks already exited");
        }
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "scheduler task panicked");
            }
        }
        info!("scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::{create_test_user, setup_test_db};
    use crate::types::{
        AllowanceSource, PostStatus, SubscriptionState, SubscriptionStatus, User, UsageKind,
    };
    use crate::upstream::mock::{MockGenerator, MockUpstream};

    fn scheduler(db: &Database, upstream: &MockUpstream, generator: &MockGenerator) -> Scheduler {
        Scheduler::new(
            db.clone(),
            Arc::new(upstream.clone()),
            Arc::new(generator.clone()),
            &Config::default_config(),
        )
    }

    async fn connected_user(db: &Database) -> User {
        let user = create_test_user(db).await;
        db.update_user_tokens(
            &user.id,
            "access-0",
            Some("refresh-0"),
            Utc::now().timestamp() + 3600,
        )
        .await
        .unwrap();
        user
    }

    async fn due_post(store: &PostStore, user_id: &str, text: Option<&str>) -> ScheduledPost {
        store
            .create(
                user_id,
                &PostDraft {
                    topic: "launch".to_string(),
                    tone: "upbeat".to_string(),
                    content: text.map(|t| GeneratedContent {
                        text: t.to_string(),
                        image_url: None,
                        article_url: None,
                    }),
                    scheduled_at: Utc::now().timestamp() - 10,
                },
            )
            .await
            .unwrap()
    }

    async fn automate(db: &Database, user_id: &str, topics: &[&str], plan: Option<&str>) {
        let prefs = SchedulingPreference {
            topics: topics.iter().map(|t| t.to_string()).collect(),
            automation_enabled: true,
            ..SchedulingPreference::defaults_for(user_id)
        };
        db.save_preference(&prefs).await.unwrap();

        if let Some(plan) = plan {
            subscribe(db, user_id, plan).await;
        }
    }

    async fn subscribe(db: &Database, user_id: &str, plan: &str) {
        db.upsert_subscription(&SubscriptionState {
            user_id: user_id.to_string(),
            plan_id: plan.to_string(),
            status: SubscriptionStatus::Active,
            current_period_start: None,
            current_period_end: None,
            provider_subscription_id: None,
            updated_at: Utc::now().timestamp(),
        })
        .await
        .unwrap();
    }

    async fn event_kinds(scheduler: &Scheduler, user_id: &str) -> Vec<(UsageKind, Option<AllowanceSource>)> {
        let mut kinds: Vec<_> = scheduler
            .ledger()
            .usage_events(user_id, 20)
            .await
            .unwrap()
            .into_iter()
            .map(|e| (e.kind, e.source))
            .collect();
        kinds.sort_by_key(|(kind, _)| kind.as_str());
        kinds
    }

    #[tokio::test]
    async fn test_sweep_publishes_due_post() {
        let (_dir, db) = setup_test_db().await;
        let user = connected_user(&db).await;
        let upstream = MockUpstream::success("post_123");
        let scheduler = scheduler(&db, &upstream, &MockGenerator::new());
        let post = due_post(scheduler.store(), &user.id, Some("Hello")).await;

        let report = scheduler.run_sweep_pass().await.unwrap();
        assert_eq!(report.due, 1);
        assert_eq!(report.posted, 1);

        let stored = scheduler.store().get(&post.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PostStatus::Posted);
        assert_eq!(stored.external_post_id.as_deref(), Some("post_123"));

        let events = scheduler.ledger().usage_events(&user.id, 10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, UsageKind::Publish);
        assert_eq!(events[0].post_id.as_deref(), Some(post.id.as_str()));
    }

    #[tokio::test]
    async fn test_sweep_ignores_future_posts() {
        let (_dir, db) = setup_test_db().await;
        let user = connected_user(&db).await;
        let upstream = MockUpstream::success("post_1");
        let scheduler = scheduler(&db, &upstream, &MockGenerator::new());
        due_post(scheduler.store(), &user.id, Some("now")).await;
        let later = scheduler
            .store()
            .create(
                &user.id,
                &PostDraft {
                    topic: "launch".to_string(),
                    tone: "upbeat".to_string(),
                    content: None,
                    scheduled_at: Utc::now().timestamp() + 3600,
                },
            )
            .await
            .unwrap();

        let report = scheduler.run_sweep_pass().await.unwrap();
        assert_eq!(report.due, 1);
        assert_eq!(upstream.publish_call_count(), 1);
        assert_eq!(
            scheduler.store().get(&later.id).await.unwrap().unwrap().status,
            PostStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_one_failure_does_not_abort_sweep() {
        let (_dir, db) = setup_test_db().await;
        let user = connected_user(&db).await;
        let upstream = MockUpstream::sequential().failing_on("boom");
        let scheduler = scheduler(&db, &upstream, &MockGenerator::new());

        let first = due_post(scheduler.store(), &user.id, Some("first")).await;
        let broken = due_post(scheduler.store(), &user.id, Some("boom")).await;
        let last = due_post(scheduler.store(), &user.id, Some("last")).await;

        let report = scheduler.run_sweep_pass().await.unwrap();
        assert_eq!((report.posted, report.failed), (2, 1));

        let store = scheduler.store();
        assert_eq!(
            store.get(&first.id).await.unwrap().unwrap().status,
            PostStatus::Posted
        );
        assert_eq!(
            store.get(&last.id).await.unwrap().unwrap().status,
            PostStatus::Posted
        );
        let failed = store.get(&broken.id).await.unwrap().unwrap();
        assert_eq!(failed.status, PostStatus::Failed);
        assert_eq!(
            failed.error_message.as_deref(),
            Some("upstream publish failed (500): Mock publish failed")
        );
    }

    #[tokio::test]
    async fn test_sweep_generates_missing_content() {
        let (_dir, db) = setup_test_db().await;
        let user = connected_user(&db).await;
        let upstream = MockUpstream::success("post_9");
        let generator = MockGenerator::new();
        let scheduler = scheduler(&db, &upstream, &generator);
        subscribe(&db, &user.id, "starter").await;
        let post = due_post(scheduler.store(), &user.id, None).await;

        let report = scheduler.run_sweep_pass().await.unwrap();
        assert_eq!(report.posted, 1);
        assert_eq!(generator.call_count(), 1);

        let stored = scheduler.store().get(&post.id).await.unwrap().unwrap();
        assert_eq!(stored.content.as_deref(), Some("[upbeat] Thoughts on launch"));
        assert_eq!(upstream.published()[0].1, "[upbeat] Thoughts on launch");

        assert_eq!(
            event_kinds(&scheduler, &user.id).await,
            vec![
                (UsageKind::Generation, Some(AllowanceSource::Subscription)),
                (UsageKind::Publish, None),
            ]
        );
        assert_eq!(
            scheduler
                .ledger()
                .posts_used_this_month(&user.id, Utc::now().timestamp())
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_sweep_late_generation_spends_access_key() {
        let (_dir, db) = setup_test_db().await;
        let user = connected_user(&db).await;
        let key = db.create_access_key(1, None, None).await.unwrap();
        db.redeem_access_key(&user.id, &key.code).await.unwrap();
        let scheduler = scheduler(&db, &MockUpstream::success("post_k"), &MockGenerator::new());
        let first = due_post(scheduler.store(), &user.id, None).await;
        let report = scheduler.run_sweep_pass().await.unwrap();
        assert_eq!(report.posted, 1);

        let key = db.get_access_key_by_code(&key.code).await.unwrap().unwrap();
        assert_eq!(key.posts_used, 1);
        assert_eq!(
            event_kinds(&scheduler, &user.id).await,
            vec![
                (UsageKind::Generation, Some(AllowanceSource::AccessKey)),
                (UsageKind::Publish, None),
            ]
        );
        let stored = scheduler.store().get(&first.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PostStatus::Posted);

        // The key is spent, so the next content-less post cannot be generated
        let second = due_post(scheduler.store(), &user.id, None).await;
        let report = scheduler.run_sweep_pass().await.unwrap();
        assert_eq!(report.failed, 1);
        let stored = scheduler.store().get(&second.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PostStatus::Failed);
        assert!(stored.content.is_none());
    }

    #[tokio::test]
    async fn test_sweep_without_allowance_fails_content_less_post() {
        let (_dir, db) = setup_test_db().await;
        let user = connected_user(&db).await;
        let upstream = MockUpstream::success("post_9");
        let generator = MockGenerator::new();
        let scheduler = scheduler(&db, &upstream, &generator);
        scheduler.ledger().add_credits(&user.id, 5, "seed").await.unwrap();
        let post = due_post(scheduler.store(), &user.id, None).await;

        let report = scheduler.run_sweep_pass().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(generator.call_count(), 0);
        assert_eq!(upstream.publish_call_count(), 0);

        let stored = scheduler.store().get(&post.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PostStatus::Failed);
        assert_eq!(
            stored.error_message.as_deref(),
            Some("no active subscription or access keys")
        );
        assert_eq!(scheduler.ledger().credit_balance(&user.id).await.unwrap(), 5);
        assert_eq!(
            event_kinds(&scheduler, &user.id).await,
            vec![(UsageKind::CreditAdd, None)]
        );
    }

    #[tokio::test]
    async fn test_sweep_marks_failed_when_generation_fails() {
        let (_dir, db) = setup_test_db().await;
        let user = connected_user(&db).await;
        let upstream = MockUpstream::success("post_9");
        let scheduler = scheduler(&db, &upstream, &MockGenerator::new().failing_on("launch"));
        subscribe(&db, &user.id, "starter").await;
        let post = due_post(scheduler.store(), &user.id, None).await;

        let report = scheduler.run_sweep_pass().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(upstream.publish_call_count(), 0);

        let stored = scheduler.store().get(&post.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PostStatus::Failed);
        assert!(stored.error_message.unwrap().contains("Mock generation failed"));
        assert!(scheduler
            .ledger()
            .usage_events(&user.id, 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_sweep_records_refresh_failure() {
        let (_dir, db) = setup_test_db().await;
        let user = create_test_user(&db).await;
        db.update_user_tokens(
            &user.id,
            "access-0",
            Some("refresh-0"),
            Utc::now().timestamp() + 120,
        )
        .await
        .unwrap();
        let upstream = MockUpstream::refresh_failure("invalid_grant");
        let scheduler = scheduler(&db, &upstream, &MockGenerator::new());
        let post = due_post(scheduler.store(), &user.id, Some("hi")).await;

        scheduler.run_sweep_pass().await.unwrap();
        assert_eq!(upstream.publish_call_count(), 0);
        let stored = scheduler.store().get(&post.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PostStatus::Failed);
        assert_eq!(
            stored.error_message.as_deref(),
            Some("token refresh failed: invalid_grant")
        );
    }

    #[tokio::test]
    async fn test_overlapping_sweep_is_skipped() {
        let (_dir, db) = setup_test_db().await;
        let user = connected_user(&db).await;
        let upstream = MockUpstream::with_delay(Duration::from_millis(300));
        let scheduler = scheduler(&db, &upstream, &MockGenerator::new());
        due_post(scheduler.store(), &user.id, Some("slow")).await;

        let (first, second) = tokio::join!(scheduler.run_sweep_pass(), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            scheduler.run_sweep_pass().await
        });

        let (first, second) = (first.unwrap(), second.unwrap());
        assert!(!first.skipped);
        assert!(second.skipped);
        assert_eq!(upstream.publish_call_count(), 1);

        // Guard is released once the pass finishes
        assert!(!scheduler.run_sweep_pass().await.unwrap().skipped);
    }

    #[tokio::test]
    async fn test_guard_is_per_pass() {
        let (_dir, db) = setup_test_db().await;
        let scheduler = scheduler(&db, &MockUpstream::success("x"), &MockGenerator::new());

        let _held = PassGuard::try_acquire(&scheduler.sweep_running).unwrap();
        assert!(scheduler.run_sweep_pass().await.unwrap().skipped);
        assert!(!scheduler.run_generation_pass().await.unwrap().skipped);
    }

    #[tokio::test]
    async fn test_generation_fills_up_to_ceiling() {
        let (_dir, db) = setup_test_db().await;
        let user = connected_user(&db).await;
        automate(&db, &user.id, &["rust", "sqlite"], Some("starter")).await;
        let generator = MockGenerator::new();
        let scheduler = scheduler(&db, &MockUpstream::success("x"), &generator);

        let report = scheduler.run_generation_pass().await.unwrap();
        assert_eq!(report.users_considered, 1);
        assert_eq!(report.posts_created, 3);
        assert_eq!(generator.call_count(), 3);

        let posts = scheduler.store().list_for_user(&user.id).await.unwrap();
        assert_eq!(posts.len(), 3);
        let now = Utc::now().timestamp();
        assert!(posts.iter().all(|p| p.scheduled_at > now && p.content.is_some()));

        let events = scheduler.ledger().usage_events(&user.id, 10).await.unwrap();
        assert_eq!(
            events.iter().filter(|e| e.kind == UsageKind::Generation).count(),
            3
        );

        // Already at the ceiling
        let again = scheduler.run_generation_pass().await.unwrap();
        assert_eq!(again.posts_created, 0);
        assert_eq!(generator.call_count(), 3);
    }

    #[tokio::test]
    async fn test_generation_skips_occupied_slots() {
        let (_dir, db) = setup_test_db().await;
        let user = connected_user(&db).await;
        automate(&db, &user.id, &["rust"], Some("starter")).await;
        let scheduler = scheduler(&db, &MockUpstream::success("x"), &MockGenerator::new());

        let prefs = db.get_preference(&user.id).await.unwrap();
        let first_slot = next_run_times_for(&prefs, Utc::now())[0];
        scheduler
            .store()
            .create(
                &user.id,
                &PostDraft {
                    topic: "manual".to_string(),
                    tone: "casual".to_string(),
                    content: None,
                    scheduled_at: first_slot.timestamp(),
                },
            )
            .await
            .unwrap();

        let report = scheduler.run_generation_pass().await.unwrap();
        assert_eq!(report.posts_created, 2);

        let posts = scheduler.store().list_for_user(&user.id).await.unwrap();
        let at_first_slot = posts
            .iter()
            .filter(|p| p.scheduled_at == first_slot.timestamp())
            .count();
        assert_eq!(at_first_slot, 1);
    }

    #[tokio::test]
    async fn test_generation_skips_blocked_and_topicless_users() {
        let (_dir, db) = setup_test_db().await;
        let blocked = connected_user(&db).await;
        automate(&db, &blocked.id, &["rust"], None).await;
        let topicless = connected_user(&db).await;
        automate(&db, &topicless.id, &[], Some("pro")).await;
        let generator = MockGenerator::new();
        let scheduler = scheduler(&db, &MockUpstream::success("x"), &generator);

        let report = scheduler.run_generation_pass().await.unwrap();
        assert_eq!(report.users_considered, 2);
        assert_eq!(report.posts_created, 0);
        assert_eq!(report.users_blocked, 1);
        assert_eq!(report.users_failed, 0);
        assert_eq!(generator.call_count(), 0);
    }

    #[tokio::test]
    async fn test_generation_stops_when_allowance_runs_out() {
        let (_dir, db) = setup_test_db().await;
        let user = connected_user(&db).await;
        automate(&db, &user.id, &["rust"], None).await;
        let key = db.create_access_key(2, None, None).await.unwrap();
        db.redeem_access_key(&user.id, &key.code).await.unwrap();
        let scheduler = scheduler(&db, &MockUpstream::success("x"), &MockGenerator::new());

        let report = scheduler.run_generation_pass().await.unwrap();
        assert_eq!(report.posts_created, 2);
        assert_eq!(report.users_blocked, 1);
    }

    #[tokio::test]
    async fn test_generation_drops_post_when_key_drained_before_commit() {
        let (_dir, db) = setup_test_db().await;
        let user = connected_user(&db).await;
        automate(&db, &user.id, &["rust"], None).await;
        let other = connected_user(&db).await;
        let key = db.create_access_key(1, None, None).await.unwrap();
        db.redeem_access_key(&user.id, &key.code).await.unwrap();
        db.redeem_access_key(&other.id, &key.code).await.unwrap();

        let scheduler = scheduler(
            &db,
            &MockUpstream::success("x"),
            &MockGenerator::with_delay(Duration::from_millis(300)),
        );
        let pass = tokio::spawn({
            let scheduler = scheduler.clone();
            async move { scheduler.run_generation_pass().await }
        });

        // Spend the last slot while the pass is waiting on the generator
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(db
            .consume_access_key(&other.id, None, Utc::now().timestamp())
            .await
            .unwrap()
            .is_some());

        let report = pass.await.unwrap().unwrap();
        assert_eq!(report.posts_created, 0);
        assert_eq!(report.users_blocked, 1);
        assert_eq!(report.users_failed, 0);

        assert!(scheduler
            .store()
            .list_for_user(&user.id)
            .await
            .unwrap()
            .is_empty());
        assert!(scheduler
            .ledger()
            .usage_events(&user.id, 10)
            .await
            .unwrap()
            .is_empty());
        let key = db.get_access_key_by_code(&key.code).await.unwrap().unwrap();
        assert_eq!(key.posts_used, 1);
    }

    #[tokio::test]
    async fn test_generation_failure_is_isolated_per_user() {
        let (_dir, db) = setup_test_db().await;
        let broken = connected_user(&db).await;
        automate(&db, &broken.id, &["cursed"], Some("pro")).await;
        let healthy = connected_user(&db).await;
        automate(&db, &healthy.id, &["rust"], Some("pro")).await;
        let scheduler = scheduler(
            &db,
            &MockUpstream::success("x"),
            &MockGenerator::new().failing_on("cursed"),
        );

        let report = scheduler.run_generation_pass().await.unwrap();
        assert_eq!(report.users_failed, 1);
        assert_eq!(report.posts_created, 3);
        assert!(scheduler
            .store()
            .list_for_user(&broken.id)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            scheduler.ledger().posts_used_this_month(&broken.id, Utc::now().timestamp())
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let (_dir, db) = setup_test_db().await;
        let user = connected_user(&db).await;
        let upstream = MockUpstream::success("post_live");
        let scheduler = scheduler(&db, &upstream, &MockGenerator::new());
        let post = due_post(scheduler.store(), &user.id, Some("tick")).await;

        let handle = scheduler.start();
        // First tick fires immediately
        for _ in 0..50 {
            if upstream.publish_call_count() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        handle.stop().await;

        let stored = scheduler.store().get(&post.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PostStatus::Posted);
        assert!(!scheduler.sweep_running.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn test_recurring_task_survives_panicking_pass() {
        let (shutdown, rx) = watch::channel(false);
        let ticks = Arc::new(std::sync::Mutex::new(0usize));

        let counter = ticks.clone();
        let task = spawn_recurring("panicky", Duration::from_millis(10), rx, move || {
            let counter = counter.clone();
            async move {
                let ticks = {
                    let mut count = counter.lock().unwrap();
                    *count += 1;
                    *count
                };
                assert_eq!(ticks, 0, "pass blew up");
            }
        });

        tokio::time::sleep(Duration::from_millis(60)).await;
        shutdown.send(true).unwrap();

        assert!(task.await.is_ok());
        assert!(*ticks.lock().unwrap() >= 2);
    }
}
