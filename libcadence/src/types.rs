//! Core types for Cadence

use chrono::{DateTime, Datelike, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An account as seen by the engine
///
/// Identity is owned by the auth subsystem; the engine only reads the
/// upstream tokens and mutates the token fields and the credit balance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    pub display_name: Option<String>,
    #[serde(skip_serializing)]
    pub access_token: Option<String>,
    #[serde(skip_serializing)]
    pub refresh_token: Option<String>,
    pub token_expires_at: Option<i64>,
    pub credits: i64,
    pub created_at: i64,
}

impl User {
    pub fn new(email: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            email,
            display_name: None,
            access_token: None,
            refresh_token: None,
            token_expires_at: None,
            credits: 0,
            created_at: Utc::now().timestamp(),
        }
    }
}

/// Per-user cadence settings used by the generation pass
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulingPreference {
    pub user_id: String,
    pub posts_per_week: u32,
    pub posting_days: Vec<Weekday>,
    pub posting_time: NaiveTime,
    pub timezone: String,
    pub topics: Vec<String>,
    pub tone: String,
    pub automation_enabled: bool,
    pub updated_at: i64,
}

impl SchedulingPreference {
    /// Defaults applied when a user's preferences are first read
    pub fn defaults_for(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            posts_per_week: 3,
            posting_days: vec![Weekday::Mon, Weekday::Wed, Weekday::Fri],
            posting_time: NaiveTime::from_hms_opt(9, 0, 0).unwrap_or(NaiveTime::MIN),
            timezone: "UTC".to_string(),
            topics: Vec::new(),
            tone: "professional".to_string(),
            automation_enabled: false,
            updated_at: Utc::now().timestamp(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PostStatus {
    Pending,
    Posted,
    Failed,
}

impl PostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostStatus::Pending => "pending",
            PostStatus::Posted => "posted",
            PostStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(PostStatus::Pending),
            "posted" => Some(PostStatus::Posted),
            "failed" => Some(PostStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, PostStatus::Pending)
    }
}

impl std::fmt::Display for PostStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Output of the content generation collaborator
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GeneratedContent {
    pub text: String,
    pub image_url: Option<String>,
    pub article_url: Option<String>,
}

/// Content handed to the publish pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishContent {
    pub text: String,
    pub image_url: Option<String>,
}

/// Input for creating a scheduled post
#[derive(Debug, Clone)]
pub struct PostDraft {
    pub topic: String,
    pub tone: String,
    pub content: Option<GeneratedContent>,
    pub scheduled_at: i64,
}

/// One unit of publish work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledPost {
    pub id: String,
    pub user_id: String,
    pub topic: String,
    pub tone: String,
    pub content: Option<String>,
    pub image_url: Option<String>,
    pub article_url: Option<String>,
    pub scheduled_at: i64,
    pub status: PostStatus,
    pub external_post_id: Option<String>,
    pub error_message: Option<String>,
    pub claimed_at: Option<i64>,
    pub created_at: i64,
    pub posted_at: Option<i64>,
}

impl ScheduledPost {
    /// Content ready for publishing, if it has been generated
    pub fn publish_content(&self) -> Option<PublishContent> {
        self.content.as_ref().map(|text| PublishContent {
            text: text.clone(),
            image_url: self.image_url.clone(),
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Cancelled,
    PastDue,
    Unpaid,
    Incomplete,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Cancelled => "cancelled",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Unpaid => "unpaid",
            SubscriptionStatus::Incomplete => "incomplete",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(SubscriptionStatus::Active),
            "cancelled" | "canceled" => Some(SubscriptionStatus::Cancelled),
            "past_due" => Some(SubscriptionStatus::PastDue),
            "unpaid" => Some(SubscriptionStatus::Unpaid),
            "incomplete" => Some(SubscriptionStatus::Incomplete),
            _ => None,
        }
    }

    /// Whether this status grants the plan's monthly allowance
    pub fn grants_allowance(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Active | SubscriptionStatus::Incomplete
        )
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubscriptionState {
    pub user_id: String,
    pub plan_id: String,
    pub status: SubscriptionStatus,
    pub current_period_start: Option<i64>,
    pub current_period_end: Option<i64>,
    pub provider_subscription_id: Option<String>,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AccessKeyStatus {
    Active,
    Expired,
    Exhausted,
    Disabled,
}

impl AccessKeyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessKeyStatus::Active => "active",
            AccessKeyStatus::Expired => "expired",
            AccessKeyStatus::Exhausted => "exhausted",
            AccessKeyStatus::Disabled => "disabled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(AccessKeyStatus::Active),
            "expired" => Some(AccessKeyStatus::Expired),
            "exhausted" => Some(AccessKeyStatus::Exhausted),
            "disabled" => Some(AccessKeyStatus::Disabled),
            _ => None,
        }
    }
}

impl std::fmt::Display for AccessKeyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A shareable, capacity-limited allowance
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessKey {
    pub id: String,
    pub code: String,
    pub posts_limit: i64,
    pub posts_used: i64,
    pub valid_from: i64,
    pub expires_at: Option<i64>,
    pub status: AccessKeyStatus,
    pub created_at: i64,
}

impl AccessKey {
    pub fn remaining_capacity(&self) -> i64 {
        (self.posts_limit - self.posts_used).max(0)
    }

    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }

    /// Active, inside its validity window and not used up
    pub fn is_usable_at(&self, now: i64) -> bool {
        self.status == AccessKeyStatus::Active
            && self.valid_from <= now
            && !self.is_expired_at(now)
            && self.remaining_capacity() > 0
    }
}

/// A user's binding to an access key with its own consumption counter
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessKeyGrant {
    pub user_id: String,
    pub key: AccessKey,
    pub posts_used: i64,
    pub granted_at: i64,
}

impl AccessKeyGrant {
    /// Posts this user may still draw from the key
    pub fn remaining(&self) -> i64 {
        (self.key.posts_limit - self.posts_used)
            .min(self.key.remaining_capacity())
            .max(0)
    }
}

/// Which allowance a billable action was drawn from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AllowanceSource {
    Subscription,
    AccessKey,
    Credits,
}

impl AllowanceSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            AllowanceSource::Subscription => "subscription",
            AllowanceSource::AccessKey => "access_key",
            AllowanceSource::Credits => "credits",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "subscription" => Some(AllowanceSource::Subscription),
            "access_key" => Some(AllowanceSource::AccessKey),
            "credits" => Some(AllowanceSource::Credits),
            _ => None,
        }
    }
}

impl std::fmt::Display for AllowanceSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UsageKind {
    Generation,
    Publish,
    CreditAdd,
    CreditDeduct,
}

impl UsageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageKind::Generation => "generation",
            UsageKind::Publish => "publish",
            UsageKind::CreditAdd => "credit_add",
            UsageKind::CreditDeduct => "credit_deduct",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "generation" => Some(UsageKind::Generation),
            "publish" => Some(UsageKind::Publish),
            "credit_add" => Some(UsageKind::CreditAdd),
            "credit_deduct" => Some(UsageKind::CreditDeduct),
            _ => None,
        }
    }
}

impl std::fmt::Display for UsageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Immutable audit record of a quota or credit affecting action
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsageEvent {
    pub id: String,
    pub user_id: String,
    pub kind: UsageKind,
    pub source: Option<AllowanceSource>,
    pub amount: i64,
    pub reason: Option<String>,
    pub post_id: Option<String>,
    pub month_bucket: String,
    pub created_at: i64,
}

impl UsageEvent {
    pub fn new(user_id: &str, kind: UsageKind, amount: i64, now: i64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            kind,
            source: None,
            amount,
            reason: None,
            post_id: None,
            month_bucket: month_bucket(now),
            created_at: now,
        }
    }

    pub fn with_source(mut self, source: AllowanceSource) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_post(mut self, post_id: Option<&str>) -> Self {
        self.post_id = post_id.map(str::to_string);
        self
    }
}

/// Calendar month bucket (`YYYY-MM`, UTC) for a Unix timestamp
pub fn month_bucket(timestamp: i64) -> String {
    let dt = DateTime::<Utc>::from_timestamp(timestamp, 0).unwrap_or_default();
    format!("{:04}-{:02}", dt.year(), dt.month())
}
