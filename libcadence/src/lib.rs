//! Cadence - scheduling and usage metering for automated social posting
//!
//! This library holds the engine behind the `cadence-send` daemon and the
//! `cadence-queue` operator tool: the quota ledger, the post store, the
//! publish pipeline, the scheduler and the preference resolver.

pub mod access_keys;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod preferences;
pub mod publisher;
pub mod quota;
pub mod scheduler;
pub mod scheduling;
pub mod store;
pub mod types;
pub mod upstream;

// Re-export commonly used types
pub use config::Config;
pub use db::Database;
pub use error::{CadenceError, PublishError, QuotaError, Result};
pub use publisher::{PublishOutcome, PublishPipeline};
pub use quota::{QuotaDecision, QuotaLedger};
pub use scheduler::{GenerationReport, Scheduler, SchedulerHandle, SweepReport};
pub use store::PostStore;
pub use types::{
    AccessKey, AccessKeyGrant, AllowanceSource, PostDraft, PostStatus, ScheduledPost,
    SchedulingPreference, UsageEvent, User,
};
