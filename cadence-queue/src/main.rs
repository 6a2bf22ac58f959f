//! cadence-queue - Operator tool for the Cadence engine
//!
//! Inspect and manage scheduled posts, quotas, credits and access keys.

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use libcadence::logging::{LogFormat, LoggingConfig};
use libcadence::preferences::next_run_times_for;
use libcadence::scheduling::parse_schedule;
use libcadence::types::GeneratedContent;
use libcadence::{
    CadenceError, Config, Database, PostDraft, PostStatus, PostStore, QuotaLedger, Result,
    ScheduledPost,
};
use serde_json::json;

#[derive(Parser, Debug)]
#[command(name = "cadence-queue")]
#[command(version)]
#[command(about = "Manage scheduled posts, quotas and access keys")]
#[command(long_about = "\
cadence-queue - Manage scheduled posts, quotas and access keys

DESCRIPTION:
    cadence-queue is the operator's view into the Cadence engine. It reads
    and writes the same database as the cadence-send daemon.

COMMANDS:
    list        List a user's posts
    schedule    Schedule a post for a user
    cancel      Cancel a pending post
    slots       Show a user's next publish times
    quota       Show a user's remaining allowance
    credits     Show or adjust a user's credit balance
    keys        Create, redeem, disable and list access keys
    usage       Show a user's usage history

USAGE EXAMPLES:
    # List a user's posts as JSON
    cadence-queue --format json list --user <USER_ID>

    # Schedule a post two hours from now
    cadence-queue schedule --user <USER_ID> --topic launch --at 2h

    # Cancel a pending post
    cadence-queue cancel <POST_ID> --user <USER_ID>

    # Create a 50-post access key valid for 30 days
    cadence-queue keys create --limit 50 --expires-in 30d

CONFIGURATION:
    Configuration file: ~/.config/cadence/config.toml
    Database location: ~/.local/share/cadence/cadence.db

    Override with environment variables:
        CADENCE_CONFIG    - Path to config file
        CADENCE_DB_PATH   - Path to database file

EXIT CODES:
    0 - Success
    1 - Operation failed
    2 - Configuration error
    3 - Invalid input (bad time format, amount, etc.)
    4 - Quota error (insufficient credits, invalid access key)
")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format: text or json
    #[arg(short, long, global = true, default_value = "text")]
    format: String,

    /// Enable verbose logging to stderr
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List a user's posts
    List {
        #[arg(short, long)]
        user: String,

        /// Only show posts with this status (pending, posted, failed)
        #[arg(short, long)]
        status: Option<String>,
    },

    /// Schedule a post
    Schedule {
        #[arg(short, long)]
        user: String,

        #[arg(long)]
        topic: String,

        #[arg(long, default_value = "professional")]
        tone: String,

        /// Post text; generated at publish time when omitted
        #[arg(long)]
        text: Option<String>,

        /// When to publish (e.g. "2h", "tomorrow 9am", RFC 3339)
        #[arg(long)]
        at: String,
    },

    /// Cancel a pending post
    Cancel {
        post_id: String,

        #[arg(short, long)]
        user: String,
    },

    /// Show a user's next publish times
    Slots {
        #[arg(short, long)]
        user: String,
    },

    /// Show a user's remaining allowance
    Quota {
        #[arg(short, long)]
        user: String,
    },

    /// Credit balance operations
    Credits {
        #[command(subcommand)]
        action: CreditAction,
    },

    /// Access key operations
    Keys {
        #[command(subcommand)]
        action: KeyAction,
    },

    /// Show a user's usage history
    Usage {
        #[arg(short, long)]
        user: String,

        #[arg(short, long, default_value_t = 20)]
        limit: u32,
    },
}

#[derive(Subcommand, Debug)]
enum CreditAction {
    /// Show the balance
    Balance {
        #[arg(short, long)]
        user: String,
    },
    /// Add credits
    Add {
        #[arg(short, long)]
        user: String,
        #[arg(short, long)]
        amount: i64,
        #[arg(short, long, default_value = "manual adjustment")]
        reason: String,
    },
    /// Deduct credits
    Deduct {
        #[arg(short, long)]
        user: String,
        #[arg(short, long)]
        amount: i64,
        #[arg(short, long, default_value = "manual adjustment")]
        reason: String,
    },
    /// Credit a purchased pack by its price id
    ApplyPack {
        #[arg(short, long)]
        user: String,
        #[arg(long)]
        price_id: String,
    },
}

#[derive(Subcommand, Debug)]
enum KeyAction {
    /// Create an access key
    Create {
        /// Posts the key grants across all its users
        #[arg(short, long)]
        limit: i64,

        /// Validity period (e.g. "30d"); no expiry when omitted
        #[arg(long)]
        expires_in: Option<String>,

        /// Redemption code; generated when omitted
        #[arg(long)]
        code: Option<String>,
    },
    /// Redeem a key for a user
    Redeem {
        #[arg(short, long)]
        user: String,
        code: String,
    },
    /// Disable a key
    Disable { code: String },
    /// List all keys, or one user's grants
    List {
        #[arg(short, long)]
        user: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "error" };
    LoggingConfig::new(LogFormat::Text, level.to_string(), cli.verbose).init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Output {
    Text,
    Json,
}

async fn run(cli: Cli) -> Result<()> {
    let output = match cli.format.as_str() {
        "text" => Output::Text,
        "json" => Output::Json,
        other => {
            return Err(CadenceError::InvalidInput(format!(
                "Invalid format '{}'. Must be 'text' or 'json'",
                other
            )))
        }
    };

    let config = Config::load()?;
    let db = Database::new(&config.database.path).await?;
    let store = PostStore::new(db.clone()).with_claim_ttl(config.scheduler.claim_ttl);
    let ledger = QuotaLedger::from_config(db.clone(), &config);

    match cli.command {
        Commands::List { user, status } => cmd_list(&store, &user, status.as_deref(), output).await,
        Commands::Schedule {
            user,
            topic,
            tone,
            text,
            at,
        } => cmd_schedule(&db, &store, &ledger, &user, topic, tone, text, &at, output).await,
        Commands::Cancel { post_id, user } => cmd_cancel(&store, &post_id, &user, output).await,
        Commands::Slots { user } => cmd_slots(&db, &user, output).await,
        Commands::Quota { user } => cmd_quota(&db, &ledger, &user, output).await,
        Commands::Credits { action } => cmd_credits(&ledger, action, output).await,
        Commands::Keys { action } => cmd_keys(&db, action, output).await,
        Commands::Usage { user, limit } => cmd_usage(&ledger, &user, limit, output).await,
    }
}

fn print_json(value: &serde_json::Value) {
    match serde_json::to_string_pretty(value) {
        Ok(s) => println!("{}", s),
        Err(e) => eprintln!("Error: failed to encode output: {}", e),
    }
}

fn format_timestamp(ts: i64) -> String {
    DateTime::<Utc>::from_timestamp(ts, 0)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| ts.to_string())
}

/// Truncate content to max characters with ellipsis
fn truncate_content(content: &str, max_len: usize) -> String {
    if content.chars().count() <= max_len {
        content.to_string()
    } else {
        format!("{}...", content.chars().take(max_len).collect::<String>())
    }
}

/// Format time until scheduled time in human-readable format
fn format_time_until(now: i64, scheduled_at: i64) -> String {
    let diff = scheduled_at - now;

    if diff < 0 {
        return "overdue".to_string();
    }

    let minutes = diff / 60;
    let hours = minutes / 60;
    let days = hours / 24;

    if days > 0 {
        format!("in {} day{}", days, if days == 1 { "" } else { "s" })
    } else if hours > 0 {
        format!("in {} hour{}", hours, if hours == 1 { "" } else { "s" })
    } else if minutes > 0 {
        format!("in {} minute{}", minutes, if minutes == 1 { "" } else { "s" })
    } else {
        "in <1 minute".to_string()
    }
}

async fn require_user(db: &Database, user_id: &str) -> Result<()> {
    match db.get_user(user_id).await? {
        Some(_) => Ok(()),
        None => Err(CadenceError::NotFound(format!("user {}", user_id))),
    }
}

async fn cmd_list(
    store: &PostStore,
    user_id: &str,
    status: Option<&str>,
    output: Output,
) -> Result<()> {
    let status = status
        .map(|s| {
            PostStatus::parse(s).ok_or_else(|| {
                CadenceError::InvalidInput(format!(
                    "Invalid status '{}'. Must be pending, posted or failed",
                    s
                ))
            })
        })
        .transpose()?;

    let mut posts = store.list_for_user(user_id).await?;
    if let Some(status) = status {
        posts.retain(|p| p.status == status);
    }

    if output == Output::Json {
        print_json(&json!(posts));
        return Ok(());
    }

    let now = Utc::now().timestamp();
    for post in &posts {
        let preview = post
            .content
            .as_deref()
            .map(|c| truncate_content(c, 50))
            .unwrap_or_else(|| format!("<{}>", post.topic));
        let when = match post.status {
            PostStatus::Pending => format_time_until(now, post.scheduled_at),
            _ => format_timestamp(post.posted_at.unwrap_or(post.scheduled_at)),
        };
        println!("{} | {} | {} | {}", post.id, post.status, preview, when);
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn cmd_schedule(
    db: &Database,
    store: &PostStore,
    ledger: &QuotaLedger,
    user_id: &str,
    topic: String,
    tone: String,
    text: Option<String>,
    at: &str,
    output: Output,
) -> Result<()> {
    require_user(db, user_id).await?;
    let scheduled_at = parse_schedule(at, Utc::now())?;

    // Content-less posts are billed when the sweep generates them
    if text.is_none() {
        ledger.check_and_reserve(user_id).await?.into_result()?;
    }

    let post: ScheduledPost = store
        .create(
            user_id,
            &PostDraft {
                topic,
                tone,
                content: text.map(|text| GeneratedContent {
                    text,
                    image_url: None,
                    article_url: None,
                }),
                scheduled_at: scheduled_at.timestamp(),
            },
        )
        .await?;

    match output {
        Output::Json => print_json(&json!(post)),
        Output::Text => println!("{} scheduled for {}", post.id, scheduled_at.to_rfc3339()),
    }
    Ok(())
}

async fn cmd_cancel(store: &PostStore, post_id: &str, user_id: &str, output: Output) -> Result<()> {
    let cancelled = store.delete(post_id, user_id).await?;

    match output {
        Output::Json => print_json(&json!({ "post_id": post_id, "cancelled": cancelled })),
        Output::Text if cancelled => println!("Cancelled {}", post_id),
        Output::Text => {}
    }

    if cancelled {
        return Ok(());
    }

    match store.get(post_id).await? {
        Some(post) if post.user_id == user_id => {
            let state = if post.status.is_terminal() {
                post.status.to_string()
            } else {
                "in flight".to_string()
            };
            Err(CadenceError::ConcurrencyConflict(format!(
                "post {} is {} and can no longer be cancelled",
                post_id, state
            )))
        }
        _ => Err(CadenceError::NotFound(format!(
            "no cancellable post {} for user {}",
            post_id, user_id
        ))),
    }
}

async fn cmd_slots(db: &Database, user_id: &str, output: Output) -> Result<()> {
    require_user(db, user_id).await?;
    let prefs = db.get_preference(user_id).await?;
    let slots = next_run_times_for(&prefs, Utc::now());

    match output {
        Output::Json => print_json(&json!({
            "user_id": user_id,
            "timezone": prefs.timezone,
            "automation_enabled": prefs.automation_enabled,
            "slots": slots.iter().map(|s| s.to_rfc3339()).collect::<Vec<_>>(),
        })),
        Output::Text => {
            for slot in &slots {
                println!("{}", slot.to_rfc3339());
            }
        }
    }
    Ok(())
}

async fn cmd_quota(db: &Database, ledger: &QuotaLedger, user_id: &str, output: Output) -> Result<()> {
    require_user(db, user_id).await?;
    let now = Utc::now().timestamp();
    let decision = ledger.check_and_reserve(user_id).await?;
    let used = ledger.posts_used_this_month(user_id, now).await?;
    let credits = ledger.credit_balance(user_id).await?;

    match output {
        Output::Json => print_json(&json!({
            "user_id": user_id,
            "allowed": decision.allowed,
            "source": decision.source,
            "remaining": decision.remaining,
            "reason": decision.reason,
            "posts_used_this_month": used,
            "credits": credits,
        })),
        Output::Text => {
            if decision.allowed {
                let remaining = decision
                    .remaining
                    .map(|r| r.to_string())
                    .unwrap_or_else(|| "unlimited".to_string());
                let source = decision
                    .source
                    .map(|s| s.to_string())
                    .unwrap_or_default();
                println!("allowed: {} remaining via {}", remaining, source);
            } else {
                println!(
                    "blocked: {}",
                    decision.reason.as_deref().unwrap_or("no allowance")
                );
            }
            println!("used this month: {}", used);
            println!("credits: {}", credits);
        }
    }
    Ok(())
}

async fn cmd_credits(ledger: &QuotaLedger, action: CreditAction, output: Output) -> Result<()> {
    let (user_id, balance) = match action {
        CreditAction::Balance { user } => {
            let balance = ledger.credit_balance(&user).await?;
            (user, balance)
        }
        CreditAction::Add {
            user,
            amount,
            reason,
        } => {
            let balance = ledger.add_credits(&user, amount, &reason).await?;
            (user, balance)
        }
        CreditAction::Deduct {
            user,
            amount,
            reason,
        } => {
            let balance = ledger.deduct_credits(&user, amount, &reason).await?;
            (user, balance)
        }
        CreditAction::ApplyPack { user, price_id } => {
            let balance = ledger.apply_credit_pack(&user, &price_id).await?;
            (user, balance)
        }
    };

    match output {
        Output::Json => print_json(&json!({ "user_id": user_id, "credits": balance })),
        Output::Text => println!("{}", balance),
    }
    Ok(())
}

async fn cmd_keys(db: &Database, action: KeyAction, output: Output) -> Result<()> {
    match action {
        KeyAction::Create {
            limit,
            expires_in,
            code,
        } => {
            let expires_at = expires_in
                .map(|s| {
                    let duration = humantime::parse_duration(&s).map_err(|e| {
                        CadenceError::InvalidInput(format!("Invalid duration '{}': {}", s, e))
                    })?;
                    i64::try_from(duration.as_secs())
                        .ok()
                        .and_then(|secs| Utc::now().timestamp().checked_add(secs))
                        .ok_or_else(|| {
                            CadenceError::InvalidInput(format!("Duration '{}' is too large", s))
                        })
                })
                .transpose()?;

            let key = db.create_access_key(limit, expires_at, code.as_deref()).await?;
            match output {
                Output::Json => print_json(&json!(key)),
                Output::Text => println!("{}", key.code),
            }
        }
        KeyAction::Redeem { user, code } => {
            let grant = db.redeem_access_key(&user, &code).await?;
            match output {
                Output::Json => print_json(&json!(grant)),
                Output::Text => println!(
                    "Redeemed {} ({} posts remaining)",
                    grant.key.code,
                    grant.remaining()
                ),
            }
        }
        KeyAction::Disable { code } => {
            if !db.disable_access_key(&code).await? {
                return Err(CadenceError::NotFound(format!("access key {}", code)));
            }
            match output {
                Output::Json => print_json(&json!({ "code": code, "disabled": true })),
                Output::Text => println!("Disabled {}", code),
            }
        }
        KeyAction::List { user: Some(user) } => {
            let grants = db.list_user_grants(&user).await?;
            match output {
                Output::Json => print_json(&json!(grants)),
                Output::Text => {
                    for grant in &grants {
                        println!(
                            "{} | {} | {}/{} used by user | {} left",
                            grant.key.code,
                            grant.key.status,
                            grant.posts_used,
                            grant.key.posts_limit,
                            grant.remaining()
                        );
                    }
                }
            }
        }
        KeyAction::List { user: None } => {
            let keys = db.list_access_keys().await?;
            match output {
                Output::Json => print_json(&json!(keys)),
                Output::Text => {
                    for key in &keys {
                        let expires = key
                            .expires_at
                            .map(format_timestamp)
                            .unwrap_or_else(|| "never".to_string());
                        println!(
                            "{} | {} | {}/{} | expires {}",
                            key.code, key.status, key.posts_used, key.posts_limit, expires
                        );
                    }
                }
            }
        }
    }
    Ok(())
}

async fn cmd_usage(ledger: &QuotaLedger, user_id: &str, limit: u32, output: Output) -> Result<()> {
    let events = ledger.usage_events(user_id, limit).await?;

    match output {
        Output::Json => print_json(&json!(events)),
        Output::Text => {
            for event in &events {
                let source = event.source.map(|s| s.to_string()).unwrap_or_default();
                println!(
                    "{} | {} | {} | {} | {}",
                    format_timestamp(event.created_at),
                    event.kind,
                    event.amount,
                    source,
                    event.reason.as_deref().unwrap_or("")
                );
            }
        }
    }
    Ok(())
}
