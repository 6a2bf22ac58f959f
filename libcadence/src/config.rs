//! Configuration management for Cadence

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub upstream: Option<UpstreamConfig>,
    #[serde(default)]
    pub generator: Option<GeneratorConfig>,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default = "default_plans")]
    pub plans: Vec<PlanConfig>,
    #[serde(default)]
    pub credit_packs: Vec<CreditPackConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

/// Third-party social API the pipeline publishes to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub api_base_url: String,
    pub token_url: String,
    pub client_id: String,
    /// Prefer `CADENCE_UPSTREAM_CLIENT_SECRET` over storing this in the file
    #[serde(default)]
    pub client_secret: Option<String>,
}

impl UpstreamConfig {
    pub fn client_secret(&self) -> Result<SecretString> {
        secret_from_env_or("CADENCE_UPSTREAM_CLIENT_SECRET", self.client_secret.as_deref())
            .ok_or_else(|| ConfigError::MissingField("upstream.client_secret".to_string()).into())
    }
}

/// Content generation collaborator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorConfig {
    pub endpoint: String,
    /// Prefer `CADENCE_GENERATOR_API_KEY` over storing this in the file
    #[serde(default)]
    pub api_key: Option<String>,
}

impl GeneratorConfig {
    pub fn api_key(&self) -> Option<SecretString> {
        secret_from_env_or("CADENCE_GENERATOR_API_KEY", self.api_key.as_deref())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Seconds between sweep passes
    pub sweep_interval: u64,
    /// Seconds between generation passes
    pub generation_interval: u64,
    /// Automated users with this many future pending posts are left alone
    pub pending_ceiling: u32,
    /// Timeout applied to every upstream and generator call, in seconds
    pub call_timeout: u64,
    /// Refresh access tokens expiring within this many seconds
    pub token_refresh_skew: u64,
    /// Claims older than this are treated as abandoned by a crashed sweep
    pub claim_ttl: u64,
    /// Maximum posts published concurrently within one sweep
    pub sweep_concurrency: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sweep_interval: 60,
            generation_interval: 3600,
            pending_ceiling: 3,
            call_timeout: 10,
            token_refresh_skew: 300,
            claim_ttl: 900,
            sweep_concurrency: 1,
        }
    }
}

impl SchedulerConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sweep_interval == 0 {
            return Err(invalid("scheduler.sweep_interval", "must be greater than zero"));
        }
        if self.generation_interval == 0 {
            return Err(invalid(
                "scheduler.generation_interval",
                "must be greater than zero",
            ));
        }
        if self.call_timeout == 0 {
            return Err(invalid("scheduler.call_timeout", "must be greater than zero"));
        }
        if self.sweep_concurrency == 0 {
            return Err(invalid("scheduler.sweep_concurrency", "must be at least 1"));
        }
        Ok(())
    }
}

/// Monthly post allowance of a subscription plan; `-1` is unlimited
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlanConfig {
    pub id: String,
    pub posts_limit: i64,
}

/// Credits granted by a one-time purchase of `price_id`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreditPackConfig {
    pub price_id: String,
    pub credits: i64,
}

fn default_plans() -> Vec<PlanConfig> {
    vec![
        PlanConfig {
            id: "starter".to_string(),
            posts_limit: 30,
        },
        PlanConfig {
            id: "pro".to_string(),
            posts_limit: 120,
        },
        PlanConfig {
            id: "agency".to_string(),
            posts_limit: -1,
        },
    ]
}

fn invalid(field: &str, reason: &str) -> crate::error::CadenceError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

fn secret_from_env_or(var: &str, fallback: Option<&str>) -> Option<SecretString> {
    std::env::var(var)
        .ok()
        .filter(|value| !value.is_empty())
        .or_else(|| fallback.map(str::to_string))
        .map(SecretString::from)
}

impl Config {
    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        let config_path = resolve_config_path()?;
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        let mut config: Config = toml::from_str(&content).map_err(ConfigError::ParseError)?;

        if let Ok(db_path) = std::env::var("CADENCE_DB_PATH") {
            config.database.path = db_path;
        }

        config.validate()?;
        Ok(config)
    }

    /// Create a default configuration
    pub fn default_config() -> Self {
        Self {
            database: DatabaseConfig {
                path: "~/.local/share/cadence/cadence.db".to_string(),
            },
            upstream: None,
            generator: None,
            scheduler: SchedulerConfig::default(),
            plans: default_plans(),
            credit_packs: Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.scheduler.validate()?;

        for plan in &self.plans {
            if plan.posts_limit < -1 {
                return Err(invalid(
                    &format!("plans.{}.posts_limit", plan.id),
                    "must be -1 (unlimited) or a non-negative count",
                ));
            }
        }

        for pack in &self.credit_packs {
            if pack.credits <= 0 {
                return Err(invalid(
                    &format!("credit_packs.{}.credits", pack.price_id),
                    "must be positive",
                ));
            }
        }

        Ok(())
    }

    pub fn plan_limit(&self, plan_id: &str) -> Option<i64> {
        self.plans
            .iter()
            .find(|plan| plan.id == plan_id)
            .map(|plan| plan.posts_limit)
    }
}

/// Resolve the configuration file path following XDG Base Directory spec
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("CADENCE_CONFIG") {
        return Ok(PathBuf::from(shellexpand::tilde(&path).to_string()));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("cadence").join("config.toml"))
}
