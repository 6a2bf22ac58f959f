//! Publish pipeline: resolve a valid upstream token and submit content
//!
//! The pipeline owns only the user's token fields. It never touches the
//! post store; the caller records the outcome.

use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::SchedulerConfig;
use crate::db::Database;
use crate::error::{PublishError, Result};
use crate::types::{PublishContent, User};
use crate::upstream::{SocialUpstream, UpstreamResult};

/// Refresh tokens this many seconds before they expire
pub const DEFAULT_REFRESH_SKEW_SECS: i64 = 300;

/// Result of a single publish attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOutcome {
    pub external_post_id: Option<String>,
    pub error: Option<PublishError>,
}

impl PublishOutcome {
    pub fn posted(external_post_id: String) -> Self {
        Self {
            external_post_id: Some(external_post_id),
            error: None,
        }
    }

    pub fn failed(error: PublishError) -> Self {
        Self {
            external_post_id: None,
            error: Some(error),
        }
    }

    pub fn success(&self) -> bool {
        self.external_post_id.is_some()
    }

    /// Message stored on the post when the attempt failed
    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(|e| e.to_string())
    }
}

#[derive(Clone)]
pub struct PublishPipeline {
    db: Database,
    upstream: Arc<dyn SocialUpstream>,
    refresh_skew: i64,
    call_timeout: Duration,
}

impl PublishPipeline {
    pub fn new(db: Database, upstream: Arc<dyn SocialUpstream>) -> Self {
        Self {
            db,
            upstream,
            refresh_skew: DEFAULT_REFRESH_SKEW_SECS,
            call_timeout: Duration::from_secs(10),
        }
    }

    pub fn from_config(
        db: Database,
        upstream: Arc<dyn SocialUpstream>,
        config: &SchedulerConfig,
    ) -> Self {
        Self::new(db, upstream)
            .with_refresh_skew(config.token_refresh_skew)
            .with_call_timeout(config.call_timeout())
    }

    pub fn with_refresh_skew(mut self, seconds: u64) -> Self {
        self.refresh_skew = i64::try_from(seconds).unwrap_or(DEFAULT_REFRESH_SKEW_SECS);
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Publish `content` as `user_id`
    ///
    /// Upstream failures are returned inside the outcome. `Err` is reserved
    /// for local failures such as the database being unavailable.
    pub async fn publish(&self, user_id: &str, content: &PublishContent) -> Result<PublishOutcome> {
        let Some(user) = self.db.get_user(user_id).await? else {
            return Ok(PublishOutcome::failed(PublishError::NotConnected));
        };

        let access_token = match self.resolve_access_token(&user).await? {
            Ok(token) => token,
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "cannot obtain upstream token");
                return Ok(PublishOutcome::failed(e));
            }
        };

        let submitted = self
            .with_timeout(self.upstream.publish(
                &access_token,
                &content.text,
                content.image_url.as_deref(),
            ))
            .await
            .unwrap_or_else(|| Err(PublishError::Timeout(self.timeout_millis())));

        match submitted {
            Ok(external_post_id) => {
                info!(user_id = %user_id, external_post_id = %external_post_id, "published");
                Ok(PublishOutcome::posted(external_post_id))
            }
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "upstream publish failed");
                Ok(PublishOutcome::failed(e))
            }
        }
    }

    /// The user's access token, refreshed first if it is about to expire
    async fn resolve_access_token(&self, user: &User) -> Result<UpstreamResult<String>> {
        let Some(current) = user.access_token.clone() else {
            return Ok(Err(PublishError::NotConnected));
        };

        let now = Utc::now().timestamp();
        let expiring = user
            .token_expires_at
            .is_some_and(|expires_at| now + self.refresh_skew >= expires_at);
        if !expiring {
            return Ok(Ok(current));
        }

        let Some(refresh_token) = user.refresh_token.as_deref() else {
            // Still usable for a few minutes; let the upstream decide
            if user.token_expires_at.is_some_and(|expires_at| expires_at > now) {
                return Ok(Ok(current));
            }
            return Ok(Err(PublishError::TokenRefreshFailed(
                "access token expired and no refresh token is stored".to_string(),
            )));
        };

        debug!(user_id = %user.id, "refreshing upstream access token");
        let refreshed = self
            .with_timeout(self.upstream.refresh_access_token(refresh_token))
            .await
            .unwrap_or_else(|| {
                Err(PublishError::TokenRefreshFailed(format!(
                    "token refresh timed out after {}ms",
                    self.timeout_millis()
                )))
            });

        let grant = match refreshed {
            Ok(grant) => grant,
            Err(e) => return Ok(Err(e)),
        };

        let refresh_token = grant.refresh_token.as_deref().unwrap_or(refresh_token);
        self.db
            .update_user_tokens(
                &user.id,
                &grant.access_token,
                Some(refresh_token),
                grant.expires_at,
            )
            .await?;

        info!(user_id = %user.id, expires_at = grant.expires_at, "refreshed upstream token");
        Ok(Ok(grant.access_token))
    }

    fn timeout_millis(&self) -> u64 {
        u64::try_from(self.call_timeout.as_millis()).unwrap_or(u64::MAX)
    }

    /// `None` when the call did not finish within the configured timeout
    async fn with_timeout<T>(&self, call: impl Future<Output = T>) -> Option<T> {
        tokio::time::timeout(self.call_timeout, call).await.ok()
    }
}
