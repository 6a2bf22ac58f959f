//! External collaborators: the social platform and the content generator
//!
//! The engine only talks to these through the traits below. Production
//! builds use the reqwest implementations in [`http`]; tests use
//! [`mock`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{PublishError, Result};
use crate::types::GeneratedContent;

pub mod http;

// Available outside of cfg(test) so integration tests and the binaries'
// test suites can use it.
pub mod mock;

pub type UpstreamResult<T> = std::result::Result<T, PublishError>;

/// Fresh credentials from an OAuth2 refresh
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    /// Absent when the provider keeps the previous refresh token valid
    pub refresh_token: Option<String>,
    /// Unix timestamp
    pub expires_at: i64,
}

/// The third-party social API posts are published to
#[async_trait]
pub trait SocialUpstream: Send + Sync {
    /// Exchange a refresh token for a new access token
    ///
    /// # Errors
    ///
    /// `PublishError::TokenRefreshFailed` with the provider's message.
    async fn refresh_access_token(&self, refresh_token: &str) -> UpstreamResult<TokenGrant>;

    /// Publish a post on behalf of the token's owner, returning the
    /// platform's id for it
    ///
    /// # Errors
    ///
    /// `PublishError::UpstreamPublishFailed` for any non-success response.
    async fn publish(
        &self,
        access_token: &str,
        text: &str,
        image_url: Option<&str>,
    ) -> UpstreamResult<String>;
}

/// Produces post copy for a topic
#[async_trait]
pub trait ContentGenerator: Send + Sync {
    /// # Errors
    ///
    /// `CadenceError::Generation` when the collaborator fails or returns
    /// nothing usable.
    async fn generate(&self, topic: &str, tone: &str) -> Result<GeneratedContent>;
}
