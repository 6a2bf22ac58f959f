//! Mock upstream and generator for testing
//!
//! Both mocks can be cloned; clones share their call counters, so a test can
//! hand one copy to the engine and keep another to inspect afterwards.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;

use super::{ContentGenerator, SocialUpstream, TokenGrant, UpstreamResult};
use crate::error::{CadenceError, PublishError, Result};
use crate::types::GeneratedContent;

/// Configuration for mock upstream behavior
#[derive(Debug, Clone)]
pub struct MockUpstreamConfig {
    /// Id returned by successful publishes; a counter suffix is appended
    /// when `sequential_ids` is set
    pub post_id: String,
    pub sequential_ids: bool,

    /// Error returned by every publish
    pub publish_error: Option<PublishError>,

    /// Publishes whose text contains one of these fail with a 500
    pub failing_texts: Vec<String>,

    /// Error message returned by every refresh
    pub refresh_error: Option<String>,

    /// Refresh token handed back on refresh (`None` mimics providers that
    /// keep the old one valid)
    pub rotated_refresh_token: Option<String>,

    /// Delay before completing any call
    pub delay: Duration,

    pub refresh_call_count: Arc<Mutex<usize>>,
    pub publish_call_count: Arc<Mutex<usize>>,

    /// (access token, text) of every publish attempt
    pub published: Arc<Mutex<Vec<(String, String)>>>,
}

impl Default for MockUpstreamConfig {
    fn default() -> Self {
        Self {
            post_id: "mock-post".to_string(),
            sequential_ids: false,
            publish_error: None,
            failing_texts: Vec::new(),
            refresh_error: None,
            rotated_refresh_token: None,
            delay: Duration::from_millis(0),
            refresh_call_count: Arc::new(Mutex::new(0)),
            publish_call_count: Arc::new(Mutex::new(0)),
            published: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MockUpstream {
    config: MockUpstreamConfig,
}

impl MockUpstream {
    pub fn new(config: MockUpstreamConfig) -> Self {
        Self { config }
    }

    /// Every publish succeeds with `post_id`
    pub fn success(post_id: &str) -> Self {
        Self::new(MockUpstreamConfig {
            post_id: post_id.to_string(),
            ..Default::default()
        })
    }

    /// Every publish succeeds with a distinct id (`mock-post-1`, ...)
    pub fn sequential() -> Self {
        Self::new(MockUpstreamConfig {
            sequential_ids: true,
            ..Default::default()
        })
    }

    pub fn publish_failure(status: u16, message: &str) -> Self {
        Self::new(MockUpstreamConfig {
            publish_error: Some(PublishError::UpstreamPublishFailed {
                status,
                message: message.to_string(),
            }),
            ..Default::default()
        })
    }

    pub fn refresh_failure(message: &str) -> Self {
        Self::new(MockUpstreamConfig {
            refresh_error: Some(message.to_string()),
            ..Default::default()
        })
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self::new(MockUpstreamConfig {
            delay,
            ..Default::default()
        })
    }

    /// Fail publishes of any text containing `fragment`
    pub fn failing_on(mut self, fragment: &str) -> Self {
        self.config.failing_texts.push(fragment.to_string());
        self
    }

    pub fn rotating_refresh_token(mut self, token: &str) -> Self {
        self.config.rotated_refresh_token = Some(token.to_string());
        self
    }

    pub fn refresh_call_count(&self) -> usize {
        *self.config.refresh_call_count.lock().unwrap()
    }

    pub fn publish_call_count(&self) -> usize {
        *self.config.publish_call_count.lock().unwrap()
    }

    pub fn published(&self) -> Vec<(String, String)> {
        self.config.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl SocialUpstream for MockUpstream {
    async fn refresh_access_token(&self, refresh_token: &str) -> UpstreamResult<TokenGrant> {
        let call = {
            let mut count = self.config.refresh_call_count.lock().unwrap();
            *count += 1;
            *count
        };

        if !self.config.delay.is_zero() {
            sleep(self.config.delay).await;
        }

        if let Some(message) = &self.config.refresh_error {
            return Err(PublishError::TokenRefreshFailed(message.clone()));
        }

        Ok(TokenGrant {
            access_token: format!("refreshed-{}-{}", refresh_token, call),
            refresh_token: self.config.rotated_refresh_token.clone(),
            expires_at: Utc::now().timestamp() + 3600,
        })
    }

    async fn publish(
        &self,
        access_token: &str,
        text: &str,
        _image_url: Option<&str>,
    ) -> UpstreamResult<String> {
        let call = {
            let mut count = self.config.publish_call_count.lock().unwrap();
            *count += 1;
            *count
        };
        self.config
            .published
            .lock()
            .unwrap()
            .push((access_token.to_string(), text.to_string()));

        if !self.config.delay.is_zero() {
            sleep(self.config.delay).await;
        }

        if let Some(error) = &self.config.publish_error {
            return Err(error.clone());
        }
        if self.config.failing_texts.iter().any(|f| text.contains(f)) {
            return Err(PublishError::UpstreamPublishFailed {
                status: 500,
                message: "Mock publish failed".to_string(),
            });
        }

        if self.config.sequential_ids {
            Ok(format!("{}-{}", self.config.post_id, call))
        } else {
            Ok(self.config.post_id.clone())
        }
    }
}

/// Mock content generator
#[derive(Debug, Clone, Default)]
pub struct MockGenerator {
    /// Topics that fail generation
    pub failing_topics: Vec<String>,
    pub delay: Duration,
    pub call_count: Arc<Mutex<usize>>,
}

impl MockGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_on(mut self, topic: &str) -> Self {
        self.failing_topics.push(topic.to_string());
        self
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    pub fn call_count(&self) -> usize {
        *self.call_count.lock().unwrap()
    }
}

#[async_trait]
impl ContentGenerator for MockGenerator {
    async fn generate(&self, topic: &str, tone: &str) -> Result<GeneratedContent> {
        *self.call_count.lock().unwrap() += 1;

        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }

        if self.failing_topics.iter().any(|t| t == topic) {
            return Err(CadenceError::Generation(format!(
                "Mock generation failed for '{}'",
                topic
            )));
        }

        Ok(GeneratedContent {
            text: format!("[{}] Thoughts on {}", tone, topic),
            image_url: None,
            article_url: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_clones_share_counters() {
        let mock = MockUpstream::success("post_123");
        let handed_out = mock.clone();

        assert_eq!(handed_out.publish("tok", "hi", None).await.unwrap(), "post_123");
        assert_eq!(mock.publish_call_count(), 1);
        assert_eq!(mock.published(), vec![("tok".to_string(), "hi".to_string())]);
    }

    #[tokio::test]
    async fn test_sequential_ids() {
        let mock = MockUpstream::sequential();
        assert_eq!(mock.publish("t", "a", None).await.unwrap(), "mock-post-1");
        assert_eq!(mock.publish("t", "b", None).await.unwrap(), "mock-post-2");
    }

    #[tokio::test]
    async fn test_scripted_failures() {
        let mock = MockUpstream::sequential().failing_on("boom");
        assert!(mock.publish("t", "fine", None).await.is_ok());
        assert!(matches!(
            mock.publish("t", "boom!", None).await,
            Err(PublishError::UpstreamPublishFailed { status: 500, .. })
        ));

        let refresh = MockUpstream::refresh_failure("invalid_grant");
        assert_eq!(
            refresh.refresh_access_token("r").await,
            Err(PublishError::TokenRefreshFailed("invalid_grant".to_string()))
        );
        assert_eq!(refresh.refresh_call_count(), 1);
    }

    #[tokio::test]
    async fn test_mock_generator() {
        let generator = MockGenerator::new().failing_on("bad");
        let content = generator.generate("rust", "witty").await.unwrap();
        assert!(content.text.contains("rust"));
        assert!(generator.generate("bad", "witty").await.is_err());
        assert_eq!(generator.call_count(), 2);
    }
}
