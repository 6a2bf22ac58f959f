//! reqwest implementations of the upstream traits

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{HeaderMap, AUTHORIZATION};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, error};

use super::{ContentGenerator, SocialUpstream, TokenGrant, UpstreamResult};
use crate::config::{GeneratorConfig, UpstreamConfig};
use crate::error::{CadenceError, ConfigError, PublishError, Result};
use crate::types::GeneratedContent;

const MAX_ERROR_BODY: usize = 500;

fn build_client(timeout: Duration, field: &str) -> Result<Client> {
    Client::builder().timeout(timeout).build().map_err(|e| {
        ConfigError::InvalidValue {
            field: field.to_string(),
            reason: format!("failed to build HTTP client: {}", e),
        }
        .into()
    })
}

/// Human-readable message from an error response body
///
/// Providers disagree on the shape, so this tries `message`,
/// `error_description` and `error` (string or `{ message }`) before falling
/// back to the raw body.
pub fn extract_error_message(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "<empty response body>".to_string();
    }

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        let from_field = |field: &str| -> Option<String> {
            match value.get(field)? {
                Value::String(s) if !s.is_empty() => Some(s.clone()),
                Value::Object(obj) => obj
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                _ => None,
            }
        };
        if let Some(message) = from_field("message")
            .or_else(|| from_field("error_description"))
            .or_else(|| from_field("error"))
        {
            return message;
        }
    }

    truncate(trimmed, MAX_ERROR_BODY)
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max).collect();
    out.push_str("...");
    out
}

async fn read_body(resp: reqwest::Response) -> String {
    match resp.text().await {
        Ok(text) => text,
        Err(err) => format!("<failed to read response body: {err}>"),
    }
}

/// Post id from the JSON body, or the `x-restli-id` header some APIs use
fn external_id(headers: &HeaderMap, body: &str) -> Option<String> {
    let from_body = serde_json::from_str::<Value>(body).ok().and_then(|v| {
        match v.get("id")? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    });

    from_body.or_else(|| {
        headers
            .get("x-restli-id")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    })
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
}

/// OAuth2 social API client
pub struct HttpUpstream {
    http: Client,
    api_base_url: String,
    token_url: String,
    client_id: String,
    client_secret: SecretString,
}

impl HttpUpstream {
    pub fn new(config: &UpstreamConfig, timeout: Duration) -> Result<Self> {
        Ok(Self {
            http: build_client(timeout, "upstream")?,
            api_base_url: config.api_base_url.trim_end_matches('/').to_string(),
            token_url: config.token_url.clone(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret()?,
        })
    }
}

#[async_trait]
impl SocialUpstream for HttpUpstream {
    async fn refresh_access_token(&self, refresh_token: &str) -> UpstreamResult<TokenGrant> {
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.expose_secret()),
        ];

        let resp = self
            .http
            .post(&self.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| PublishError::TokenRefreshFailed(e.to_string()))?;

        let status = resp.status();
        let body = read_body(resp).await;
        if !status.is_success() {
            let message = extract_error_message(&body);
            error!(status = %status, message = %message, "token refresh rejected");
            return Err(PublishError::TokenRefreshFailed(message));
        }

        let token: TokenResponse = serde_json::from_str(&body).map_err(|e| {
            PublishError::TokenRefreshFailed(format!("malformed token response: {}", e))
        })?;

        // Providers that omit expires_in get a conservative hour
        let expires_in = token.expires_in.unwrap_or(3600);
        Ok(TokenGrant {
            access_token: token.access_token,
            refresh_token: token.refresh_token.filter(|t| !t.is_empty()),
            expires_at: Utc::now().timestamp() + expires_in,
        })
    }

    async fn publish(
        &self,
        access_token: &str,
        text: &str,
        image_url: Option<&str>,
    ) -> UpstreamResult<String> {
        let mut payload = json!({ "text": text });
        if let Some(url) = image_url {
            payload["image_url"] = json!(url);
        }

        let resp = self
            .http
            .post(format!("{}/posts", self.api_base_url))
            .header(AUTHORIZATION, format!("Bearer {}", access_token))
            .json(&payload)
            .send()
            .await
            .map_err(|e| PublishError::UpstreamPublishFailed {
                status: e.status().map(|s| s.as_u16()).unwrap_or(0),
                message: e.to_string(),
            })?;

        let status = resp.status();
        let headers = resp.headers().clone();
        let body = read_body(resp).await;

        if !status.is_success() {
            let message = extract_error_message(&body);
            error!(status = %status, message = %message, "upstream publish rejected");
            return Err(PublishError::UpstreamPublishFailed {
                status: status.as_u16(),
                message,
            });
        }

        let id = external_id(&headers, &body).ok_or_else(|| PublishError::UpstreamPublishFailed {
            status: status.as_u16(),
            message: "response did not include a post id".to_string(),
        })?;
        debug!(external_post_id = %id, "upstream accepted post");
        Ok(id)
    }
}

/// JSON-over-HTTP content generator
pub struct HttpContentGenerator {
    http: Client,
    endpoint: String,
    api_key: Option<SecretString>,
}

impl HttpContentGenerator {
    pub fn new(config: &GeneratorConfig, timeout: Duration) -> Result<Self> {
        Ok(Self {
            http: build_client(timeout, "generator")?,
            endpoint: config.endpoint.clone(),
            api_key: config.api_key(),
        })
    }
}

#[async_trait]
impl ContentGenerator for HttpContentGenerator {
    async fn generate(&self, topic: &str, tone: &str) -> Result<GeneratedContent> {
        let mut request = self
            .http
            .post(&self.endpoint)
            .json(&json!({ "topic": topic, "tone": tone }));
        if let Some(key) = &self.api_key {
            request = request.header(AUTHORIZATION, format!("Bearer {}", key.expose_secret()));
        }

        let resp = request
            .send()
            .await
            .map_err(|e| CadenceError::Generation(e.to_string()))?;

        let status = resp.status();
        let body = read_body(resp).await;
        if !status.is_success() {
            return Err(CadenceError::Generation(format!(
                "generator returned {}: {}",
                status,
                extract_error_message(&body)
            )));
        }

        let content: GeneratedContent = serde_json::from_str(&body)
            .map_err(|e| CadenceError::Generation(format!("malformed generator response: {}", e)))?;
        if content.text.trim().is_empty() {
            return Err(CadenceError::Generation(
                "generator returned empty text".to_string(),
            ));
        }
        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_extract_error_message_shapes() {
        assert_eq!(
            extract_error_message(r#"{"message":"Duplicate post"}"#),
            "Duplicate post"
        );
        assert_eq!(
            extract_error_message(r#"{"error":"invalid_grant","error_description":"Token revoked"}"#),
            "Token revoked"
        );
        assert_eq!(
            extract_error_message(r#"{"error":{"message":"Rate limited"}}"#),
            "Rate limited"
        );
        assert_eq!(extract_error_message(r#"{"error":"invalid_grant"}"#), "invalid_grant");
        assert_eq!(extract_error_message("Bad Gateway"), "Bad Gateway");
        assert_eq!(extract_error_message("  "), "<empty response body>");
    }

    #[test]
    fn test_extract_error_message_truncates_raw_bodies() {
        let body = "x".repeat(2000);
        let message = extract_error_message(&body);
        assert_eq!(message.len(), MAX_ERROR_BODY + 3);
        assert!(message.ends_with("..."));
    }

    #[test]
    fn test_external_id_from_body_or_header() {
        let empty = HeaderMap::new();
        assert_eq!(
            external_id(&empty, r#"{"id":"post_123"}"#).as_deref(),
            Some("post_123")
        );
        assert_eq!(external_id(&empty, r#"{"id":42}"#).as_deref(), Some("42"));
        assert_eq!(external_id(&empty, ""), None);

        let mut headers = HeaderMap::new();
        headers.insert("x-restli-id", HeaderValue::from_static("urn:li:share:9"));
        assert_eq!(
            external_id(&headers, "").as_deref(),
            Some("urn:li:share:9")
        );
    }

    #[test]
    fn test_generated_content_parses_without_optional_fields() {
        let content: GeneratedContent = serde_json::from_str(r#"{"text":"hello"}"#).unwrap();
        assert_eq!(content.text, "hello");
        assert!(content.image_url.is_none());
        assert!(content.article_url.is_none());
    }
}
