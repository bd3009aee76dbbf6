//! External-service KB adapter.
//!
//! POSTs the query to a per-deployment search service with a bearer token
//! and a hard 5 second timeout. The service owns ranking; this adapter only
//! clamps confidences and enforces the article cap.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{KbAdapter, KbError, SearchScope};
use crate::protocol_constants::KB_SERVICE_TIMEOUT_SECS;
use crate::types::KbArticle;

#[derive(Serialize)]
struct SearchRequest<'a> {
    query: &'a str,
    tenant_id: &'a str,
    max: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<&'a str>,
}

#[derive(Deserialize)]
struct SearchReply {
    #[serde(default)]
    articles: Vec<KbArticle>,
}

/// HTTPS search-service client.
pub struct ServiceKbAdapter {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
}

impl ServiceKbAdapter {
    #[must_use]
    pub fn new(client: reqwest::Client, endpoint: &str, token: Option<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.to_string(),
            token,
        }
    }
}

#[async_trait]
impl KbAdapter for ServiceKbAdapter {
    fn name(&self) -> &'static str {
        "service"
    }

    async fn search(
        &self,
        query: &str,
        scope: &SearchScope,
    ) -> Result<Vec<KbArticle>, KbError> {
        let Some(token) = &self.token else {
            return Err(KbError::Unavailable("no bearer token configured".into()));
        };

        let body = SearchRequest {
            query,
            tenant_id: &scope.tenant_id,
            max: scope.max,
            context: scope.context.as_deref(),
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(token)
            .timeout(Duration::from_secs(KB_SERVICE_TIMEOUT_SECS))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    KbError::Timeout
                } else {
                    KbError::Http(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(KbError::Http(format!("status {}", response.status())));
        }

        let reply: SearchReply = response
            .json()
            .await
            .map_err(|e| KbError::Http(e.to_string()))?;

        let mut articles = reply.articles;
        articles.truncate(scope.max);
        for article in &mut articles {
            article.source = "service".to_string();
            article.confidence = article.confidence.clamp(0.0, 1.0);
        }
        Ok(articles)
    }
}
