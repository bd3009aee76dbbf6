//! External LLM client used for intent classification and call summaries.
//!
//! Speaks a chat-completions-style HTTPS API. Replies are expected to carry
//! JSON, but models wrap it in prose often enough that the extraction
//! helper scans for the first complete JSON object instead of trusting the
//! whole body.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// LLM failure. Callers degrade (intent `unknown`, fallback summary)
/// rather than propagate.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("llm request failed: {0}")]
    Http(String),
    #[error("llm request timed out")]
    Timeout,
    #[error("llm reply unusable: {0}")]
    InvalidReply(String),
    #[error("llm client not configured")]
    Unconfigured,
}

/// One completion request.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub system: String,
    pub user: String,
    pub temperature: f32,
}

/// Minimal chat-completions client seam.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Returns the assistant message content.
    async fn complete(&self, request: ChatRequest) -> Result<String, LlmError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// JSON Extraction
// ─────────────────────────────────────────────────────────────────────────────

/// Extracts the first parseable JSON object from a reply, tolerating prose
/// around it.
///
/// Scans for balanced `{...}` spans outside string literals and parses
/// each candidate. A balanced span that is not valid JSON (prose like
/// `{1}`) does not end the search - the scan resumes at the next `{` so a
/// later valid object is still found. Returns `None` when no candidate
/// parses.
#[must_use]
pub fn extract_json_object(reply: &str) -> Option<Value> {
    let bytes = reply.as_bytes();
    let mut search_from = 0usize;

    while let Some(found) = reply[search_from..].find('{') {
        let start = search_from + found;
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;
        let mut end = None;

        for (offset, &byte) in bytes[start..].iter().enumerate() {
            if in_string {
                if escaped {
                    escaped = false;
                } else if byte == b'\\' {
                    escaped = true;
                } else if byte == b'"' {
                    in_string = false;
                }
                continue;
            }
            match byte {
                b'"' => in_string = true,
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        end = Some(start + offset);
                        break;
                    }
                }
                _ => {}
            }
        }

        if let Some(end) = end {
            if let Ok(value) = serde_json::from_str(&reply[start..=end]) {
                return Some(value);
            }
        }

        // Decoy or unbalanced span: resume just past its opening brace so
        // objects nested inside or following it are still considered.
        search_from = start + 1;
    }
    None
}

// ─────────────────────────────────────────────────────────────────────────────
// HTTP Client
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatCompletionBody<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatCompletionReply {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

/// Chat-completions client over HTTPS.
pub struct HttpLlm {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpLlm {
    /// Creates the client. The shared `reqwest::Client` comes from bootstrap
    /// so connection pools are reused across services.
    #[must_use]
    pub fn new(client: reqwest::Client, base_url: &str, api_key: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }
}

#[async_trait]
impl LlmClient for HttpLlm {
    async fn complete(&self, request: ChatRequest) -> Result<String, LlmError> {
        let body = ChatCompletionBody {
            model: &request.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &request.system,
                },
                ChatMessage {
                    role: "user",
                    content: &request.user,
                },
            ],
            temperature: request.temperature,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout
                } else {
                    LlmError::Http(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(LlmError::Http(format!("status {}", response.status())));
        }

        let reply: ChatCompletionReply = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidReply(e.to_string()))?;

        reply
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| LlmError::InvalidReply("empty choices".to_string()))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Mock Client
// ─────────────────────────────────────────────────────────────────────────────

/// Scripted LLM for tests and keyless development.
///
/// Replies are popped front-to-back; when the script runs dry the client
/// returns the configured fallback (an error by default).
#[derive(Default)]
pub struct MockLlm {
    replies: parking_lot::Mutex<std::collections::VecDeque<Result<String, String>>>,
    /// Reply used once the script is exhausted, if any.
    repeat_last: parking_lot::Mutex<Option<String>>,
    pub calls: std::sync::atomic::AtomicU64,
}

impl MockLlm {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a successful reply.
    pub fn push_reply(&self, reply: &str) {
        self.replies.lock().push_back(Ok(reply.to_string()));
    }

    /// Queues a failure.
    pub fn push_error(&self, message: &str) {
        self.replies.lock().push_back(Err(message.to_string()));
    }

    /// Repeats this reply forever once the queue is empty.
    pub fn repeat(&self, reply: &str) {
        *self.repeat_last.lock() = Some(reply.to_string());
    }
}

#[async_trait]
impl LlmClient for MockLlm {
    async fn complete(&self, _request: ChatRequest) -> Result<String, LlmError> {
        self.calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if let Some(scripted) = self.replies.lock().pop_front() {
            return scripted.map_err(LlmError::Http);
        }
        if let Some(repeat) = self.repeat_last.lock().clone() {
            return Ok(repeat);
        }
        Err(LlmError::Unconfigured)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_plain_object() {
        let value = extract_json_object(r#"{"intent":"billing","confidence":0.8}"#).unwrap();
        assert_eq!(value["intent"], "billing");
    }

    #[test]
    fn extracts_object_wrapped_in_prose() {
        let reply = "Sure! Here is the classification:\n{\"intent\":\"card_block\",\"confidence\":0.9}\nLet me know if you need anything else.";
        let value = extract_json_object(reply).unwrap();
        assert_eq!(value["intent"], "card_block");
    }

    #[test]
    fn braces_inside_strings_do_not_confuse_the_scan() {
        let reply = r#"{"resolution":"customer said {literally} nothing","confidence":0.4}"#;
        let value = extract_json_object(reply).unwrap();
        assert_eq!(value["resolution"], "customer said {literally} nothing");
    }

    #[test]
    fn no_object_yields_none() {
        assert!(extract_json_object("I could not classify that.").is_none());
        assert!(extract_json_object("{unbalanced").is_none());
        assert!(extract_json_object("see note {1} and {2}").is_none());
    }

    #[test]
    fn decoy_balanced_span_does_not_hide_a_later_object() {
        let reply = r#"see note {1}, result: {"intent":"billing","confidence":0.8}"#;
        let value = extract_json_object(reply).unwrap();
        assert_eq!(value["intent"], "billing");
    }

    #[test]
    fn object_nested_in_an_unbalanced_span_is_still_found() {
        let reply = r#"{ oops {"intent":"card_block","confidence":0.9}"#;
        let value = extract_json_object(reply).unwrap();
        assert_eq!(value["intent"], "card_block");
    }

    #[tokio::test]
    async fn mock_pops_scripted_replies_in_order() {
        let mock = MockLlm::new();
        mock.push_reply("one");
        mock.push_error("down");

        let req = ChatRequest {
            model: "m".into(),
            system: "s".into(),
            user: "u".into(),
            temperature: 0.0,
        };

        assert_eq!(mock.complete(req.clone()).await.unwrap(), "one");
        assert!(mock.complete(req).await.is_err());
        assert_eq!(mock.calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }
}
