//! Intent classification.
//!
//! Sends a structured prompt to the LLM and normalises the resulting label
//! into a stable snake_case vocabulary. Classification never fails upward:
//! any LLM error, timeout or malformed reply degrades to `unknown` with
//! zero confidence.

use std::sync::Arc;

use crate::config::LlmConfig;
use crate::llm::{extract_json_object, ChatRequest, LlmClient};
use crate::types::IntentVerdict;

/// Maximum normalised intent length.
const MAX_INTENT_LEN: usize = 50;

const SYSTEM_PROMPT: &str = "You classify the intent of a single line spoken by a \
call-centre customer. Reply with a JSON object only: \
{\"intent\": \"<short_snake_case_label>\", \"confidence\": <0..1>}. \
Use \"unknown\" when the line is not classifiable.";

/// Normalises a raw intent label.
///
/// Lowercase, `[^\w\s-]` stripped, whitespace and dashes collapsed to
/// single underscores, truncated to 50 chars. Idempotent:
/// `normalise(normalise(x)) == normalise(x)`. Empty input normalises to
/// `unknown`.
#[must_use]
pub fn normalise_intent(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len().min(MAX_INTENT_LEN));
    let mut last_was_sep = true;

    for c in raw.to_lowercase().chars() {
        let mapped = if c.is_alphanumeric() {
            Some(c)
        } else if c.is_whitespace() || c == '-' || c == '_' {
            None
        } else {
            // Stripped entirely (punctuation, symbols).
            continue;
        };

        match mapped {
            Some(c) => {
                out.push(c);
                last_was_sep = false;
            }
            None => {
                if !last_was_sep {
                    out.push('_');
                    last_was_sep = true;
                }
            }
        }
    }

    while out.ends_with('_') {
        out.pop();
    }
    if out.chars().count() > MAX_INTENT_LEN {
        out = out.chars().take(MAX_INTENT_LEN).collect();
    }
    while out.ends_with('_') {
        out.pop();
    }

    if out.is_empty() {
        "unknown".to_string()
    } else {
        out
    }
}

/// LLM-backed classifier.
pub struct IntentClassifier {
    llm: Arc<dyn LlmClient>,
    config: LlmConfig,
}

impl IntentClassifier {
    #[must_use]
    pub fn new(llm: Arc<dyn LlmClient>, config: LlmConfig) -> Self {
        Self { llm, config }
    }

    /// Classifies one transcript line. Never errors; degraded results carry
    /// `unknown` with zero confidence.
    pub async fn classify(
        &self,
        interaction_id: &str,
        seq: u64,
        text: &str,
        model_override: Option<&str>,
    ) -> IntentVerdict {
        let request = ChatRequest {
            model: model_override
                .unwrap_or(&self.config.intent_model)
                .to_string(),
            system: SYSTEM_PROMPT.to_string(),
            user: format!("Customer line: {text:?}"),
            temperature: self.config.intent_temperature,
        };

        let reply = match self.llm.complete(request).await {
            Ok(reply) => reply,
            Err(e) => {
                log::warn!("[Intent] {interaction_id} classification failed: {e}");
                return IntentVerdict::unknown(interaction_id, seq);
            }
        };

        let Some(parsed) = extract_json_object(&reply) else {
            log::warn!("[Intent] {interaction_id} reply had no JSON object: {reply:?}");
            return IntentVerdict::unknown(interaction_id, seq);
        };

        let intent = parsed
            .get("intent")
            .and_then(|v| v.as_str())
            .map(normalise_intent)
            .unwrap_or_else(|| "unknown".to_string());
        let confidence = parsed
            .get("confidence")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0)
            .clamp(0.0, 1.0) as f32;

        IntentVerdict {
            interaction_id: interaction_id.to_string(),
            seq,
            intent,
            confidence,
            ts: crate::utils::now_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlm;

    #[test]
    fn normalise_basic_shapes() {
        assert_eq!(normalise_intent("Credit Card Block"), "credit_card_block");
        assert_eq!(normalise_intent("credit-card-block"), "credit_card_block");
        assert_eq!(normalise_intent("  billing!!  question?  "), "billing_question");
        assert_eq!(normalise_intent("already_snake_case"), "already_snake_case");
    }

    #[test]
    fn normalise_collapses_repeated_separators() {
        assert_eq!(normalise_intent("a -- b__c   d"), "a_b_c_d");
    }

    #[test]
    fn normalise_truncates_to_fifty() {
        let long = "x".repeat(80);
        assert_eq!(normalise_intent(&long).len(), 50);
    }

    #[test]
    fn normalise_empty_is_unknown() {
        assert_eq!(normalise_intent(""), "unknown");
        assert_eq!(normalise_intent("!?!"), "unknown");
    }

    #[test]
    fn normalise_is_idempotent() {
        for raw in ["Credit Card Block", "a--b", "", "x!y@z", "  lots   of   space  "] {
            let once = normalise_intent(raw);
            assert_eq!(normalise_intent(&once), once, "raw case: {raw:?}");
        }
    }

    #[tokio::test]
    async fn classify_parses_and_normalises() {
        let llm = Arc::new(MockLlm::new());
        llm.push_reply(r#"{"intent":"Credit Card Block","confidence":0.91}"#);
        let classifier = IntentClassifier::new(llm, LlmConfig::default());

        let verdict = classifier
            .classify("call-3", 1, "I need to block my credit card", None)
            .await;
        assert_eq!(verdict.intent, "credit_card_block");
        assert!((verdict.confidence - 0.91).abs() < 1e-6);
    }

    #[tokio::test]
    async fn classify_clamps_confidence() {
        let llm = Arc::new(MockLlm::new());
        llm.push_reply(r#"{"intent":"billing","confidence":3.5}"#);
        let classifier = IntentClassifier::new(llm, LlmConfig::default());

        let verdict = classifier.classify("call-1", 1, "billing please", None).await;
        assert_eq!(verdict.confidence, 1.0);
    }

    #[tokio::test]
    async fn llm_failure_degrades_to_unknown() {
        let llm = Arc::new(MockLlm::new());
        llm.push_error("down");
        let classifier = IntentClassifier::new(llm, LlmConfig::default());

        let verdict = classifier.classify("call-1", 4, "whatever", None).await;
        assert_eq!(verdict.intent, "unknown");
        assert_eq!(verdict.confidence, 0.0);
        assert_eq!(verdict.seq, 4);
    }

    #[tokio::test]
    async fn prose_wrapped_reply_still_parses() {
        let llm = Arc::new(MockLlm::new());
        llm.push_reply("The intent here is: {\"intent\":\"password_reset\",\"confidence\":0.8} hope that helps");
        let classifier = IntentClassifier::new(llm, LlmConfig::default());

        let verdict = classifier.classify("call-1", 1, "reset my password", None).await;
        assert_eq!(verdict.intent, "password_reset");
    }
}
