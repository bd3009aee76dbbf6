//! End-of-call summary and disposition mapping.
//!
//! Assembles the stored transcript, asks the LLM for a structured summary
//! and maps suggested dispositions onto the tenant's taxonomy. An LLM
//! reply that does not match the expected shape degrades to a fallback
//! summary carrying the raw output - the caller always gets *something*.
//! Generation never persists; saving is the dashboard's explicit step.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde_json::Value;

use crate::config::LlmConfig;
use crate::error::{AssistError, AssistResult};
use crate::llm::{extract_json_object, ChatRequest, LlmClient};
use crate::metrics::ConsumerMetrics;
use crate::store::AssistStore;
use crate::tenant::{DispositionTaxonomyEntry, TenantConfigService};
use crate::types::{CallSummary, DispositionSuggestion, Speaker};

const SYSTEM_PROMPT: &str = "You summarise a finished call-centre conversation. Reply with a \
JSON object only: {\"issue\": \"...\", \"resolution\": \"...\", \"next_steps\": \"...\", \
\"dispositions\": [{\"code\": \"...\", \"title\": \"...\", \"score\": <0..1>}], \
\"confidence\": <0..1>}.";

/// Produces end-of-call summaries.
pub struct SummaryService {
    llm: Arc<dyn LlmClient>,
    store: Arc<dyn AssistStore>,
    tenants: Arc<TenantConfigService>,
    config: LlmConfig,
    metrics: Arc<ConsumerMetrics>,
}

impl SummaryService {
    #[must_use]
    pub fn new(
        llm: Arc<dyn LlmClient>,
        store: Arc<dyn AssistStore>,
        tenants: Arc<TenantConfigService>,
        config: LlmConfig,
        metrics: Arc<ConsumerMetrics>,
    ) -> Self {
        Self {
            llm,
            store,
            tenants,
            config,
            metrics,
        }
    }

    /// Generates a summary for one finished call.
    ///
    /// Retries are allowed; results may differ across attempts (LLM
    /// non-determinism) - callers accept this.
    pub async fn summarise(
        &self,
        interaction_id: &str,
        tenant_id: &str,
    ) -> AssistResult<CallSummary> {
        let rows = self
            .store
            .transcript_for_call(interaction_id)
            .await
            .map_err(|e| AssistError::Store(e.to_string()))?;

        let lines: Vec<String> = rows
            .iter()
            .filter(|row| !row.text.trim().is_empty())
            .map(|row| {
                let who = match row.speaker {
                    Speaker::Agent => "Agent",
                    Speaker::Customer => "Customer",
                    Speaker::Unknown => "Speaker",
                };
                format!("{who}: {}", row.text.trim())
            })
            .collect();

        if lines.is_empty() {
            return Err(AssistError::CallNotFound(interaction_id.to_string()));
        }

        let settings = self.tenants.settings(tenant_id).await;
        let request = ChatRequest {
            model: settings
                .summary_model
                .clone()
                .unwrap_or_else(|| self.config.summary_model.clone()),
            system: SYSTEM_PROMPT.to_string(),
            user: format!("Conversation transcript:\n{}", lines.join("\n")),
            temperature: self.config.summary_temperature,
        };

        let reply = match self.llm.complete(request).await {
            Ok(reply) => reply,
            Err(e) => {
                log::warn!("[Summary] {interaction_id} LLM failed: {e}");
                return Ok(self.fallback(interaction_id, &format!("summary unavailable: {e}")));
            }
        };

        match self.parse_reply(interaction_id, &reply, &settings.dispositions) {
            Some(summary) => Ok(summary),
            None => {
                log::warn!("[Summary] {interaction_id} reply failed shape validation");
                Ok(self.fallback(interaction_id, &reply))
            }
        }
    }

    /// Validates the reply shape and maps dispositions to the taxonomy.
    fn parse_reply(
        &self,
        interaction_id: &str,
        reply: &str,
        taxonomy: &[DispositionTaxonomyEntry],
    ) -> Option<CallSummary> {
        let parsed = extract_json_object(reply)?;

        let issue = parsed.get("issue")?.as_str()?.to_string();
        let resolution = parsed.get("resolution")?.as_str()?.to_string();
        let next_steps = parsed.get("next_steps")?.as_str()?.to_string();
        let confidence = parsed
            .get("confidence")
            .and_then(Value::as_f64)
            .unwrap_or(0.0)
            .clamp(0.0, 1.0) as f32;

        let dispositions = parsed
            .get("dispositions")
            .and_then(Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|entry| {
                        let code = entry.get("code")?.as_str()?.to_string();
                        let title = entry
                            .get("title")
                            .and_then(Value::as_str)
                            .unwrap_or(&code)
                            .to_string();
                        let score = entry
                            .get("score")
                            .and_then(Value::as_f64)
                            .unwrap_or(0.0)
                            .clamp(0.0, 1.0) as f32;
                        Some(map_disposition(code, title, score, taxonomy))
                    })
                    .collect()
            })
            .unwrap_or_default();

        Some(CallSummary {
            interaction_id: interaction_id.to_string(),
            issue,
            resolution,
            next_steps,
            dispositions,
            confidence,
            used_fallback: false,
        })
    }

    /// Degraded summary carrying the raw LLM output.
    fn fallback(&self, interaction_id: &str, raw: &str) -> CallSummary {
        self.metrics.summary_fallbacks.fetch_add(1, Ordering::Relaxed);
        CallSummary {
            interaction_id: interaction_id.to_string(),
            issue: String::new(),
            resolution: raw.to_string(),
            next_steps: String::new(),
            dispositions: Vec::new(),
            confidence: 0.0,
            used_fallback: true,
        }
    }
}

/// Attaches a taxonomy id: exact match by code first, else fuzzy title
/// match (case-insensitive containment either way).
fn map_disposition(
    code: String,
    title: String,
    score: f32,
    taxonomy: &[DispositionTaxonomyEntry],
) -> DispositionSuggestion {
    let taxonomy_id = taxonomy
        .iter()
        .find(|entry| entry.code.eq_ignore_ascii_case(&code))
        .or_else(|| {
            let suggested = title.to_lowercase();
            taxonomy.iter().find(|entry| {
                let known = entry.title.to_lowercase();
                known.contains(&suggested) || suggested.contains(&known)
            })
        })
        .map(|entry| entry.id.clone());

    DispositionSuggestion {
        code,
        title,
        score,
        taxonomy_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlm;
    use crate::store::{MemoryStore, TranscriptRow};
    use crate::tenant::{ConfigScope, MemoryConfigSource};

    async fn seeded_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        for (seq, text) in [
            (1, "I was double charged this month"),
            (2, "Let me look into that for you"),
            (3, ""),
            (4, "I have issued a refund"),
        ] {
            store
                .save_transcript_line(TranscriptRow {
                    call_id: "call-6".into(),
                    seq,
                    ts: seq * 100,
                    text: text.into(),
                    speaker: if seq % 2 == 1 {
                        Speaker::Customer
                    } else {
                        Speaker::Agent
                    },
                })
                .await
                .unwrap();
        }
        store
    }

    fn service_with(
        llm: Arc<MockLlm>,
        store: Arc<MemoryStore>,
        taxonomy: serde_json::Value,
    ) -> SummaryService {
        let source = Arc::new(MemoryConfigSource::new());
        source.put(
            ConfigScope::Tenant("acme".into()),
            serde_json::json!({ "dispositions": taxonomy }),
        );
        SummaryService::new(
            llm,
            store,
            Arc::new(TenantConfigService::new(source, 3)),
            LlmConfig::default(),
            Arc::new(ConsumerMetrics::default()),
        )
    }

    #[tokio::test]
    async fn valid_reply_maps_dispositions() {
        let llm = Arc::new(MockLlm::new());
        llm.push_reply(
            r#"{"issue":"Double charge","resolution":"Refund issued","next_steps":"Confirm on next statement","dispositions":[{"code":"refund","title":"Refund issued","score":0.9},{"code":"escalate","title":"Needs escalation","score":0.2}],"confidence":0.85}"#,
        );
        let service = service_with(
            llm,
            seeded_store().await,
            serde_json::json!([
                {"id": "d-1", "code": "REFUND", "title": "Refund"},
                {"id": "d-2", "code": "resolved", "title": "Issue resolved"}
            ]),
        );

        let summary = service.summarise("call-6", "acme").await.unwrap();
        assert!(!summary.used_fallback);
        assert_eq!(summary.issue, "Double charge");
        assert_eq!(summary.dispositions.len(), 2);
        // Exact code match, case-insensitive.
        assert_eq!(summary.dispositions[0].taxonomy_id.as_deref(), Some("d-1"));
        // No code or title match.
        assert_eq!(summary.dispositions[1].taxonomy_id, None);
    }

    #[tokio::test]
    async fn fuzzy_title_match_when_code_differs() {
        let llm = Arc::new(MockLlm::new());
        llm.push_reply(
            r#"{"issue":"x","resolution":"y","next_steps":"z","dispositions":[{"code":"done","title":"Issue resolved fully","score":0.7}],"confidence":0.5}"#,
        );
        let service = service_with(
            llm,
            seeded_store().await,
            serde_json::json!([{"id": "d-2", "code": "resolved", "title": "Issue resolved"}]),
        );

        let summary = service.summarise("call-6", "acme").await.unwrap();
        assert_eq!(summary.dispositions[0].taxonomy_id.as_deref(), Some("d-2"));
    }

    #[tokio::test]
    async fn malformed_reply_builds_fallback() {
        let llm = Arc::new(MockLlm::new());
        // Missing `issue`: shape validation fails.
        llm.push_reply(r#"The call went fine. {"resolution":"all good"}"#);
        let service = service_with(llm, seeded_store().await, serde_json::json!([]));

        let summary = service.summarise("call-6", "acme").await.unwrap();
        assert!(summary.used_fallback);
        assert!(summary.resolution.contains("all good"));
        assert_eq!(summary.confidence, 0.0);
    }

    #[tokio::test]
    async fn llm_error_builds_fallback() {
        let llm = Arc::new(MockLlm::new());
        llm.push_error("timeout");
        let service = service_with(llm, seeded_store().await, serde_json::json!([]));

        let summary = service.summarise("call-6", "acme").await.unwrap();
        assert!(summary.used_fallback);
        assert!(summary.resolution.contains("unavailable"));
    }

    #[tokio::test]
    async fn empty_transcript_is_call_not_found() {
        let llm = Arc::new(MockLlm::new());
        let service = service_with(llm, Arc::new(MemoryStore::new()), serde_json::json!([]));

        let err = service.summarise("missing", "acme").await.unwrap_err();
        assert_eq!(err.code(), "call_not_found");
    }
}
