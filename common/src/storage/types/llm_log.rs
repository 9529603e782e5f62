use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::stored_object;

/// What kind of LLM call produced this log row, so the audit trail can be
/// filtered without parsing `prompt`/`raw_response`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    MetadataExtraction,
    RelationExtraction,
    Embedding,
}

stored_object!(LlmLog, "llm_log", {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    duration_ms: i64,
    success: bool,
    request_type: RequestType,
    model: String,
    prompt: Option<String>,
    raw_response: Option<String>,
    error: Option<String>,
    prompt_tokens: Option<i64>,
    completion_tokens: Option<i64>,
    tenant_id: Option<String>,
    doc_id: Option<String>,
    chunk_id: Option<i64>,
});

impl LlmLog {
    /// Builds a row for a request whose outcome is already known. Kept
    /// synchronous and infallible so callers can log on both the success and
    /// failure path without threading an extra `Result` through the call
    /// site that made the LLM request.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn record(
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        request_type: RequestType,
        model: String,
        prompt: Option<String>,
        outcome: Result<(String, Option<i64>, Option<i64>), String>,
        tenant_id: Option<String>,
        doc_id: Option<String>,
        chunk_id: Option<i64>,
    ) -> Self {
        let duration_ms = (end - start).num_milliseconds();
        let (success, raw_response, error, prompt_tokens, completion_tokens) = match outcome {
            Ok((response, prompt_tokens, completion_tokens)) => {
                (true, Some(response), None, prompt_tokens, completion_tokens)
            }
            Err(message) => (false, None, Some(message), None, None),
        };
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            start,
            end,
            duration_ms,
            success,
            request_type,
            model,
            prompt,
            raw_response,
            error,
            prompt_tokens,
            completion_tokens,
            tenant_id,
            doc_id,
            chunk_id,
            created_at: end,
            updated_at: end,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_computes_duration_and_success_flag() {
        let start = Utc::now();
        let end = start + chrono::Duration::milliseconds(250);

        let ok = LlmLog::record(
            start,
            end,
            RequestType::Embedding,
            "bge-small".to_string(),
            Some("prompt".to_string()),
            Ok(("[0.1, 0.2]".to_string(), Some(12), Some(3))),
            Some("tenant1".to_string()),
            Some("doc1".to_string()),
            Some(0),
        );
        assert!(ok.success);
        assert_eq!(ok.duration_ms, 250);
        assert!(ok.error.is_none());

        let failed = LlmLog::record(
            start,
            end,
            RequestType::MetadataExtraction,
            "gpt-4o-mini".to_string(),
            None,
            Err("timeout".to_string()),
            None,
            None,
            None,
        );
        assert!(!failed.success);
        assert!(failed.raw_response.is_none());
        assert_eq!(failed.error.as_deref(), Some("timeout"));
    }
}
