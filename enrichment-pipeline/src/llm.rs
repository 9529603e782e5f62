//! C6 LLM calls: metadata extraction and relation extraction. Both stages
//! share one request/response shape (`<json_output>...</json_output>`
//! fenced JSON) and differ only in prompt and parsed type.

use common::error::AppError;
use common::graph::ExtractedRelation;
use common::retry::RetryPolicy;
use common::storage::db::SurrealDbClient;
use common::storage::types::llm_log::{LlmLog, RequestType};
use common::utils::config::{AppConfig, LlmProvider};
use serde_json::Value;

const METADATA_SYSTEM_PROMPT: &str = "You are a high-precision information extraction API. Your reply MUST be only a valid JSON object inside <json_output> tags. Never write explanations or any text outside the JSON structure.";

const METADATA_USER_PROMPT_TEMPLATE: &str = "First think step by step inside a <thinking> block. Analyze the document fragment, identify the main topic, key terms and named entities.\n\nThen, based on your reasoning, produce a JSON object with keys `summary`, `keywords` and `entities`.\n- `summary` is a 1-2 sentence summary.\n- `keywords` is an array of important terms.\n- `entities` is an object keyed by entity type (e.g. `PERSON`, `ORGANIZATION`) with arrays of extracted names as values.\n- All JSON values MUST be in the original language of the document.\n- Finally, place the JSON object inside <json_output> tags.\n\nDocument fragment:\n---\n{text}\n---\n";

const RELATIONS_SYSTEM_PROMPT: &str = "You are a high-precision knowledge graph extraction API. Your reply MUST be only a valid JSON array inside <json_output> tags. Never write explanations.";

const RELATIONS_USER_PROMPT_TEMPLATE: &str = "First think step by step inside a <thinking> block. Analyze the text to identify distinct entities and the relations between them.\n\nThen, based on your reasoning, extract relations for a knowledge graph. Return a JSON array of objects, each with keys `subject`, `subject_type`, `relation`, `object` and `object_type`.\n\nIMPORTANT:\n1. Values for `subject`, `relation`, `object` MUST be in the original language.\n2. Values for `subject_type`/`object_type` MUST come from: `PERSON`, `ORGANIZATION`, `LOCATION`, `DATE`, `PRODUCT`, `EVENT`, `CONCEPT`. Default to `ENTITY`.\n3. `relation` must be a short verb phrase in UPPERCASE.\n4. If no relations are found, return an empty array `[]`.\n5. Finally, place the JSON array inside <json_output> tags.\n\nText to analyze:\n---\n{text}\n---\n";

pub struct LlmClient {
    http: reqwest::Client,
    provider: LlmProvider,
    api_base: String,
    model: String,
    timeout: std::time::Duration,
    vllm_priority: Option<String>,
    retry: RetryPolicy,
}

impl LlmClient {
    #[must_use]
    pub fn new(config: &AppConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            provider: config.llm_provider,
            api_base: config.llm_api_base.trim_end_matches('/').to_string(),
            model: config.llm_model.clone(),
            timeout: std::time::Duration::from_secs(config.llm_request_timeout),
            vllm_priority: config.vllm_request_priority.map(|p| match p {
                p if p <= 0 => "low".to_string(),
                _ => "high".to_string(),
            }),
            retry: RetryPolicy::from_config(config),
        }
    }

    pub async fn extract_metadata(
        &self,
        db: &SurrealDbClient,
        text: &str,
        tenant_id: &str,
        doc_id: &str,
        chunk_id: i64,
    ) -> Result<Value, AppError> {
        let user_prompt = METADATA_USER_PROMPT_TEMPLATE.replace("{text}", text);
        self.call(
            db,
            METADATA_SYSTEM_PROMPT,
            &user_prompt,
            RequestType::MetadataExtraction,
            tenant_id,
            doc_id,
            chunk_id,
        )
        .await
    }

    pub async fn extract_relations(
        &self,
        db: &SurrealDbClient,
        text: &str,
        tenant_id: &str,
        doc_id: &str,
        chunk_id: i64,
    ) -> Result<Vec<ExtractedRelation>, AppError> {
        let user_prompt = RELATIONS_USER_PROMPT_TEMPLATE.replace("{text}", text);
        let value = self
            .call(
                db,
                RELATIONS_SYSTEM_PROMPT,
                &user_prompt,
                RequestType::RelationExtraction,
                tenant_id,
                doc_id,
                chunk_id,
            )
            .await?;

        Ok(parse_relations(&value))
    }

    async fn call(
        &self,
        db: &SurrealDbClient,
        system_prompt: &str,
        user_prompt: &str,
        request_type: RequestType,
        tenant_id: &str,
        doc_id: &str,
        chunk_id: i64,
    ) -> Result<Value, AppError> {
        let start = chrono::Utc::now();
        let outcome = self.dispatch(system_prompt, user_prompt).await;
        let end = chrono::Utc::now();

        let log_outcome = outcome
            .as_ref()
            .map(|(raw, prompt_tokens, completion_tokens)| {
                (raw.clone(), *prompt_tokens, *completion_tokens)
            })
            .map_err(|err: &AppError| err.to_string());

        let log = LlmLog::record(
            start,
            end,
            request_type,
            self.model.clone(),
            Some(user_prompt.to_string()),
            log_outcome,
            Some(tenant_id.to_string()),
            Some(doc_id.to_string()),
            Some(chunk_id),
        );
        db.store_item(log).await?;

        let (raw_response, _, _) = outcome?;
        if raw_response.trim().is_empty() {
            return Err(AppError::LLMParsing("LLM returned an empty response".to_string()));
        }
        Ok(extract_json_block(&raw_response))
    }

    /// Retries the underlying HTTP call under `self.retry` (§9's explicit
    /// retry policy object): only `AppError::is_transient` errors are
    /// retried, with jittered exponential backoff between attempts.
    async fn dispatch(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<(String, Option<i64>, Option<i64>), AppError> {
        self.retry
            .run(|| async {
                match self.provider {
                    LlmProvider::Ollama => self.call_ollama(system_prompt, user_prompt).await,
                    LlmProvider::Openai | LlmProvider::Vllm => self.call_openai_compatible(system_prompt, user_prompt).await,
                }
            })
            .await
    }

    async fn call_openai_compatible(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<(String, Option<i64>, Option<i64>), AppError> {
        let mut payload = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": user_prompt},
            ],
            "temperature": 0.0,
            "stream": false,
        });

        if matches!(self.provider, LlmProvider::Vllm) {
            if let Some(priority) = &self.vllm_priority {
                payload["priority"] = Value::String(priority.clone());
            }
        }

        let url = format!("{}/v1/chat/completions", self.api_base);
        let response: Value = self
            .http
            .post(&url)
            .timeout(self.timeout)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let content = response["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        let prompt_tokens = response["usage"]["prompt_tokens"].as_i64();
        let completion_tokens = response["usage"]["completion_tokens"].as_i64();
        Ok((content, prompt_tokens, completion_tokens))
    }

    async fn call_ollama(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<(String, Option<i64>, Option<i64>), AppError> {
        let payload = serde_json::json!({
            "model": self.model,
            "system": system_prompt,
            "prompt": user_prompt,
            "stream": false,
            "options": {"temperature": 0.0},
        });

        let url = format!("{}/api/generate", self.api_base);
        let response: Value = self
            .http
            .post(&url)
            .timeout(self.timeout)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let content = response["response"].as_str().unwrap_or_default().to_string();
        Ok((content, None, None))
    }
}

/// Node labels the prompt asks the model to restrict `subject_type`/
/// `object_type` to. Anything else collapses to `ENTITY` rather than
/// letting the model's output dictate the graph's label vocabulary.
const ALLOWED_ENTITY_TYPES: &[&str] = &[
    "PERSON", "ORGANIZATION", "LOCATION", "DATE", "PRODUCT", "EVENT", "CONCEPT",
];

/// Deserializes the relation array element by element, discarding only the
/// elements that fail to parse rather than the whole batch, then applies
/// the §4.6 sanitization rules to what survives. A response that isn't a
/// JSON array at all (e.g. the `{"error": ...}` sentinel `extract_json_block`
/// returns when nothing parsed) yields an empty list.
fn parse_relations(value: &Value) -> Vec<ExtractedRelation> {
    let Some(items) = value.as_array() else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| serde_json::from_value::<ExtractedRelation>(item.clone()).ok())
        .map(sanitize_relation)
        .filter(|relation| !relation.subject.trim().is_empty() && !relation.object.trim().is_empty())
        .collect()
}

/// Restricts `subject_type`/`object_type` to the allowed label set
/// (case-insensitively, falling back to `ENTITY`), and normalizes
/// `relation` to an uppercase alphanumeric/underscore token so the graph
/// never has to trust the model to follow the prompt's formatting rules.
fn sanitize_relation(mut relation: ExtractedRelation) -> ExtractedRelation {
    relation.subject_type = sanitize_entity_type(&relation.subject_type);
    relation.object_type = sanitize_entity_type(&relation.object_type);
    relation.relation = sanitize_relation_token(&relation.relation);
    relation
}

fn sanitize_entity_type(raw: &str) -> String {
    let upper = raw.trim().to_uppercase();
    if ALLOWED_ENTITY_TYPES.contains(&upper.as_str()) {
        upper
    } else {
        "ENTITY".to_string()
    }
}

fn sanitize_relation_token(raw: &str) -> String {
    raw.trim()
        .to_uppercase()
        .chars()
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect()
}

/// Extracts the `<json_output>...</json_output>` fenced block, falling
/// back to the first brace/bracket-delimited span in the text when the
/// model didn't follow the tag instruction.
fn extract_json_block(text: &str) -> Value {
    if let Some(start) = text.find("<json_output>") {
        let after = &text[start + "<json_output>".len()..];
        if let Some(end) = after.find("</json_output>") {
            let candidate = after[..end].trim();
            if let Ok(value) = serde_json::from_str(candidate) {
                return value;
            }
            return serde_json::json!({"error": "invalid json in json_output tags", "raw_content": candidate});
        }
    }

    for (open, close) in [('{', '}'), ('[', ']')] {
        if let (Some(start), Some(end)) = (text.find(open), text.rfind(close)) {
            if end > start {
                let candidate = &text[start..=end];
                if let Ok(value) = serde_json::from_str(candidate) {
                    return value;
                }
            }
        }
    }

    serde_json::json!({"error": "no json found in response"})
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_json_block_prefers_fenced_tags() {
        let text = "<thinking>blah</thinking><json_output>{\"summary\": \"ok\"}</json_output>";
        let value = extract_json_block(text);
        assert_eq!(value["summary"], "ok");
    }

    #[test]
    fn extract_json_block_falls_back_to_bare_braces() {
        let text = "here you go: {\"summary\": \"ok\"} thanks";
        let value = extract_json_block(text);
        assert_eq!(value["summary"], "ok");
    }

    #[test]
    fn extract_json_block_reports_error_when_nothing_found() {
        let value = extract_json_block("no json here");
        assert!(value.get("error").is_some());
    }

    #[test]
    fn parse_relations_discards_only_the_malformed_element() {
        let value = serde_json::json!([
            {"subject": "Ada", "subject_type": "person", "relation": "wrote", "object": "Notes", "object_type": "document"},
            {"subject": "missing fields"},
            {"subject": "Babbage", "subject_type": "PERSON", "relation": "designed", "object": "Engine", "object_type": "PRODUCT"},
        ]);
        let relations = parse_relations(&value);
        assert_eq!(relations.len(), 2);
        assert_eq!(relations[0].subject, "Ada");
        assert_eq!(relations[1].subject, "Babbage");
    }

    #[test]
    fn parse_relations_non_array_response_yields_empty() {
        let value = serde_json::json!({"error": "no json found in response"});
        assert!(parse_relations(&value).is_empty());
    }

    #[test]
    fn sanitize_entity_type_restricts_to_allowed_labels() {
        assert_eq!(sanitize_entity_type("person"), "PERSON");
        assert_eq!(sanitize_entity_type("Organization"), "ORGANIZATION");
        assert_eq!(sanitize_entity_type("spaceship"), "ENTITY");
    }

    #[test]
    fn sanitize_relation_token_normalizes_spacing_and_punctuation() {
        assert_eq!(sanitize_relation_token("was born in"), "WAS_BORN_IN");
        assert_eq!(sanitize_relation_token("co-founded!"), "COFOUNDED");
    }
}
