use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::storage::types::settings::EmbeddingGenerator;

#[derive(Clone, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Local,
    Memory,
    S3,
}

fn default_storage_kind() -> StorageKind {
    StorageKind::Local
}

/// Ordering of PDF extraction strategies: try the text/markup layer first
/// and fall back to OCR, or the reverse for scan-heavy corpora.
#[derive(Clone, Copy, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PdfIngestMode {
    LlmFirst,
    OcrFirst,
}

fn default_pdf_ingest_mode() -> PdfIngestMode {
    PdfIngestMode::LlmFirst
}

/// Wire dialect spoken to the LLM HTTP endpoint (§6).
#[derive(Clone, Copy, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    Openai,
    Vllm,
    Ollama,
}

/// Whether embeddings come from an in-process model or a remote API.
#[derive(Clone, Copy, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingMode {
    Local,
    Api,
}

/// Process-wide configuration, loaded once at startup from `config.toml`
/// (if present) layered under process environment variables. Deserialization
/// failure here — an unknown `LLM_PROVIDER`, a missing required key — is the
/// one place the process is allowed to refuse to start (§7).
#[derive(Clone, Deserialize, Debug)]
pub struct AppConfig {
    pub openai_api_key: String,
    pub surrealdb_address: String,
    pub surrealdb_username: String,
    pub surrealdb_password: String,
    pub surrealdb_namespace: String,
    pub surrealdb_database: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    pub http_port: u16,
    #[serde(default = "default_base_url")]
    pub openai_base_url: String,
    #[serde(default = "default_storage_kind")]
    pub storage: StorageKind,
    #[serde(default = "default_pdf_ingest_mode")]
    pub pdf_ingest_mode: PdfIngestMode,

    // MinIO / S3-compatible object store, selected when `storage = "s3"`.
    pub minio_endpoint: Option<String>,
    pub minio_bucket: Option<String>,
    pub minio_access_key: Option<String>,
    pub minio_secret_key: Option<String>,
    #[serde(default = "default_minio_region")]
    pub minio_region: String,

    // Graph store. When disabled, relation extraction and graph writes are
    // skipped entirely (§6).
    #[serde(default)]
    pub neo4j_enabled: bool,
    pub neo4j_uri: Option<String>,
    pub neo4j_username: Option<String>,
    pub neo4j_password: Option<String>,

    #[serde(default = "default_llm_provider")]
    pub llm_provider: LlmProvider,
    #[serde(default = "default_base_url")]
    pub llm_api_base: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default = "default_llm_request_timeout")]
    pub llm_request_timeout: u64,
    pub vllm_request_priority: Option<i64>,

    #[serde(default = "default_embedding_mode")]
    pub embedding_mode: EmbeddingMode,
    pub embedding_api_base: Option<String>,
    #[serde(default = "default_embedding_model_name")]
    pub embedding_model_name: String,
    #[serde(default = "default_embedding_batch_size")]
    pub embedding_batch_size: usize,
    #[serde(default = "default_embedding_api_timeout")]
    pub embedding_api_timeout: u64,
    #[serde(default = "default_embedding_generator")]
    pub embedding_generator: EmbeddingGenerator,

    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
    #[serde(default = "default_enrichment_batch_size")]
    pub enrichment_batch_size: usize,
    #[serde(default = "default_llm_max_concurrency")]
    pub llm_max_concurrency: usize,
    #[serde(default = "default_upload_worker_count")]
    pub upload_worker_count: usize,
    #[serde(default = "default_enrichment_worker_count")]
    pub enrichment_worker_count: usize,
    #[serde(default = "default_deletion_worker_count")]
    pub deletion_worker_count: usize,
    #[serde(default = "default_migration_batch_size")]
    pub migration_batch_size: usize,

    #[serde(default = "default_chunker_chunk_tokens")]
    pub chunker_chunk_tokens: usize,
    #[serde(default = "default_chunker_overlap_tokens")]
    pub chunker_overlap_tokens: usize,
    #[serde(default = "default_chunker_section_limit")]
    pub chunker_section_limit: usize,
    #[serde(default = "default_chunker_doc_limit")]
    pub chunker_doc_limit: usize,
    #[serde(default = "default_chunker_list_limit")]
    pub chunker_list_limit: usize,
    #[serde(default = "default_chunker_table_limit")]
    pub chunker_table_limit: usize,
    pub chunker_table_row_group_tokens: Option<usize>,
    pub chunker_table_row_overlap: Option<usize>,

    #[serde(default)]
    pub ocr_enabled: bool,
    #[serde(default = "default_ocr_lang")]
    pub ocr_lang: String,
    #[serde(default = "default_ocr_backend")]
    pub ocr_backend: String,

    #[serde(default = "default_excel_row_batch_size")]
    pub excel_row_batch_size: usize,

    #[serde(default = "default_tokenizer_encoding")]
    pub tokenizer_encoding: String,

    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: usize,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_minio_region() -> String {
    "us-east-1".to_string()
}

fn default_llm_provider() -> LlmProvider {
    LlmProvider::Openai
}

fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_llm_request_timeout() -> u64 {
    60
}

fn default_embedding_mode() -> EmbeddingMode {
    EmbeddingMode::Local
}

fn default_embedding_model_name() -> String {
    "BAAI/bge-small-en-v1.5".to_string()
}

fn default_embedding_batch_size() -> usize {
    32
}

fn default_embedding_api_timeout() -> u64 {
    30
}

fn default_embedding_generator() -> EmbeddingGenerator {
    EmbeddingGenerator::LocalModel
}

fn default_poll_interval() -> u64 {
    5
}

fn default_enrichment_batch_size() -> usize {
    16
}

fn default_llm_max_concurrency() -> usize {
    4
}

fn default_upload_worker_count() -> usize {
    2
}

fn default_enrichment_worker_count() -> usize {
    2
}

fn default_deletion_worker_count() -> usize {
    1
}

fn default_migration_batch_size() -> usize {
    100
}

fn default_chunker_chunk_tokens() -> usize {
    512
}

fn default_chunker_overlap_tokens() -> usize {
    64
}

fn default_chunker_section_limit() -> usize {
    1024
}

fn default_chunker_doc_limit() -> usize {
    2048
}

fn default_chunker_list_limit() -> usize {
    768
}

fn default_chunker_table_limit() -> usize {
    768
}

fn default_ocr_lang() -> String {
    "eng".to_string()
}

fn default_ocr_backend() -> String {
    "tesseract".to_string()
}

fn default_excel_row_batch_size() -> usize {
    200
}

/// Hugging Face Hub repo the chunker loads its tokenizer encoding from;
/// `Xenova/gpt-4` is a cl100k-compatible re-upload with a plain
/// `tokenizer.json`, unlike OpenAI's own gated repos.
fn default_tokenizer_encoding() -> String {
    "Xenova/gpt-4".to_string()
}

fn default_retry_max_attempts() -> usize {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    200
}

fn default_retry_max_delay_ms() -> u64 {
    5000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for AppConfig {
    /// Only used by tests, which override the handful of fields a given
    /// scenario cares about via `..Default::default()`. Never loaded as a
    /// runtime configuration path.
    fn default() -> Self {
        Self {
            openai_api_key: String::new(),
            surrealdb_address: String::new(),
            surrealdb_username: String::new(),
            surrealdb_password: String::new(),
            surrealdb_namespace: String::new(),
            surrealdb_database: String::new(),
            data_dir: default_data_dir(),
            http_port: 0,
            openai_base_url: default_base_url(),
            storage: default_storage_kind(),
            pdf_ingest_mode: default_pdf_ingest_mode(),
            minio_endpoint: None,
            minio_bucket: None,
            minio_access_key: None,
            minio_secret_key: None,
            minio_region: default_minio_region(),
            neo4j_enabled: false,
            neo4j_uri: None,
            neo4j_username: None,
            neo4j_password: None,
            llm_provider: default_llm_provider(),
            llm_api_base: default_base_url(),
            llm_model: default_llm_model(),
            llm_request_timeout: default_llm_request_timeout(),
            vllm_request_priority: None,
            embedding_mode: default_embedding_mode(),
            embedding_api_base: None,
            embedding_model_name: default_embedding_model_name(),
            embedding_batch_size: default_embedding_batch_size(),
            embedding_api_timeout: default_embedding_api_timeout(),
            embedding_generator: default_embedding_generator(),
            poll_interval: default_poll_interval(),
            enrichment_batch_size: default_enrichment_batch_size(),
            llm_max_concurrency: default_llm_max_concurrency(),
            upload_worker_count: default_upload_worker_count(),
            enrichment_worker_count: default_enrichment_worker_count(),
            deletion_worker_count: default_deletion_worker_count(),
            migration_batch_size: default_migration_batch_size(),
            chunker_chunk_tokens: default_chunker_chunk_tokens(),
            chunker_overlap_tokens: default_chunker_overlap_tokens(),
            chunker_section_limit: default_chunker_section_limit(),
            chunker_doc_limit: default_chunker_doc_limit(),
            chunker_list_limit: default_chunker_list_limit(),
            chunker_table_limit: default_chunker_table_limit(),
            chunker_table_row_group_tokens: None,
            chunker_table_row_overlap: None,
            ocr_enabled: false,
            ocr_lang: default_ocr_lang(),
            ocr_backend: default_ocr_backend(),
            excel_row_batch_size: default_excel_row_batch_size(),
            tokenizer_encoding: default_tokenizer_encoding(),
            retry_max_attempts: default_retry_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            log_level: default_log_level(),
        }
    }
}

pub fn get_config() -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(Environment::default())
        .build()?;

    config.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_config_fails_fast_on_missing_required_keys() {
        for key in [
            "OPENAI_API_KEY",
            "SURREALDB_ADDRESS",
            "SURREALDB_USERNAME",
            "SURREALDB_PASSWORD",
            "SURREALDB_NAMESPACE",
            "SURREALDB_DATABASE",
            "HTTP_PORT",
        ] {
            std::env::remove_var(key);
        }
        assert!(get_config().is_err());
    }
}
