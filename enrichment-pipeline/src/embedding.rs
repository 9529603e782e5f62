//! C7 Embedding Generator: local in-process model via `fastembed`, or a
//! remote OpenAI-compatible/Ollama HTTP API. Mirrors `generate_embeddings`/
//! `_generate_embeddings_api`'s dispatch on generator kind.

use std::sync::atomic::{AtomicUsize, Ordering};

use common::error::AppError;
use common::retry::RetryPolicy;
use common::storage::types::settings::EmbeddingGenerator;
use common::utils::config::{AppConfig, EmbeddingMode};
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use serde_json::Value;

pub enum Embedder {
    Local(LocalEmbedder),
    Remote(RemoteEmbedder),
}

/// Wraps `fastembed`'s in-process model with the adaptive batch-size state
/// `_fetch_and_process_task` keeps in `self.current_batch_size`: a shrink on
/// failure, a gradual doubling back toward `max_batch_size` on success.
pub struct LocalEmbedder {
    model: TextEmbedding,
    max_batch_size: usize,
    current_batch_size: AtomicUsize,
}

pub struct RemoteEmbedder {
    http: reqwest::Client,
    api_base: String,
    model: String,
    generator: EmbeddingGenerator,
    batch_size: usize,
    timeout: std::time::Duration,
    retry: RetryPolicy,
}

impl Embedder {
    pub fn from_config(config: &AppConfig) -> Result<Self, AppError> {
        match config.embedding_mode {
            EmbeddingMode::Local => {
                let model = fastembed_model_for(&config.embedding_model_name);
                let init = InitOptions::new(model).with_show_download_progress(false);
                let embedding = TextEmbedding::try_new(init)
                    .map_err(|err| AppError::InternalError(format!("failed to load local embedding model: {err}")))?;
                Ok(Embedder::Local(LocalEmbedder {
                    model: embedding,
                    max_batch_size: config.embedding_batch_size,
                    current_batch_size: AtomicUsize::new(config.embedding_batch_size.max(1)),
                }))
            }
            EmbeddingMode::Api => {
                let api_base = config
                    .embedding_api_base
                    .clone()
                    .ok_or_else(|| AppError::Validation("EMBEDDING_API_BASE is required when EMBEDDING_MODE=api".to_string()))?;
                Ok(Embedder::Remote(RemoteEmbedder {
                    http: reqwest::Client::new(),
                    api_base: api_base.trim_end_matches('/').to_string(),
                    model: config.embedding_model_name.clone(),
                    generator: config.embedding_generator,
                    batch_size: config.embedding_batch_size,
                    timeout: std::time::Duration::from_secs(config.embedding_api_timeout),
                    retry: RetryPolicy::from_config(config),
                }))
            }
        }
    }

    /// Embeds `texts` in order, returning one vector per input.
    pub async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, AppError> {
        match self {
            Embedder::Local(local) => local.embed(texts),
            Embedder::Remote(remote) => remote.embed(texts).await,
        }
    }
}

impl LocalEmbedder {
    fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, AppError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let size = self.current_batch_size.load(Ordering::SeqCst).max(1).min(texts.len());
        let mut all = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(size) {
            all.extend(self.embed_with_backoff(chunk.to_vec())?);
        }
        Ok(all)
    }

    /// `fastembed`'s ONNX runtime doesn't surface a distinguishable OOM error
    /// the way `torch.cuda.OutOfMemoryError` does, so any failure on a batch
    /// larger than one item is treated as an OOM candidate: the batch is
    /// bisected and each half retried at the smaller size, mirroring
    /// `current_attempt_size = current_attempt_size // 2`. A failure that
    /// persists down to a single item is terminal for that item.
    fn embed_with_backoff(&self, batch: Vec<String>) -> Result<Vec<Vec<f32>>, AppError> {
        let attempt_size = batch.len();
        match self.model.embed(batch.clone(), None) {
            Ok(embeddings) => {
                let current = self.current_batch_size.load(Ordering::SeqCst);
                if attempt_size >= current && current < self.max_batch_size {
                    let restored = (current * 2).min(self.max_batch_size);
                    self.current_batch_size.store(restored, Ordering::SeqCst);
                    tracing::info!(restored, "batch size successfully restored");
                }
                Ok(embeddings)
            }
            Err(err) => {
                if attempt_size == 1 {
                    return Err(AppError::ResourceExhausted(format!(
                        "local embedding failed at batch_size=1, item abandoned: {err}"
                    )));
                }
                let new_size = (attempt_size / 2).max(1);
                self.current_batch_size.store(new_size, Ordering::SeqCst);
                tracing::warn!(error = %err, new_size, "local embedding failed, reducing batch size and retrying");
                let mid = attempt_size / 2;
                let mut first = self.embed_with_backoff(batch[..mid].to_vec())?;
                let second = self.embed_with_backoff(batch[mid..].to_vec())?;
                first.extend(second);
                Ok(first)
            }
        }
    }
}

impl RemoteEmbedder {
    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, AppError> {
        let mut all = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size.max(1)) {
            let batch_embeddings = self
                .retry
                .run(|| async {
                    match self.generator {
                        EmbeddingGenerator::Ollama => self.embed_ollama(batch).await,
                        _ => self.embed_openai_compatible(batch).await,
                    }
                })
                .await?;
            all.extend(batch_embeddings);
        }
        Ok(all)
    }

    async fn embed_openai_compatible(&self, batch: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
        let url = format!("{}/embeddings", self.api_base);
        let response: Value = self
            .http
            .post(&url)
            .timeout(self.timeout)
            .json(&serde_json::json!({"model": self.model, "input": batch}))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let mut items: Vec<(i64, Vec<f32>)> = response["data"]
            .as_array()
            .ok_or_else(|| AppError::LLMParsing("embedding response missing 'data'".to_string()))?
            .iter()
            .map(|item| {
                let index = item["index"].as_i64().unwrap_or(0);
                let embedding = item["embedding"]
                    .as_array()
                    .map(|arr| arr.iter().filter_map(Value::as_f64).map(|v| v as f32).collect())
                    .unwrap_or_default();
                (index, embedding)
            })
            .collect();
        items.sort_by_key(|(index, _)| *index);
        Ok(items.into_iter().map(|(_, embedding)| embedding).collect())
    }

    async fn embed_ollama(&self, batch: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
        let url = format!("{}/api/embeddings", self.api_base);
        let mut embeddings = Vec::with_capacity(batch.len());
        for text in batch {
            let response: Value = self
                .http
                .post(&url)
                .timeout(self.timeout)
                .json(&serde_json::json!({"model": self.model, "prompt": text}))
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            let embedding = response["embedding"]
                .as_array()
                .map(|arr| arr.iter().filter_map(Value::as_f64).map(|v| v as f32).collect())
                .ok_or_else(|| AppError::LLMParsing("ollama response missing 'embedding'".to_string()))?;
            embeddings.push(embedding);
        }
        Ok(embeddings)
    }
}

fn fastembed_model_for(name: &str) -> EmbeddingModel {
    match name {
        "BAAI/bge-small-en-v1.5" => EmbeddingModel::BGESmallENV15,
        "BAAI/bge-base-en-v1.5" => EmbeddingModel::BGEBaseENV15,
        "BAAI/bge-large-en-v1.5" => EmbeddingModel::BGELargeENV15,
        _ => EmbeddingModel::BGESmallENV15,
    }
}
