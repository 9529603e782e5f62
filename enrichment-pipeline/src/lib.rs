//! Enrichment side of the pipeline: C6 per-stage enrichment sweep, C7
//! embedding generation, C8 dimension migration. All three share the same
//! claim-batch/process/report-stage shape built around
//! `Chunk::claim_pending_chunks`.

pub mod embedding;
pub mod llm;

use std::sync::Arc;
use std::time::Duration;

use common::graph::GraphStore;
use common::storage::db::SurrealDbClient;
use common::storage::types::chunk::{Chunk, EnrichmentStage, StageStatus};
use common::storage::types::settings::Settings;
use common::utils::config::AppConfig;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::embedding::Embedder;
use crate::llm::LlmClient;

/// Sleeps for `poll_interval` unless `shutdown` fires first, matching the
/// ingestion-pipeline worker loops' cancellation behavior.
async fn sleep_or_cancelled(poll_interval: Duration, shutdown: &CancellationToken) {
    tokio::select! {
        () = tokio::time::sleep(poll_interval) => {}
        () = shutdown.cancelled() => {}
    }
}

/// C6: sweeps one stage repeatedly, claiming up to `batch_size` pending
/// chunks and processing them with up to `llm_max_concurrency` requests in
/// flight at once. Polls at `poll_interval` when nothing is pending. Checks
/// `shutdown` at every loop boundary and before claiming a new batch.
pub async fn run_enrichment_worker_loop(
    db: Arc<SurrealDbClient>,
    llm: Arc<LlmClient>,
    graph: Arc<dyn GraphStore>,
    stage: EnrichmentStage,
    batch_size: usize,
    max_concurrency: usize,
    poll_interval: Duration,
    shutdown: CancellationToken,
) {
    while !shutdown.is_cancelled() {
        let batch = match Chunk::claim_pending_chunks(&db, stage, batch_size).await {
            Ok(batch) => batch,
            Err(err) => {
                tracing::error!(error = %err, ?stage, "failed to claim chunk batch");
                sleep_or_cancelled(poll_interval, &shutdown).await;
                continue;
            }
        };

        if batch.is_empty() {
            sleep_or_cancelled(poll_interval, &shutdown).await;
            continue;
        }

        let stage_label = stage.as_field().to_string();
        stream::iter(batch)
            .for_each_concurrent(max_concurrency.max(1), |chunk| {
                let db = db.clone();
                let llm = llm.clone();
                let graph = graph.clone();
                let stage_label = stage_label.clone();
                async move {
                    let result = process_chunk_stage(&db, &llm, graph.as_ref(), &chunk, stage).await;
                    if let Err(err) = &result {
                        tracing::error!(
                            error = %err,
                            doc_id = %chunk.doc_id,
                            chunk_id = chunk.chunk_id,
                            ?stage,
                            "chunk enrichment stage failed"
                        );
                        metrics::counter!("processing_errors_total", "worker_type" => "enrichment", "stage" => stage_label)
                            .increment(1);
                    } else {
                        metrics::counter!("chunks_enriched_total", "stage" => stage_label).increment(1);
                    }
                }
            })
            .await;
    }
}

async fn process_chunk_stage(
    db: &SurrealDbClient,
    llm: &LlmClient,
    graph: &dyn GraphStore,
    chunk: &Chunk,
    stage: EnrichmentStage,
) -> Result<(), common::error::AppError> {
    match stage {
        EnrichmentStage::MetadataExtraction => {
            let result = llm
                .extract_metadata(db, &chunk.text, &chunk.tenant_id, &chunk.doc_id, chunk.chunk_id)
                .await;
            let (status, metadata, error) = match result {
                Ok(value) => classify_metadata_result(&value),
                Err(err) => (StageStatus::Failed, None, Some(err.to_string())),
            };
            Chunk::update_chunk_stage(db, &chunk.doc_id, chunk.chunk_id, stage, status, metadata, error).await
        }
        EnrichmentStage::RelationExtraction => {
            let result = llm
                .extract_relations(db, &chunk.text, &chunk.tenant_id, &chunk.doc_id, chunk.chunk_id)
                .await;
            match result {
                Ok(relations) => {
                    for relation in &relations {
                        graph.write_relation(&chunk.tenant_id, &chunk.doc_id, relation).await?;
                    }
                    Chunk::update_chunk_stage(db, &chunk.doc_id, chunk.chunk_id, stage, StageStatus::Completed, None, None).await
                }
                Err(err) => {
                    Chunk::update_chunk_stage(db, &chunk.doc_id, chunk.chunk_id, stage, StageStatus::Failed, None, Some(err.to_string())).await
                }
            }
        }
        EnrichmentStage::EmbeddingGeneration => {
            unreachable!("embedding generation is driven by run_embedding_worker_loop, not process_chunk_stage")
        }
    }
}

/// Classifies one metadata-extraction LLM response into the status/payload
/// `process_chunk_stage` stores. A response carrying an `error` key (the
/// sentinel `extract_json_block` produces when the model's output wasn't
/// parseable JSON) fails only its own chunk — batch siblings are untouched.
fn classify_metadata_result(value: &Value) -> (StageStatus, Option<Value>, Option<String>) {
    match value.get("error") {
        None => (StageStatus::Completed, Some(value.clone()), None),
        Some(_) => {
            let message = value.get("error").and_then(Value::as_str).unwrap_or("llm error").to_string();
            (StageStatus::Failed, None, Some(message))
        }
    }
}

/// C7: claims a batch of chunks pending `embedding_generation`, embeds them
/// as one unit, and writes the whole batch back atomically. A single
/// failed batch fails every chunk in it rather than partially persisting,
/// matching the "batch is the unit of success" contract.
pub async fn run_embedding_worker_loop(
    db: Arc<SurrealDbClient>,
    embedder: Arc<Embedder>,
    batch_size: usize,
    poll_interval: Duration,
    shutdown: CancellationToken,
) {
    while !shutdown.is_cancelled() {
        let batch = match Chunk::claim_pending_chunks(&db, EnrichmentStage::EmbeddingGeneration, batch_size).await {
            Ok(batch) => batch,
            Err(err) => {
                tracing::error!(error = %err, "failed to claim embedding batch");
                sleep_or_cancelled(poll_interval, &shutdown).await;
                continue;
            }
        };

        if batch.is_empty() {
            sleep_or_cancelled(poll_interval, &shutdown).await;
            continue;
        }

        let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
        let settings = match Settings::get_current(&db).await {
            Ok(settings) => settings,
            Err(err) => {
                tracing::error!(error = %err, "failed to read embedding settings");
                continue;
            }
        };

        match embedder.embed(texts).await {
            Ok(embeddings) => {
                let updates: Vec<(String, i64, Vec<f32>)> = batch
                    .iter()
                    .zip(embeddings)
                    .map(|(chunk, embedding)| (chunk.doc_id.clone(), chunk.chunk_id, embedding))
                    .collect();
                if let Err(err) = Chunk::store_embeddings_batch(&db, &updates, settings.embedding_config.version).await {
                    tracing::error!(error = %err, "failed to store embedding batch");
                    metrics::counter!("processing_errors_total", "worker_type" => "enrichment", "stage" => "embedding_generation").increment(1);
                } else {
                    metrics::counter!("chunks_enriched_total", "stage" => "embedding_generation").increment(updates.len() as u64);
                }
            }
            Err(err) => {
                tracing::error!(error = %err, batch_size = batch.len(), "embedding batch failed");
                for chunk in &batch {
                    let _ = Chunk::update_chunk_stage(
                        &db,
                        &chunk.doc_id,
                        chunk.chunk_id,
                        EnrichmentStage::EmbeddingGeneration,
                        StageStatus::Failed,
                        None,
                        Some(err.to_string()),
                    )
                    .await;
                }
                metrics::counter!("processing_errors_total", "worker_type" => "enrichment", "stage" => "embedding_generation").increment(1);
            }
        }
    }
}

/// C8: drives the dimension-migration protocol end to end once at
/// startup when the persisted `EmbeddingConfig` doesn't match the active
/// embedder's model/dimension, then exits. Resumable across restarts: the
/// side column is reset idempotently and the batched loop just keeps
/// selecting rows with `embedding_version < target_version`.
pub async fn run_migration_if_needed(
    db: &SurrealDbClient,
    embedder: &Embedder,
    config: &AppConfig,
    target_model_name: &str,
    target_dimension: u32,
) -> Result<(), common::error::AppError> {
    let settings = Settings::get_current(db).await?;
    let target_version = settings.embedding_config.version + 1;

    if settings.embedding_config.model_name == target_model_name
        && settings.embedding_config.dimension == target_dimension
    {
        return Ok(());
    }

    tracing::warn!(
        old_model = %settings.embedding_config.model_name,
        new_model = target_model_name,
        old_dimension = settings.embedding_config.dimension,
        new_dimension = target_dimension,
        "embedding configuration changed, migrating existing chunks"
    );

    Chunk::reset_migration_side_column(db).await?;

    loop {
        let pending = Chunk::count_pending_migration(db, target_version).await?;
        if pending == 0 {
            break;
        }
        let batch = Chunk::select_for_migration(db, target_version, config.migration_batch_size).await?;
        if batch.is_empty() {
            break;
        }
        let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
        let embeddings = embedder.embed(texts).await?;
        for (chunk, embedding) in batch.iter().zip(embeddings) {
            Chunk::store_migrated_embedding(db, &chunk.doc_id, chunk.chunk_id, embedding, target_version).await?;
        }
        tracing::info!(remaining = pending.saturating_sub(batch.len()), "migration batch complete");
    }

    Chunk::swap_migrated_embeddings(db).await?;
    db.rebuild_embedding_index(target_dimension).await?;
    Settings::update_embedding_config(
        db,
        common::storage::types::settings::EmbeddingConfig {
            model_name: target_model_name.to_string(),
            dimension: target_dimension,
            version: target_version,
            generator: settings.embedding_config.generator,
        },
    )
    .await?;

    tracing::info!("embedding migration complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::storage::types::chunk::ChunkMetadata;
    use uuid::Uuid;

    /// §8 scenario 5: drives the same claim-batch/store/swap protocol
    /// `run_migration_if_needed` does, standing in a synthetic vector for
    /// the embedder call. After the loop drains and the swap runs, every
    /// chunk sits at the target version/dimension with no null embedding.
    #[tokio::test]
    async fn dimension_migration_leaves_every_chunk_at_the_target_version() {
        let db = SurrealDbClient::memory("test", &Uuid::new_v4().to_string()).await.expect("memory db");
        db.ensure_initialized(1024).await.expect("init");

        for chunk_id in 1..=3i64 {
            let chunk = Chunk::new("doc1", chunk_id, "tenant1", "text".to_string(), None, "doc".to_string(), None, ChunkMetadata::default(), false);
            db.store_item(chunk).await.expect("store chunk");
        }
        let seed: Vec<(String, i64, Vec<f32>)> =
            (1..=3).map(|id| ("doc1".to_string(), id, vec![0.0; 1024])).collect();
        Chunk::store_embeddings_batch(&db, &seed, 1).await.expect("seed embeddings");

        let target_version = 2;
        let target_dimension = 2048usize;
        Chunk::reset_migration_side_column(&db).await.expect("reset side column");
        loop {
            let pending = Chunk::count_pending_migration(&db, target_version).await.expect("count pending");
            if pending == 0 {
                break;
            }
            let batch = Chunk::select_for_migration(&db, target_version, 100).await.expect("select batch");
            if batch.is_empty() {
                break;
            }
            for chunk in &batch {
                Chunk::store_migrated_embedding(&db, &chunk.doc_id, chunk.chunk_id, vec![0.0; target_dimension], target_version)
                    .await
                    .expect("store migrated embedding");
            }
        }
        Chunk::swap_migrated_embeddings(&db).await.expect("swap");
        db.rebuild_embedding_index(target_dimension as u32).await.expect("rebuild index");

        let chunks = Chunk::list_by_doc_id(&db, "doc1").await.expect("list chunks");
        assert_eq!(chunks.len(), 3);
        for chunk in chunks {
            assert_eq!(chunk.embedding_version, target_version);
            let embedding = chunk.embedding.expect("embedding must not be null after migration");
            assert_eq!(embedding.len(), target_dimension);
        }
    }

    /// §8 scenario 6: in a batch of 5, an invalid-JSON response for one
    /// chunk fails only that chunk; the other four reach `completed` with
    /// their extracted metadata intact.
    #[test]
    fn metadata_batch_isolates_a_single_malformed_response() {
        let responses = vec![
            serde_json::json!({"summary": "one", "keywords": [], "entities": {}}),
            serde_json::json!({"summary": "two", "keywords": [], "entities": {}}),
            serde_json::json!({"error": "invalid json in json_output tags", "raw_content": "not json"}),
            serde_json::json!({"summary": "four", "keywords": [], "entities": {}}),
            serde_json::json!({"summary": "five", "keywords": [], "entities": {}}),
        ];

        let classified: Vec<_> = responses.iter().map(classify_metadata_result).collect();

        for (idx, (status, metadata, error)) in classified.iter().enumerate() {
            if idx == 2 {
                assert_eq!(*status, StageStatus::Failed);
                assert!(metadata.is_none());
                assert_eq!(error.as_deref(), Some("invalid json in json_output tags"));
            } else {
                assert_eq!(*status, StageStatus::Completed);
                assert!(metadata.is_some());
                assert!(error.is_none());
            }
        }
    }
}
