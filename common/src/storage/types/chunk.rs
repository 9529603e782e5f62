use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::error::AppError;
use crate::storage::db::SurrealDbClient;
use crate::stored_object;

/// The three enrichment stages a chunk can carry. `RelationExtraction` is
/// only present on the wire when the graph store is enabled.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentStage {
    EmbeddingGeneration,
    MetadataExtraction,
    RelationExtraction,
}

impl EnrichmentStage {
    #[must_use]
    pub fn as_field(self) -> &'static str {
        match self {
            EnrichmentStage::EmbeddingGeneration => "embedding_generation",
            EnrichmentStage::MetadataExtraction => "metadata_extraction",
            EnrichmentStage::RelationExtraction => "relation_extraction",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageState {
    pub status: StageStatus,
    pub updated_at: chrono::DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl StageState {
    #[must_use]
    pub fn pending() -> Self {
        Self {
            status: StageStatus::Pending,
            updated_at: Utc::now(),
            error_message: None,
        }
    }
}

/// Per-chunk enrichment progress. An open map in the source system; modeled
/// here as a tagged struct per the design notes' "open metadata maps"
/// pattern, with `relation_extraction` only populated when the graph store
/// is enabled for this tenant/process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnrichmentStatus {
    pub embedding_generation: StageState,
    pub metadata_extraction: StageState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relation_extraction: Option<StageState>,
}

impl EnrichmentStatus {
    #[must_use]
    pub fn new_pending(relations_enabled: bool) -> Self {
        Self {
            embedding_generation: StageState::pending(),
            metadata_extraction: StageState::pending(),
            relation_extraction: relations_enabled.then(StageState::pending),
        }
    }
}

/// One source section folded into a composite chunk, preserved in order
/// with its own metadata so colliding keys across sections never overwrite
/// each other (the bug the design notes call out explicitly).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SectionMeta {
    pub index: usize,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// Open metadata map, tagged for the well-known keys the worker/chunker
/// populate and a flattened sidecar for everything else (LLM-derived
/// keywords/entities, `section_{index}.{key}` lookups, etc).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ChunkMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_path: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sections: Option<Vec<SectionMeta>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_whole_doc: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_metadata_extraction: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChunkMetadata {
    /// Merges the flattened `section_{index}.{key}` lookup entries used by
    /// the chunker's metadata-combination rule (never overwrites an
    /// existing key).
    pub fn insert_flattened(&mut self, key: String, value: Value) {
        self.extra.entry(key).or_insert(value);
    }
}

stored_object!(Chunk, "chunk", {
    doc_id: String,
    chunk_id: i64,
    tenant_id: String,
    text: String,
    section: Option<String>,
    block_type: String,
    source_type: Option<String>,
    metadata: ChunkMetadata,
    embedding: Option<Vec<f32>>,
    embedding_version: i64,
    enrichment_status: EnrichmentStatus,
});

impl Chunk {
    #[must_use]
    pub fn new(
        doc_id: &str,
        chunk_id: i64,
        tenant_id: &str,
        text: String,
        section: Option<String>,
        block_type: String,
        source_type: Option<String>,
        metadata: ChunkMetadata,
        relations_enabled: bool,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: format!("{doc_id}_{chunk_id}"),
            doc_id: doc_id.to_string(),
            chunk_id,
            tenant_id: tenant_id.to_string(),
            text,
            section,
            block_type,
            source_type,
            metadata,
            embedding: None,
            embedding_version: 0,
            enrichment_status: EnrichmentStatus::new_pending(relations_enabled),
            created_at: now,
            updated_at: now,
        }
    }

    /// C4 `claim_pending_chunks`: atomically flips up to `batch_size` rows'
    /// `enrichment_status.<stage>.status` from `pending` to `processing`,
    /// in deterministic `(doc_id, chunk_id)` order, and returns them.
    ///
    /// SurrealDB has no literal "skip locked" clause; the same effect is
    /// achieved by running the select-then-update inside a single
    /// serializable transaction and retrying on the conflict error it
    /// raises when two claimers race for the same rows, so no row is ever
    /// handed to more than one worker.
    pub async fn claim_pending_chunks(
        db: &SurrealDbClient,
        stage: EnrichmentStage,
        batch_size: usize,
    ) -> Result<Vec<Chunk>, AppError> {
        let field = stage.as_field();
        let query = format!(
            "BEGIN TRANSACTION;
             LET $rows = (SELECT * FROM chunk WHERE enrichment_status.{field}.status = 'pending' \
                 ORDER BY doc_id, chunk_id LIMIT {batch_size});
             UPDATE $rows SET enrichment_status.{field}.status = 'processing', \
                 enrichment_status.{field}.updated_at = time::now();
             COMMIT TRANSACTION;
             RETURN $rows;"
        );

        let mut attempt = 0u32;
        loop {
            let result = db.client.query(query.clone()).await;
            match result {
                Ok(mut response) => {
                    let rows: Vec<Chunk> = response.take(response.num_statements() - 1)?;
                    return Ok(rows);
                }
                Err(err) if is_conflict(&err) && attempt < 5 => {
                    attempt += 1;
                    tokio::time::sleep(std::time::Duration::from_millis(20 * u64::from(attempt)))
                        .await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// C4 `update_chunk_stage`: merges a terminal or error state into
    /// `enrichment_status.<stage>`, and (on success with a non-error
    /// result) merges the result under `metadata.llm_<stage>`.
    pub async fn update_chunk_stage(
        db: &SurrealDbClient,
        doc_id: &str,
        chunk_id: i64,
        stage: EnrichmentStage,
        status: StageStatus,
        result: Option<Value>,
        error: Option<String>,
    ) -> Result<(), AppError> {
        let id = format!("{doc_id}_{chunk_id}");
        let field = stage.as_field();
        let state = StageState {
            status,
            updated_at: Utc::now(),
            error_message: error,
        };

        if let Some(result) = result.filter(|_| status == StageStatus::Completed) {
            let key = format!("llm_{field}");
            db.client
                .query(format!(
                    "UPDATE type::thing('chunk', $id) SET enrichment_status.{field} = $state, metadata.{key} = $result"
                ))
                .bind(("id", id))
                .bind(("state", state))
                .bind(("result", result))
                .await?;
        } else {
            db.client
                .query(format!(
                    "UPDATE type::thing('chunk', $id) SET enrichment_status.{field} = $state"
                ))
                .bind(("id", id))
                .bind(("state", state))
                .await?;
        }
        Ok(())
    }

    /// Bulk-writes embeddings for an entire batch in one statement, stamping
    /// every row with the current `embedding_version` and marking the
    /// `embedding_generation` stage completed. Used by the enrichment
    /// worker, which treats the whole batch as one unit of success/failure.
    pub async fn store_embeddings_batch(
        db: &SurrealDbClient,
        updates: &[(String, i64, Vec<f32>)],
        embedding_version: i64,
    ) -> Result<(), AppError> {
        for (doc_id, chunk_id, embedding) in updates {
            let id = format!("{doc_id}_{chunk_id}");
            let state = StageState {
                status: StageStatus::Completed,
                updated_at: Utc::now(),
                error_message: None,
            };
            db.client
                .query(
                    "UPDATE type::thing('chunk', $id) SET embedding = $embedding, embedding_version = $version, \
                     enrichment_status.embedding_generation = $state",
                )
                .bind(("id", id))
                .bind(("embedding", embedding.clone()))
                .bind(("version", embedding_version))
                .bind(("state", state))
                .await?;
        }
        Ok(())
    }

    pub async fn delete_by_doc_id(db: &SurrealDbClient, doc_id: &str) -> Result<(), AppError> {
        db.client
            .query("DELETE chunk WHERE doc_id = $doc_id")
            .bind(("doc_id", doc_id.to_string()))
            .await?;
        Ok(())
    }

    pub async fn list_by_doc_id(db: &SurrealDbClient, doc_id: &str) -> Result<Vec<Chunk>, AppError> {
        let mut response = db
            .client
            .query("SELECT * FROM chunk WHERE doc_id = $doc_id ORDER BY chunk_id")
            .bind(("doc_id", doc_id.to_string()))
            .await?;
        Ok(response.take(0)?)
    }

    /// Batch selection for the migration worker: rows whose
    /// `embedding_version` has not yet reached `target_version`.
    pub async fn select_for_migration(
        db: &SurrealDbClient,
        target_version: i64,
        batch_size: usize,
    ) -> Result<Vec<Chunk>, AppError> {
        let mut response = db
            .client
            .query(format!(
                "SELECT * FROM chunk WHERE embedding_version < $target LIMIT {batch_size}"
            ))
            .bind(("target", target_version))
            .await?;
        Ok(response.take(0)?)
    }

    pub async fn count_pending_migration(
        db: &SurrealDbClient,
        target_version: i64,
    ) -> Result<usize, AppError> {
        #[derive(Deserialize)]
        struct CountRow {
            count: usize,
        }
        let mut response = db
            .client
            .query("SELECT count() FROM chunk WHERE embedding_version < $target GROUP ALL")
            .bind(("target", target_version))
            .await?;
        let rows: Vec<CountRow> = response.take(0)?;
        Ok(rows.first().map_or(0, |r| r.count))
    }

    /// Drops and re-adds the `embedding_new` side column used by the
    /// migration worker. Idempotent across restarts: a prior interrupted
    /// migration's side column is dropped and recreated at the (possibly
    /// unchanged) target dimension before the batched loop resumes.
    pub async fn reset_migration_side_column(db: &SurrealDbClient) -> Result<(), AppError> {
        db.client
            .query("UPDATE chunk SET embedding_new = NONE")
            .await?;
        Ok(())
    }

    /// Writes one migrated vector into the `embedding_new` side column and
    /// advances `embedding_version`, without touching `embedding` itself —
    /// the live column stays on the old vectors until the final swap.
    pub async fn store_migrated_embedding(
        db: &SurrealDbClient,
        doc_id: &str,
        chunk_id: i64,
        embedding_new: Vec<f32>,
        target_version: i64,
    ) -> Result<(), AppError> {
        let id = format!("{doc_id}_{chunk_id}");
        db.client
            .query(
                "UPDATE type::thing('chunk', $id) SET embedding_new = $embedding, \
                 embedding_version = $version",
            )
            .bind(("id", id))
            .bind(("embedding", embedding_new))
            .bind(("version", target_version))
            .await?;
        Ok(())
    }

    /// Step 4 of the migration protocol: atomically drops the old
    /// `embedding` column and renames `embedding_new` into its place.
    /// SurrealDB has no `ALTER TABLE ... RENAME COLUMN`; the equivalent
    /// here is copying the side column's value over the live one and
    /// clearing the side column, inside one transaction so no reader ever
    /// observes a chunk with neither populated.
    pub async fn swap_migrated_embeddings(db: &SurrealDbClient) -> Result<(), AppError> {
        db.client
            .query(
                "BEGIN TRANSACTION;
                 UPDATE chunk SET embedding = embedding_new, embedding_new = NONE \
                     WHERE embedding_new != NONE;
                 COMMIT TRANSACTION;",
            )
            .await?;
        Ok(())
    }
}

fn is_conflict(err: &surrealdb::Error) -> bool {
    err.to_string().to_lowercase().contains("conflict")
}

/// Per-batch work item threaded through the embedding pipeline: just enough
/// to re-key a generated vector back onto its chunk row.
#[derive(Debug, Clone)]
pub struct PendingEmbedding {
    pub doc_id: String,
    pub chunk_id: i64,
    pub text: String,
}

impl From<&Chunk> for PendingEmbedding {
    fn from(chunk: &Chunk) -> Self {
        Self {
            doc_id: chunk.doc_id.clone(),
            chunk_id: chunk.chunk_id,
            text: chunk.text.clone(),
        }
    }
}

/// Flattens the chunker's `sections` metadata into `section_{index}.{key}`
/// lookup keys without ever overwriting a colliding key, per the
/// metadata-combination rule.
#[must_use]
pub fn flatten_section_keys(sections: &[SectionMeta]) -> HashMap<String, Value> {
    let mut flat = HashMap::new();
    for sec in sections {
        for (key, value) in &sec.fields {
            flat.entry(format!("section_{}.{key}", sec.index))
                .or_insert_with(|| value.clone());
        }
    }
    flat
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn claim_pending_chunks_flips_status_and_is_exclusive() {
        let db = SurrealDbClient::memory("test", &Uuid::new_v4().to_string())
            .await
            .expect("memory db");
        db.ensure_initialized(8).await.expect("init");

        let chunk = Chunk::new(
            "doc1",
            1,
            "tenant1",
            "hello world".to_string(),
            None,
            "doc".to_string(),
            None,
            ChunkMetadata::default(),
            false,
        );
        db.store_item(chunk).await.expect("store");

        let claimed = Chunk::claim_pending_chunks(&db, EnrichmentStage::EmbeddingGeneration, 10)
            .await
            .expect("claim");
        assert_eq!(claimed.len(), 1);
        assert_eq!(
            claimed[0].enrichment_status.embedding_generation.status,
            StageStatus::Processing
        );

        let claimed_again =
            Chunk::claim_pending_chunks(&db, EnrichmentStage::EmbeddingGeneration, 10)
                .await
                .expect("claim again");
        assert!(claimed_again.is_empty());
    }

    #[test]
    fn flatten_section_keys_never_overwrites() {
        let mut fields_a = Map::new();
        fields_a.insert("title".to_string(), Value::String("A".to_string()));
        let mut fields_b = Map::new();
        fields_b.insert("title".to_string(), Value::String("B".to_string()));

        let sections = vec![
            SectionMeta { index: 0, fields: fields_a },
            SectionMeta { index: 1, fields: fields_b },
        ];
        let flat = flatten_section_keys(&sections);
        assert_eq!(flat.get("section_0.title").unwrap(), "A");
        assert_eq!(flat.get("section_1.title").unwrap(), "B");
    }
}
