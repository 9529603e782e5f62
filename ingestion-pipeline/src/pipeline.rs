//! C5 Upload Worker: downloads a task's source file, parses it, normalizes
//! and hierarchy-enriches the resulting blocks, chunks them, and persists
//! the `Document` + `Chunk` rows. No embeddings are generated here — that's
//! the enrichment worker's job, so an upload never blocks on an LLM call.

use std::sync::Arc;

use common::error::AppError;
use common::graph::GraphStore;
use common::storage::db::SurrealDbClient;
use common::storage::store::StorageManager;
use common::storage::types::chunk::{Chunk, ChunkMetadata, SectionMeta};
use common::storage::types::document::Document;
use common::storage::types::knowledge_event::KnowledgeEvent;
use common::utils::config::AppConfig;
use serde_json::Value;

use crate::chunker::{RawChunk, Section, SmartChunker};
use crate::parsers::{self, Block, OcrOptions};
use crate::tokenizer::TokenCounter;

pub struct IngestionPipeline {
    db: Arc<SurrealDbClient>,
    storage: StorageManager,
    graph: Arc<dyn GraphStore>,
    chunker: SmartChunker,
    relations_enabled: bool,
    excel_row_batch_size: usize,
    ocr: OcrOptions,
}

impl IngestionPipeline {
    #[must_use]
    pub fn new(
        db: Arc<SurrealDbClient>,
        storage: StorageManager,
        graph: Arc<dyn GraphStore>,
        config: &AppConfig,
    ) -> Self {
        let chunker = SmartChunker::new(config, TokenCounter::load(&config.tokenizer_encoding));
        Self {
            db,
            storage,
            graph,
            chunker,
            relations_enabled: config.neo4j_enabled,
            excel_row_batch_size: config.excel_row_batch_size,
            ocr: OcrOptions { enabled: config.ocr_enabled, lang: config.ocr_lang.clone() },
        }
    }

    /// Parses, chunks and stores one uploaded document. Mirrors
    /// `process_and_save_file`'s cascade-delete-then-reprocess behavior: a
    /// re-upload of a `doc_id` that already exists wipes the prior
    /// document/chunks first so the store never carries two generations of
    /// the same document side by side.
    pub async fn process_upload(&self, task: &KnowledgeEvent) -> Result<String, AppError> {
        let s3_path = task
            .s3_path
            .as_ref()
            .ok_or_else(|| AppError::Validation("task is missing s3_path".to_string()))?;

        if Document::exists(&self.db, &task.item_uuid).await? {
            tracing::warn!(doc_id = %task.item_uuid, "document already exists, reprocessing from scratch");
            self.graph.delete_by_doc(&task.tenant_id, &task.item_uuid).await?;
            Document::delete_cascade(&self.db, &task.item_uuid).await?;
        }

        let bytes = self.storage.get(s3_path).await?;
        let tmp = tempfile::Builder::new()
            .suffix(&format!("_{}", task.item_name))
            .tempfile()
            .map_err(AppError::Io)?;
        std::fs::write(tmp.path(), &bytes).map_err(AppError::Io)?;

        let (raw_blocks, properties) =
            parsers::parse(tmp.path(), &task.item_uuid, self.excel_row_batch_size, &self.ocr);

        if let Some(first) = raw_blocks.first() {
            if first.block_type == "error" {
                return Err(AppError::Processing(format!("parsing failed: {}", first.text)));
            }
        }

        let normalized = normalize_blocks(raw_blocks);
        if normalized.is_empty() {
            let size_bytes = properties.get("size_bytes").and_then(Value::as_u64).unwrap_or(0);
            if size_bytes > 1024 {
                return Err(AppError::Processing(format!(
                    "parser extracted no content from a non-empty file ({size_bytes} bytes)"
                )));
            }
            return Ok("document is empty, nothing to index".to_string());
        }

        let enriched = enrich_blocks_with_hierarchy(normalized);
        let sections: Vec<Section> = enriched
            .iter()
            .map(|block| Section {
                text: block.text.clone(),
                meta: block.metadata.clone(),
            })
            .collect();

        let raw_chunks = self.chunker.split_document(&sections);
        if raw_chunks.is_empty() {
            return Ok("document did not yield any chunks".to_string());
        }

        let doc = Document::new(
            &task.item_uuid,
            &task.tenant_id,
            &task.user_id,
            task.item_name.clone(),
            properties.get("title").and_then(Value::as_str).map(str::to_string),
            None,
            properties,
        );
        self.db.store_item(doc).await?;

        let chunk_count = raw_chunks.len();
        for (idx, raw_chunk) in raw_chunks.into_iter().enumerate() {
            let chunk_id = (idx + 1) as i64;
            let section = section_from_raw(&raw_chunk);
            let source_type = source_type_from_raw(&raw_chunk);
            let metadata = chunk_metadata_from_raw(&raw_chunk);
            let chunk = Chunk::new(
                &task.item_uuid,
                chunk_id,
                &task.tenant_id,
                raw_chunk.text,
                section,
                raw_chunk.block_type,
                source_type,
                metadata,
                self.relations_enabled,
            );
            self.db.store_item(chunk).await?;
        }

        Ok(format!("document and {chunk_count} chunks stored"))
    }
}

/// Reads the chunker-computed section identifier off a raw chunk: a
/// top-level `section` key for chunks built from a single source section
/// (tables, list/paragraph passthrough), or the first composited section's
/// `section_0.section` for merged/whole-doc chunks.
fn section_from_raw(raw: &RawChunk) -> Option<String> {
    raw.meta
        .get("section")
        .or_else(|| raw.meta.get("section_0.section"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Reads the original parser block `type` (§3's "source block type",
/// distinct from the chunker's own `block_type` output class) off a raw
/// chunk, the same way `section_from_raw` reads `section`.
fn source_type_from_raw(raw: &RawChunk) -> Option<String> {
    raw.meta
        .get("type")
        .or_else(|| raw.meta.get("section_0.type"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Converts a chunker-produced `sections` array (if present) into the
/// structured `SectionMeta` list the `Chunk` record carries, leaving every
/// other metadata key under `extra`.
fn chunk_metadata_from_raw(raw: &RawChunk) -> ChunkMetadata {
    let mut metadata = ChunkMetadata::default();
    let mut source = raw.meta.clone();

    if let Some(Value::Array(sections)) = source.remove("sections") {
        let parsed = sections
            .into_iter()
            .enumerate()
            .filter_map(|(idx, value)| match value {
                Value::Object(mut fields) => {
                    fields.remove("index");
                    Some(SectionMeta { index: idx, fields })
                }
                _ => None,
            })
            .collect();
        metadata.sections = Some(parsed);
    }

    if let Some(Value::Bool(is_whole_doc)) = source.remove("is_whole_doc") {
        metadata.is_whole_doc = Some(is_whole_doc);
    }

    if let Some(Value::Array(path)) = source.get("context_path").cloned() {
        metadata.context_path = Some(
            path.into_iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
        );
        source.remove("context_path");
    }

    metadata.extra = source;
    metadata
}

/// Mirrors `normalize_text_block`: collapses hyphenated line-wraps, then
/// joins wrapped lines within a paragraph back into one line while keeping
/// blank-line paragraph boundaries, dropping blocks that normalize to
/// nothing. Non-text block types (tables, slides) pass through untouched.
fn normalize_blocks(blocks: Vec<Block>) -> Vec<Block> {
    const TEXT_LIKE: &[&str] = &["paragraph", "heading", "image_text", "section", "caption"];

    blocks
        .into_iter()
        .filter_map(|mut block| {
            if TEXT_LIKE.contains(&block.block_type.as_str()) {
                let cleaned = normalize_text_block(&block.text);
                if cleaned.is_empty() {
                    return None;
                }
                block.text = cleaned;
                Some(block)
            } else if !block.text.trim().is_empty() {
                Some(block)
            } else {
                None
            }
        })
        .collect()
}

fn normalize_text_block(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }
    let dehyphenated = dehyphenate(text);
    dehyphenated
        .split("\n\n")
        .map(|paragraph| paragraph.replace('\n', " ").trim().to_string())
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Joins a line-final hyphen directly onto the next line's first word,
/// undoing PDF/OCR text-layer line wraps (`"exam-\nple"` -> `"example"`).
fn dehyphenate(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '-' {
            let mut lookahead = chars.clone();
            let mut saw_newline = false;
            while let Some(&next) = lookahead.peek() {
                if next == '\n' {
                    saw_newline = true;
                    lookahead.next();
                } else if next.is_whitespace() {
                    lookahead.next();
                } else {
                    break;
                }
            }
            if saw_newline {
                chars = lookahead;
                continue;
            }
        }
        result.push(c);
    }
    result
}

/// Mirrors `enrich_blocks_with_hierarchy`: tracks the active heading stack
/// and stamps every block with `context_path`, the titles of its enclosing
/// headings from outermost to innermost.
fn enrich_blocks_with_hierarchy(blocks: Vec<Block>) -> Vec<Block> {
    let mut stack: Vec<(u8, String)> = Vec::new();
    blocks
        .into_iter()
        .map(|mut block| {
            if block.block_type == "heading" {
                if let Some(level) = block.level {
                    while stack.last().is_some_and(|(l, _)| *l >= level) {
                        stack.pop();
                    }
                    stack.push((level, block.text.clone()));
                }
            }
            let context_path: Vec<Value> = stack.iter().map(|(_, title)| Value::String(title.clone())).collect();
            block.metadata.insert("context_path".to_string(), Value::Array(context_path));
            block.metadata.insert("type".to_string(), Value::String(block.block_type.clone()));
            if let Some(section) = &block.section {
                block.metadata.entry("section".to_string()).or_insert_with(|| Value::String(section.clone()));
            }
            if let Some(caption) = &block.caption {
                block.metadata.entry("caption".to_string()).or_insert_with(|| Value::String(caption.clone()));
            }
            block
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::graph::NullGraphStore;
    use common::storage::types::knowledge_event::{ItemType, KnowledgeEvent, Operation, TaskStatus};
    use common::utils::config::StorageKind;
    use uuid::Uuid;

    async fn test_pipeline(db: Arc<SurrealDbClient>) -> IngestionPipeline {
        let config = AppConfig {
            storage: StorageKind::Memory,
            chunker_chunk_tokens: 50,
            chunker_overlap_tokens: 0,
            chunker_doc_limit: 2000,
            ..AppConfig::default()
        };
        let storage = StorageManager::new(&config).await.expect("memory storage");
        IngestionPipeline::new(db, storage, Arc::new(NullGraphStore), &config)
    }

    fn upload_event(item_uuid: &str, s3_path: &str) -> KnowledgeEvent {
        let now = chrono::Utc::now();
        KnowledgeEvent {
            id: Uuid::new_v4().to_string(),
            item_uuid: item_uuid.to_string(),
            tenant_id: "tenant1".to_string(),
            user_id: "user1".to_string(),
            operation: Operation::Created,
            operation_time: now,
            item_name: "doc1.txt".to_string(),
            item_type: ItemType::File,
            content: None,
            size: Some(64),
            status: TaskStatus::New,
            s3_path: Some(s3_path.to_string()),
            result_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// §8 scenario 4: reprocessing the same `created` event twice yields
    /// the same `(doc_id, chunk_id)` set and chunk count, with no orphan
    /// rows left behind by the cascade delete the reprocess branch runs.
    #[tokio::test]
    async fn reprocessing_the_same_upload_is_idempotent() {
        let db = Arc::new(SurrealDbClient::memory("test", &Uuid::new_v4().to_string()).await.expect("memory db"));
        db.ensure_initialized(8).await.expect("init");
        let pipeline = test_pipeline(db.clone()).await;

        let s3_path = "tenant1/doc1/doc1.txt";
        pipeline.storage.put(s3_path, bytes::Bytes::from_static(b"Hello world.\n\nA short body paragraph.")).await.expect("seed upload");

        let task = upload_event("doc1", s3_path);

        pipeline.process_upload(&task).await.expect("first process");
        let first_chunks = Chunk::list_by_doc_id(&db, "doc1").await.expect("list chunks");

        pipeline.process_upload(&task).await.expect("second process");
        let second_chunks = Chunk::list_by_doc_id(&db, "doc1").await.expect("list chunks");

        assert_eq!(first_chunks.len(), second_chunks.len());
        let first_ids: Vec<i64> = first_chunks.iter().map(|c| c.chunk_id).collect();
        let second_ids: Vec<i64> = second_chunks.iter().map(|c| c.chunk_id).collect();
        assert_eq!(first_ids, second_ids);
    }

    #[test]
    fn normalize_text_block_dehyphenates_and_collapses_wraps() {
        let input = "this is an exam-\nple of wrapped\ntext.\n\nSecond paragraph.";
        let normalized = normalize_text_block(input);
        assert_eq!(normalized, "this is an example of wrapped text.\n\nSecond paragraph.");
    }

    #[test]
    fn normalize_text_block_empty_input_is_empty() {
        assert_eq!(normalize_text_block(""), "");
    }

    #[test]
    fn enrich_blocks_with_hierarchy_tracks_nested_headings() {
        let mut h1 = Block::new(1, "heading", "Top".to_string());
        h1.level = Some(1);
        let mut h2 = Block::new(2, "heading", "Sub".to_string());
        h2.level = Some(2);
        let para = Block::new(3, "paragraph", "body text".to_string());

        let enriched = enrich_blocks_with_hierarchy(vec![h1, h2, para]);
        let context_path = enriched[2].metadata.get("context_path").unwrap().as_array().unwrap();
        assert_eq!(context_path, &vec![Value::String("Top".to_string()), Value::String("Sub".to_string())]);
    }

    #[test]
    fn enrich_blocks_with_hierarchy_pops_siblings_at_same_level() {
        let mut h1 = Block::new(1, "heading", "A".to_string());
        h1.level = Some(1);
        let mut h2 = Block::new(2, "heading", "B".to_string());
        h2.level = Some(1);
        let para = Block::new(3, "paragraph", "text".to_string());

        let enriched = enrich_blocks_with_hierarchy(vec![h1, h2, para]);
        let context_path = enriched[2].metadata.get("context_path").unwrap().as_array().unwrap();
        assert_eq!(context_path, &vec![Value::String("B".to_string())]);
    }
}
