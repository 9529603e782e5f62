//! Upload and deletion side of the pipeline (C2 parser dispatch, C3
//! chunking, C5 upload worker). Embedding generation, LLM enrichment and
//! dimension migration live in `enrichment-pipeline` instead, since they
//! scale independently and have a very different failure profile (network
//! calls to an LLM/embedding endpoint vs. local CPU-bound parsing).

pub mod chunker;
pub mod parsers;
pub mod pipeline;
pub mod tokenizer;

use std::sync::Arc;
use std::time::Duration;

use common::error::AppError;
use common::storage::db::SurrealDbClient;
use common::storage::types::document::Document;
use common::storage::types::knowledge_event::{KnowledgeEvent, Operation, TaskStatus};
use tokio_util::sync::CancellationToken;

use crate::pipeline::IngestionPipeline;

/// Sleeps for `poll_interval` unless `shutdown` fires first, in which case
/// it returns immediately so the caller's loop can observe cancellation
/// without waiting out the rest of the poll interval.
async fn sleep_or_cancelled(poll_interval: Duration, shutdown: &CancellationToken) {
    tokio::select! {
        () = tokio::time::sleep(poll_interval) => {}
        () = shutdown.cancelled() => {}
    }
}

/// C5 upload worker loop: claims the oldest `created`/`updated` task,
/// downloads + parses + chunks it, and marks the task `done`/`failed`.
/// Polls at `poll_interval` when the queue is empty rather than busy-waiting.
/// Checks `shutdown` at every loop boundary and before claiming a new task.
pub async fn run_upload_worker_loop(
    db: Arc<SurrealDbClient>,
    pipeline: Arc<IngestionPipeline>,
    poll_interval: Duration,
    shutdown: CancellationToken,
) {
    while !shutdown.is_cancelled() {
        let task = match KnowledgeEvent::claim_next(&db, Operation::Created).await {
            Ok(Some(task)) => task,
            Ok(None) => match KnowledgeEvent::claim_next(&db, Operation::Updated).await {
                Ok(Some(task)) => task,
                Ok(None) => {
                    sleep_or_cancelled(poll_interval, &shutdown).await;
                    continue;
                }
                Err(err) => {
                    tracing::error!(error = %err, "failed to claim updated task");
                    sleep_or_cancelled(poll_interval, &shutdown).await;
                    continue;
                }
            },
            Err(err) => {
                tracing::error!(error = %err, "failed to claim created task");
                sleep_or_cancelled(poll_interval, &shutdown).await;
                continue;
            }
        };

        let task_id = task.id.clone();
        let doc_id = task.item_uuid.clone();
        metrics::histogram!("doc_processing_duration_seconds", "operation" => "upload")
            .record(0.0);
        let start = std::time::Instant::now();
        match pipeline.process_upload(&task).await {
            Ok(message) => {
                if let Err(err) = KnowledgeEvent::complete(&db, &task_id, TaskStatus::Done, Some(message)).await {
                    tracing::error!(error = %err, task_id, doc_id, "failed to mark task done");
                }
                metrics::counter!("docs_processed_total").increment(1);
            }
            Err(err) => {
                tracing::error!(error = %err, task_id, doc_id, "upload task failed");
                let _ = KnowledgeEvent::complete(&db, &task_id, TaskStatus::Failed, Some(err.to_string())).await;
                metrics::counter!("processing_errors_total", "worker_type" => "upload", "stage" => "main")
                    .increment(1);
            }
        }
        metrics::histogram!("doc_processing_duration_seconds", "operation" => "upload")
            .record(start.elapsed().as_secs_f64());
    }
}

/// C5 deletion worker loop: claims a `deleted` task and cascade-removes the
/// document. Graph-store cleanup is the caller's responsibility and must
/// run before this, per `Document::delete_cascade`'s contract.
pub async fn run_deletion_worker_loop(
    db: Arc<SurrealDbClient>,
    graph: Arc<dyn common::graph::GraphStore>,
    poll_interval: Duration,
    shutdown: CancellationToken,
) {
    while !shutdown.is_cancelled() {
        let task = match KnowledgeEvent::claim_next(&db, Operation::Deleted).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                sleep_or_cancelled(poll_interval, &shutdown).await;
                continue;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to claim deletion task");
                sleep_or_cancelled(poll_interval, &shutdown).await;
                continue;
            }
        };

        match delete_document(&db, graph.as_ref(), &task).await {
            Ok(()) => {
                let _ = KnowledgeEvent::complete(&db, &task.id, TaskStatus::Done, None).await;
                metrics::counter!("docs_deprovisioned_total").increment(1);
            }
            Err(err) => {
                tracing::error!(error = %err, task_id = %task.id, doc_id = %task.item_uuid, "deletion task failed");
                let _ = KnowledgeEvent::complete(&db, &task.id, TaskStatus::Failed, Some(err.to_string())).await;
                metrics::counter!("processing_errors_total", "worker_type" => "deletion", "stage" => "main")
                    .increment(1);
            }
        }
    }
}

async fn delete_document(
    db: &SurrealDbClient,
    graph: &dyn common::graph::GraphStore,
    task: &KnowledgeEvent,
) -> Result<(), AppError> {
    graph.delete_by_doc(&task.tenant_id, &task.item_uuid).await?;
    Document::delete_cascade(db, &task.item_uuid).await?;
    Ok(())
}
