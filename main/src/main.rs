//! C9 Supervisor: the single process that owns every background worker
//! plus an HTTP surface limited to health and metrics (§6 — no
//! subcommands, no other routes). Every worker is a plain tokio task
//! sharing one `SurrealDbClient` connection and one `StorageManager`.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use common::graph::{GraphStore, NullGraphStore, SurrealGraphStore};
use common::storage::db::SurrealDbClient;
use common::storage::store::StorageManager;
use common::storage::types::chunk::EnrichmentStage;
use common::utils::config::get_config;
use enrichment_pipeline::embedding::Embedder;
use enrichment_pipeline::llm::LlmClient;
use ingestion_pipeline::pipeline::IngestionPipeline;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// §4.9: the cooldown a crashed worker waits before it is restarted.
const WORKER_RESTART_COOLDOWN: Duration = Duration::from_secs(15);

/// Runs `make_task` under a supervising task that restarts it after
/// `WORKER_RESTART_COOLDOWN` if it ever panics, logging the failure first.
/// A worker that returns normally (only happens once `shutdown` fires) is
/// not restarted.
fn spawn_supervised<F, Fut>(worker: &'static str, shutdown: CancellationToken, make_task: F)
where
    F: Fn() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        while !shutdown.is_cancelled() {
            let handle = tokio::spawn(make_task());
            match handle.await {
                Ok(()) => break,
                Err(join_err) => {
                    error!(worker, error = %join_err, "worker task panicked, restarting after cooldown");
                    tokio::select! {
                        () = tokio::time::sleep(WORKER_RESTART_COOLDOWN) => {}
                        () = shutdown.cancelled() => break,
                    }
                }
            }
        }
    });
}

#[derive(Clone)]
struct HealthState {
    db: Arc<SurrealDbClient>,
    metrics: Arc<metrics_exporter_prometheus::PrometheusHandle>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let config = get_config()?;

    let db = Arc::new(
        SurrealDbClient::new(
            &config.surrealdb_address,
            &config.surrealdb_username,
            &config.surrealdb_password,
            &config.surrealdb_namespace,
            &config.surrealdb_database,
        )
        .await?,
    );

    let embedder = Arc::new(Embedder::from_config(&config)?);
    let target_dimension = embedding_dimension_for(&config.embedding_model_name);

    db.ensure_initialized(target_dimension).await?;

    enrichment_pipeline::run_migration_if_needed(
        &db,
        &embedder,
        &config,
        &config.embedding_model_name,
        target_dimension,
    )
    .await?;

    let storage = StorageManager::new(&config).await?;
    let graph: Arc<dyn GraphStore> = if config.neo4j_enabled {
        Arc::new(SurrealGraphStore::new((*db).clone()))
    } else {
        Arc::new(NullGraphStore)
    };

    let metrics_handle = Arc::new(common::metrics::install()?);

    let ingestion_pipeline = Arc::new(IngestionPipeline::new(db.clone(), storage.clone(), graph.clone(), &config));
    let poll_interval = Duration::from_secs(config.poll_interval);
    let shutdown = CancellationToken::new();

    for _ in 0..config.upload_worker_count.max(1) {
        let db = db.clone();
        let pipeline = ingestion_pipeline.clone();
        let shutdown = shutdown.clone();
        spawn_supervised("upload_worker", shutdown.clone(), move || {
            let db = db.clone();
            let pipeline = pipeline.clone();
            let shutdown = shutdown.clone();
            async move {
                ingestion_pipeline::run_upload_worker_loop(db, pipeline, poll_interval, shutdown).await;
            }
        });
    }

    for _ in 0..config.deletion_worker_count.max(1) {
        let db = db.clone();
        let graph = graph.clone();
        let shutdown = shutdown.clone();
        spawn_supervised("deletion_worker", shutdown.clone(), move || {
            let db = db.clone();
            let graph = graph.clone();
            let shutdown = shutdown.clone();
            async move {
                ingestion_pipeline::run_deletion_worker_loop(db, graph, poll_interval, shutdown).await;
            }
        });
    }

    let llm_client = Arc::new(LlmClient::new(&config));
    let mut enrichment_stages = vec![EnrichmentStage::MetadataExtraction];
    if config.neo4j_enabled {
        enrichment_stages.push(EnrichmentStage::RelationExtraction);
    }
    for stage in enrichment_stages {
        for _ in 0..config.enrichment_worker_count.max(1) {
            let db = db.clone();
            let llm_client = llm_client.clone();
            let graph = graph.clone();
            let shutdown = shutdown.clone();
            spawn_supervised("enrichment_worker", shutdown.clone(), move || {
                let db = db.clone();
                let llm_client = llm_client.clone();
                let graph = graph.clone();
                let shutdown = shutdown.clone();
                async move {
                    enrichment_pipeline::run_enrichment_worker_loop(
                        db,
                        llm_client,
                        graph,
                        stage,
                        config.enrichment_batch_size,
                        config.llm_max_concurrency,
                        poll_interval,
                        shutdown,
                    )
                    .await;
                }
            });
        }
    }

    {
        let db = db.clone();
        let embedder = embedder.clone();
        let batch_size = config.enrichment_batch_size;
        let shutdown = shutdown.clone();
        spawn_supervised("embedding_worker", shutdown.clone(), move || {
            let db = db.clone();
            let embedder = embedder.clone();
            let shutdown = shutdown.clone();
            async move {
                enrichment_pipeline::run_embedding_worker_loop(db, embedder, batch_size, poll_interval, shutdown).await;
            }
        });
    }

    let health_state = HealthState { db: db.clone(), metrics: metrics_handle };
    let app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .with_state(health_state);

    let serve_address = format!("0.0.0.0:{}", config.http_port);
    info!(address = %serve_address, "starting supervisor http surface");
    let listener = tokio::net::TcpListener::bind(serve_address).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received, cancelling workers");
            shutdown.cancel();
        })
        .await?;

    Ok(())
}

/// §6: per-dependency status, HTTP 503 if any is down. The only dependency
/// this process has is SurrealDB — object storage/LLM/embedding endpoints
/// are checked lazily by the workers that use them, not on every health
/// probe, so a transient upstream outage doesn't take the whole process out
/// of rotation.
async fn health(State(state): State<HealthState>) -> impl IntoResponse {
    match state.db.client.query("RETURN 1").await {
        Ok(_) => (StatusCode::OK, axum::Json(serde_json::json!({"surrealdb": "ok"}))),
        Err(err) => {
            warn!(error = %err, "health check: surrealdb unreachable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                axum::Json(serde_json::json!({"surrealdb": "down", "error": err.to_string()})),
            )
        }
    }
}

async fn metrics_endpoint(State(state): State<HealthState>) -> impl IntoResponse {
    common::metrics::render(&state.metrics)
}

fn embedding_dimension_for(model_name: &str) -> u32 {
    match model_name {
        "BAAI/bge-base-en-v1.5" => 768,
        "BAAI/bge-large-en-v1.5" => 1024,
        _ => 384,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::OnceLock;
    use tower::ServiceExt;
    use uuid::Uuid;

    // The prometheus recorder is process-global; installing it twice
    // across different #[tokio::test] functions in this binary panics,
    // so every test shares one handle instead of calling install() each time.
    static METRICS_HANDLE: OnceLock<metrics_exporter_prometheus::PrometheusHandle> = OnceLock::new();

    async fn test_app() -> Router {
        let db = Arc::new(
            SurrealDbClient::memory("test", &Uuid::new_v4().to_string())
                .await
                .expect("memory db"),
        );
        db.ensure_initialized(384).await.expect("init");
        let handle = METRICS_HANDLE.get_or_init(|| common::metrics::install().expect("install metrics")).clone();
        let state = HealthState { db, metrics: Arc::new(handle) };
        Router::new()
            .route("/health", get(health))
            .route("/metrics", get(metrics_endpoint))
            .with_state(state)
    }

    #[tokio::test]
    async fn health_reports_ok_when_db_reachable() {
        let app = test_app().await;
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_endpoint_returns_prometheus_text() {
        let app = test_app().await;
        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }
}
