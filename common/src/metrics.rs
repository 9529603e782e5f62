use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Installs the process-wide Prometheus recorder. No HTTP listener of its
/// own is started — the returned handle is rendered from the `/metrics`
/// route the main binary serves alongside `/health` (§6).
pub fn install() -> Result<PrometheusHandle, anyhow::Error> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    describe();
    Ok(handle)
}

/// Renders the current snapshot for the `/metrics` route.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

pub mod names {
    pub const DOCS_PROCESSED_TOTAL: &str = "docs_processed_total";
    pub const DOCS_DEPROVISIONED_TOTAL: &str = "docs_deprovisioned_total";
    pub const CHUNKS_ENRICHED_TOTAL: &str = "chunks_enriched_total";
    pub const PROCESSING_ERRORS_TOTAL: &str = "processing_errors_total";
    pub const DOC_PROCESSING_DURATION_SECONDS: &str = "doc_processing_duration_seconds";
}

/// Registers descriptions for every metric named in §6 so a fresh scrape
/// carries `HELP`/`TYPE` lines even before the first observation.
pub fn describe() {
    metrics::describe_counter!(names::DOCS_PROCESSED_TOTAL, "Documents successfully ingested");
    metrics::describe_counter!(
        names::DOCS_DEPROVISIONED_TOTAL,
        "Documents removed via deletion events"
    );
    metrics::describe_counter!(
        names::CHUNKS_ENRICHED_TOTAL,
        "Chunks that completed an enrichment stage, labeled by stage"
    );
    metrics::describe_counter!(
        names::PROCESSING_ERRORS_TOTAL,
        "Errors encountered by workers, labeled by worker_type and stage"
    );
    metrics::describe_histogram!(
        names::DOC_PROCESSING_DURATION_SECONDS,
        metrics::Unit::Seconds,
        "Wall-clock time per document-level operation, labeled by operation"
    );
}
