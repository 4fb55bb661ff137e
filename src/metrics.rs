//! Prometheus metrics

use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;

/// Setup Prometheus metrics recorder
/// Returns a handle that can be used to render the current metrics
pub fn setup_metrics() -> Result<metrics_exporter_prometheus::PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus recorder: {}", e))?;

    tracing::info!("Prometheus metrics recorder installed");

    Ok(handle)
}

/// Record a model registration
pub fn record_model_registered(model_id: &str) {
    metrics::counter!("llm_cache_models_registered_total",
        "model" => model_id.to_string()
    )
    .increment(1);
}

/// Record a model cache deletion
pub fn record_model_deleted(model_id: &str) {
    metrics::counter!("llm_cache_models_deleted_total",
        "model" => model_id.to_string()
    )
    .increment(1);
}

/// Record an adapter download
pub fn record_adapter_download(key: &str) {
    metrics::counter!("llm_cache_adapter_downloads_total",
        "adapter" => key.to_string()
    )
    .increment(1);
}

/// Record an adapter resolved from cache
pub fn record_adapter_cache_hit(key: &str) {
    metrics::counter!("llm_cache_adapter_cache_hits_total",
        "adapter" => key.to_string()
    )
    .increment(1);
}

/// Record a backend model load
pub fn record_model_load(model_id: &str) {
    metrics::counter!("llm_cache_model_loads_total",
        "model" => model_id.to_string()
    )
    .increment(1);
}

/// Record an LRU eviction
pub fn record_model_eviction(model_id: &str) {
    metrics::counter!("llm_cache_model_evictions_total",
        "model" => model_id.to_string()
    )
    .increment(1);
}

/// Update tracked model count gauge
pub fn update_loaded_models(count: usize) {
    metrics::gauge!("llm_cache_loaded_models").set(count as f64);
}

/// Record a background download transition
pub fn record_background_download(outcome: &'static str) {
    metrics::counter!("llm_cache_background_downloads_total",
        "outcome" => outcome
    )
    .increment(1);
}

/// Record a low memory warning
pub fn record_memory_warning() {
    metrics::counter!("llm_cache_memory_warnings_total").increment(1);
}
