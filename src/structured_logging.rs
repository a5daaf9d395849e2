//! Structured logging for pipeline events

use uuid::Uuid;

use crate::pipeline::PipelineError;

/// Structured logger for pipeline events
///
/// Every event carries the `context_id` of the run that produced it, so the
/// lines of one batch can be grouped when several runs share a log sink.
#[derive(Debug, Clone)]
pub struct PipelineLogger {
    context_id: String,
}

impl PipelineLogger {
    pub fn new(context_id: String) -> Self {
        Self { context_id }
    }

    /// Logger with a fresh random context id
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4().to_string())
    }

    pub fn context_id(&self) -> &str {
        &self.context_id
    }

    pub fn log_cache_hit(&self, signature: &str) {
        tracing::debug!(
            context_id = %self.context_id,
            signature = %signature,
            "Cache hit"
        );
    }

    pub fn log_cache_miss(&self, signature: &str) {
        tracing::debug!(
            context_id = %self.context_id,
            signature = %signature,
            "Cache miss"
        );
    }

    pub fn log_fetch(&self, signature: &str, max_supported_version: u8) {
        tracing::debug!(
            context_id = %self.context_id,
            signature = %signature,
            max_supported_version = %max_supported_version,
            "Fetching transaction"
        );
    }

    pub fn log_persisted(&self, signature: &str, bytes: usize, latency_ms: u64) {
        tracing::info!(
            context_id = %self.context_id,
            signature = %signature,
            bytes = %bytes,
            latency_ms = %latency_ms,
            "Transaction cached"
        );
    }

    /// Another writer created the entry first
    pub fn log_persist_race(&self, signature: &str) {
        tracing::debug!(
            context_id = %self.context_id,
            signature = %signature,
            "Cache entry created concurrently, reading existing entry"
        );
    }

    pub fn log_failure(&self, signature: &str, error: &PipelineError) {
        tracing::warn!(
            context_id = %self.context_id,
            signature = %signature,
            category = %error.category(),
            retryable = %error.is_retryable(),
            error = %error,
            "Transaction pipeline failed"
        );
    }

    /// Forensic record of a damaged cache entry
    pub fn log_corruption(&self, signature: &str, path: &str, raw: &[u8], cause: &str) {
        tracing::error!(
            context_id = %self.context_id,
            signature = %signature,
            path = %path,
            byte_len = %raw.len(),
            raw = %String::from_utf8_lossy(raw),
            cause = %cause,
            "Corrupt cache entry"
        );
    }
}

impl Default for PipelineLogger {
    fn default() -> Self {
        Self::generate()
    }
}
