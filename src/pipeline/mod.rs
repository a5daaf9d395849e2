//! Transaction parsing, reconciliation and caching pipeline
//!
//! Control flow for one signature:
//!
//! ```text
//! cache lookup ── hit ──> decode -> validate -> return
//!      │
//!     miss -> fetch -> resolve accounts -> reconcile token balances
//!          -> flatten instructions -> validate -> persist -> return
//! ```
//!
//! Ordinary failures come back as [`PipelineError`] in the inner result.
//! A damaged cache entry or a storage failure comes back as [`CacheFault`]
//! in the outer result.

pub mod cache;
pub mod codec;
pub mod errors;
pub mod instructions;
pub mod parse;
pub mod source;
pub mod token_balances;
pub mod validator;

use std::sync::Arc;

pub use cache::{CacheFault, CorruptionCause, TransactionCache};
pub use codec::{deserialize, serialize, RawValue};
pub use errors::{
    BalanceList, BuildError, IssueKind, PipelineError, ReconcileError, ResolveError, SchemaError,
    SchemaIssue,
};
pub use instructions::{InstructionTreeBuilder, StackHeightCheck};
pub use parse::{assemble, parse_transaction, ParseOptions};
pub use source::{
    AccountResolver, InstructionData, LoadedAddressResolver, RawTransactionResponse,
    TransactionFetcher,
};
pub use token_balances::reconcile_token_balances;
pub use validator::validate;

use crate::metrics::{PipelineMetrics, Timer};
use crate::structured_logging::PipelineLogger;
use crate::types::Transaction;

/// Cache-backed transaction pipeline over injected fetch and resolve capabilities
pub struct Pipeline<F, R> {
    cache: TransactionCache,
    fetcher: F,
    resolver: R,
    options: ParseOptions,
    metrics: Option<Arc<PipelineMetrics>>,
    logger: PipelineLogger,
}

impl<F, R> Pipeline<F, R>
where
    F: TransactionFetcher,
    R: AccountResolver,
{
    pub fn new(cache: TransactionCache, fetcher: F, resolver: R, options: ParseOptions) -> Self {
        Self {
            cache,
            fetcher,
            resolver,
            options,
            metrics: None,
            logger: PipelineLogger::default(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_logger(mut self, logger: PipelineLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn cache(&self) -> &TransactionCache {
        &self.cache
    }

    pub fn options(&self) -> &ParseOptions {
        &self.options
    }

    /// Return the transaction for `signature`, from the cache when present
    pub async fn get_transaction(
        &self,
        signature: &str,
    ) -> Result<Result<Transaction, PipelineError>, CacheFault> {
        let result = self
            .cache
            .get(signature, || self.fetch_and_parse(signature))
            .await?;

        if let Err(err) = &result {
            self.logger.log_failure(signature, err);
            if let Some(metrics) = &self.metrics {
                metrics.record_failure(err);
            }
        }
        Ok(result)
    }

    /// Fetch and parse without consulting or filling the cache
    pub async fn fetch_and_parse(&self, signature: &str) -> Result<Transaction, PipelineError> {
        let max_version = self.options.max_supported_transaction_version;
        self.logger.log_fetch(signature, max_version);
        if let Some(metrics) = &self.metrics {
            metrics.fetches.inc();
        }

        let timer = Timer::start();
        let response = self
            .fetcher
            .fetch(signature, max_version)
            .await
            .map_err(|source| PipelineError::FetchFailure {
                signature: signature.to_string(),
                source,
            })?
            .ok_or_else(|| PipelineError::NullFetchResponse {
                signature: signature.to_string(),
            })?;

        let result = parse_transaction(&response, &self.resolver, &self.options).await;
        if let Some(metrics) = &self.metrics {
            timer.observe_duration(&metrics.parse_latency);
        }
        result
    }
}
