//! Ledger transaction cache
//!
//! Fetches raw transactions by signature, flattens and reconciles them into a
//! strictly validated canonical form, and keeps a write-once on-disk cache of
//! the result with lossless big integer encoding.

pub mod config;
pub mod metrics;
pub mod pipeline;
pub mod rpc;
pub mod structured_logging;
pub mod types;

// Re-export commonly used types
pub use pipeline::{CacheFault, Pipeline, PipelineError, TransactionCache};
pub use types::{Account, Instruction, TokenBalance, Transaction};
