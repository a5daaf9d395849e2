//! Error taxonomy for the transaction pipeline
//!
//! Every anticipated failure is returned as a [`PipelineError`] value. Cache
//! corruption is deliberately not part of this enum: it travels through the
//! separate [`super::cache::CacheFault`] channel so callers cannot mistake a
//! damaged cache entry for an ordinary parse failure.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use thiserror::Error;

use super::source::{RawOuterInstruction, RawTokenBalance};

/// Which token balance list of the transaction meta is affected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BalanceList {
    Pre,
    Post,
}

impl fmt::Display for BalanceList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pre => write!(f, "pre"),
            Self::Post => write!(f, "post"),
        }
    }
}

/// Failure while flattening outer and inner instructions
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    /// Outer instructions are implicitly at depth 1 and must not report one
    #[error("outer instruction {outer_index} unexpectedly carries stack height {stack_height}")]
    OuterInstructionUnexpectedDepth {
        outer_index: usize,
        stack_height: u32,
        instruction: RawOuterInstruction,
    },

    /// Two inner instruction groups claim the same outer instruction
    #[error("inner instruction groups repeat outer index {repeated_index}")]
    RepeatedOuterIndexForInnerGroup { repeated_index: u8 },

    /// An inner instruction group points past the last outer instruction
    #[error("inner instruction group for outer index {index} has no outer instruction (outer count {outer_count})")]
    InnerGroupWithoutOuter { index: u8, outer_count: usize },

    /// Strict mode: an inner instruction's depth is missing or breaks the nesting rule
    #[error(
        "invalid stack height transition at outer {outer_index}, inner {inner_index}: {prior_stack_height} -> {}",
        .inner_stack_height.map_or_else(|| "none".to_string(), |h| h.to_string())
    )]
    InvalidDepthTransition {
        outer_index: usize,
        inner_index: usize,
        prior_stack_height: u32,
        inner_stack_height: Option<u32>,
    },
}

/// Failure while mapping token balance entries onto accounts
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconcileError {
    /// Several entries of one list resolve to the same token account
    ///
    /// `duplicates` holds every colliding entry (first occurrence included)
    /// keyed by the account's public key.
    #[error("duplicate token accounts in {balance_list} token balances: {}", duplicate_keys(.duplicates))]
    DuplicateTokenAccounts {
        balance_list: BalanceList,
        duplicates: BTreeMap<String, Vec<RawTokenBalance>>,
    },

    #[error("{balance_list} token balance references account index {account_index} but only {account_count} accounts were resolved")]
    TokenBalanceAccountOutOfRange {
        balance_list: BalanceList,
        account_index: u8,
        account_count: usize,
    },
}

fn duplicate_keys(duplicates: &BTreeMap<String, Vec<RawTokenBalance>>) -> String {
    duplicates.keys().cloned().collect::<Vec<_>>().join(", ")
}

/// Failure reported by an [`super::source::AccountResolver`]
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("message uses {lookups} address table lookup(s) but no loaded addresses were returned")]
    MissingLoadedAddresses { lookups: usize },

    #[error("account lookup failed: {0}")]
    Lookup(#[from] anyhow::Error),
}

/// Kind of a single schema violation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IssueKind {
    Required,
    UnrecognizedKey,
    InvalidType {
        expected: &'static str,
        received: &'static str,
    },
    OutOfRange {
        expected: &'static str,
    },
    InvalidLiteral {
        expected: &'static str,
    },
    InvalidLength {
        expected: usize,
        received: usize,
    },
    InvalidBase58,
    Empty,
    DuplicateKey {
        first_index: usize,
    },
    /// A tagged union object must carry exactly one variant key
    VariantCount {
        received: usize,
    },
}

impl fmt::Display for IssueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Required => write!(f, "required"),
            Self::UnrecognizedKey => write!(f, "unrecognized key"),
            Self::InvalidType { expected, received } => {
                write!(f, "expected {expected}, received {received}")
            }
            Self::OutOfRange { expected } => write!(f, "out of range, expected {expected}"),
            Self::InvalidLiteral { expected } => write!(f, "invalid literal, expected {expected}"),
            Self::InvalidLength { expected, received } => {
                write!(f, "expected {expected} element(s), received {received}")
            }
            Self::InvalidBase58 => write!(f, "not a valid base58 string"),
            Self::Empty => write!(f, "must not be empty"),
            Self::DuplicateKey { first_index } => {
                write!(f, "duplicate of element {first_index}")
            }
            Self::VariantCount { received } => {
                write!(f, "expected exactly one variant, received {received}")
            }
        }
    }
}

/// A schema violation at a specific location, e.g. `accounts[2].preBalance`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaIssue {
    pub path: String,
    pub kind: IssueKind,
}

impl fmt::Display for SchemaIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path = if self.path.is_empty() { "<root>" } else { &self.path };
        write!(f, "{path}: {}", self.kind)
    }
}

/// All violations found while validating one transaction shape
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("schema validation failed with {} issue(s): {}", .issues.len(), join_issues(.issues))]
pub struct SchemaError {
    pub issues: Vec<SchemaIssue>,
}

impl SchemaError {
    /// Whether any issue was reported at exactly `path`
    pub fn has_issue_at(&self, path: &str) -> bool {
        self.issues.iter().any(|issue| issue.path == path)
    }
}

fn join_issues(issues: &[SchemaIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Every anticipated way fetching and parsing a transaction can fail
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Requested signature is not usable as a cache key
    #[error("invalid transaction signature {signature:?}")]
    InvalidSignature { signature: String },

    /// The node returned no transaction for the signature
    #[error("no transaction returned for {signature}")]
    NullFetchResponse { signature: String },

    /// The fetch capability itself failed
    #[error("failed to fetch {signature}: {source}")]
    FetchFailure {
        signature: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    SchemaValidation(#[from] SchemaError),

    #[error("account resolution failed: {0}")]
    AccountResolutionFailure(#[from] ResolveError),

    #[error(transparent)]
    TokenBalances(#[from] ReconcileError),

    #[error(transparent)]
    Instructions(#[from] BuildError),

    /// The fetched transaction is not the one that was asked for
    #[error("requested {requested} but the fetched transaction's primary signature is {primary}")]
    SignatureMismatch { requested: String, primary: String },
}

impl PipelineError {
    /// Only transport failures may succeed on a later attempt; the pipeline
    /// itself never retries
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::FetchFailure { .. })
    }

    /// Stable label for metrics and logs
    pub fn category(&self) -> &'static str {
        match self {
            Self::InvalidSignature { .. } => "invalid_signature",
            Self::NullFetchResponse { .. } => "null_fetch_response",
            Self::FetchFailure { .. } => "fetch_failure",
            Self::SchemaValidation(_) => "schema_validation",
            Self::AccountResolutionFailure(_) => "account_resolution",
            Self::TokenBalances(ReconcileError::DuplicateTokenAccounts { .. }) => {
                "duplicate_token_accounts"
            }
            Self::TokenBalances(ReconcileError::TokenBalanceAccountOutOfRange { .. }) => {
                "token_balance_out_of_range"
            }
            Self::Instructions(BuildError::OuterInstructionUnexpectedDepth { .. }) => {
                "outer_instruction_unexpected_depth"
            }
            Self::Instructions(BuildError::RepeatedOuterIndexForInnerGroup { .. }) => {
                "repeated_outer_index"
            }
            Self::Instructions(BuildError::InnerGroupWithoutOuter { .. }) => {
                "inner_group_without_outer"
            }
            Self::Instructions(BuildError::InvalidDepthTransition { .. }) => {
                "invalid_depth_transition"
            }
            Self::SignatureMismatch { .. } => "signature_mismatch",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_error_display() {
        let err = SchemaError {
            issues: vec![
                SchemaIssue {
                    path: "accounts[0].preBalance".to_string(),
                    kind: IssueKind::Required,
                },
                SchemaIssue {
                    path: "slot".to_string(),
                    kind: IssueKind::InvalidType {
                        expected: "integer",
                        received: "string",
                    },
                },
            ],
        };
        assert_eq!(
            err.to_string(),
            "schema validation failed with 2 issue(s): accounts[0].preBalance: required; \
             slot: expected integer, received string"
        );
        assert!(err.has_issue_at("slot"));
        assert!(!err.has_issue_at("fee"));
    }

    #[test]
    fn test_depth_transition_display() {
        let err = BuildError::InvalidDepthTransition {
            outer_index: 1,
            inner_index: 0,
            prior_stack_height: 1,
            inner_stack_height: None,
        };
        assert_eq!(
            err.to_string(),
            "invalid stack height transition at outer 1, inner 0: 1 -> none"
        );
    }

    #[test]
    fn test_categories() {
        let err = PipelineError::NullFetchResponse {
            signature: "sig".to_string(),
        };
        assert_eq!(err.category(), "null_fetch_response");
        assert!(!err.is_retryable());

        let err = PipelineError::from(BuildError::RepeatedOuterIndexForInnerGroup {
            repeated_index: 3,
        });
        assert_eq!(err.category(), "repeated_outer_index");
        assert_eq!(err.to_string(), "inner instruction groups repeat outer index 3");

        let err = PipelineError::FetchFailure {
            signature: "sig".to_string(),
            source: anyhow::anyhow!("connection reset"),
        };
        assert!(err.is_retryable());
        assert_eq!(err.category(), "fetch_failure");
    }

    #[test]
    fn test_balance_list_display() {
        assert_eq!(BalanceList::Pre.to_string(), "pre");
        assert_eq!(BalanceList::Post.to_string(), "post");
    }
}
