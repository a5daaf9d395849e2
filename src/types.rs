//! Canonical transaction entities
//!
//! Values of these types are only produced by the schema validator, either
//! from a freshly fetched response or from a decoded cache entry. They are
//! never mutated after construction.
//!
//! Serialization follows the cache text layout: camelCase keys, optional
//! fields omitted when absent, and every arbitrary-precision integer rendered
//! through [`crate::pipeline::codec::serialize_big`]. Free text that looks
//! like a big integer marker is escaped through
//! [`crate::pipeline::codec::escape_text`].

use num_bigint::BigUint;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

use crate::pipeline::codec::{escape_text, serialize_big, serialize_texts};

/// A fully parsed and validated transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    /// Seconds since the Unix epoch
    pub block_time: i64,

    /// Ledger position
    pub slot: u64,

    pub recent_blockhash: String,

    #[serde(serialize_with = "serialize_big")]
    pub compute_units_consumed: BigUint,

    /// Execution failure, absent for successful transactions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub err: Option<TransactionError>,

    /// Fee in lamports
    #[serde(serialize_with = "serialize_big")]
    pub fee: BigUint,

    /// Signatures in message order, the first one identifies the transaction
    pub signatures: Vec<String>,

    pub version: TransactionVersion,

    #[serde(serialize_with = "serialize_texts")]
    pub log_messages: Vec<String>,

    /// Index-aligned with the resolved account address list
    pub accounts: Vec<Account>,

    /// Flattened call sequence, each outer instruction followed by its inner ones
    pub instructions: Vec<Instruction>,
}

impl Transaction {
    /// Primary signature, used as the cache key
    pub fn signature(&self) -> &str {
        self.signatures.first().map(String::as_str).unwrap_or_default()
    }

    /// Look up an account by public key
    pub fn account(&self, pubkey: &str) -> Option<&Account> {
        self.accounts.iter().find(|account| account.pubkey == pubkey)
    }

    /// The fee payer is always the first account of the message
    pub fn fee_payer(&self) -> Option<&Account> {
        self.accounts.first()
    }

    /// Top-level instructions only (stack height 1)
    pub fn outer_instructions(&self) -> impl Iterator<Item = &Instruction> {
        self.instructions.iter().filter(|ix| ix.is_outer())
    }

    pub fn succeeded(&self) -> bool {
        self.err.is_none()
    }
}

/// Per-account snapshot of a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub pubkey: String,
    pub is_signer: bool,
    pub is_writeable: bool,

    /// Lamport balance before execution
    #[serde(serialize_with = "serialize_big")]
    pub pre_balance: BigUint,

    /// Lamport balance after execution
    #[serde(serialize_with = "serialize_big")]
    pub post_balance: BigUint,

    /// Present when the account was a token account before execution
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pre_token_balance: Option<TokenBalance>,

    /// Present when the account was a token account after execution
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_token_balance: Option<TokenBalance>,
}

/// Token holdings of a single token account
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenBalance {
    pub mint: String,
    pub owner: String,

    /// Raw amount in the mint's smallest unit
    #[serde(serialize_with = "serialize_big")]
    pub amount: BigUint,

    pub decimals: u8,
}

/// One entry of the flattened instruction sequence
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Instruction {
    /// 1 for outer instructions, the reported invocation depth for inner
    /// ones. Older ledger history does not report inner depths, those are
    /// written as `null`.
    pub stack_height: Option<u32>,

    /// Index into the transaction's account list
    pub program_id_index: u8,

    /// Base58 encoded instruction data
    pub data: String,

    /// Indices into the transaction's account list
    pub accounts: Vec<u8>,
}

impl Instruction {
    #[inline]
    pub fn is_outer(&self) -> bool {
        self.stack_height == Some(1)
    }
}

/// Message version of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionVersion {
    Legacy,
    V0,
}

impl Serialize for TransactionVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Legacy => serializer.serialize_str("legacy"),
            Self::V0 => serializer.serialize_u8(0),
        }
    }
}

/// Execution failure recorded for a transaction
///
/// Serialized in the chain's externally tagged layout, e.g.
/// `{"InstructionError":[2,{"Custom":6001}]}` or
/// `{"InsufficientFundsForRent":{"account_index":4}}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    /// An instruction failed while executing
    InstructionError {
        index: u8,
        cause: InstructionErrorCause,
    },
    /// An account would have been left below the rent-exempt minimum
    InsufficientFundsForRent { account_index: u8 },
}

/// Why an instruction failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstructionErrorCause {
    /// A built-in failure such as `"InvalidAccountData"`
    Named(String),
    /// A program-defined error code
    Custom(u32),
}

impl Serialize for InstructionErrorCause {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Named(name) => serializer.serialize_str(&escape_text(name)),
            Self::Custom(code) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("Custom", code)?;
                map.end()
            }
        }
    }
}

#[derive(Serialize)]
struct RentAccount {
    account_index: u8,
}

impl Serialize for TransactionError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        match self {
            Self::InstructionError { index, cause } => {
                map.serialize_entry("InstructionError", &(index, cause))?;
            }
            Self::InsufficientFundsForRent { account_index } => {
                map.serialize_entry(
                    "InsufficientFundsForRent",
                    &RentAccount {
                        account_index: *account_index,
                    },
                )?;
            }
        }
        map.end()
    }
}
