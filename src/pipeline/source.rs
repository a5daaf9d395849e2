//! Upstream response model and the capabilities the pipeline consumes
//!
//! The pipeline never talks to the network itself. It is handed a
//! [`TransactionFetcher`] and an [`AccountResolver`], so tests can drive it
//! with in-memory fakes and production code can plug in the RPC client from
//! [`crate::rpc`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use solana_sdk::message::MessageHeader;

use super::codec::RawValue;
use super::errors::ResolveError;

/// Instruction data as delivered upstream
///
/// Compiled messages carry raw bytes while JSON encoded responses already
/// carry base58 text. Both normalize to base58 in the flattened sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InstructionData {
    Bytes(Vec<u8>),
    Base58(String),
}

impl InstructionData {
    /// Base58 form: bytes are encoded, text is passed through verbatim
    pub fn to_base58(&self) -> String {
        match self {
            Self::Bytes(bytes) => bs58::encode(bytes).into_string(),
            Self::Base58(text) => text.clone(),
        }
    }
}

/// Top-level instruction of a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawOuterInstruction {
    pub program_id_index: u8,
    pub accounts: Vec<u8>,
    pub data: InstructionData,
    /// Expected to be absent; outer instructions are implicitly depth 1
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_height: Option<u32>,
}

/// Instruction invoked while executing an outer instruction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawInnerInstruction {
    pub program_id_index: u8,
    pub accounts: Vec<u8>,
    pub data: InstructionData,
    #[serde(default)]
    pub stack_height: Option<u32>,
}

/// Inner instructions triggered by the outer instruction at `index`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawInnerInstructions {
    pub index: u8,
    pub instructions: Vec<RawInnerInstruction>,
}

/// One entry of a pre or post token balance list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTokenBalance {
    pub account_index: u8,
    pub mint: String,
    #[serde(default)]
    pub owner: Option<String>,
    /// Decimal string of the raw amount
    pub amount: String,
    pub decimals: u8,
}

impl RawTokenBalance {
    /// Loosely typed token balance shape for validation
    ///
    /// An amount that is not a decimal integer is kept as a string so the
    /// validator reports it instead of it being silently coerced.
    pub fn to_shape(&self) -> RawValue {
        let amount = match self.amount.parse::<num_bigint::BigUint>() {
            Ok(n) => RawValue::BigInt(n),
            Err(_) => RawValue::String(self.amount.clone()),
        };
        let mut fields = vec![
            ("mint", RawValue::from(self.mint.as_str())),
            ("amount", amount),
            ("decimals", RawValue::from(self.decimals)),
        ];
        if let Some(owner) = &self.owner {
            fields.push(("owner", RawValue::from(owner.as_str())));
        }
        RawValue::object(fields)
    }
}

/// Addresses loaded through address lookup tables
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadedAddresses {
    pub writable: Vec<String>,
    pub readonly: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawMessage {
    pub header: MessageHeader,
    /// Statically listed account keys
    pub account_keys: Vec<String>,
    pub recent_blockhash: String,
    pub instructions: Vec<RawOuterInstruction>,
    /// Number of address table lookups the message performs
    #[serde(default)]
    pub address_table_lookups: usize,
}

/// Execution metadata
///
/// Optional lists mirror what nodes actually omit; missing token balance and
/// inner instruction lists are treated as empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawMeta {
    #[serde(default)]
    pub err: Option<serde_json::Value>,
    pub fee: u64,
    pub pre_balances: Vec<u64>,
    pub post_balances: Vec<u64>,
    #[serde(default)]
    pub pre_token_balances: Option<Vec<RawTokenBalance>>,
    #[serde(default)]
    pub post_token_balances: Option<Vec<RawTokenBalance>>,
    #[serde(default)]
    pub log_messages: Option<Vec<String>>,
    #[serde(default)]
    pub inner_instructions: Option<Vec<RawInnerInstructions>>,
    #[serde(default)]
    pub loaded_addresses: Option<LoadedAddresses>,
    #[serde(default)]
    pub compute_units_consumed: Option<u64>,
}

/// A transaction as returned by the fetch capability, before any checks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTransactionResponse {
    pub slot: u64,
    #[serde(default)]
    pub block_time: Option<i64>,
    /// `"legacy"` or a version number, passed on to validation as-is
    #[serde(default)]
    pub version: Option<serde_json::Value>,
    pub signatures: Vec<String>,
    pub message: RawMessage,
    #[serde(default)]
    pub meta: Option<RawMeta>,
}

impl RawTransactionResponse {
    fn loaded_addresses(&self) -> Option<&LoadedAddresses> {
        self.meta.as_ref().and_then(|meta| meta.loaded_addresses.as_ref())
    }

    /// Whether the account at `index` of the resolved list signed the message
    pub fn is_account_signer(&self, index: usize) -> bool {
        index < self.message.header.num_required_signatures as usize
    }

    /// Whether the account at `index` of the resolved list was writable
    ///
    /// Static keys are ordered: writable signers, read-only signers, writable
    /// non-signers, read-only non-signers. Loaded addresses follow, writable
    /// before read-only.
    pub fn is_account_writable(&self, index: usize) -> bool {
        let header = &self.message.header;
        let static_count = self.message.account_keys.len();
        let signer_count = header.num_required_signatures as usize;

        if index < signer_count {
            return index < signer_count.saturating_sub(header.num_readonly_signed_accounts as usize);
        }
        if index < static_count {
            return index
                < static_count.saturating_sub(header.num_readonly_unsigned_accounts as usize);
        }
        let loaded_writable = self.loaded_addresses().map_or(0, |loaded| loaded.writable.len());
        index - static_count < loaded_writable
    }
}

/// Retrieves a transaction by signature
#[async_trait]
pub trait TransactionFetcher: Send + Sync {
    /// `Ok(None)` means the node has no transaction for this signature
    async fn fetch(
        &self,
        signature: &str,
        max_supported_version: u8,
    ) -> anyhow::Result<Option<RawTransactionResponse>>;
}

/// Produces the ordered account address list of a transaction
#[async_trait]
pub trait AccountResolver: Send + Sync {
    async fn resolve(&self, response: &RawTransactionResponse) -> Result<Vec<String>, ResolveError>;
}

#[async_trait]
impl<T: TransactionFetcher + ?Sized> TransactionFetcher for std::sync::Arc<T> {
    async fn fetch(
        &self,
        signature: &str,
        max_supported_version: u8,
    ) -> anyhow::Result<Option<RawTransactionResponse>> {
        (**self).fetch(signature, max_supported_version).await
    }
}

#[async_trait]
impl<T: AccountResolver + ?Sized> AccountResolver for std::sync::Arc<T> {
    async fn resolve(&self, response: &RawTransactionResponse) -> Result<Vec<String>, ResolveError> {
        (**self).resolve(response).await
    }
}

/// Resolver that relies on the loaded addresses reported in the meta
///
/// Order: static keys, then loaded writable, then loaded read-only.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadedAddressResolver;

impl LoadedAddressResolver {
    pub fn resolve_now(response: &RawTransactionResponse) -> Result<Vec<String>, ResolveError> {
        let mut keys = response.message.account_keys.clone();
        match response.loaded_addresses() {
            Some(loaded) => {
                keys.extend(loaded.writable.iter().cloned());
                keys.extend(loaded.readonly.iter().cloned());
            }
            None if response.message.address_table_lookups > 0 => {
                return Err(ResolveError::MissingLoadedAddresses {
                    lookups: response.message.address_table_lookups,
                });
            }
            None => {}
        }
        Ok(keys)
    }
}

#[async_trait]
impl AccountResolver for LoadedAddressResolver {
    async fn resolve(&self, response: &RawTransactionResponse) -> Result<Vec<String>, ResolveError> {
        Self::resolve_now(response)
    }
}
