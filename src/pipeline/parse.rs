//! Fresh transaction assembly
//!
//! Turns a fetched response into a [`Transaction`]: resolve accounts,
//! reconcile both token balance lists, zip accounts with their flags and
//! balances, flatten instructions, then run the complete shape through the
//! validator. Only the resolve step suspends.

use std::collections::BTreeMap;

use num_bigint::BigUint;

use super::codec::RawValue;
use super::errors::{BalanceList, PipelineError};
use super::instructions::{InstructionTreeBuilder, StackHeightCheck};
use super::source::{AccountResolver, RawMeta, RawTokenBalance, RawTransactionResponse};
use super::token_balances::reconcile_token_balances;
use super::validator;
use crate::types::{Instruction, Transaction};

/// Knobs for fetching and parsing fresh transactions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseOptions {
    pub stack_height_check: StackHeightCheck,
    /// Highest message version requested from the fetcher
    pub max_supported_transaction_version: u8,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            stack_height_check: StackHeightCheck::Relaxed,
            max_supported_transaction_version: 0,
        }
    }
}

/// Resolve accounts for `response` and assemble the canonical transaction
pub async fn parse_transaction<R>(
    response: &RawTransactionResponse,
    resolver: &R,
    options: &ParseOptions,
) -> Result<Transaction, PipelineError>
where
    R: AccountResolver + ?Sized,
{
    let accounts = resolver.resolve(response).await?;
    assemble(response, &accounts, options)
}

/// Assemble and validate a transaction from a response and its resolved accounts
pub fn assemble(
    response: &RawTransactionResponse,
    accounts: &[String],
    options: &ParseOptions,
) -> Result<Transaction, PipelineError> {
    let empty = RawMeta::default();
    let meta = response.meta.as_ref();
    let meta_or_empty = meta.unwrap_or(&empty);

    let pre_tokens = reconcile_token_balances(
        BalanceList::Pre,
        meta_or_empty.pre_token_balances.as_deref().unwrap_or_default(),
        accounts,
    )?;
    let post_tokens = reconcile_token_balances(
        BalanceList::Post,
        meta_or_empty.post_token_balances.as_deref().unwrap_or_default(),
        accounts,
    )?;

    let account_shapes = accounts
        .iter()
        .enumerate()
        .map(|(index, pubkey)| {
            account_shape(response, meta_or_empty, index, pubkey, &pre_tokens, &post_tokens)
        })
        .collect();

    let instructions = InstructionTreeBuilder::new(options.stack_height_check).build(
        &response.message.instructions,
        meta_or_empty.inner_instructions.as_deref().unwrap_or_default(),
    )?;

    let mut fields = vec![
        ("blockTime", response.block_time.map_or(RawValue::Null, RawValue::from)),
        ("slot", RawValue::from(response.slot)),
        ("recentBlockhash", RawValue::from(response.message.recent_blockhash.as_str())),
        ("signatures", RawValue::from(response.signatures.clone())),
        ("accounts", RawValue::Array(account_shapes)),
        (
            "instructions",
            RawValue::Array(instructions.iter().map(instruction_shape).collect()),
        ),
    ];
    if let Some(version) = &response.version {
        fields.push(("version", RawValue::from_json(version.clone())));
    }
    // Fields the node did not report stay absent so validation names them
    if let Some(meta) = meta {
        fields.push(("fee", RawValue::from(BigUint::from(meta.fee))));
        if let Some(units) = meta.compute_units_consumed {
            fields.push(("computeUnitsConsumed", RawValue::from(BigUint::from(units))));
        }
        if let Some(logs) = &meta.log_messages {
            fields.push(("logMessages", RawValue::from(logs.clone())));
        }
        if let Some(err) = meta.err.as_ref().filter(|err| !err.is_null()) {
            fields.push(("err", RawValue::from_json(err.clone())));
        }
    }

    Ok(validator::validate(&RawValue::object(fields))?)
}

fn account_shape(
    response: &RawTransactionResponse,
    meta: &RawMeta,
    index: usize,
    pubkey: &str,
    pre_tokens: &BTreeMap<String, RawTokenBalance>,
    post_tokens: &BTreeMap<String, RawTokenBalance>,
) -> RawValue {
    let mut fields = vec![
        ("pubkey", RawValue::from(pubkey)),
        ("isSigner", RawValue::from(response.is_account_signer(index))),
        ("isWriteable", RawValue::from(response.is_account_writable(index))),
    ];
    if let Some(&lamports) = meta.pre_balances.get(index) {
        fields.push(("preBalance", RawValue::from(BigUint::from(lamports))));
    }
    if let Some(&lamports) = meta.post_balances.get(index) {
        fields.push(("postBalance", RawValue::from(BigUint::from(lamports))));
    }
    if let Some(balance) = pre_tokens.get(pubkey) {
        fields.push(("preTokenBalance", balance.to_shape()));
    }
    if let Some(balance) = post_tokens.get(pubkey) {
        fields.push(("postTokenBalance", balance.to_shape()));
    }
    RawValue::object(fields)
}

fn instruction_shape(instruction: &Instruction) -> RawValue {
    RawValue::object([
        ("stackHeight", RawValue::from(instruction.stack_height)),
        ("programIdIndex", RawValue::from(instruction.program_id_index)),
        ("data", RawValue::from(instruction.data.as_str())),
        ("accounts", RawValue::from(instruction.accounts.clone())),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::errors::{BuildError, ReconcileError, ResolveError};
    use crate::pipeline::source::{
        InstructionData, LoadedAddressResolver, LoadedAddresses, RawInnerInstruction,
        RawInnerInstructions, RawMessage, RawOuterInstruction,
    };
    use crate::types::{InstructionErrorCause, TransactionError, TransactionVersion};
    use serde_json::json;
    use solana_sdk::message::MessageHeader;

    fn key(n: u8) -> String {
        bs58::encode([n; 32]).into_string()
    }

    fn token(account_index: u8, amount: &str) -> RawTokenBalance {
        RawTokenBalance {
            account_index,
            mint: key(50),
            owner: Some(key(0)),
            amount: amount.to_string(),
            decimals: 6,
        }
    }

    fn response() -> RawTransactionResponse {
        RawTransactionResponse {
            slot: 42,
            block_time: Some(1_700_000_000),
            version: Some(json!(0)),
            signatures: vec![bs58::encode([7u8; 64]).into_string()],
            message: RawMessage {
                header: MessageHeader {
                    num_required_signatures: 1,
                    num_readonly_signed_accounts: 0,
                    num_readonly_unsigned_accounts: 1,
                },
                account_keys: vec![key(0), key(1), key(2)],
                recent_blockhash: key(99),
                instructions: vec![RawOuterInstruction {
                    program_id_index: 2,
                    accounts: vec![0, 1],
                    data: InstructionData::Bytes(vec![3, 4]),
                    stack_height: None,
                }],
                address_table_lookups: 1,
            },
            meta: Some(RawMeta {
                err: None,
                fee: 5000,
                pre_balances: vec![10_000, 2_039_280, 1, 0],
                post_balances: vec![5_000, 2_039_280, 1, 0],
                pre_token_balances: Some(vec![token(1, "100")]),
                post_token_balances: Some(vec![token(1, "250"), token(3, "18446744073709551616")]),
                log_messages: Some(vec!["Program log: ok".to_string()]),
                inner_instructions: Some(vec![RawInnerInstructions {
                    index: 0,
                    instructions: vec![RawInnerInstruction {
                        program_id_index: 2,
                        accounts: vec![1],
                        data: InstructionData::Base58("3Bxs".to_string()),
                        stack_height: Some(2),
                    }],
                }]),
                loaded_addresses: Some(LoadedAddresses {
                    writable: vec![key(3)],
                    readonly: vec![],
                }),
                compute_units_consumed: Some(1_234),
            }),
        }
    }

    #[tokio::test]
    async fn test_parse_full_transaction() {
        let tx = parse_transaction(&response(), &LoadedAddressResolver, &ParseOptions::default())
            .await
            .unwrap();

        assert_eq!(tx.slot, 42);
        assert_eq!(tx.version, TransactionVersion::V0);
        assert_eq!(tx.compute_units_consumed, BigUint::from(1_234u32));
        assert_eq!(tx.accounts.len(), 4);

        let flags: Vec<(bool, bool)> =
            tx.accounts.iter().map(|a| (a.is_signer, a.is_writeable)).collect();
        assert_eq!(flags, vec![(true, true), (false, true), (false, false), (false, true)]);

        let token_account = &tx.accounts[1];
        assert_eq!(
            token_account.pre_token_balance.as_ref().unwrap().amount,
            BigUint::from(100u32)
        );
        assert_eq!(
            token_account.post_token_balance.as_ref().unwrap().amount,
            BigUint::from(250u32)
        );
        assert!(tx.accounts[0].pre_token_balance.is_none());
        assert_eq!(
            tx.accounts[3].post_token_balance.as_ref().unwrap().amount,
            BigUint::from(u64::MAX) + 1u32
        );

        assert_eq!(tx.instructions.len(), 2);
        assert_eq!(tx.instructions[0].data, bs58::encode([3u8, 4]).into_string());
        assert_eq!(tx.instructions[1].data, "3Bxs");
        assert_eq!(tx.instructions[1].stack_height, Some(2));
    }

    #[test]
    fn test_execution_error_is_carried() {
        let mut raw = response();
        raw.meta.as_mut().unwrap().err = Some(json!({"InstructionError": [0, {"Custom": 1}]}));
        let accounts = LoadedAddressResolver::resolve_now(&raw).unwrap();

        let tx = assemble(&raw, &accounts, &ParseOptions::default()).unwrap();
        assert_eq!(
            tx.err,
            Some(TransactionError::InstructionError {
                index: 0,
                cause: InstructionErrorCause::Custom(1),
            })
        );
        assert!(!tx.succeeded());
    }

    #[test]
    fn test_duplicate_post_token_accounts() {
        let mut raw = response();
        raw.meta.as_mut().unwrap().post_token_balances =
            Some(vec![token(1, "1"), token(1, "2")]);
        let accounts = LoadedAddressResolver::resolve_now(&raw).unwrap();

        let err = assemble(&raw, &accounts, &ParseOptions::default()).unwrap_err();
        match err {
            PipelineError::TokenBalances(ReconcileError::DuplicateTokenAccounts {
                balance_list,
                duplicates,
            }) => {
                assert_eq!(balance_list, BalanceList::Post);
                assert_eq!(duplicates[&key(1)].len(), 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_missing_meta_fields_fail_validation() {
        let mut raw = response();
        raw.meta = None;
        raw.version = None;
        raw.message.address_table_lookups = 0;
        let accounts = LoadedAddressResolver::resolve_now(&raw).unwrap();

        let err = assemble(&raw, &accounts, &ParseOptions::default()).unwrap_err();
        let PipelineError::SchemaValidation(schema) = err else {
            panic!("expected schema validation failure");
        };
        for path in ["fee", "computeUnitsConsumed", "logMessages", "version", "accounts[0].preBalance"] {
            assert!(schema.has_issue_at(path), "missing issue at {path}");
        }
    }

    #[test]
    fn test_strict_mode_is_applied() {
        let mut raw = response();
        let meta = raw.meta.as_mut().unwrap();
        meta.inner_instructions.as_mut().unwrap()[0].instructions[0].stack_height = Some(3);
        let accounts = LoadedAddressResolver::resolve_now(&raw).unwrap();

        assert!(assemble(&raw, &accounts, &ParseOptions::default()).is_ok());
        let strict = ParseOptions {
            stack_height_check: StackHeightCheck::Strict,
            ..ParseOptions::default()
        };
        assert!(matches!(
            assemble(&raw, &accounts, &strict),
            Err(PipelineError::Instructions(BuildError::InvalidDepthTransition { .. }))
        ));
    }

    #[test]
    fn test_unreported_inner_depth_parses_in_relaxed_mode() {
        let mut raw = response();
        let meta = raw.meta.as_mut().unwrap();
        meta.inner_instructions.as_mut().unwrap()[0].instructions[0].stack_height = None;
        let accounts = LoadedAddressResolver::resolve_now(&raw).unwrap();

        let tx = assemble(&raw, &accounts, &ParseOptions::default()).unwrap();
        assert_eq!(tx.instructions[0].stack_height, Some(1));
        assert_eq!(tx.instructions[1].stack_height, None);
        assert_eq!(tx.outer_instructions().count(), 1);

        let strict = ParseOptions {
            stack_height_check: StackHeightCheck::Strict,
            ..ParseOptions::default()
        };
        assert!(matches!(
            assemble(&raw, &accounts, &strict),
            Err(PipelineError::Instructions(BuildError::InvalidDepthTransition {
                inner_stack_height: None,
                ..
            }))
        ));
    }

    #[tokio::test]
    async fn test_resolver_failure() {
        let mut raw = response();
        raw.meta.as_mut().unwrap().loaded_addresses = None;
        let err = parse_transaction(&raw, &LoadedAddressResolver, &ParseOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::AccountResolutionFailure(ResolveError::MissingLoadedAddresses { lookups: 1 })
        ));
    }
}
