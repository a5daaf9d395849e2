//! Shared fixtures and in-memory fakes for integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use solana_sdk::message::MessageHeader;

use ledger_tx_cache::pipeline::source::{
    InstructionData, LoadedAddresses, RawInnerInstruction, RawInnerInstructions, RawMessage,
    RawMeta, RawOuterInstruction, RawTokenBalance, RawTransactionResponse, TransactionFetcher,
};

pub fn key(seed: u8, n: u8) -> String {
    let mut bytes = [n; 32];
    bytes[0] = seed;
    bs58::encode(bytes).into_string()
}

pub fn sig(seed: u8) -> String {
    bs58::encode([seed; 64]).into_string()
}

pub fn token(account_index: u8, mint: &str, owner: &str, amount: &str) -> RawTokenBalance {
    RawTokenBalance {
        account_index,
        mint: mint.to_string(),
        owner: Some(owner.to_string()),
        amount: amount.to_string(),
        decimals: 9,
    }
}

/// A v0 transfer-like transaction: payer, token account, program, one
/// loaded writable address, one outer instruction with a two-level CPI
pub fn sample_response(seed: u8) -> RawTransactionResponse {
    let payer = key(seed, 1);
    let mint = key(seed, 200);
    RawTransactionResponse {
        slot: 250_000_000 + u64::from(seed),
        block_time: Some(1_700_000_000 + i64::from(seed)),
        version: Some(json!(0)),
        signatures: vec![sig(seed)],
        message: RawMessage {
            header: MessageHeader {
                num_required_signatures: 1,
                num_readonly_signed_accounts: 0,
                num_readonly_unsigned_accounts: 1,
            },
            account_keys: vec![payer.clone(), key(seed, 2), key(seed, 3)],
            recent_blockhash: key(seed, 99),
            instructions: vec![RawOuterInstruction {
                program_id_index: 2,
                accounts: vec![0, 1, 3],
                data: InstructionData::Bytes(vec![3, 0, 202, 154, 59, 0, 0, 0, 0]),
                stack_height: None,
            }],
            address_table_lookups: 1,
        },
        meta: Some(RawMeta {
            err: None,
            fee: 5_000,
            pre_balances: vec![1_000_000_000, 2_039_280, 1, 2_039_280],
            post_balances: vec![999_995_000, 2_039_280, 1, 2_039_280],
            pre_token_balances: Some(vec![
                token(1, &mint, &payer, "18446744073709551616000"),
                token(3, &mint, &key(seed, 4), "0"),
            ]),
            post_token_balances: Some(vec![
                token(1, &mint, &payer, "18446744073709551615000"),
                token(3, &mint, &key(seed, 4), "1000"),
            ]),
            log_messages: Some(vec![
                "Program log: Instruction: Transfer".to_string(),
                "Program consumed 4512 of 200000 compute units".to_string(),
            ]),
            inner_instructions: Some(vec![RawInnerInstructions {
                index: 0,
                instructions: vec![
                    RawInnerInstruction {
                        program_id_index: 2,
                        accounts: vec![1, 3],
                        data: InstructionData::Base58("3Bxs4h24hBtQy9rw".to_string()),
                        stack_height: Some(2),
                    },
                    RawInnerInstruction {
                        program_id_index: 2,
                        accounts: vec![3],
                        data: InstructionData::Base58("6".to_string()),
                        stack_height: Some(3),
                    },
                ],
            }]),
            loaded_addresses: Some(LoadedAddresses {
                writable: vec![key(seed, 5)],
                readonly: vec![],
            }),
            compute_units_consumed: Some(4_512),
        }),
    }
}

enum Canned {
    Found(RawTransactionResponse),
    Fail(String),
}

/// Fetcher serving canned responses and counting invocations
#[derive(Default)]
pub struct FakeFetcher {
    responses: HashMap<String, Canned>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl FakeFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `response` under its primary signature
    pub fn with_response(self, response: RawTransactionResponse) -> Self {
        let signature = response.signatures[0].clone();
        self.with_response_for(&signature, response)
    }

    /// Serve `response` under an arbitrary signature
    pub fn with_response_for(mut self, signature: &str, response: RawTransactionResponse) -> Self {
        self.responses
            .insert(signature.to_string(), Canned::Found(response));
        self
    }

    pub fn with_failure(mut self, signature: &str, message: &str) -> Self {
        self.responses
            .insert(signature.to_string(), Canned::Fail(message.to_string()));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransactionFetcher for FakeFetcher {
    async fn fetch(
        &self,
        signature: &str,
        _max_supported_version: u8,
    ) -> anyhow::Result<Option<RawTransactionResponse>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match self.responses.get(signature) {
            Some(Canned::Found(response)) => Ok(Some(response.clone())),
            Some(Canned::Fail(message)) => Err(anyhow::anyhow!(message.clone())),
            None => Ok(None),
        }
    }
}
