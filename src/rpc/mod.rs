//! JSON-RPC transaction fetcher
//!
//! Implements [`TransactionFetcher`] on top of the nonblocking
//! `solana-client` RPC client. The response is requested in the `json`
//! encoding so instructions keep their compiled account indices.

pub mod mapper;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::json;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_config::RpcTransactionConfig;
use solana_client::rpc_request::RpcRequest;
use solana_sdk::commitment_config::CommitmentConfig;
use solana_transaction_status::{EncodedConfirmedTransactionWithStatusMeta, UiTransactionEncoding};

use crate::config::RpcConfig;
use crate::pipeline::source::{RawTransactionResponse, TransactionFetcher};

pub use mapper::map_confirmed_transaction;

pub struct RpcTransactionFetcher {
    client: Arc<RpcClient>,
    commitment: CommitmentConfig,
}

impl RpcTransactionFetcher {
    pub fn new(url: String, timeout: Duration) -> Self {
        Self::from_client(Arc::new(RpcClient::new_with_timeout(url, timeout)))
    }

    pub fn from_config(config: &RpcConfig) -> Self {
        Self::new(config.url.clone(), Duration::from_secs(config.timeout_secs))
    }

    /// Share an existing client; commitment defaults to `confirmed`
    pub fn from_client(client: Arc<RpcClient>) -> Self {
        Self {
            client,
            commitment: CommitmentConfig::confirmed(),
        }
    }

    pub fn with_commitment(mut self, commitment: CommitmentConfig) -> Self {
        self.commitment = commitment;
        self
    }

    fn request_config(&self, max_supported_version: u8) -> RpcTransactionConfig {
        RpcTransactionConfig {
            encoding: Some(UiTransactionEncoding::Json),
            commitment: Some(self.commitment),
            max_supported_transaction_version: Some(max_supported_version),
        }
    }
}

#[async_trait]
impl TransactionFetcher for RpcTransactionFetcher {
    async fn fetch(
        &self,
        signature: &str,
        max_supported_version: u8,
    ) -> anyhow::Result<Option<RawTransactionResponse>> {
        // `getTransaction` answers null for unknown signatures, which the
        // typed client helper would report as a decode error
        let response: Option<EncodedConfirmedTransactionWithStatusMeta> = self
            .client
            .send(
                RpcRequest::GetTransaction,
                json!([signature, self.request_config(max_supported_version)]),
            )
            .await
            .with_context(|| format!("getTransaction failed for {signature}"))?;

        response
            .map(map_confirmed_transaction)
            .transpose()
            .with_context(|| format!("Unsupported getTransaction response for {signature}"))
    }
}
