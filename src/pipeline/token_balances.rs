//! Token balance reconciliation
//!
//! Nodes report token balances as lists keyed by account index. The pipeline
//! attaches them to accounts by public key, so an index must resolve inside
//! the account list and no two entries of the same list may land on the same
//! token account.

use std::collections::BTreeMap;

use super::errors::{BalanceList, ReconcileError};
use super::source::RawTokenBalance;

/// Map one token balance list onto the resolved account keys
///
/// Returns the entry for each token account keyed by public key. On
/// collision the error carries every colliding entry, including the first
/// occurrence, for every affected account.
pub fn reconcile_token_balances(
    balance_list: BalanceList,
    entries: &[RawTokenBalance],
    accounts: &[String],
) -> Result<BTreeMap<String, RawTokenBalance>, ReconcileError> {
    let mut parsed: BTreeMap<String, RawTokenBalance> = BTreeMap::new();
    let mut duplicates: BTreeMap<String, Vec<RawTokenBalance>> = BTreeMap::new();

    for entry in entries {
        let pubkey = accounts
            .get(usize::from(entry.account_index))
            .ok_or_else(|| ReconcileError::TokenBalanceAccountOutOfRange {
                balance_list,
                account_index: entry.account_index,
                account_count: accounts.len(),
            })?;

        if let Some(previous) = parsed.insert(pubkey.clone(), entry.clone()) {
            duplicates
                .entry(pubkey.clone())
                .or_insert_with(|| vec![previous])
                .push(entry.clone());
        }
    }

    if !duplicates.is_empty() {
        tracing::debug!(
            balance_list = %balance_list,
            accounts = duplicates.len(),
            "Duplicate token accounts"
        );
        return Err(ReconcileError::DuplicateTokenAccounts {
            balance_list,
            duplicates,
        });
    }
    Ok(parsed)
}
