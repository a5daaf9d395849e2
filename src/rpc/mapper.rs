//! Conversion from node JSON responses into the raw response model

use anyhow::{bail, Context, Result};
use solana_transaction_status::{
    option_serializer::OptionSerializer, EncodedConfirmedTransactionWithStatusMeta,
    EncodedTransaction, UiInnerInstructions, UiInstruction, UiMessage, UiTransactionStatusMeta,
    UiTransactionTokenBalance,
};

use crate::pipeline::source::{
    InstructionData, LoadedAddresses, RawInnerInstruction, RawInnerInstructions, RawMessage,
    RawMeta, RawOuterInstruction, RawTokenBalance, RawTransactionResponse,
};

fn present<T>(value: &OptionSerializer<T>) -> Option<&T> {
    match value {
        OptionSerializer::Some(inner) => Some(inner),
        _ => None,
    }
}

/// Map a `json` encoded `getTransaction` result
///
/// Only raw (non `jsonParsed`) messages are accepted: the pipeline needs
/// compiled instructions with account indices.
pub fn map_confirmed_transaction(
    confirmed: EncodedConfirmedTransactionWithStatusMeta,
) -> Result<RawTransactionResponse> {
    let with_meta = confirmed.transaction;
    let EncodedTransaction::Json(ui_tx) = with_meta.transaction else {
        bail!("Only JSON encoded transactions are supported");
    };
    let UiMessage::Raw(msg) = ui_tx.message else {
        bail!("Parsed messages are not supported, request the json encoding");
    };

    let instructions = msg
        .instructions
        .into_iter()
        .map(|ix| RawOuterInstruction {
            program_id_index: ix.program_id_index,
            accounts: ix.accounts,
            data: InstructionData::Base58(ix.data),
            stack_height: ix.stack_height,
        })
        .collect();

    let message = RawMessage {
        header: msg.header,
        account_keys: msg.account_keys,
        recent_blockhash: msg.recent_blockhash,
        instructions,
        address_table_lookups: msg.address_table_lookups.as_ref().map_or(0, Vec::len),
    };

    let meta = with_meta.meta.map(convert_meta).transpose()?;
    let version = with_meta
        .version
        .map(serde_json::to_value)
        .transpose()
        .context("Failed to encode transaction version")?;

    Ok(RawTransactionResponse {
        slot: confirmed.slot,
        block_time: confirmed.block_time,
        version,
        signatures: ui_tx.signatures,
        message,
        meta,
    })
}

fn convert_meta(meta: UiTransactionStatusMeta) -> Result<RawMeta> {
    let err = match &meta.err {
        Some(err) => Some(serde_json::to_value(err).context("Failed to encode execution error")?),
        None => None,
    };

    let inner_instructions = present(&meta.inner_instructions)
        .map(|groups| groups.iter().map(convert_inner_group).collect::<Result<Vec<_>>>())
        .transpose()?;

    Ok(RawMeta {
        err,
        fee: meta.fee,
        pre_balances: meta.pre_balances,
        post_balances: meta.post_balances,
        pre_token_balances: present(&meta.pre_token_balances).map(|b| convert_token_balances(b)),
        post_token_balances: present(&meta.post_token_balances).map(|b| convert_token_balances(b)),
        log_messages: present(&meta.log_messages).cloned(),
        inner_instructions,
        loaded_addresses: present(&meta.loaded_addresses).map(|loaded| LoadedAddresses {
            writable: loaded.writable.clone(),
            readonly: loaded.readonly.clone(),
        }),
        compute_units_consumed: present(&meta.compute_units_consumed).copied(),
    })
}

fn convert_inner_group(group: &UiInnerInstructions) -> Result<RawInnerInstructions> {
    let instructions = group
        .instructions
        .iter()
        .map(|ix| match ix {
            UiInstruction::Compiled(compiled) => Ok(RawInnerInstruction {
                program_id_index: compiled.program_id_index,
                accounts: compiled.accounts.clone(),
                data: InstructionData::Base58(compiled.data.clone()),
                stack_height: compiled.stack_height,
            }),
            UiInstruction::Parsed(_) => {
                bail!("Parsed inner instruction in group {}", group.index)
            }
        })
        .collect::<Result<_>>()?;

    Ok(RawInnerInstructions {
        index: group.index,
        instructions,
    })
}

fn convert_token_balances(balances: &[UiTransactionTokenBalance]) -> Vec<RawTokenBalance> {
    balances
        .iter()
        .map(|balance| RawTokenBalance {
            account_index: balance.account_index,
            mint: balance.mint.clone(),
            owner: present(&balance.owner).cloned(),
            amount: balance.ui_token_amount.amount.clone(),
            decimals: balance.ui_token_amount.decimals,
        })
        .collect()
}
