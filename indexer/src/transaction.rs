//! Decodes raw `getBlock` payloads into [`ParsedBlock`] values.
//!
//! A transaction that cannot be decoded is dropped with a warning; it never
//! fails the surrounding block. Vote transactions, transactions that failed
//! on chain and versioned transactions other than legacy are filtered out.

use std::collections::HashMap;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use error_stack::{Result, ResultExt};
use solana_sdk::{
    instruction::{AccountMeta, Instruction},
    message::Message,
    pubkey::Pubkey,
    transaction::Transaction,
};
use tracing::warn;

use crate::core::{ParsedBlock, ParsedTransaction, TokenBalanceChange, TxMeta};
use crate::provider::models::{RawBlock, RawBlockTransaction, RawTxMeta};

#[derive(Debug)]
pub enum ParseError {
    Transaction,
    Account,
    TokenBalance,
}

impl error_stack::Context for ParseError {}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::Transaction => f.write_str("failed to decode transaction"),
            ParseError::Account => f.write_str("account index out of range"),
            ParseError::TokenBalance => f.write_str("failed to parse token balance"),
        }
    }
}

/// Convert a raw block into its parsed form, dropping transactions that
/// fail to decode.
pub fn parse_block(raw: RawBlock) -> ParsedBlock {
    let mut transactions = Vec::with_capacity(raw.transactions.len());

    for raw_tx in raw.transactions {
        match parse_transaction(raw_tx) {
            Ok(Some(tx)) => transactions.push(tx),
            Ok(None) => {}
            Err(err) => {
                warn!(err = ?err, "dropping undecodable transaction");
            }
        }
    }

    ParsedBlock {
        parent_slot: raw.parent_slot,
        block_time: raw.block_time.unwrap_or_default(),
        blockhash: raw.blockhash,
        transactions,
    }
}

/// Parse a single raw transaction.
///
/// Returns `Ok(None)` when the transaction is filtered out: unsupported
/// version, vote transaction, or failed on-chain execution.
pub fn parse_transaction(
    raw: RawBlockTransaction,
) -> Result<Option<ParsedTransaction>, ParseError> {
    if let Some(version) = &raw.version {
        let legacy = version.as_str().map(|v| v == "legacy").unwrap_or(false);
        if !version.is_null() && !legacy {
            warn!(version = %version, "skipping unsupported transaction version");
            return Ok(None);
        }
    }

    let raw_bytes = BASE64
        .decode(raw.transaction.0.as_bytes())
        .change_context(ParseError::Transaction)
        .attach_printable("invalid base64 payload")?;

    let tx: Transaction = bincode::deserialize(&raw_bytes)
        .change_context(ParseError::Transaction)
        .attach_printable("invalid transaction bytes")?;

    let message = &tx.message;
    let instructions = decompile_instructions(message)?;

    if let Some(first) = instructions.first() {
        if first.program_id == solana_sdk::vote::program::id() {
            return Ok(None);
        }
    }

    let meta = raw.meta;

    if meta.err.is_some() {
        return Ok(None);
    }

    let signature = tx.signatures.first().copied().unwrap_or_default();
    let inner_instructions = decompile_inner_instructions(message, &meta)?;
    let sol_changes = parse_sol_changes(&meta, &message.account_keys);
    let token_changes = parse_token_changes(&meta, &message.account_keys)?;

    Ok(Some(ParsedTransaction {
        signature,
        meta: TxMeta {
            sol_changes,
            token_changes,
            logs: meta.log_messages,
        },
        instructions,
        inner_instructions,
    }))
}

fn decompile_instructions(message: &Message) -> Result<Vec<Instruction>, ParseError> {
    let mut instructions = Vec::with_capacity(message.instructions.len());

    for compiled in &message.instructions {
        let program_id = *account_at(message, compiled.program_id_index as usize)?;
        let accounts = compiled
            .accounts
            .iter()
            .map(|index| account_meta_at(message, *index as usize))
            .collect::<Result<Vec<_>, _>>()?;

        instructions.push(Instruction {
            program_id,
            accounts,
            data: compiled.data.clone(),
        });
    }

    Ok(instructions)
}

fn decompile_inner_instructions(
    message: &Message,
    meta: &RawTxMeta,
) -> Result<HashMap<usize, Vec<Instruction>>, ParseError> {
    let mut result = HashMap::with_capacity(meta.inner_instructions.len());

    for inner in &meta.inner_instructions {
        let mut instructions = Vec::with_capacity(inner.instructions.len());

        for compiled in &inner.instructions {
            let program_id = *account_at(message, compiled.program_id_index)?;
            let accounts = compiled
                .accounts
                .iter()
                .map(|index| account_meta_at(message, *index))
                .collect::<Result<Vec<_>, _>>()?;
            let data = bs58::decode(&compiled.data)
                .into_vec()
                .change_context(ParseError::Transaction)
                .attach_printable("invalid base58 instruction data")?;

            instructions.push(Instruction {
                program_id,
                accounts,
                data,
            });
        }

        result.insert(inner.index, instructions);
    }

    Ok(result)
}

fn account_at(message: &Message, index: usize) -> Result<&Pubkey, ParseError> {
    message
        .account_keys
        .get(index)
        .ok_or(ParseError::Account)
        .attach_printable_lazy(|| format!("index: {index}"))
}

/// Signer and writability flags follow from the account's position
/// relative to the message header counts.
fn account_meta_at(message: &Message, index: usize) -> Result<AccountMeta, ParseError> {
    let pubkey = *account_at(message, index)?;
    let header = &message.header;

    let num_required = header.num_required_signatures as usize;
    let num_readonly_signed = header.num_readonly_signed_accounts as usize;
    let num_readonly_unsigned = header.num_readonly_unsigned_accounts as usize;
    let total = message.account_keys.len();

    let is_signer = index < num_required;
    let is_writable = index < num_required.saturating_sub(num_readonly_signed)
        || (index >= num_required && index < total.saturating_sub(num_readonly_unsigned));

    Ok(AccountMeta {
        pubkey,
        is_signer,
        is_writable,
    })
}

fn parse_sol_changes(meta: &RawTxMeta, accounts: &[Pubkey]) -> HashMap<Pubkey, i64> {
    let mut changes = HashMap::with_capacity(meta.post_balances.len());

    for (index, post) in meta.post_balances.iter().enumerate() {
        let (Some(account), Some(pre)) = (accounts.get(index), meta.pre_balances.get(index))
        else {
            continue;
        };
        changes.insert(*account, post - pre);
    }

    changes
}

fn parse_token_changes(
    meta: &RawTxMeta,
    accounts: &[Pubkey],
) -> Result<HashMap<Pubkey, TokenBalanceChange>, ParseError> {
    let mut changes = HashMap::with_capacity(meta.post_token_balances.len());

    for post in &meta.post_token_balances {
        let account = *accounts
            .get(post.account_index)
            .ok_or(ParseError::TokenBalance)
            .attach_printable_lazy(|| format!("account index: {}", post.account_index))?;

        let owner: Pubkey = post
            .owner
            .parse::<Pubkey>()
            .change_context(ParseError::TokenBalance)
            .attach_printable("invalid owner key")?;
        let mint: Pubkey = post
            .mint
            .parse::<Pubkey>()
            .change_context(ParseError::TokenBalance)
            .attach_printable("invalid mint key")?;

        let post_amount: u64 = post
            .ui_token_amount
            .amount
            .parse::<u64>()
            .change_context(ParseError::TokenBalance)
            .attach_printable("invalid post amount")?;

        let pre = meta
            .pre_token_balances
            .iter()
            .find(|pre| pre.account_index == post.account_index);

        let delta = match pre {
            // Token account created by this transaction. The post amount is
            // the starting balance.
            None => post_amount as i64,
            Some(pre) => {
                let pre_amount: u64 = pre
                    .ui_token_amount
                    .amount
                    .parse::<u64>()
                    .change_context(ParseError::TokenBalance)
                    .attach_printable("invalid pre amount")?;
                post_amount as i64 - pre_amount as i64
            }
        };

        changes.insert(
            account,
            TokenBalanceChange {
                delta,
                decimals: post.ui_token_amount.decimals,
                owner,
                mint,
            },
        );
    }

    Ok(changes)
}
