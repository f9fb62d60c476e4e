use std::collections::HashMap;

use solana_sdk::{instruction::Instruction, pubkey::Pubkey, signature::Signature};

/// Numeric block position in the ledger. Not every slot produces a block.
pub type Slot = u64;

/// The graph program observed by the indexer.
pub const GRAPH_PROGRAM_ID: Pubkey =
    solana_sdk::pubkey!("graph8zS8zjLVJHdiSvP7S9PP7hNJpnHdbnJLR81FMg");

/// First 8 bytes of instruction data identifying an `add_relation` call.
pub const ADD_RELATION_DISCRIMINATOR: [u8; 8] = [105, 147, 147, 214, 252, 133, 155, 210];

/// A relation between two accounts, attested by a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relation {
    pub from: Pubkey,
    pub to: Pubkey,
    pub provider: Pubkey,
    /// Unix seconds of the block that created the relation.
    pub connected_at: i64,
    pub disconnected_at: Option<i64>,
    pub extra: Vec<u8>,
}

/// Per-account token balance change in a single transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenBalanceChange {
    /// Post minus pre amount, in base units.
    pub delta: i64,
    pub decimals: u8,
    pub owner: Pubkey,
    pub mint: Pubkey,
}

/// Balance effects and logs of a parsed transaction.
#[derive(Debug, Clone, Default)]
pub struct TxMeta {
    pub sol_changes: HashMap<Pubkey, i64>,
    pub token_changes: HashMap<Pubkey, TokenBalanceChange>,
    pub logs: Vec<String>,
}

/// A transaction decoded into decompiled instructions.
///
/// Vote transactions, failed transactions and unsupported versions are
/// filtered out at parse time and never reach this type.
#[derive(Debug, Clone)]
pub struct ParsedTransaction {
    pub signature: Signature,
    pub meta: TxMeta,
    pub instructions: Vec<Instruction>,
    /// Inner instructions grouped by the index of the outer instruction
    /// that produced them.
    pub inner_instructions: HashMap<usize, Vec<Instruction>>,
}

impl ParsedTransaction {
    /// All instructions of the transaction, outer first, then inner
    /// groups in unspecified order.
    pub fn all_instructions(&self) -> impl Iterator<Item = &Instruction> {
        self.instructions
            .iter()
            .chain(self.inner_instructions.values().flatten())
    }
}

/// A produced slot with its surviving transactions.
#[derive(Debug, Clone)]
pub struct ParsedBlock {
    pub parent_slot: Slot,
    /// Unix seconds.
    pub block_time: u64,
    pub blockhash: String,
    pub transactions: Vec<ParsedTransaction>,
}
