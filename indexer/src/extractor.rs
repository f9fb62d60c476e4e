//! Extracts relations from graph program instructions.
//!
//! Instructions are dispatched on their 8-byte data prefix through a decoder
//! table; new instruction kinds are supported by registering another entry.

use std::collections::HashMap;

use borsh::{BorshDeserialize, BorshSerialize};
use solana_sdk::{instruction::Instruction, pubkey::Pubkey};
use tracing::warn;

use crate::core::{ParsedTransaction, Relation, ADD_RELATION_DISCRIMINATOR};

type DecodeFn = fn(&Instruction, i64) -> Option<Relation>;

pub struct RelationExtractor {
    program_id: Pubkey,
    decoders: HashMap<[u8; 8], DecodeFn>,
}

/// Payload of an `add_relation` instruction, after the discriminator.
#[derive(BorshSerialize, BorshDeserialize)]
struct AddRelationArgs {
    from: [u8; 32],
    to: [u8; 32],
    extra: Vec<u8>,
}

impl RelationExtractor {
    pub fn new(program_id: Pubkey) -> Self {
        let mut decoders: HashMap<[u8; 8], DecodeFn> = HashMap::new();
        decoders.insert(ADD_RELATION_DISCRIMINATOR, decode_add_relation);

        Self {
            program_id,
            decoders,
        }
    }

    /// Relations created by the transaction, outer and inner instructions
    /// alike.
    pub fn extract(&self, tx: &ParsedTransaction, block_time: u64) -> Vec<Relation> {
        let mut relations = Vec::new();

        for instruction in tx.all_instructions() {
            if instruction.program_id != self.program_id {
                continue;
            }

            if instruction.data.len() < 8 {
                continue;
            }

            let mut discriminator = [0u8; 8];
            discriminator.copy_from_slice(&instruction.data[..8]);

            let Some(decode) = self.decoders.get(&discriminator) else {
                continue;
            };

            if let Some(relation) = decode(instruction, block_time as i64) {
                relations.push(relation);
            }
        }

        relations
    }
}

fn decode_add_relation(instruction: &Instruction, block_time: i64) -> Option<Relation> {
    let args = match AddRelationArgs::try_from_slice(&instruction.data[8..]) {
        Ok(args) => args,
        Err(err) => {
            warn!(err = %err, "failed to parse add_relation payload");
            return None;
        }
    };

    let Some(provider) = instruction.accounts.first() else {
        warn!("add_relation instruction without accounts");
        return None;
    };

    Some(Relation {
        from: Pubkey::new_from_array(args.from),
        to: Pubkey::new_from_array(args.to),
        provider: provider.pubkey,
        connected_at: block_time,
        disconnected_at: None,
        extra: args.extra,
    })
}
