//! Wire models for the ledger JSON-RPC methods used by the indexer.

use serde::Deserialize;

/// JSON-RPC 2.0 response envelope.
#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct RpcResponse<T> {
    #[allow(dead_code)]
    pub jsonrpc: String,
    #[allow(dead_code)]
    #[serde(default)]
    pub id: serde_json::Value,
    #[serde(default)]
    pub error: Option<RpcErrorObject>,
    #[serde(default)]
    pub result: Option<T>,
}

#[derive(Debug, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
}

impl std::fmt::Display for RpcErrorObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "rpc error {}: {}", self.code, self.message)
    }
}

/// `getEpochInfo` result.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EpochInfo {
    pub absolute_slot: u64,
    #[allow(dead_code)]
    pub block_height: u64,
}

/// `getBlock` result.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawBlock {
    #[allow(dead_code)]
    #[serde(default)]
    pub block_height: Option<u64>,
    #[serde(default)]
    pub block_time: Option<u64>,
    pub parent_slot: u64,
    pub blockhash: String,
    #[allow(dead_code)]
    #[serde(default)]
    pub previous_blockhash: Option<String>,
    #[serde(default)]
    pub transactions: Vec<RawBlockTransaction>,
}

#[derive(Debug, Deserialize)]
pub struct RawBlockTransaction {
    pub meta: RawTxMeta,
    /// `[base64_payload, encoding]`.
    pub transaction: (String, String),
    #[serde(default)]
    pub version: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RawTxMeta {
    #[serde(default)]
    pub err: Option<serde_json::Value>,
    #[allow(dead_code)]
    #[serde(default)]
    pub fee: u64,
    #[serde(default)]
    pub pre_balances: Vec<i64>,
    #[serde(default)]
    pub post_balances: Vec<i64>,
    #[serde(default)]
    pub pre_token_balances: Vec<RawTokenBalance>,
    #[serde(default)]
    pub post_token_balances: Vec<RawTokenBalance>,
    #[serde(default)]
    pub log_messages: Vec<String>,
    #[serde(default)]
    pub inner_instructions: Vec<RawInnerInstructions>,
    #[allow(dead_code)]
    #[serde(default)]
    pub loaded_addresses: Option<RawLoadedAddresses>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
#[allow(dead_code)]
pub struct RawLoadedAddresses {
    #[serde(default)]
    pub writable: Vec<String>,
    #[serde(default)]
    pub readonly: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RawTokenBalance {
    pub account_index: usize,
    pub mint: String,
    #[serde(default)]
    pub owner: String,
    pub ui_token_amount: RawTokenAmount,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RawTokenAmount {
    /// Unsigned base-unit amount as a decimal string.
    pub amount: String,
    pub decimals: u8,
}

#[derive(Debug, Deserialize)]
pub struct RawInnerInstructions {
    pub index: usize,
    #[serde(default)]
    pub instructions: Vec<RawCompiledInstruction>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawCompiledInstruction {
    pub accounts: Vec<usize>,
    /// Base58-encoded instruction data.
    pub data: String,
    pub program_id_index: usize,
}
