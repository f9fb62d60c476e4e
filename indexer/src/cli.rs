use std::net::SocketAddr;

use clap::Args;
use error_stack::{Result, ResultExt};
use solana_sdk::pubkey::Pubkey;
use tokio_util::sync::CancellationToken;

use crate::{core::GRAPH_PROGRAM_ID, error::IndexerError};

#[derive(Args, Debug, Clone)]
pub struct StartArgs {
    /// Minimum level for log lines.
    #[arg(long, env = "LOG_LEVEL")]
    pub log_level: String,

    /// Ledger JSON-RPC endpoint.
    #[arg(long, env = "RPC_ENDPOINT")]
    pub rpc_endpoint: String,

    /// Number of block processor workers. Zero means one per hardware
    /// thread.
    #[arg(long, env = "BLOCK_PROCESSOR_CONCURRENCY")]
    pub block_processor_concurrency: usize,

    #[arg(long, env = "REDIS_HOST")]
    pub redis_host: String,

    #[arg(long, env = "REDIS_PORT")]
    pub redis_port: u16,

    #[arg(long, env = "MONGO_HOST")]
    pub mongo_host: String,

    /// Replica id used in queue consumer names.
    #[arg(long, env = "REPLICA_ID", default_value_t = 0)]
    pub replica_id: u32,

    /// Address of the read API server.
    #[arg(long, env = "SERVER_ADDRESS", default_value = "0.0.0.0:8080")]
    pub server_address: SocketAddr,

    /// Override the indexed graph program id.
    #[arg(long, env = "GRAPH_PROGRAM")]
    pub graph_program: Option<String>,
}

impl StartArgs {
    pub fn redis_url(&self) -> String {
        format!("redis://{}:{}", self.redis_host, self.redis_port)
    }

    pub fn rpc_endpoint(&self) -> Result<url::Url, IndexerError> {
        self.rpc_endpoint
            .parse::<url::Url>()
            .change_context(IndexerError::Configuration)
            .attach_printable_lazy(|| format!("invalid rpc endpoint: {}", self.rpc_endpoint))
    }

    pub fn graph_program(&self) -> Result<Pubkey, IndexerError> {
        match &self.graph_program {
            None => Ok(GRAPH_PROGRAM_ID),
            Some(raw) => raw
                .parse::<Pubkey>()
                .change_context(IndexerError::Configuration)
                .attach_printable_lazy(|| format!("invalid graph program id: {raw}")),
        }
    }

    pub fn worker_count(&self) -> usize {
        if self.block_processor_concurrency >= 1 {
            return self.block_processor_concurrency;
        }

        std::thread::available_parallelism()
            .map(|parallelism| parallelism.get())
            .unwrap_or(1)
    }
}

/// Connect the cancellation token to the SIGINT/SIGTERM handler.
pub fn set_ctrlc_handler(ct: CancellationToken) -> std::result::Result<(), ctrlc::Error> {
    ctrlc::set_handler(move || {
        ct.cancel();
    })
}
