//! Ledger JSON-RPC access: batched transport, block loader and typed calls.

mod http;
mod loader;
pub mod models;

pub use http::{HttpTransport, LedgerRpc, RpcProvider, RpcProviderOptions};
pub use loader::{BlockLoader, BlockLoaderOptions, FetchBlocks};

#[derive(Debug)]
pub enum ProviderError {
    Request,
    Timeout,
    Rpc,
    Decode,
    Configuration,
}

impl error_stack::Context for ProviderError {}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderError::Request => write!(f, "failed to send request"),
            ProviderError::Timeout => write!(f, "request timed out"),
            ProviderError::Rpc => write!(f, "rpc returned an error"),
            ProviderError::Decode => write!(f, "failed to decode response"),
            ProviderError::Configuration => write!(f, "provider configuration error"),
        }
    }
}
