use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use error_stack::{report, Result, ResultExt};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{error, trace};
use url::Url;

use crate::core::{ParsedBlock, Slot};
use crate::transaction::parse_block;

use super::{
    loader::{BlockLoader, BlockLoaderOptions, FetchBlocks},
    models::{EpochInfo, RawBlock, RpcResponse},
    ProviderError,
};

const COMMITMENT: &str = "confirmed";
const RETRY_BACKOFF: Duration = Duration::from_millis(150);

/// Typed view over the ledger JSON-RPC endpoint.
#[async_trait]
pub trait LedgerRpc: Send + Sync + 'static {
    /// Latest confirmed slot.
    async fn latest_slot(&self) -> Result<Slot, ProviderError>;

    /// Produced slot numbers starting at `from`, at most `limit` of them.
    async fn slots_from(&self, from: Slot, limit: u64) -> Result<Vec<Slot>, ProviderError>;

    /// Fetch and parse the given blocks, retrying failed slots up to
    /// `retries` more times.
    ///
    /// The first element of the result is position-aligned with `slots`;
    /// positions that could not be fetched are `None` and their indices are
    /// returned in the second element.
    async fn get_blocks(
        &self,
        slots: &[Slot],
        retries: u32,
    ) -> Result<(Vec<Option<ParsedBlock>>, Vec<usize>), ProviderError>;
}

#[derive(Debug, Clone)]
pub struct RpcProviderOptions {
    /// Per-request timeout.
    pub timeout: Duration,
    pub loader: BlockLoaderOptions,
}

impl Default for RpcProviderOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            loader: BlockLoaderOptions::default(),
        }
    }
}

#[derive(Debug, Serialize)]
struct RequestEnvelope {
    jsonrpc: &'static str,
    id: u64,
    method: &'static str,
    params: serde_json::Value,
}

struct RpcCall {
    method: &'static str,
    params: serde_json::Value,
}

/// Raw JSON-RPC 2.0 transport. Requests are always sent in the array batch
/// form, one element per call.
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: Url,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(endpoint: Url, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
            timeout,
        }
    }

    async fn batch_request<T: DeserializeOwned>(
        &self,
        calls: &[RpcCall],
    ) -> Result<Vec<RpcResponse<T>>, ProviderError> {
        let payload = calls
            .iter()
            .map(|call| RequestEnvelope {
                jsonrpc: "2.0",
                id: 1,
                method: call.method,
                params: call.params.clone(),
            })
            .collect::<Vec<_>>();

        let request = self.client.post(self.endpoint.clone()).json(&payload).send();

        let Ok(response) = tokio::time::timeout(self.timeout, request).await else {
            return Err(report!(ProviderError::Timeout))
                .attach_printable_lazy(|| format!("endpoint: {}", self.endpoint));
        };

        let response = response
            .change_context(ProviderError::Request)
            .attach_printable_lazy(|| format!("endpoint: {}", self.endpoint))?;

        if !response.status().is_success() {
            return Err(report!(ProviderError::Request))
                .attach_printable_lazy(|| format!("http status: {}", response.status()));
        }

        response
            .json::<Vec<RpcResponse<T>>>()
            .await
            .change_context(ProviderError::Decode)
            .attach_printable("invalid json-rpc response body")
    }
}

#[async_trait]
impl FetchBlocks for HttpTransport {
    async fn fetch(&self, slots: Vec<u64>) -> Vec<Result<ParsedBlock, ProviderError>> {
        let calls = slots
            .iter()
            .map(|slot| RpcCall {
                method: "getBlock",
                params: serde_json::json!([
                    slot,
                    {
                        "encoding": "base64",
                        "commitment": COMMITMENT,
                        "maxSupportedTransactionVersion": 1,
                    }
                ]),
            })
            .collect::<Vec<_>>();

        let responses = match self.batch_request::<RawBlock>(&calls).await {
            Ok(responses) => responses,
            Err(err) => {
                // The call failed as a whole: every slot in the batch
                // observes the same failure.
                let cause = format!("{err:?}");
                return slots
                    .iter()
                    .map(|_| {
                        Err(report!(ProviderError::Request)).attach_printable(cause.clone())
                    })
                    .collect();
            }
        };

        if responses.len() != slots.len() {
            return slots
                .iter()
                .map(|_| {
                    Err(report!(ProviderError::Decode))
                        .attach_printable("response count does not match request count")
                })
                .collect();
        }

        responses
            .into_iter()
            .map(|response| {
                if let Some(err) = response.error {
                    return Err(report!(ProviderError::Rpc)).attach_printable(err.to_string());
                }
                let raw = response
                    .result
                    .ok_or(ProviderError::Decode)
                    .attach_printable("response has neither result nor error")?;
                Ok(parse_block(raw))
            })
            .collect()
    }
}

/// Ledger RPC client backed by the batching block loader.
#[derive(Clone)]
pub struct RpcProvider {
    transport: Arc<HttpTransport>,
    loader: BlockLoader,
}

impl RpcProvider {
    pub fn new(endpoint: Url, options: RpcProviderOptions) -> Self {
        let transport = Arc::new(HttpTransport::new(endpoint, options.timeout));
        let loader = BlockLoader::new(transport.clone(), options.loader);
        Self { transport, loader }
    }
}

#[async_trait]
impl LedgerRpc for RpcProvider {
    async fn latest_slot(&self) -> Result<Slot, ProviderError> {
        let call = RpcCall {
            method: "getEpochInfo",
            params: serde_json::json!([{ "commitment": COMMITMENT }]),
        };

        let mut responses = self.transport.batch_request::<EpochInfo>(&[call]).await?;
        let response = first_response(&mut responses)?;
        Ok(response.absolute_slot)
    }

    async fn slots_from(&self, from: Slot, limit: u64) -> Result<Vec<Slot>, ProviderError> {
        let call = RpcCall {
            method: "getBlocksWithLimit",
            params: serde_json::json!([from, limit, { "commitment": COMMITMENT }]),
        };

        let mut responses = self.transport.batch_request::<Vec<Slot>>(&[call]).await?;
        first_response(&mut responses)
    }

    async fn get_blocks(
        &self,
        slots: &[Slot],
        retries: u32,
    ) -> Result<(Vec<Option<ParsedBlock>>, Vec<usize>), ProviderError> {
        let mut blocks: Vec<Option<ParsedBlock>> = vec![None; slots.len()];
        // Positions of `slots` still waiting for a block.
        let mut pending: Vec<usize> = (0..slots.len()).collect();
        let mut attempts_left = retries;

        loop {
            let loads = pending.iter().map(|index| self.loader.load(slots[*index]));
            let results = futures_util::future::join_all(loads).await;

            let mut failed = Vec::new();
            for (position, result) in pending.iter().zip(results) {
                match result {
                    Ok(block) => blocks[*position] = Some(block),
                    Err(err) => {
                        trace!(
                            slot = slots[*position],
                            retries_left = attempts_left,
                            err = ?err,
                            "failed to fetch block"
                        );
                        failed.push(*position);
                    }
                }
            }

            if failed.is_empty() {
                return Ok((blocks, Vec::new()));
            }

            if attempts_left == 0 {
                let failed_slots = failed.iter().map(|index| slots[*index]).collect::<Vec<_>>();
                error!(
                    count = failed.len(),
                    slots = ?failed_slots,
                    "failed to fetch blocks after retries"
                );
                return Ok((blocks, failed));
            }

            attempts_left -= 1;
            tokio::time::sleep(RETRY_BACKOFF).await;
            pending = failed;
        }
    }
}

fn first_response<T>(responses: &mut Vec<RpcResponse<T>>) -> Result<T, ProviderError> {
    if responses.is_empty() {
        return Err(report!(ProviderError::Decode)).attach_printable("empty batch response");
    }

    let response = responses.swap_remove(0);

    if let Some(err) = response.error {
        return Err(report!(ProviderError::Rpc)).attach_printable(err.to_string());
    }

    response
        .result
        .ok_or(ProviderError::Decode)
        .attach_printable("response has neither result nor error")
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    // Exercises the retry loop of `get_blocks` through the loader with a
    // backend that fails a slot a configurable number of times.
    struct FlakyFetcher {
        fail_slot: u64,
        failures: AtomicU32,
    }

    #[async_trait]
    impl FetchBlocks for FlakyFetcher {
        async fn fetch(&self, slots: Vec<u64>) -> Vec<Result<ParsedBlock, ProviderError>> {
            slots
                .into_iter()
                .map(|slot| {
                    if slot == self.fail_slot
                        && self.failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                            n.checked_sub(1)
                        }).is_ok()
                    {
                        Err(report!(ProviderError::Rpc)).attach_printable("unavailable")
                    } else {
                        Ok(ParsedBlock {
                            parent_slot: slot - 1,
                            block_time: 0,
                            blockhash: format!("hash-{slot}"),
                            transactions: Vec::new(),
                        })
                    }
                })
                .collect()
        }
    }

    fn provider_with_fetcher(fetcher: Arc<dyn FetchBlocks>) -> RpcProvider {
        let endpoint: Url = "http://localhost:8899".parse().unwrap();
        let transport = Arc::new(HttpTransport::new(endpoint, Duration::from_secs(1)));
        RpcProvider {
            transport,
            loader: BlockLoader::new(fetcher, BlockLoaderOptions::default()),
        }
    }

    #[tokio::test]
    async fn test_get_blocks_preserves_input_order() {
        let fetcher = Arc::new(FlakyFetcher {
            fail_slot: 0,
            failures: AtomicU32::new(0),
        });
        let provider = provider_with_fetcher(fetcher);

        let slots = [1005u64, 1001, 1003];
        let (blocks, failed) = provider.get_blocks(&slots, 4).await.unwrap();

        assert!(failed.is_empty());
        let hashes = blocks
            .into_iter()
            .map(|block| block.unwrap().blockhash)
            .collect::<Vec<_>>();
        assert_eq!(hashes, vec!["hash-1005", "hash-1001", "hash-1003"]);
    }

    #[tokio::test]
    async fn test_get_blocks_recovers_after_transient_failures() {
        let fetcher = Arc::new(FlakyFetcher {
            fail_slot: 1002,
            failures: AtomicU32::new(2),
        });
        let provider = provider_with_fetcher(fetcher);

        let slots = [1001u64, 1002];
        let (blocks, failed) = provider.get_blocks(&slots, 4).await.unwrap();

        assert!(failed.is_empty());
        assert!(blocks.iter().all(|block| block.is_some()));
    }

    #[tokio::test]
    async fn test_get_blocks_reports_exhausted_slots() {
        let fetcher = Arc::new(FlakyFetcher {
            fail_slot: 1002,
            failures: AtomicU32::new(u32::MAX),
        });
        let provider = provider_with_fetcher(fetcher);

        let slots = [1001u64, 1002, 1003];
        let (blocks, failed) = provider.get_blocks(&slots, 1).await.unwrap();

        assert_eq!(failed, vec![1]);
        assert!(blocks[0].is_some());
        assert!(blocks[1].is_none());
        assert!(blocks[2].is_some());
    }
}
