//! Coalesces concurrent single-block fetches into batched backend calls.
//!
//! Callers submit one slot at a time; the loader collects slots for a short
//! window (or until the batch is full) and issues a single backend call.
//! Each caller observes only its own slot's result.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use error_stack::{report, Result, ResultExt};
use tokio::sync::{oneshot, Mutex};

use crate::core::ParsedBlock;

use super::ProviderError;

/// Backend of the loader: fetch a batch of slots in one call.
#[async_trait]
pub trait FetchBlocks: Send + Sync + 'static {
    /// The returned vector must be position-aligned with `slots`.
    async fn fetch(&self, slots: Vec<u64>) -> Vec<Result<ParsedBlock, ProviderError>>;
}

#[derive(Debug, Clone)]
pub struct BlockLoaderOptions {
    /// How long to wait for more slots before flushing a partial batch.
    pub wait: Duration,
    /// Flush immediately once this many slots are pending.
    pub max_batch: usize,
}

impl Default for BlockLoaderOptions {
    fn default() -> Self {
        Self {
            wait: Duration::from_millis(10),
            max_batch: 10,
        }
    }
}

struct Pending {
    slot: u64,
    tx: oneshot::Sender<Result<ParsedBlock, ProviderError>>,
}

#[derive(Default)]
struct Inner {
    queue: Vec<Pending>,
    // Bumped on every flush so an armed timer can detect that its batch
    // is gone.
    generation: u64,
}

#[derive(Clone)]
pub struct BlockLoader {
    fetcher: Arc<dyn FetchBlocks>,
    options: BlockLoaderOptions,
    inner: Arc<Mutex<Inner>>,
}

impl BlockLoader {
    pub fn new(fetcher: Arc<dyn FetchBlocks>, options: BlockLoaderOptions) -> Self {
        Self {
            fetcher,
            options,
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    /// Fetch a single block, transparently batched with concurrent callers.
    pub async fn load(&self, slot: u64) -> Result<ParsedBlock, ProviderError> {
        let (tx, rx) = oneshot::channel();

        let ready = {
            let mut inner = self.inner.lock().await;
            inner.queue.push(Pending { slot, tx });

            if inner.queue.len() >= self.options.max_batch {
                inner.generation = inner.generation.wrapping_add(1);
                Some(std::mem::take(&mut inner.queue))
            } else {
                if inner.queue.len() == 1 {
                    self.arm_timer(inner.generation);
                }
                None
            }
        };

        if let Some(batch) = ready {
            let loader = self.clone();
            tokio::spawn(async move { loader.flush(batch).await });
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(report!(ProviderError::Request))
                .attach_printable("block loader dropped the request"),
        }
    }

    fn arm_timer(&self, generation: u64) {
        let loader = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(loader.options.wait).await;

            let batch = {
                let mut inner = loader.inner.lock().await;
                if inner.generation != generation || inner.queue.is_empty() {
                    return;
                }
                inner.generation = inner.generation.wrapping_add(1);
                std::mem::take(&mut inner.queue)
            };

            loader.flush(batch).await;
        });
    }

    async fn flush(&self, batch: Vec<Pending>) {
        let slots = batch.iter().map(|pending| pending.slot).collect::<Vec<_>>();
        let results = self.fetcher.fetch(slots).await;

        if results.len() != batch.len() {
            for pending in batch {
                let _ = pending.tx.send(
                    Err(report!(ProviderError::Request))
                        .attach_printable("backend returned a misaligned batch"),
                );
            }
            return;
        }

        for (pending, result) in batch.into_iter().zip(results) {
            let _ = pending.tx.send(result);
        }
    }
}
