//! Keeps the block stream fed.
//!
//! A single harvester advances the persisted cursor over produced slots and
//! enqueues them. The cursor is only advanced after a successful enqueue, so
//! a crash between the two can duplicate slots but never lose them.

use std::{sync::Arc, time::Duration};

use error_stack::Result;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use crate::{
    error::{IndexerError, IndexerErrorResultExt},
    provider::LedgerRpc,
    queue::WorkQueue,
};

// Average block time.
const BLOCK_HARVEST_INTERVAL: Duration = Duration::from_millis(400);
const BLOCK_LIMIT: u64 = 1000;

pub struct Harvester<R, Q> {
    rpc: Arc<R>,
    queue: Q,
}

impl<R, Q> Harvester<R, Q>
where
    R: LedgerRpc,
    Q: WorkQueue,
{
    pub fn new(rpc: Arc<R>, queue: Q) -> Self {
        Self { rpc, queue }
    }

    /// Run until cancelled. Any error aborts the current iteration and
    /// propagates; the supervisor restarts the loop.
    pub async fn run(&self, ct: CancellationToken) -> Result<(), IndexerError> {
        loop {
            if ct.is_cancelled() {
                return Ok(());
            }

            self.harvest_once().await?;

            tokio::select! {
                _ = ct.cancelled() => return Ok(()),
                _ = tokio::time::sleep(BLOCK_HARVEST_INTERVAL) => {}
            }
        }
    }

    async fn harvest_once(&self) -> Result<(), IndexerError> {
        let mut cursor = self
            .queue
            .cursor()
            .await
            .temporary("failed to read the harvest cursor")?;

        if cursor == 0 {
            cursor = self
                .rpc
                .latest_slot()
                .await
                .temporary("failed to fetch the latest slot")?;
            warn!(slot = cursor, "no saved cursor, starting from the latest slot");
        }

        let slots = self
            .rpc
            .slots_from(cursor, BLOCK_LIMIT)
            .await
            .temporary("failed to list produced slots")?;

        self.queue
            .enqueue(&slots)
            .await
            .temporary("failed to enqueue blocks")?;

        trace!(count = slots.len(), "enqueued blocks");

        // Start the next pass from the slot after the last one seen.
        let last_seen = match slots.last() {
            Some(last) => last + 1,
            None => cursor,
        };

        self.queue
            .set_cursor(last_seen)
            .await
            .temporary("failed to save the harvest cursor")?;

        Ok(())
    }
}
