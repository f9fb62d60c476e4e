//! Block processor workers.
//!
//! Every worker runs the same batch step: rescue stale entries, claim fresh
//! ones, fetch and parse the blocks, extract relations, persist them and
//! acknowledge the batch. A failed persist leaves the batch unacknowledged
//! so it becomes reclaim-eligible after the stale timeout.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use error_stack::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::{
    core::Slot,
    error::{IndexerError, IndexerErrorResultExt},
    extractor::RelationExtractor,
    progress::ProgressCounters,
    provider::LedgerRpc,
    queue::WorkQueue,
    sink::RelationStore,
};

const BATCH_SIZE: usize = 20;
const CLAIM_BLOCK_FOR: Duration = Duration::from_millis(500);
const STALE_TIMEOUT: Duration = Duration::from_secs(4 * 60);
// 5 attempts in total.
const FETCH_RETRIES: u32 = 4;

pub struct Processor<R, Q, S> {
    rpc: Arc<R>,
    queue: Q,
    store: Arc<S>,
    extractor: RelationExtractor,
    counters: Arc<ProgressCounters>,
}

impl<R, Q, S> Processor<R, Q, S>
where
    R: LedgerRpc,
    Q: WorkQueue,
    S: RelationStore,
{
    pub fn new(
        rpc: Arc<R>,
        queue: Q,
        store: Arc<S>,
        extractor: RelationExtractor,
        counters: Arc<ProgressCounters>,
    ) -> Self {
        Self {
            rpc,
            queue,
            store,
            extractor,
            counters,
        }
    }

    /// Worker loop for one consumer. Step errors are logged and the loop
    /// continues; an unacknowledged batch is redelivered through reclaim.
    pub async fn run(self: Arc<Self>, consumer_id: String, ct: CancellationToken) {
        loop {
            if ct.is_cancelled() {
                return;
            }

            if let Err(err) = self.process_batch(&consumer_id).await {
                error!(consumer = %consumer_id, err = ?err, "error while processing blocks");
            }
        }
    }

    async fn process_batch(&self, consumer_id: &str) -> Result<(), IndexerError> {
        let stale = self
            .queue
            .reclaim(consumer_id, STALE_TIMEOUT, BATCH_SIZE)
            .await
            .temporary("failed to reclaim stale entries")?;

        if !stale.is_empty() {
            let slots = stale.iter().map(|entry| entry.slot).collect::<Vec<_>>();
            warn!(slots = ?slots, "found stale blocks");
        }

        let fresh = self
            .queue
            .claim(consumer_id, BATCH_SIZE - stale.len(), CLAIM_BLOCK_FOR)
            .await
            .temporary("failed to claim new entries")?;

        let mut batch = stale;
        batch.extend(fresh);

        if batch.is_empty() {
            return Ok(());
        }

        let slots = batch.iter().map(|entry| entry.slot).collect::<Vec<_>>();
        let started = Instant::now();

        let failed = self.process_blocks(consumer_id, &slots).await?;

        trace!(
            count = batch.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "processed batch, acknowledging entries"
        );

        if !failed.is_empty() {
            // Fresh attempt at the back of the queue; the original entries
            // are acknowledged below.
            self.queue
                .enqueue(&failed)
                .await
                .temporary("failed to re-enqueue blocks")?;
        }

        let entry_ids = batch.into_iter().map(|entry| entry.id).collect::<Vec<_>>();
        self.queue
            .ack(&entry_ids)
            .await
            .temporary("failed to acknowledge blocks")?;

        let max_seen = slots.iter().copied().max().unwrap_or_default();
        self.counters.record_batch(max_seen, slots.len() as u64);

        Ok(())
    }

    /// Process a batch of slots, returning the ones whose block could not
    /// be fetched.
    async fn process_blocks(
        &self,
        consumer_id: &str,
        slots: &[Slot],
    ) -> Result<Vec<Slot>, IndexerError> {
        trace!(consumer = %consumer_id, slots = ?slots, "fetching blocks");

        let (blocks, failed_indices) = self
            .rpc
            .get_blocks(slots, FETCH_RETRIES)
            .await
            .temporary("failed to get blocks")?;

        let failed = failed_indices
            .iter()
            .map(|index| slots[*index])
            .collect::<Vec<_>>();

        if !failed.is_empty() {
            warn!(slots = ?failed, "failed to fetch blocks, sending them to the back of the queue");
        }

        for block in blocks.into_iter().flatten() {
            for tx in &block.transactions {
                let relations = self.extractor.extract(tx, block.block_time);
                if relations.is_empty() {
                    continue;
                }

                debug!(
                    signature = %tx.signature,
                    count = relations.len(),
                    "new relations"
                );

                self.store
                    .save_relations(&relations)
                    .await
                    .temporary("failed to save relations")?;
            }
        }

        Ok(failed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use solana_sdk::{
        instruction::{AccountMeta, Instruction},
        pubkey::Pubkey,
    };

    use crate::core::{
        ParsedBlock, ParsedTransaction, Relation, TxMeta, ADD_RELATION_DISCRIMINATOR,
        GRAPH_PROGRAM_ID,
    };
    use crate::provider::ProviderError;
    use crate::queue::{QueueEntry, QueueError};
    use crate::sink::{RelationDocument, RelationQuery, StoreError};

    use super::*;

    struct StaticRpc {
        blocks: Vec<Option<ParsedBlock>>,
        failed: Vec<usize>,
    }

    #[async_trait]
    impl LedgerRpc for StaticRpc {
        async fn latest_slot(&self) -> error_stack::Result<Slot, ProviderError> {
            Ok(0)
        }

        async fn slots_from(
            &self,
            _from: Slot,
            _limit: u64,
        ) -> error_stack::Result<Vec<Slot>, ProviderError> {
            Ok(Vec::new())
        }

        async fn get_blocks(
            &self,
            _slots: &[Slot],
            _retries: u32,
        ) -> error_stack::Result<(Vec<Option<ParsedBlock>>, Vec<usize>), ProviderError> {
            Ok((self.blocks.clone(), self.failed.clone()))
        }
    }

    #[derive(Default)]
    struct ScriptedQueue {
        stale: Mutex<Vec<QueueEntry>>,
        fresh: Mutex<Vec<QueueEntry>>,
        acked: Mutex<Vec<String>>,
        enqueued: Mutex<Vec<Slot>>,
    }

    #[async_trait]
    impl WorkQueue for ScriptedQueue {
        async fn enqueue(&self, slots: &[Slot]) -> error_stack::Result<(), QueueError> {
            self.enqueued.lock().unwrap().extend_from_slice(slots);
            Ok(())
        }

        async fn claim(
            &self,
            _consumer: &str,
            count: usize,
            _block_for: Duration,
        ) -> error_stack::Result<Vec<QueueEntry>, QueueError> {
            let mut fresh = self.fresh.lock().unwrap();
            let take = count.min(fresh.len());
            Ok(fresh.drain(..take).collect())
        }

        async fn reclaim(
            &self,
            _consumer: &str,
            _min_idle: Duration,
            _count: usize,
        ) -> error_stack::Result<Vec<QueueEntry>, QueueError> {
            Ok(std::mem::take(&mut *self.stale.lock().unwrap()))
        }

        async fn ack(&self, entry_ids: &[String]) -> error_stack::Result<(), QueueError> {
            self.acked.lock().unwrap().extend_from_slice(entry_ids);
            Ok(())
        }

        async fn set_cursor(&self, _slot: Slot) -> error_stack::Result<(), QueueError> {
            Ok(())
        }

        async fn cursor(&self) -> error_stack::Result<Slot, QueueError> {
            Ok(0)
        }
    }

    #[derive(Default)]
    struct RecordingStore {
        saved: Mutex<Vec<Relation>>,
        fail: bool,
    }

    #[async_trait]
    impl RelationStore for RecordingStore {
        async fn save_relations(
            &self,
            relations: &[Relation],
        ) -> error_stack::Result<(), StoreError> {
            if self.fail {
                return Err(error_stack::report!(StoreError::Insert));
            }
            self.saved.lock().unwrap().extend(relations.iter().cloned());
            Ok(())
        }

        async fn fetch_relations(
            &self,
            _query: RelationQuery,
        ) -> error_stack::Result<Vec<RelationDocument>, StoreError> {
            Ok(Vec::new())
        }
    }

    fn relation_transaction(provider: Pubkey) -> ParsedTransaction {
        let from = Pubkey::new_unique();
        let to = Pubkey::new_unique();

        let mut data = ADD_RELATION_DISCRIMINATOR.to_vec();
        data.extend(from.to_bytes());
        data.extend(to.to_bytes());
        data.extend(0u32.to_le_bytes());

        ParsedTransaction {
            signature: Default::default(),
            meta: TxMeta::default(),
            instructions: vec![Instruction {
                program_id: GRAPH_PROGRAM_ID,
                accounts: vec![AccountMeta::new(provider, false)],
                data,
            }],
            inner_instructions: Default::default(),
        }
    }

    fn block_with(transactions: Vec<ParsedTransaction>) -> ParsedBlock {
        ParsedBlock {
            parent_slot: 1000,
            block_time: 1_700_000_000,
            blockhash: "hash".to_string(),
            transactions,
        }
    }

    fn entry(id: &str, slot: Slot) -> QueueEntry {
        QueueEntry {
            id: id.to_string(),
            slot,
        }
    }

    fn processor(
        rpc: StaticRpc,
        queue: ScriptedQueue,
        store: Arc<RecordingStore>,
    ) -> Processor<StaticRpc, ScriptedQueue, RecordingStore> {
        Processor::new(
            Arc::new(rpc),
            queue,
            store,
            RelationExtractor::new(GRAPH_PROGRAM_ID),
            Arc::new(ProgressCounters::default()),
        )
    }

    #[tokio::test]
    async fn test_batch_step_persists_and_acks() {
        let provider = Pubkey::new_unique();
        let rpc = StaticRpc {
            blocks: vec![Some(block_with(vec![relation_transaction(provider)]))],
            failed: Vec::new(),
        };
        let queue = ScriptedQueue::default();
        *queue.fresh.lock().unwrap() = vec![entry("1-0", 1001)];
        let store = Arc::new(RecordingStore::default());

        let processor = processor(rpc, queue, store.clone());
        processor.process_batch("replica-0-consumer-0").await.unwrap();

        let saved = store.saved.lock().unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].provider, provider);
        assert_eq!(saved[0].connected_at, 1_700_000_000);

        assert_eq!(
            *processor.queue.acked.lock().unwrap(),
            vec!["1-0".to_string()]
        );
        assert_eq!(processor.counters.last_processed_slot(), 1001);
    }

    #[tokio::test]
    async fn test_failed_fetches_are_reenqueued_and_still_acked() {
        let rpc = StaticRpc {
            blocks: vec![None],
            failed: vec![0],
        };
        let queue = ScriptedQueue::default();
        *queue.fresh.lock().unwrap() = vec![entry("1-0", 1003)];
        let store = Arc::new(RecordingStore::default());

        let processor = processor(rpc, queue, store);
        processor.process_batch("replica-0-consumer-0").await.unwrap();

        assert_eq!(*processor.queue.enqueued.lock().unwrap(), vec![1003]);
        assert_eq!(
            *processor.queue.acked.lock().unwrap(),
            vec!["1-0".to_string()]
        );
    }

    #[tokio::test]
    async fn test_stale_and_fresh_entries_are_acked_together() {
        let rpc = StaticRpc {
            blocks: vec![Some(block_with(vec![])), Some(block_with(vec![]))],
            failed: Vec::new(),
        };
        let queue = ScriptedQueue::default();
        *queue.stale.lock().unwrap() = vec![entry("1-0", 900)];
        *queue.fresh.lock().unwrap() = vec![entry("2-0", 901)];
        let store = Arc::new(RecordingStore::default());

        let processor = processor(rpc, queue, store);
        processor.process_batch("replica-0-consumer-1").await.unwrap();

        let acked = processor.queue.acked.lock().unwrap();
        assert_eq!(*acked, vec!["1-0".to_string(), "2-0".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_persist_leaves_the_batch_unacked() {
        let provider = Pubkey::new_unique();
        let rpc = StaticRpc {
            blocks: vec![Some(block_with(vec![relation_transaction(provider)]))],
            failed: Vec::new(),
        };
        let queue = ScriptedQueue::default();
        *queue.fresh.lock().unwrap() = vec![entry("1-0", 1001)];
        let store = Arc::new(RecordingStore {
            fail: true,
            ..RecordingStore::default()
        });

        let processor = processor(rpc, queue, store);
        let result = processor.process_batch("replica-0-consumer-0").await;

        assert!(result.is_err());
        assert!(processor.queue.acked.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_batch_is_a_no_op() {
        let rpc = StaticRpc {
            blocks: Vec::new(),
            failed: Vec::new(),
        };
        let store = Arc::new(RecordingStore::default());

        let processor = processor(rpc, ScriptedQueue::default(), store);
        processor.process_batch("replica-0-consumer-0").await.unwrap();

        assert!(processor.queue.acked.lock().unwrap().is_empty());
        assert_eq!(processor.counters.last_processed_slot(), 0);
    }
}
