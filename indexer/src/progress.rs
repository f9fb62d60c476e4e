//! Periodic indexing progress reports.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    sync::Arc,
    time::{Duration, Instant},
};

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::{core::Slot, provider::LedgerRpc};

const REPORT_INTERVAL: Duration = Duration::from_secs(30);
const STATUS_RPC_TIMEOUT: Duration = Duration::from_secs(15);

// Slots behind the tip we still consider up to date.
const DELAY_TOLERANCE: u64 = 250;

/// Lock-free counters shared between the workers and the reporter.
#[derive(Debug, Default)]
pub struct ProgressCounters {
    last_processed_slot: AtomicU64,
    processed_count: AtomicU64,
}

impl ProgressCounters {
    pub fn record_batch(&self, max_slot: Slot, count: u64) {
        self.last_processed_slot
            .fetch_max(max_slot, Ordering::Relaxed);
        self.processed_count.fetch_add(count, Ordering::Relaxed);
    }

    pub fn last_processed_slot(&self) -> Slot {
        self.last_processed_slot.load(Ordering::Relaxed)
    }

    /// Read and reset the processed counter.
    pub fn take_processed_count(&self) -> u64 {
        self.processed_count.swap(0, Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexingStatus {
    /// The tip is behind the last processed slot.
    Unknown,
    UpToDate { behind: u64 },
    CatchingUp { behind: u64 },
    Stalled { behind: u64 },
}

impl std::fmt::Display for IndexingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndexingStatus::Unknown => write!(f, "UNKNOWN"),
            IndexingStatus::UpToDate { behind } => {
                write!(f, "UP-TO-DATE ({behind} slots behind)")
            }
            IndexingStatus::CatchingUp { behind } => {
                write!(f, "CATCHING UP ({behind} slots behind)")
            }
            IndexingStatus::Stalled { behind } => {
                write!(f, "STALLED ({behind} slots behind)")
            }
        }
    }
}

pub fn calc_status(latest: Slot, last_processed: Slot, rate: f64) -> IndexingStatus {
    if latest < last_processed {
        return IndexingStatus::Unknown;
    }

    let behind = latest - last_processed;

    if behind < DELAY_TOLERANCE {
        return IndexingStatus::UpToDate { behind };
    }

    if rate > 1.0 {
        IndexingStatus::CatchingUp { behind }
    } else {
        IndexingStatus::Stalled { behind }
    }
}

pub struct ProgressReporter<R> {
    rpc: Arc<R>,
    counters: Arc<ProgressCounters>,
}

impl<R> ProgressReporter<R>
where
    R: LedgerRpc,
{
    pub fn new(rpc: Arc<R>, counters: Arc<ProgressCounters>) -> Self {
        Self { rpc, counters }
    }

    /// Report progress every 30 seconds until cancelled.
    pub async fn run(self, ct: CancellationToken) {
        let mut last_report = Instant::now();
        // Suppress the very first line, there is no baseline yet.
        let mut last_report_slot = 0;

        loop {
            tokio::select! {
                _ = ct.cancelled() => return,
                _ = tokio::time::sleep(REPORT_INTERVAL) => {}
            }

            self.report(&mut last_report, &mut last_report_slot).await;
        }
    }

    async fn report(&self, last_report: &mut Instant, last_report_slot: &mut Slot) {
        let latest = match tokio::time::timeout(STATUS_RPC_TIMEOUT, self.rpc.latest_slot()).await {
            Ok(Ok(slot)) => slot,
            Ok(Err(err)) => {
                error!(err = ?err, "failed to fetch the latest slot");
                return;
            }
            Err(_) => {
                error!("timed out fetching the latest slot");
                return;
            }
        };

        let last_processed = self.counters.last_processed_slot();
        let count = self.counters.take_processed_count();

        let elapsed = last_report.elapsed().as_secs_f64();
        let rate = count as f64 / elapsed;

        let status = calc_status(latest, last_processed, rate);

        if *last_report_slot != 0 {
            info!(
                new_blocks = count,
                elapsed_secs = format!("{elapsed:.1}"),
                rate = format!("{rate:.2}"),
                status = %status,
                "indexing progress"
            );
        }

        *last_report = Instant::now();
        *last_report_slot = last_processed;
    }
}
