//! # Relation graph indexer
//!
//! Harvests produced slots into a durable queue, fans them out to a pool of
//! block processors that fetch and parse blocks over JSON-RPC, extracts
//! graph program relations and persists them to the document store. A small
//! JSON-RPC read API serves the stored relations.

mod api;
mod cli;
mod core;
mod error;
mod extractor;
mod harvester;
mod processor;
mod progress;
mod provider;
mod queue;
mod server;
mod sink;
mod transaction;

use std::sync::Arc;

use error_stack::Result;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub use crate::cli::{set_ctrlc_handler, StartArgs};
pub use crate::core::{
    ParsedBlock, ParsedTransaction, Relation, Slot, TokenBalanceChange, TxMeta,
    ADD_RELATION_DISCRIMINATOR, GRAPH_PROGRAM_ID,
};
pub use crate::error::{IndexerError, ReportExt};
pub use crate::extractor::RelationExtractor;
pub use crate::harvester::Harvester;
pub use crate::processor::Processor;
pub use crate::progress::{calc_status, IndexingStatus, ProgressCounters, ProgressReporter};
pub use crate::provider::{
    BlockLoader, BlockLoaderOptions, FetchBlocks, LedgerRpc, ProviderError, RpcProvider,
    RpcProviderOptions,
};
pub use crate::queue::{BlockQueue, QueueEntry, QueueError, WorkQueue};
pub use crate::server::{RpcErrorObject, RpcServer};
pub use crate::sink::{
    MongoStore, RelationDocument, RelationQuery, RelationStore, StoreError,
};
pub use crate::transaction::{parse_block, parse_transaction, ParseError};

use crate::error::IndexerErrorResultExt;

/// Start the indexer: harvester, processors, progress reporter and the
/// read API. Returns once every task has observed the cancellation token.
pub async fn start_indexer(args: StartArgs, ct: CancellationToken) -> Result<(), IndexerError> {
    info!("connecting to redis");
    let queue = queue::BlockQueue::connect(&args.redis_url())
        .await
        .temporary("failed to connect to the queue backend")?;
    queue
        .initialize()
        .await
        .temporary("failed to initialize the queue")?;

    info!("connecting to the document store");
    let store = sink::MongoStore::connect(&args.mongo_host)
        .await
        .temporary("failed to connect to the document store")?;
    store
        .initialize()
        .await
        .temporary("failed to initialize the document store")?;
    let store = Arc::new(store);

    let rpc = Arc::new(provider::RpcProvider::new(
        args.rpc_endpoint()?,
        provider::RpcProviderOptions::default(),
    ));

    let counters = Arc::new(progress::ProgressCounters::default());
    let extractor = extractor::RelationExtractor::new(args.graph_program()?);

    let processor = Arc::new(processor::Processor::new(
        rpc.clone(),
        queue.clone(),
        store.clone(),
        extractor,
        counters.clone(),
    ));

    let mut tasks: JoinSet<()> = JoinSet::new();

    // Exactly one harvester; restart its loop when an iteration fails.
    let harvester = harvester::Harvester::new(rpc.clone(), queue.clone());
    tasks.spawn({
        let ct = ct.clone();
        async move {
            loop {
                match harvester.run(ct.clone()).await {
                    Ok(()) => break,
                    Err(err) => {
                        error!(err = ?err, "harvest loop stopped, restarting");
                    }
                }

                if ct.is_cancelled() {
                    break;
                }
            }
        }
    });

    let workers = args.worker_count();
    info!(workers, "starting block processors");

    for thread in 0..workers {
        let consumer_id = format!("replica-{}-consumer-{}", args.replica_id, thread);
        tasks.spawn(processor.clone().run(consumer_id, ct.clone()));
    }

    let reporter = progress::ProgressReporter::new(rpc.clone(), counters);
    tasks.spawn(reporter.run(ct.clone()));

    let mut api_server = server::RpcServer::new();
    api::register_api(&mut api_server, store);
    tasks.spawn({
        let address = args.server_address;
        let ct = ct.clone();
        async move {
            if let Err(err) = api_server.run(address, ct).await {
                error!(err = ?err, "read api stopped");
            }
        }
    });

    while let Some(joined) = tasks.join_next().await {
        if let Err(err) = joined {
            error!(err = ?err, "task panicked");
        }
    }

    info!("goodbye");
    Ok(())
}
