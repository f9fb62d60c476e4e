use std::process::ExitCode;

use clap::{Parser, Subcommand};
use error_stack::{Result, ResultExt};
use graph_indexer::{set_ctrlc_handler, start_indexer, IndexerError, ReportExt, StartArgs};
use graph_observability::init_observability;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the indexer and the read API.
    Start(StartArgs),
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Cli::parse();
    run_with_args(args).await.to_exit_code()
}

async fn run_with_args(args: Cli) -> Result<(), IndexerError> {
    match args.command {
        Command::Start(args) => {
            // The logging bootstrap reads LOG_LEVEL from the environment;
            // keep the flag form working too.
            std::env::set_var("LOG_LEVEL", &args.log_level);
            init_observability().change_context(IndexerError::Configuration)?;

            let ct = CancellationToken::new();
            set_ctrlc_handler(ct.clone())
                .change_context(IndexerError::Fatal)
                .attach_printable("failed to register the signal handler")?;

            start_indexer(args, ct).await
        }
    }
}
