use std::{fmt, process::ExitCode};

use error_stack::{Result, ResultExt};

/// Indexer error.
///
/// Subsystems should default to `IndexerError::Temporary` for errors that the
/// supervising loop retries. `IndexerError::Configuration` is reserved for
/// startup problems that should not be retried.
#[derive(Debug)]
pub enum IndexerError {
    /// Configuration error. Should not retry.
    Configuration,
    /// Temporary error. The enclosing loop retries.
    Temporary,
    /// Fatal error. Should not retry.
    Fatal,
}

impl error_stack::Context for IndexerError {}

impl fmt::Display for IndexerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexerError::Configuration => f.write_str("indexer configuration error"),
            IndexerError::Temporary => f.write_str("temporary indexer error"),
            IndexerError::Fatal => f.write_str("fatal indexer error"),
        }
    }
}

pub trait ReportExt {
    fn to_exit_code(&self) -> ExitCode;
}

impl<T> ReportExt for Result<T, IndexerError> {
    fn to_exit_code(&self) -> ExitCode {
        match self {
            Ok(_) => ExitCode::SUCCESS,
            Err(err) => {
                eprintln!("{:?}", err);
                // Exit codes based on sysexits.h
                match err.downcast_ref::<IndexerError>() {
                    Some(IndexerError::Configuration) => ExitCode::from(78),
                    Some(IndexerError::Temporary) => ExitCode::from(75),
                    Some(IndexerError::Fatal) => ExitCode::FAILURE,
                    None => ExitCode::FAILURE,
                }
            }
        }
    }
}

pub trait IndexerErrorResultExt {
    type Ok;
    fn configuration(self, reason: &str) -> Result<Self::Ok, IndexerError>;
    fn temporary(self, reason: &str) -> Result<Self::Ok, IndexerError>;
    fn fatal(self, reason: &str) -> Result<Self::Ok, IndexerError>;
}

impl<T, C> IndexerErrorResultExt for Result<T, C>
where
    C: error_stack::Context,
{
    type Ok = T;

    fn configuration(self, reason: &str) -> Result<T, IndexerError> {
        self.change_context(IndexerError::Configuration)
            .attach_printable(reason.to_string())
    }

    fn temporary(self, reason: &str) -> Result<T, IndexerError> {
        self.change_context(IndexerError::Temporary)
            .attach_printable(reason.to_string())
    }

    fn fatal(self, reason: &str) -> Result<T, IndexerError> {
        self.change_context(IndexerError::Fatal)
            .attach_printable(reason.to_string())
    }
}
