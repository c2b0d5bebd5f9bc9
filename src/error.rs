//! Error type shared by the query builder and every execution backend.
//!
//! Errors fall into a few classes that callers may want to tell apart:
//!
//! - [`Error::Config`] is raised while a query is being assembled (grouping set
//!   twice, timestamp aggregation after `group_by_entity`, ...).
//! - [`Error::TimestampOutOfRange`] is a data error raised per item during
//!   execution and aborts the query.
//! - [`Error::Timeout`] is raised by the distributed backend when the deadline
//!   expires; no partial result is returned.
//! - [`Error::Collaborator`] wraps opaque failures of the cell store or the cell
//!   iteration layer.
//!
//! Geometry faults during sub-region clipping never surface here; they are
//! recovered locally with an empty geometry.

use crate::timestamps::TimestampMs;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for `Result<T, histbeam::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// The query was configured in a way no backend can execute.
    #[error("invalid query configuration: {0}")]
    Config(String),

    /// An item was matched against a timestamp list that does not span it.
    #[error("timestamp {timestamp} lies outside the configured range [{first}, {last}]")]
    TimestampOutOfRange {
        timestamp: TimestampMs,
        first: TimestampMs,
        last: TimestampMs,
    },

    /// The distributed computation did not finish before the deadline.
    #[error("query timed out after {0:?}")]
    Timeout(Duration),

    /// A type-erased pipeline value did not have the expected runtime type.
    #[error("type mismatch in pipeline: expected {expected}")]
    TypeMismatch { expected: &'static str },

    /// A textual filter could not be parsed.
    #[error("invalid filter at position {position}: {message}")]
    InvalidFilter { position: usize, message: String },

    /// A timestamp or period string could not be parsed.
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),

    /// The cell store or the cell iteration layer failed.
    #[error(transparent)]
    Collaborator(#[from] anyhow::Error),
}

impl Error {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}
