//! Typed errors for the coordination framework.
//!
//! Uses `thiserror` for the library surface. Stage code is free to use
//! `anyhow` internally; a failing finalize is carried here as the boxed
//! source of [`PipelineError::Finalize`].
//!
//! Every variant belongs to one [`ErrorClass`], which decides whether a worker
//! process should stop and with which exit status.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::work::{WorkDate, WorkState};

/// Errors raised by the message channel layer.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Broker unreachable or the connection dropped.
    #[error("connection error: {0}")]
    Connection(String),

    /// Publishing a payload failed after the connection was established.
    #[error("publish to {queue} failed: {reason}")]
    Publish { queue: String, reason: String },

    /// Acknowledging a delivery failed.
    #[error("ack failed: {0}")]
    Ack(String),

    /// Consumer or stream setup failed.
    #[error("consumer setup for {queue} failed: {reason}")]
    Consumer { queue: String, reason: String },

    /// The channel was closed locally.
    #[error("channel closed")]
    Closed,
}

impl ChannelError {
    /// Returns true if reconnecting may clear the error.
    pub fn is_connection(&self) -> bool {
        matches!(self, ChannelError::Connection(_))
    }
}

/// Errors that can occur while coordinating pipeline workers.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Missing or invalid stage options. Always raised before connecting.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Broker unreachable after the bounded retry policy gave up.
    #[error("connection error after {attempts} attempt(s): {source}")]
    Connection {
        attempts: u32,
        #[source]
        source: ChannelError,
    },

    /// A writer tried to move a work date's state backward.
    #[error("state regression for {date}: stored {current}, requested {requested}")]
    Regression {
        date: WorkDate,
        current: WorkState,
        requested: WorkState,
    },

    /// Degenerate partition request.
    #[error("invalid partition: {0}")]
    InvalidPartition(String),

    /// A different partition was already published for the date.
    #[error("partition conflict for {date}: a different partition is already published")]
    PartitionConflict { date: WorkDate },

    /// A state at or beyond BATCHES_READY was requested with no partition on record.
    #[error("cannot advance {date} to {requested}: no partition has been published")]
    MissingPartition { date: WorkDate, requested: WorkState },

    /// A state marker exists but cannot be interpreted.
    #[error("corrupt state marker {}: {reason}", path.display())]
    CorruptState { path: PathBuf, reason: String },

    /// The readiness latch gave up waiting for BATCHES_READY.
    #[error("timed out waiting for {date} to reach BATCHES_READY (last seen {last_seen})")]
    ReadinessTimeout { date: WorkDate, last_seen: WorkState },

    /// The stage's batch finalize failed; the batch stays unacknowledged.
    #[error("finalize failed in stage {stage}: {source:#}")]
    Finalize {
        stage: String,
        #[source]
        source: anyhow::Error,
    },

    /// One payload or artifact could not be interpreted.
    #[error("malformed payload {payload:?}: {reason}")]
    MalformedPayload { payload: String, reason: String },

    /// Stage setup or main loop failed outside of a batch finalize.
    #[error("stage {stage} failed: {source:#}")]
    Stage {
        stage: String,
        #[source]
        source: anyhow::Error,
    },

    /// Channel failure that is not a connection loss.
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// Shutdown was requested while waiting.
    #[error("operation cancelled")]
    Cancelled,

    /// Filesystem failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Coarse classification used for logging and process exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Reconfigure before restarting.
    Configuration,
    /// Broker trouble; restarting later may help.
    Connection,
    /// Coordination invariant broken; escalate.
    Protocol,
    /// A stage could not finish its work.
    Stage,
}

impl ErrorClass {
    /// Process exit status for this class.
    pub fn exit_code(self) -> u8 {
        match self {
            ErrorClass::Stage => 1,
            ErrorClass::Configuration => 2,
            ErrorClass::Connection => 3,
            ErrorClass::Protocol => 4,
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorClass::Configuration => write!(f, "configuration error"),
            ErrorClass::Connection => write!(f, "connection error"),
            ErrorClass::Protocol => write!(f, "protocol error"),
            ErrorClass::Stage => write!(f, "stage failure"),
        }
    }
}

impl PipelineError {
    pub fn class(&self) -> ErrorClass {
        match self {
            PipelineError::Configuration(_) => ErrorClass::Configuration,
            PipelineError::Connection { .. } => ErrorClass::Connection,
            PipelineError::Channel(e) if e.is_connection() => ErrorClass::Connection,
            PipelineError::Regression { .. }
            | PipelineError::InvalidPartition(_)
            | PipelineError::PartitionConflict { .. }
            | PipelineError::MissingPartition { .. }
            | PipelineError::CorruptState { .. } => ErrorClass::Protocol,
            PipelineError::ReadinessTimeout { .. }
            | PipelineError::Finalize { .. }
            | PipelineError::MalformedPayload { .. }
            | PipelineError::Stage { .. }
            | PipelineError::Channel(_)
            | PipelineError::Cancelled
            | PipelineError::Io(_)
            | PipelineError::Json(_) => ErrorClass::Stage,
        }
    }

    /// Protocol-level failures always terminate the worker.
    pub fn is_protocol(&self) -> bool {
        self.class() == ErrorClass::Protocol
    }

    pub fn malformed(payload: impl Into<String>, reason: impl fmt::Display) -> Self {
        PipelineError::MalformedPayload {
            payload: payload.into(),
            reason: reason.to_string(),
        }
    }

    pub fn configuration(reason: impl Into<String>) -> Self {
        PipelineError::Configuration(reason.into())
    }
}

/// Result type alias for coordination operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_regression_display() {
        let err = PipelineError::Regression {
            date: "2024-01-01".parse().unwrap(),
            current: WorkState::BatchesReady,
            requested: WorkState::RssFetched,
        };
        let msg = err.to_string();
        assert!(msg.contains("2024-01-01"));
        assert!(msg.contains("BATCHES_READY"));
        assert!(msg.contains("RSS_FETCHED"));
    }

    #[test]
    fn test_error_classes() {
        assert_eq!(
            PipelineError::configuration("missing --date").class(),
            ErrorClass::Configuration
        );
        assert_eq!(
            PipelineError::InvalidPartition("no items".into()).class(),
            ErrorClass::Protocol
        );
        assert_eq!(
            PipelineError::Channel(ChannelError::Connection("reset".into())).class(),
            ErrorClass::Connection
        );
        assert_eq!(
            PipelineError::Channel(ChannelError::Ack("gone".into())).class(),
            ErrorClass::Stage
        );
        assert_eq!(
            PipelineError::Finalize {
                stage: "metadata".into(),
                source: anyhow::anyhow!("disk full"),
            }
            .class(),
            ErrorClass::Stage
        );
    }

    #[test]
    fn test_exit_codes_are_distinct() {
        let codes = [
            ErrorClass::Configuration,
            ErrorClass::Connection,
            ErrorClass::Protocol,
            ErrorClass::Stage,
        ]
        .map(ErrorClass::exit_code);
        for (i, a) in codes.iter().enumerate() {
            assert_ne!(*a, 0);
            for b in &codes[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_error_can_be_downcast_from_anyhow() {
        let err: anyhow::Error = PipelineError::MissingPartition {
            date: "2024-01-01".parse().unwrap(),
            requested: WorkState::BatchesReady,
        }
        .into();

        let pipeline_err = err.downcast_ref::<PipelineError>();
        assert!(matches!(
            pipeline_err,
            Some(PipelineError::MissingPartition { .. })
        ));
        assert!(pipeline_err.unwrap().is_protocol());
    }
}
