//! Error handling for the scheduler
//!
//! This module defines the crate-wide error type and a Result alias used
//! throughout the pipeline and scheduler.
//!
//! Property reads that find nothing are *not* errors: `MetadataPool::read`
//! returns `Option` and the caller decides whether absence is fatal.

use crate::ids::NodeId;
use crate::metadata::PropertyId;
use crate::scheduler::Stage;
use std::time::Duration;
use thiserror::Error;

/// Main error type for scheduler operations
#[derive(Error, Debug)]
pub enum SchedError {
    /// A node tried to register a second non-preemptable dependency unit
    /// for the same request. Programming error in the node.
    #[error("duplicate dependency registration for {node:?} request {request}")]
    DuplicateRegistration { node: NodeId, request: u64 },

    /// A dependency unit with no fence and no property dependencies was
    /// registered. Such a stage must run immediately instead.
    #[error("empty dependency unit for {node:?} request {request}")]
    EmptyDependencyUnit { node: NodeId, request: u64 },

    /// A producer wrote the same property twice for one request.
    #[error("property {id:?} already written for request {request}")]
    AlreadyWritten { id: PropertyId, request: u64 },

    /// A property lookback reached beyond the sliding window.
    #[error("property offset {offset} exceeds the request window of {window}")]
    OffsetOutOfWindow { offset: u64, window: usize },

    /// The slot for a new request is still held by an unretired request.
    #[error("slot for request {request} still occupied by request {occupant}")]
    SlotBusy { request: u64, occupant: u64 },

    /// The request is not currently in flight.
    #[error("request {0} is not in flight")]
    UnknownRequest(u64),

    /// A node received a resumption token it does not recognise.
    #[error("invalid stage token {stage:?} for node {node}")]
    InvalidStage { node: String, stage: Stage },

    /// Stripe merge geometry is inconsistent.
    #[error("stripe geometry invalid: {0}")]
    StripeGeometry(String),

    /// A stripe buffer does not match its declared geometry.
    #[error("stripe buffer size mismatch: expected {expected} bytes, got {actual}")]
    StripeLength { expected: usize, actual: usize },

    /// Flush did not drain all in-flight requests within the deadline.
    #[error("flush did not converge within {0:?}")]
    FlushTimeout(Duration),

    /// The worker pool has been shut down.
    #[error("pipeline is shut down")]
    ShutDown,

    /// Errors related to configuration loading/saving
    #[error("configuration error: {0}")]
    Config(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<SchedError>,
    },
}

impl SchedError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        SchedError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }
}

/// Result type alias for scheduler operations
pub type Result<T> = std::result::Result<T, SchedError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SchedError::UnknownRequest(17);
        assert_eq!(err.to_string(), "request 17 is not in flight");
    }

    #[test]
    fn test_error_with_context() {
        let err = SchedError::Config("missing queue depth".to_string());
        let with_ctx = err.with_context("failed to finalize pipeline");
        assert!(with_ctx.to_string().contains("failed to finalize pipeline"));
    }

    #[test]
    fn test_duplicate_registration_display() {
        let err = SchedError::DuplicateRegistration {
            node: NodeId(3),
            request: 12,
        };
        assert!(err.to_string().contains("NodeId(3)"));
        assert!(err.to_string().contains("12"));
    }
}
