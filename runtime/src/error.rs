//! Processing failures raised by the runtime itself.

use conduit_core::Failure;
use thiserror::Error;

/// Failures the runtime records on an exchange.
///
/// These are processing failures, not configuration errors: they are stored
/// on the exchange and flow to error handlers like any processor error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
    /// Discovery and filtering left no candidate for the service.
    #[error("No available service for: {service}")]
    NoAvailableService {
        /// The service name.
        service: String,
    },

    /// The circuit breaker rejected the call.
    #[error("Circuit breaker {name} is open")]
    CircuitOpen {
        /// Breaker name.
        name: String,
    },

    /// The guarded processor did not finish in time.
    #[error("Command {name} timed out after {timeout_ms} ms")]
    CommandTimeout {
        /// Command name.
        name: String,
        /// Configured timeout.
        timeout_ms: u64,
    },

    /// The task running a command went away without reporting back.
    #[error("Command {name} was aborted before completing")]
    CommandAborted {
        /// Command name.
        name: String,
    },

    /// A processor panicked.
    #[error("Processor {processor} panicked: {message}")]
    ProcessorPanicked {
        /// Name of the processor.
        processor: String,
        /// Panic payload, if it was a string.
        message: String,
    },

    /// A spawned branch task failed to join.
    #[error("Branch task failed: {0}")]
    TaskFailed(String),

    /// No endpoint is registered for the uri.
    #[error("No endpoint could be found for: {0}")]
    NoSuchEndpoint(String),

    /// Strict index validation found no index header.
    #[error("No '{header}' header available of type: i64")]
    MissingDataSetIndex {
        /// Header name.
        header: String,
    },

    /// The index header does not match the expected counter.
    #[error("Header: {header} does not match. Expected: {expected} but was: {actual}")]
    DataSetIndexMismatch {
        /// Header name.
        header: String,
        /// Expected index.
        expected: i64,
        /// Received index.
        actual: i64,
    },
}

impl From<RoutingError> for Failure {
    fn from(error: RoutingError) -> Self {
        Self::new(error)
    }
}
