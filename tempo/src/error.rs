//! The runtime error taxonomy.

use tempo_serialization::SerializationError;
use tempo_store::StoreError;
use tempo_time::Time;

/// A failure captured from a component while the pipeline was running.
#[derive(Clone, Debug)]
pub struct PipelineError {
    /// Component (emitter, receiver, or source) that failed.
    pub component: String,
    /// Human-readable description of the failure.
    pub message: String,
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.component, self.message)
    }
}

/// Errors surfaced by the runtime.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A post with an originating time earlier than the last one.
    #[error("out-of-order post on `{emitter}`: {attempted} after {last}")]
    Ordering {
        /// Emitter that rejected the post.
        emitter: String,
        /// Last accepted originating time.
        last: Time,
        /// Rejected originating time.
        attempted: Time,
    },
    /// A quiescence or completion wait exceeded its budget.
    #[error("timed out waiting for {0}")]
    Timeout(String),
    /// A caller-supplied argument is out of range or contradictory.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// One or more component failures were never handled.
    #[error("{} unhandled pipeline failure(s); first: {}", failures.len(),
            failures.first().map(|f| f.to_string()).unwrap_or_default())]
    AggregateFailure {
        /// Every captured failure, in arrival order.
        failures: Vec<PipelineError>,
    },
    /// A store operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// A payload failed to (de)serialize or clone.
    #[error(transparent)]
    Serialization(#[from] SerializationError),
}
