//! # Errors
//!
//! A single error type is shared by the pipeline and by every collaborator
//! contract it consumes. Variants fall into three groups:
//!
//! - **Configuration errors** abort the call and name the offending request,
//!   so a driver can evict that request and keep serving the rest.
//! - **Invariant violations** indicate a programming error in a collaborator
//!   or in the pipeline itself.
//! - **Collaborator failures** wrap errors raised by the cache manager, the
//!   executor, the grammar engine or the tensor backend.
//!
//! Recoverable degradations (grammar compile failures, unsupported
//! log-probabilities) never surface here; they are logged and the feature is
//! disabled for the request.

use thiserror::Error;
use uuid::Uuid;
use crate::interfaces::CacheSeqId;

/// Errors produced while preparing, executing or finalizing a batch.
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    /// The request is already at or past its length bound.
    #[error(
        "Request {request_id} (cache id {cache_seq_id}) length ({current_length}) is larger than or equal to the configured max_length ({max_length})"
    )]
    LengthExceeded {
        request_id: Uuid,
        cache_seq_id: CacheSeqId,
        current_length: usize,
        active_length: usize,
        max_length: usize,
    },

    /// A JSON schema was supplied while structured output is turned off.
    #[error("Request {request_id} provided a json_schema but constrained decoding is not enabled")]
    StructuredOutputDisabled { request_id: Uuid },

    /// A context asked for more tokens than the model can hold.
    #[error("Request {request_id} max_length ({requested}) exceeds the upper bound ({upper_bound})")]
    MaxLengthAboveModelLimit {
        request_id: Uuid,
        requested: usize,
        upper_bound: usize,
    },

    /// Two contexts in one batch address the same cache slot.
    #[error("Cache id {cache_seq_id} appears more than once in the batch (requests {first} and {second})")]
    DuplicateCacheId {
        cache_seq_id: CacheSeqId,
        first: Uuid,
        second: Uuid,
    },

    /// A collaborator broke its contract.
    #[error("Internal invariant violated: {0}")]
    InvariantViolation(String),

    /// Invalid pipeline configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Grammar engine failure that is not recoverable per request.
    #[error("Grammar error: {0}")]
    Grammar(#[from] GrammarError),

    /// KV cache manager failure.
    #[error("KV cache error: {0}")]
    Cache(String),

    /// Model executor failure.
    #[error("Model execution error: {0}")]
    Execution(String),

    /// Tensor backend failure.
    #[error("Backend error: {0}")]
    Backend(String),

    /// The batch this request belonged to failed for another reason.
    #[error("Batch aborted: {0}")]
    Aborted(String),
}

impl PipelineError {
    /// Whether this error is a per-request configuration error.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            PipelineError::LengthExceeded { .. }
                | PipelineError::StructuredOutputDisabled { .. }
                | PipelineError::MaxLengthAboveModelLimit { .. }
        )
    }

    /// The request this error is attributed to, if any.
    pub fn request_id(&self) -> Option<Uuid> {
        match self {
            PipelineError::LengthExceeded { request_id, .. }
            | PipelineError::StructuredOutputDisabled { request_id }
            | PipelineError::MaxLengthAboveModelLimit { request_id, .. } => Some(*request_id),
            PipelineError::DuplicateCacheId { second, .. } => Some(*second),
            _ => None,
        }
    }

    pub(crate) fn invariant(msg: impl Into<String>) -> Self {
        PipelineError::InvariantViolation(msg.into())
    }
}

/// A JSON schema could not be compiled into a grammar matcher.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct GrammarError(pub String);

#[cfg(feature = "candle")]
impl From<candle_core::Error> for PipelineError {
    fn from(err: candle_core::Error) -> Self {
        PipelineError::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Config(err.to_string())
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, PipelineError>;
