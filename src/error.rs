//! Failure classification and the pluggable error-handler seam.
//!
//! Every dispatch failure maps onto one of four terminal classes. Transient
//! and conflict failures are retried per the retry policy; permanent and
//! validation failures dead-letter on first occurrence. Anything the runtime
//! cannot classify defaults to transient, failing safe into the retry loop.

use crate::interfaces::store::StoreError;
use crate::interfaces::transport::TransportError;

/// Terminal error class, also the wire value of `x-saga-failure-reason`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Transient,
    Permanent,
    Conflict,
    Validation,
}

impl Classification {
    /// Wire representation for DLQ headers.
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Transient => "Transient",
            Classification::Permanent => "Permanent",
            Classification::Conflict => "Conflict",
            Classification::Validation => "Validation",
        }
    }

    /// Whether the retry loop should re-attempt this class.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Classification::Transient | Classification::Conflict)
    }
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by user handlers and initial-state factories.
///
/// Handlers pick the marker matching the failure; the worker maps it onto
/// the retry/DLQ decision.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("permanent failure: {0}")]
    Permanent(String),

    #[error("validation failed: {0}")]
    Validation(String),

    /// Unclassified error, retried as transient.
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl HandlerError {
    pub fn classification(&self) -> Classification {
        match self {
            HandlerError::Transient(_) | HandlerError::Other(_) => Classification::Transient,
            HandlerError::Permanent(_) => Classification::Permanent,
            HandlerError::Validation(_) => Classification::Validation,
        }
    }
}

/// Errors surfacing from a single saga dispatch.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("saga '{saga}' handler failed: {source}")]
    Handler {
        saga: String,
        #[source]
        source: HandlerError,
    },

    #[error("initial state factory failed for saga '{saga}': {source}")]
    InitialState {
        saga: String,
        #[source]
        source: HandlerError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("state snapshot failed: {0}")]
    Serialization(String),

    #[error("pipeline error: {0}")]
    Pipeline(String),

    #[error("dispatch cancelled")]
    Cancelled,
}

impl DispatchError {
    /// Map onto the terminal error class.
    pub fn classification(&self) -> Classification {
        match self {
            DispatchError::Handler { source, .. } => source.classification(),
            // Creation failures are never retried: the factory is
            // deterministic over the starting message.
            DispatchError::InitialState { .. } => Classification::Permanent,
            DispatchError::Store(e) => match e {
                StoreError::Conflict { .. } | StoreError::DuplicateKey { .. } => {
                    Classification::Conflict
                }
                StoreError::Serialization(_) => Classification::Permanent,
                StoreError::NotFound { .. } | StoreError::Backend(_) => Classification::Transient,
            },
            DispatchError::Transport(_) => Classification::Transient,
            DispatchError::Serialization(_) => Classification::Permanent,
            DispatchError::Pipeline(_) => Classification::Permanent,
            DispatchError::Cancelled => Classification::Transient,
        }
    }
}

/// Verdict from an error handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorVerdict {
    /// Re-attempt per the retry policy.
    Retry,
    /// Route to the dead-letter endpoint and ack.
    DeadLetter,
    /// Ack and discard.
    Drop,
}

/// Pluggable override for failure handling.
///
/// The worker consults the handler once per failed attempt; the verdict
/// replaces the default classification-driven decision. `Retry` still
/// respects the policy's attempt cap.
pub trait ErrorHandler: Send + Sync {
    fn verdict(&self, error: &DispatchError, attempt: u32) -> ErrorVerdict;
}

/// Default policy: retry what is retryable, dead-letter the rest.
#[derive(Debug, Default)]
pub struct DefaultErrorHandler;

impl ErrorHandler for DefaultErrorHandler {
    fn verdict(&self, error: &DispatchError, _attempt: u32) -> ErrorVerdict {
        if error.classification().is_retryable() {
            ErrorVerdict::Retry
        } else {
            ErrorVerdict::DeadLetter
        }
    }
}
