//! Error types for Custodia
//!
//! Validation and state-machine failures are raised before any processor
//! call. Processor failures carry the processor's own code, message and
//! details untouched.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{EscrowOperation, EscrowStatus};

/// Result type for Custodia operations
pub type Result<T> = std::result::Result<T, EscrowError>;

/// Failure reported by an external payment processor
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{processor} rejected the call with {code}: {message}")]
pub struct ProcessorError {
    /// Processor name as registered
    pub processor: String,
    /// Processor-specific error code
    pub code: String,
    pub message: String,
    /// Raw details as the processor returned them
    #[serde(default)]
    pub details: serde_json::Value,
    /// Whether the caller may retry the same call
    pub retryable: bool,
}

impl ProcessorError {
    pub fn new(
        processor: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            processor: processor.into(),
            code: code.into(),
            message: message.into(),
            details: serde_json::Value::Null,
            retryable: false,
        }
    }

    pub fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    /// A call that did not answer within the configured bound
    pub fn timeout(processor: impl Into<String>, after: Duration) -> Self {
        Self::new(
            processor,
            "timeout",
            format!("no response within {} ms", after.as_millis()),
        )
        .retryable()
    }
}

/// Coarse classification used by transports to pick status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    InvalidStateTransition,
    Processor,
    NotFound,
    ConcurrencyConflict,
    Storage,
}

/// Escrow engine errors
#[derive(Debug, Clone, Error)]
pub enum EscrowError {
    /// Bad input
    #[error("Validation error: {message}")]
    Validation { message: String },

    /// Operation not allowed from the current status
    #[error("Cannot {operation} an escrow in state {from}")]
    InvalidStateTransition {
        from: EscrowStatus,
        operation: EscrowOperation,
    },

    /// The processor call failed; nothing was committed locally
    #[error("Processor error: {0}")]
    Processor(#[from] ProcessorError),

    #[error("Escrow {escrow_id} not found")]
    NotFound { escrow_id: String },

    /// Optimistic-lock failure; reload and reconcile
    #[error("Escrow {escrow_id} changed concurrently, expected version {expected_version}")]
    ConcurrencyConflict {
        escrow_id: String,
        expected_version: u64,
    },

    #[error("Storage error: {message}")]
    Storage { message: String },
}

impl EscrowError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } => ErrorKind::Validation,
            Self::InvalidStateTransition { .. } => ErrorKind::InvalidStateTransition,
            Self::Processor(_) => ErrorKind::Processor,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::ConcurrencyConflict { .. } => ErrorKind::ConcurrencyConflict,
            Self::Storage { .. } => ErrorKind::Storage,
        }
    }

    /// Whether the caller can safely retry after reloading
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ConcurrencyConflict { .. } => true,
            Self::Processor(e) => e.retryable,
            _ => false,
        }
    }

    pub fn processor_error(&self) -> Option<&ProcessorError> {
        match self {
            Self::Processor(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for EscrowError {
    fn from(e: serde_json::Error) -> Self {
        EscrowError::Storage {
            message: format!("serialization: {}", e),
        }
    }
}
