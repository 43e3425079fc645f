//! Error type shared by every hopwire module.

use thiserror::Error;

use crate::cancel::CancelReason;

/// Errors produced by hopwire.
#[derive(Debug, Error)]
pub enum Error {
    /// No credit and the caller did not want to wait.
    #[error("no credit available on {pool}")]
    CreditUnavailable {
        /// Name of the pool.
        pool: String,
    },

    /// A credit request for zero.
    #[error("credit request of {amount} is invalid: amount must be positive")]
    InvalidCreditRequest {
        /// The rejected amount.
        amount: u32,
    },

    /// The pool was disposed before or while waiting.
    #[error("credit pool {pool} has been disposed")]
    Disposed {
        /// Name of the pool.
        pool: String,
    },

    /// A cancel token fired first.
    #[error("operation cancelled: {0}")]
    Cancelled(CancelReason),

    /// Every proxy candidate has been tried.
    #[error("no usable proxy candidate")]
    NoCandidate,

    /// A URI that is not an absolute `http`/`https` endpoint.
    #[error("invalid endpoint {uri}: {reason}")]
    InvalidEndpoint {
        /// The URI as given.
        uri: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Malformed bytes on the wire.
    #[error("could not decode {what}")]
    Decode {
        /// The structure being decoded.
        what: &'static str,
    },

    /// Configuration that failed validation.
    #[error("configuration error: {0}")]
    Config(String),

    /// A [`Sender`](crate::Sender) failed to transmit a request.
    #[error("sender failed: {0}")]
    Sender(String),

    /// Malformed JSON configuration.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Configuration file could not be read.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for outcomes that mean "nothing available right now" rather than a fault.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Error::CreditUnavailable { .. } | Error::NoCandidate)
    }

    /// True if the operation was cut short by a cancel token.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled(_))
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
