// =============================================================================
// Error taxonomy
// =============================================================================
//
// Decode and validation errors are absorbed where they occur (logged, the
// offending payload or request is skipped). Connection errors feed the
// reconnection policy; only exhaustion is fatal for a stream client.
// =============================================================================

use thiserror::Error;

/// An inbound payload that could not be turned into a price update.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("payload is missing required field `{0}`")]
    MissingField(&'static str),

    #[error("field `{field}` has an invalid value: {value}")]
    InvalidField { field: &'static str, value: String },
}

/// A rejected indicator request. The computation is never attempted.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("unknown indicator `{0}`")]
    UnknownIndicator(String),

    #[error("{indicator}: unknown parameter `{name}`")]
    UnknownParameter { indicator: &'static str, name: String },

    #[error("{indicator}: parameter `{name}` must be an integer")]
    WrongType { indicator: &'static str, name: &'static str },

    #[error("{indicator}: parameter `{name}` is not a number: {value}")]
    NotNumeric {
        indicator: &'static str,
        name: &'static str,
        value: String,
    },

    #[error("{indicator}: parameter `{name}` = {value} is below the minimum {min}")]
    BelowMinimum {
        indicator: &'static str,
        name: &'static str,
        value: f64,
        min: f64,
    },

    #[error("{indicator}: expected at most {expected} parameters, got {got}")]
    TooManyParameters {
        indicator: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("{indicator}: parameter `{name}` {reason}")]
    Inconsistent {
        indicator: &'static str,
        name: &'static str,
        reason: String,
    },

    #[error("malformed indicator configuration `{0}`")]
    Syntax(String),
}

/// Errors reported by a stream client to its owner.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StreamError {
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("gave up after {attempts} reconnect attempts")]
    ExhaustedRetries { attempts: u32 },
}

impl StreamError {
    /// Only exhaustion ends a client; everything else is recoverable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ExhaustedRetries { .. })
    }
}

/// Errors surfaced to the caller of the subscription coordinator.
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("historical backfill for {key} failed: {reason}")]
    Backfill { key: String, reason: String },

    #[error("invalid symbol `{0}`")]
    InvalidSymbol(String),

    #[error("no subscription has been selected")]
    NoSubscription,
}
