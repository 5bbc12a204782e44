//! Engine error taxonomy
//!
//! None of these are fatal. A `Parse` or `Validation` error drops exactly one
//! record, `PricingUnavailable` degrades cost to unpriced and
//! `CacheSchemaMismatch` triggers a rebuild from full history.

use thiserror::Error;

/// Why a single raw record was turned away.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("record is not a JSON object")]
    NotAnObject,
    #[error("record carries no usage block")]
    MissingUsage,
    #[error("timestamp missing")]
    MissingTimestamp,
    #[error("unparseable timestamp {0:?}")]
    UnparseableTimestamp(String),
    #[error("negative {0}")]
    NegativeTokens(&'static str),
    #[error("invalid value for {0}")]
    InvalidField(&'static str),
    #[error("timestamp too far from current time")]
    TimestampOutOfRange,
    #[error("event predates every block of its session")]
    OutOfOrder,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("parse error: {0}")]
    Parse(Rejection),

    #[error("validation error: {0}")]
    Validation(Rejection),

    #[error("pricing unavailable: {0}")]
    PricingUnavailable(String),

    #[error("cache schema mismatch: {0}")]
    CacheSchemaMismatch(String),
}

impl EngineError {
    pub fn is_parse(&self) -> bool {
        matches!(self, EngineError::Parse(_))
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, EngineError::Validation(_))
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
