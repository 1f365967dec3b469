//! Error taxonomy for the scan engine and its external collaborators
//!
//! Per-symbol failures are represented by [`ScanError`]. The engine looks at
//! the variant to decide whether a symbol is simply skipped for the cycle or
//! whether the failure must be escalated.

use std::path::PathBuf;
use thiserror::Error;

use crate::{Side, Symbol};

/// Channel/oscillator computation failures
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AnalysisError {
    #[error("insufficient bars: needed {needed}, got {available}")]
    InsufficientBars { needed: usize, available: usize },

    #[error("degenerate regression: {0}")]
    DegenerateRegression(&'static str),
}

/// Failures of a single symbol's scan
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("market data unavailable for {symbol}: {reason}")]
    DataUnavailable { symbol: Symbol, reason: String },

    #[error("channel computation failed for {symbol}: {source}")]
    ComputationDegenerate {
        symbol: Symbol,
        #[source]
        source: AnalysisError,
    },

    #[error("{service} call failed: {message}")]
    ExternalService {
        service: &'static str,
        message: String,
    },

    #[error("CRITICAL: {side} position on {symbol} has no protective orders: {message}")]
    CriticalUnprotectedPosition {
        symbol: Symbol,
        side: Side,
        message: String,
    },

    #[error("state file {path} is corrupt: {message}")]
    StateCorruption { path: PathBuf, message: String },
}

impl ScanError {
    /// Errors that only mean "skip this symbol for the current cycle"
    pub fn is_skip(&self) -> bool {
        matches!(
            self,
            ScanError::DataUnavailable { .. } | ScanError::ComputationDegenerate { .. }
        )
    }

    pub fn is_critical(&self) -> bool {
        matches!(self, ScanError::CriticalUnprotectedPosition { .. })
    }
}

/// Exchange gateway errors
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("API error (code {code}): {message}")]
    Api { code: i64, message: String },

    #[error("Auth error: {0}")]
    Auth(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Rate limit exceeded")]
    RateLimited,
}

impl GatewayError {
    /// Rate limits and transport failures are worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::RateLimited | GatewayError::Network(_))
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Parse(err.to_string())
        } else {
            Self::Network(err.to_string())
        }
    }
}

impl From<GatewayError> for ScanError {
    fn from(err: GatewayError) -> Self {
        ScanError::ExternalService {
            service: "exchange",
            message: err.to_string(),
        }
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
