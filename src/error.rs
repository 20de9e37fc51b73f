//! Error types for rusty-ashare

use thiserror::Error;

/// Main error type for rusty-ashare
#[derive(Error, Debug)]
pub enum AshareError {
    /// Not enough history for a requested window. Engines never return
    /// this; it only shows up in logs and in strict helpers.
    #[error("Data gap for {symbol}: need {required} rows, have {available}")]
    DataGap {
        symbol: String,
        required: usize,
        available: usize,
    },

    #[error("Upstream fetch failed for {api}: {message}")]
    UpstreamFetch { api: String, message: String },

    #[error("Malformed reference data: {0}")]
    MalformedReferenceData(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Sync of {symbol} timed out after {seconds}s")]
    Timeout { symbol: String, seconds: u64 },

    #[error("Data error: {0}")]
    DataError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),
}

impl AshareError {
    /// Whether a failure is local to one symbol/date range and the batch
    /// run may continue with the next symbol.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, AshareError::ConfigError(_))
    }

    pub(crate) fn upstream(api: &str, message: impl ToString) -> Self {
        AshareError::UpstreamFetch {
            api: api.to_string(),
            message: message.to_string(),
        }
    }
}

#[cfg(feature = "rusqlite-support")]
impl From<rusqlite::Error> for AshareError {
    fn from(e: rusqlite::Error) -> Self {
        AshareError::Persistence(e.to_string())
    }
}

/// Result type alias for rusty-ashare operations
pub type Result<T> = std::result::Result<T, AshareError>;
