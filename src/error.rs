//! Error types for the meter bridge

use thiserror::Error;

/// Failure to obtain the measurement document from the meter.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("HTTP request to meter failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Meter returned a malformed document: {0}")]
    Malformed(String),

    #[error("Meter document has no `{0}` key")]
    MissingKey(String),
}

/// Raised only by the stop-at-first-failure extraction policy.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExtractionError {
    #[error("Source key `{source_key}` for {path} missing from meter document")]
    MissingKey { path: String, source_key: String },

    #[error("Source key `{source_key}` for {path} is not a number")]
    NotNumeric { path: String, source_key: String },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DerivationError {
    #[error("Aggregate power was not accepted this cycle")]
    MissingPower,

    #[error("Aggregate power is zero")]
    ZeroPower,
}

#[derive(Error, Debug, PartialEq)]
pub enum StoreError {
    #[error("Unknown path: {0}")]
    UnknownPath(String),

    #[error("Path already registered: {0}")]
    DuplicatePath(String),

    #[error("Path is read-only: {0}")]
    ReadOnly(String),
}

/// Startup configuration problems. Always fatal.
#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("Required setting {0} is not set")]
    Missing(&'static str),

    #[error("Invalid value for {name}: `{value}`")]
    InvalidValue { name: &'static str, value: String },

    #[error("Cannot infer quantity kind for {0}")]
    UnknownQuantity(String),

    #[error("Ambiguous quantity kind for {0}")]
    AmbiguousQuantity(String),

    #[error("Field map is empty")]
    EmptyFieldMap,
}

/// Why a poll cycle stopped early. The Update Index still advances.
#[derive(Error, Debug)]
pub enum CycleError {
    #[error("fetch: {0}")]
    Fetch(#[from] FetchError),

    #[error("extract: {0}")]
    Extraction(#[from] ExtractionError),

    #[error("publish: {0}")]
    Store(#[from] StoreError),
}

impl CycleError {
    /// Name of the cycle stage that failed, used as a log field.
    pub fn stage(&self) -> &'static str {
        match self {
            CycleError::Fetch(_) => "fetch",
            CycleError::Extraction(_) => "extract",
            CycleError::Store(_) => "publish",
        }
    }
}
