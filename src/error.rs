//! Error types for the Beacon engine.

use thiserror::Error;

/// Top-level error type for all Beacon operations.
#[derive(Debug, Error)]
pub enum BeaconError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid call: {0}")]
    InvalidCall(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("delivery rejected with status {status}: {body}")]
    Delivery { status: u16, body: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience Result alias that defaults to [`BeaconError`].
pub type Result<T> = std::result::Result<T, BeaconError>;
