//! Error types for Backhaul.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Invalid tunnel identifier")]
    InvalidIdentifier,

    #[error("Encode error: {0}")]
    Encode(String),
}
