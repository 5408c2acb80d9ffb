use async_trait::async_trait;
use thiserror::Error;

pub mod file;
pub mod memory;

pub use file::FileChallengeStore;
pub use memory::MemoryChallengeStore;

/// The URL path prefix HTTP-01 validation requests arrive under
pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChallengeStoreError {
    #[error("Invalid challenge token `{0}`")]
    InvalidToken(String),

    #[error("Failed to write challenge token `{token}`: {message}")]
    WriteError { token: String, message: String },

    #[error("Failed to read challenge token `{token}`: {message}")]
    ReadError { token: String, message: String },

    #[error("Failed to remove challenge token `{token}`: {message}")]
    RemoveError { token: String, message: String },

    #[error("{0}")]
    GenericError(String),
}

/// Storage for pending HTTP-01 challenge responses
///
/// Tokens are written by the provisioning pipeline right before validation is requested and
/// removed right after it completes. Removing a token that does not exist is not an error.
#[async_trait]
pub trait ChallengeStore: Send + Sync {
    async fn write(&self, token: &str, value: &str) -> Result<(), ChallengeStoreError>;

    async fn remove(&self, token: &str) -> Result<(), ChallengeStoreError>;

    async fn read(&self, token: &str) -> Result<Option<String>, ChallengeStoreError>;
}

/// Returns the token of an HTTP-01 challenge path, if `path` is one
pub fn extract_token(path: &str) -> Option<&str> {
    path.strip_prefix(ACME_CHALLENGE_PREFIX)
}

/// ACME tokens are base64url, anything else (path separators, dots) is rejected
pub fn validate_token(token: &str) -> Result<(), ChallengeStoreError> {
    let is_valid = !token.is_empty()
        && token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');

    if is_valid {
        Ok(())
    } else {
        Err(ChallengeStoreError::InvalidToken(token.to_string()))
    }
}
